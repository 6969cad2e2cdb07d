use std::net::SocketAddr;
use std::sync::Arc;

use rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use tracing::info;

use porteiro_core::config::PorteiroConfig;
use porteiro_core::events::TracingSink;
use porteiro_evolution::EvolutionClient;
use porteiro_gateway::{app, flusher};
use porteiro_store::MemoryKv;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "porteiro_gateway=info,porteiro=info,tower_http=warn".into()),
        )
        .init();

    // load config: PORTEIRO_CONFIG path > ~/.porteiro/porteiro.toml
    let config_path = std::env::var("PORTEIRO_CONFIG").ok();
    let config = PorteiroConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        PorteiroConfig::default()
    });

    if let Some(parent) = std::path::Path::new(&config.storage.outbox_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(&config.storage.outbox_path)?;

    let gateway = Arc::new(EvolutionClient::new(&config.evolution));
    let (state, flush_rx) = app::AppState::build(
        config,
        Arc::new(MemoryKv::new()),
        gateway,
        conn,
        Arc::new(TracingSink),
    )?;

    let cancel = CancellationToken::new();
    flusher::spawn_workers(
        state.clone(),
        flush_rx,
        state.config.delivery.flush_workers,
        cancel.clone(),
    );

    let bind = state.config.gateway.bind.clone();
    let port = state.config.gateway.port;
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("Porteiro gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown({
            let cancel = cancel.clone();
            async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutdown signal received");
                cancel.cancel();
            }
        })
        .await?;

    Ok(())
}
