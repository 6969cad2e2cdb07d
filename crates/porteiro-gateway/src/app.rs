use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use rusqlite::Connection;
use tokio::sync::mpsc;

use porteiro_core::breaker::CircuitBreaker;
use porteiro_core::config::PorteiroConfig;
use porteiro_core::events::EventSink;
use porteiro_core::flags::FeatureFlags;
use porteiro_delivery::{DeliveryWorker, OutboundGateway};
use porteiro_outbox::OutboxRepository;
use porteiro_pipeline::{
    preprocess::RateLimiter, Guards, KeywordClassifier, Orchestrator, TemplatePlanner,
};
use porteiro_store::{DedupStore, KvStore};
use porteiro_turn::TurnController;

use crate::flusher::FlushRequest;

/// Central shared state — passed as `Arc<AppState>` to all Axum handlers
/// and to the flush worker pool.
pub struct AppState {
    pub config: PorteiroConfig,
    pub flags: Arc<FeatureFlags>,
    pub sink: Arc<dyn EventSink>,
    pub kv: Arc<dyn KvStore>,
    pub dedup: Arc<DedupStore>,
    pub turns: Arc<TurnController>,
    pub outbox: Arc<OutboxRepository>,
    pub guards: Arc<Guards>,
    pub orchestrator: Arc<Orchestrator>,
    pub delivery: Arc<DeliveryWorker>,
    /// Deferred-flush queue. Bounded: when full, the request is dropped and
    /// the buffer TTL / next inbound message provide convergence.
    pub flush_tx: mpsc::Sender<FlushRequest>,
}

impl AppState {
    /// Wire the full pipeline. Returns the state plus the receive half of
    /// the flush queue, which the caller hands to the worker pool.
    pub fn build(
        config: PorteiroConfig,
        kv: Arc<dyn KvStore>,
        gateway: Arc<dyn OutboundGateway>,
        outbox_conn: Connection,
        sink: Arc<dyn EventSink>,
    ) -> porteiro_outbox::Result<(Arc<Self>, mpsc::Receiver<FlushRequest>)> {
        let flags = Arc::new(FeatureFlags::new(
            config.flags.pipeline_enabled,
            config.flags.delivery_enabled,
        ));
        let dedup = Arc::new(DedupStore::new(
            kv.clone(),
            Duration::from_secs(config.dedup.message_ttl_secs),
            Duration::from_secs(config.dedup.idempotency_ttl_secs),
        ));
        let turns = Arc::new(TurnController::new(
            kv.clone(),
            sink.clone(),
            config.turn.debounce_ms,
            Duration::from_secs(config.turn.buffer_ttl_secs),
            Duration::from_secs(config.turn.lock_ttl_secs),
        ));
        let outbox = Arc::new(OutboxRepository::new(outbox_conn, sink.clone())?);
        let guards = Arc::new(Guards::new(
            kv.clone(),
            sink.clone(),
            config.limits.recursion_limit,
            Duration::from_secs(config.limits.recursion_ttl_secs),
            Duration::from_secs(config.limits.greeting_cooldown_secs),
        ));
        let delivery = Arc::new(DeliveryWorker::new(
            outbox.clone(),
            dedup.clone(),
            gateway,
            Arc::new(CircuitBreaker::new(
                "gateway",
                config.breaker.failure_threshold,
                Duration::from_secs(config.breaker.recovery_secs),
            )),
            sink.clone(),
            Duration::from_secs(config.delivery.deadline_secs),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(KeywordClassifier),
            Arc::new(TemplatePlanner::new(&config.contact.human_phone)),
            guards.clone(),
            RateLimiter::new(
                kv.clone(),
                config.limits.messages_per_minute,
                Duration::from_secs(60),
            ),
            Arc::new(CircuitBreaker::new(
                "classifier",
                config.breaker.failure_threshold,
                Duration::from_secs(config.breaker.recovery_secs),
            )),
            outbox.clone(),
            delivery.clone(),
            sink.clone(),
            flags.clone(),
            &config.contact.human_phone,
            config.limits.max_text_chars,
        ));

        let (flush_tx, flush_rx) = mpsc::channel(config.delivery.flush_queue_depth);

        let state = Arc::new(Self {
            config,
            flags,
            sink,
            kv,
            dedup,
            turns,
            outbox,
            guards,
            orchestrator,
            delivery,
            flush_tx,
        });
        Ok((state, flush_rx))
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/ready", get(crate::http::health::ready_handler))
        .route("/webhook", post(crate::http::webhook::webhook_handler))
        .route("/admin/turn/{phone}", get(crate::http::admin::turn_status))
        .route("/admin/outbox/{cid}", get(crate::http::admin::outbox_stats))
        .route(
            "/admin/outbox/{cid}/{tid}",
            get(crate::http::admin::outbox_turn_stats),
        )
        .route(
            "/admin/outbox/{cid}/{tid}/retry",
            post(crate::http::admin::outbox_retry),
        )
        .route(
            "/admin/outbox/{cid}/{tid}/discard",
            post(crate::http::admin::outbox_discard),
        )
        .route("/admin/outbox/purge", post(crate::http::admin::outbox_purge))
        .route(
            "/admin/guards/{cid}",
            get(crate::http::admin::guard_stats).delete(crate::http::admin::guard_reset),
        )
        .route(
            "/admin/flags",
            get(crate::http::admin::flags_get).put(crate::http::admin::flags_put),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
