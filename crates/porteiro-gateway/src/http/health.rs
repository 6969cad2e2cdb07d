//! Liveness and readiness probes.

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use porteiro_store::KvStore;

use crate::app::AppState;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// GET /health — liveness.
///
/// Healthy when ingress can enqueue (KV answers, flush queue open) and
/// delivery can read the pending outbox. 503 with per-check detail otherwise.
pub async fn health_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let kv_ok = state
        .kv
        .set("health:probe", "1", Duration::from_secs(5))
        .await
        .is_ok();
    let outbox_ok = state.outbox.probe().is_ok();
    let queue_ok = !state.flush_tx.is_closed();

    let body = json!({
        "status": if kv_ok && outbox_ok && queue_ok { "ok" } else { "degraded" },
        "version": VERSION,
        "checks": {
            "kv": kv_ok,
            "outbox": outbox_ok,
            "flush_queue": queue_ok,
        },
        "flags": state.flags.snapshot(),
    });

    if kv_ok && outbox_ok && queue_ok {
        Ok(Json(body))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(body)))
    }
}

/// GET /ready — readiness.
///
/// Fails exactly when the authoritative outbox store is unreachable;
/// a degraded KV store does not flip readiness (those paths fail open).
pub async fn ready_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.outbox.probe() {
        Ok(()) => Ok(Json(json!({"ready": true}))),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"ready": false, "error": e.to_string()})),
        )),
    }
}
