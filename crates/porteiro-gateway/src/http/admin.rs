//! Admin surface: turn/outbox/guard inspection, manual retry, flag toggles.
//!
//! Authentication of this surface is out of scope (deploy behind a
//! trusted network boundary).

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use porteiro_core::events::mask_phone;
use porteiro_core::flags::FlagsSnapshot;
use porteiro_core::types::{ConversationId, TurnId};

use crate::app::AppState;

/// GET /admin/turn/{phone} — buffer and lock state for a phone.
pub async fn turn_status(
    State(state): State<Arc<AppState>>,
    Path(phone): Path<String>,
) -> Json<Value> {
    let status = state.turns.status(&phone).await;
    Json(json!({
        "phone": mask_phone(&phone),
        "status": status,
    }))
}

/// GET /admin/outbox/{cid} — per-status counts for a conversation.
pub async fn outbox_stats(
    State(state): State<Arc<AppState>>,
    Path(cid): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let cid = ConversationId(cid);
    let stats = state.outbox.stats(&cid, None).map_err(db_error)?;
    let total = stats.total();
    Ok(Json(json!({
        "conversation_id": cid,
        "stats": stats,
        "total": total,
    })))
}

/// GET /admin/outbox/{cid}/{tid} — counts scoped to one turn.
pub async fn outbox_turn_stats(
    State(state): State<Arc<AppState>>,
    Path((cid, tid)): Path<(String, String)>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let cid = ConversationId(cid);
    let tid = TurnId(tid);
    let stats = state.outbox.stats(&cid, Some(&tid)).map_err(db_error)?;
    let total = stats.total();
    Ok(Json(json!({
        "conversation_id": cid,
        "turn_id": tid,
        "stats": stats,
        "total": total,
    })))
}

/// POST /admin/outbox/{cid}/{tid}/retry — the only path by which `failed`
/// rows re-enter `queued`. Triggers delivery for the turn immediately.
pub async fn outbox_retry(
    State(state): State<Arc<AppState>>,
    Path((cid, tid)): Path<(String, String)>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let cid = ConversationId(cid);
    let tid = TurnId(tid);

    let requeued = state.outbox.retry_failed(&cid, &tid).map_err(db_error)?;
    info!(conversation_id = %cid, turn_id = %tid, requeued, "manual outbox retry");

    let report = match state.delivery.deliver(&cid, &tid).await {
        Ok(report) => report,
        Err(porteiro_delivery::DeliveryError::Outbox(e)) => return Err(db_error(e)),
    };

    Ok(Json(json!({
        "conversation_id": cid,
        "turn_id": tid,
        "requeued": requeued,
        "report": report,
    })))
}

/// POST /admin/outbox/{cid}/{tid}/discard — abandon a turn's failed rows.
pub async fn outbox_discard(
    State(state): State<Arc<AppState>>,
    Path((cid, tid)): Path<(String, String)>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let cid = ConversationId(cid);
    let tid = TurnId(tid);
    let discarded = state.outbox.discard_failed(&cid, &tid).map_err(db_error)?;
    info!(conversation_id = %cid, turn_id = %tid, discarded, "failed outbox rows discarded");
    Ok(Json(json!({
        "conversation_id": cid,
        "turn_id": tid,
        "discarded": discarded,
    })))
}

/// POST /admin/outbox/purge — delete terminal rows older than `days`
/// (default 30) to keep the store bounded.
pub async fn outbox_purge(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let days = serde_json::from_slice::<Value>(&body)
        .ok()
        .as_ref()
        .and_then(|v| v.get("days"))
        .and_then(Value::as_u64)
        .unwrap_or(30) as u32;
    let purged = state.outbox.purge_older_than(days).map_err(db_error)?;
    info!(days, purged, "outbox purge");
    Ok(Json(json!({"days": days, "purged": purged})))
}

/// GET /admin/guards/{cid} — recursion counter and greeting cooldown.
pub async fn guard_stats(
    State(state): State<Arc<AppState>>,
    Path(cid): Path<String>,
) -> Json<Value> {
    let conversation_id = ConversationId(cid.clone());
    // conversation id is the phone number today; the greeting cooldown is
    // keyed by phone
    let stats = state.guards.stats(&conversation_id, &cid).await;
    Json(json!({
        "conversation_id": conversation_id,
        "guards": stats,
    }))
}

/// DELETE /admin/guards/{cid} — clear guard state for a conversation.
pub async fn guard_reset(
    State(state): State<Arc<AppState>>,
    Path(cid): Path<String>,
) -> Json<Value> {
    let conversation_id = ConversationId(cid.clone());
    state.guards.reset(&conversation_id, &cid).await;
    info!(conversation_id = %conversation_id, "guards reset");
    Json(json!({"reset": true}))
}

/// GET /admin/flags — current flag values.
pub async fn flags_get(State(state): State<Arc<AppState>>) -> Json<FlagsSnapshot> {
    Json(state.flags.snapshot())
}

/// PUT /admin/flags — replace flag values, effective immediately.
pub async fn flags_put(
    State(state): State<Arc<AppState>>,
    Json(snapshot): Json<FlagsSnapshot>,
) -> Json<FlagsSnapshot> {
    state.flags.apply(snapshot);
    info!(?snapshot, "feature flags updated");
    Json(state.flags.snapshot())
}

fn db_error(e: porteiro_outbox::OutboxError) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": e.to_string()})),
    )
}
