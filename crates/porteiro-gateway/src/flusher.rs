//! Deferred flush queue and worker pool.
//!
//! Ingress never runs the pipeline inline: it enqueues a [`FlushRequest`]
//! stamped with the earliest moment the buffer could be quiet. A fixed
//! pool of workers sleeps out the debounce remainder and then attempts
//! lock → flush → orchestrate → release. Non-holders walk away; a later
//! request (every inbound message schedules one) observes the buffer.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use porteiro_core::events::mask_phone;
use porteiro_core::now_ms;

use crate::app::AppState;

/// Grace added past the debounce window so the worker's clock check lands
/// strictly after the quiet period.
const FLUSH_SLACK_MS: u64 = 100;

#[derive(Debug)]
pub struct FlushRequest {
    pub phone: String,
    pub not_before: Instant,
}

/// Enqueue a deferred flush for `phone`. Returns `false` when the queue is
/// full or closed; the request is dropped with a warning — backpressure by
/// shedding, never by blocking the webhook.
pub fn schedule(tx: &mpsc::Sender<FlushRequest>, phone: &str, debounce_ms: i64) -> bool {
    let request = FlushRequest {
        phone: phone.to_string(),
        not_before: Instant::now()
            + Duration::from_millis(debounce_ms.max(0) as u64 + FLUSH_SLACK_MS),
    };
    match tx.try_send(request) {
        Ok(()) => true,
        Err(e) => {
            warn!(phone = %mask_phone(phone), error = %e, "flush queue full or closed, request dropped");
            false
        }
    }
}

/// Spawn `count` flush workers draining `rx` until cancellation.
pub fn spawn_workers(
    state: Arc<AppState>,
    rx: mpsc::Receiver<FlushRequest>,
    count: usize,
    cancel: CancellationToken,
) {
    let rx = Arc::new(Mutex::new(rx));
    for worker_id in 0..count.max(1) {
        let state = state.clone();
        let rx = rx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            worker_loop(state, rx, cancel, worker_id).await;
        });
    }
}

async fn worker_loop(
    state: Arc<AppState>,
    rx: Arc<Mutex<mpsc::Receiver<FlushRequest>>>,
    cancel: CancellationToken,
    worker_id: usize,
) {
    debug!(worker_id, "flush worker started");
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = async { rx.lock().await.recv().await } => match request {
                Some(request) => request,
                None => break,
            },
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep_until(request.not_before) => {}
        }

        process_flush(&state, &request.phone).await;
    }
    info!(worker_id, "flush worker stopped");
}

/// One flush attempt for one phone: acquire the turn lock, consume the
/// buffer if quiet, run the pipeline, release. Safe to call concurrently
/// from any number of workers — the lock admits one.
pub async fn process_flush(state: &AppState, phone: &str) {
    if !state.flags.pipeline_enabled() {
        debug!(phone = %mask_phone(phone), "pipeline disabled, flush skipped");
        return;
    }

    if !state.turns.try_acquire_lock(phone).await {
        return;
    }

    if let Some(turn) = state.turns.flush_if_quiet(phone, now_ms()).await {
        let outcome = state.orchestrator.run(&turn).await;
        debug!(
            phone = %mask_phone(phone),
            turn_id = %turn.turn_id,
            outcome = ?outcome,
            "pipeline run finished"
        );
    }

    state.turns.release_lock(phone).await;
}
