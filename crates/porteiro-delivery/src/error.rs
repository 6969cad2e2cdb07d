use thiserror::Error;

/// Errors that abort a delivery run.
///
/// Gateway failures are NOT in here — they are per-item outcomes handled
/// inside the loop (mark_failed + halt or continue). Only the outbox store
/// itself aborts the run, leaving untouched rows `queued` for retry.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Outbox(#[from] porteiro_outbox::OutboxError),
}

pub type Result<T> = std::result::Result<T, DeliveryError>;
