use thiserror::Error;

/// Errors from the authoritative outbox store.
///
/// Unlike the ingress-side stores, the outbox never fails open: a failed
/// `mark_sent` leaves the row `queued` and the item is retried later.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// Underlying SQLite / rusqlite error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored payload could not be serialized or decoded.
    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OutboxError>;
