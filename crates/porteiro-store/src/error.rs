use thiserror::Error;

/// Errors from the key-value store.
///
/// `Unavailable` is transient — callers on the ingress side fail open on it,
/// callers on the delivery side leave state untouched and retry later.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached or timed out.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored value violated its expected shape.
    #[error("corrupt value at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
