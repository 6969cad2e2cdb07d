pub mod breaker;
pub mod config;
pub mod error;
pub mod events;
pub mod flags;
pub mod types;

pub use error::{PorteiroError, Result};

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Gateway timestamps are advisory; this is the server-side clock used for
/// debounce arithmetic and as a fallback when a webhook omits its timestamp.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
