//! Input sanitization and per-phone rate limiting.
//!
//! Pure preprocessing, no orchestration: the orchestrator calls
//! [`sanitize`] on the aggregated turn text and [`RateLimiter::check`]
//! before anything else runs.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use porteiro_core::events::mask_phone;
use porteiro_core::now_ms;
use porteiro_store::KvStore;

/// Sanitize user text: truncate to `max_chars`, drop `<script>` blocks and
/// HTML tags, and collapse runs of spaces. Newlines are preserved — they
/// are the aggregation boundaries between burst messages.
pub fn sanitize(text: &str, max_chars: usize) -> String {
    let truncated: String = text.chars().take(max_chars).collect();
    let no_scripts = strip_script_blocks(&truncated);
    let no_tags = strip_tags(&no_scripts);
    normalize_whitespace(&no_tags)
}

/// Remove `<script …>…</script>` spans, case-insensitively. An unclosed
/// opening tag removes through the end of the input.
fn strip_script_blocks(text: &str) -> String {
    // ASCII lowering keeps byte offsets aligned with the original text.
    let lower = text.to_ascii_lowercase();
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    while let Some(start) = lower[pos..].find("<script") {
        let start = pos + start;
        out.push_str(&text[pos..start]);
        match lower[start..].find("</script>") {
            Some(end) => pos = start + end + "</script>".len(),
            None => return out,
        }
    }
    out.push_str(&text[pos..]);
    out
}

/// Strip anything between `<` and `>`. A dangling `<` is dropped with the
/// rest of the input — user text is not markup, losing it is the safe side.
fn strip_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

/// Collapse horizontal whitespace within each line and trim the result,
/// keeping line boundaries intact.
fn normalize_whitespace(text: &str) -> String {
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Sliding-window rate limiter keyed by phone number.
///
/// The window is a JSON list of recent timestamps under `rate:{phone}`.
/// The read-filter-write sequence is not atomic; a racing duplicate entry
/// only makes the limit marginally stricter, which is acceptable for a
/// load-shedding guard. Degrades OPEN on store outage.
pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    limit: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>, limit: usize, window: Duration) -> Self {
        Self { kv, limit, window }
    }

    /// `true` when the phone is under its budget; records the request.
    pub async fn check(&self, phone: &str) -> bool {
        let key = format!("rate:{phone}");
        let now = now_ms();
        let window_start = now - self.window.as_millis() as i64;

        let mut stamps: Vec<i64> = match self.kv.get(&key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_default(),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, phone = %mask_phone(phone), "rate limiter unavailable, allowing");
                return true;
            }
        };
        stamps.retain(|ts| *ts > window_start);

        if stamps.len() >= self.limit {
            warn!(
                phone = %mask_phone(phone),
                count = stamps.len(),
                limit = self.limit,
                "rate limit exceeded"
            );
            return false;
        }

        stamps.push(now);
        let serialized = serde_json::to_string(&stamps).unwrap_or_else(|_| "[]".to_string());
        let ttl = self.window + Duration::from_secs(10);
        if let Err(e) = self.kv.set(&key, &serialized, ttl).await {
            warn!(error = %e, phone = %mask_phone(phone), "rate window write failed");
        }
        debug!(phone = %mask_phone(phone), count = stamps.len(), limit = self.limit, "rate check passed");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use porteiro_store::MemoryKv;

    #[test]
    fn sanitize_truncates_to_char_budget() {
        let long = "a".repeat(1500);
        assert_eq!(sanitize(&long, 1000).len(), 1000);
        // multi-byte chars are counted as chars, not bytes
        let acentos = "ã".repeat(1200);
        assert_eq!(sanitize(&acentos, 1000).chars().count(), 1000);
    }

    #[test]
    fn sanitize_strips_script_blocks() {
        let text = "oi <ScRiPt>alert('x')</script> tudo bem";
        assert_eq!(sanitize(text, 1000), "oi tudo bem");
        // unclosed script swallows the rest
        assert_eq!(sanitize("antes <script>resto", 1000), "antes");
    }

    #[test]
    fn sanitize_strips_tags_but_keeps_text() {
        assert_eq!(sanitize("quero <b>agendar</b> hoje", 1000), "quero agendar hoje");
    }

    #[test]
    fn sanitize_preserves_line_boundaries() {
        assert_eq!(sanitize("oi\nbom   dia\ndia", 1000), "oi\nbom dia\ndia");
    }

    #[test]
    fn sanitize_drops_blank_lines_and_trims() {
        assert_eq!(sanitize("  oi  \n   \n dia ", 1000), "oi\ndia");
    }

    #[tokio::test]
    async fn rate_limiter_allows_until_the_budget() {
        let limiter = RateLimiter::new(Arc::new(MemoryKv::new()), 3, Duration::from_secs(60));
        assert!(limiter.check("5511999").await);
        assert!(limiter.check("5511999").await);
        assert!(limiter.check("5511999").await);
        assert!(!limiter.check("5511999").await);
        // other phones are unaffected
        assert!(limiter.check("5511888").await);
    }
}
