//! Deterministic turn identity.

use sha2::{Digest, Sha256};

use porteiro_core::types::TurnId;

/// Derive the turn id from the first message of a buffer.
///
/// `sha256("{phone}:{first_msg_id}:{first_ts_ms / 1000}")`, first 16 hex
/// chars. The timestamp is truncated to seconds so that gateway clock
/// jitter below one second cannot split a turn's identity. Two workers
/// observing the same first message always derive the same id.
pub fn make_turn_id(phone: &str, first_msg_id: &str, first_ts_ms: i64) -> TurnId {
    let first_ts_s = first_ts_ms.div_euclid(1000);
    let raw = format!("{phone}:{first_msg_id}:{first_ts_s}");
    let digest = Sha256::digest(raw.as_bytes());
    TurnId(hex::encode(digest)[..16].to_string())
}
