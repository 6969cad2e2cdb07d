//! Deduplication records: two disjoint key families with distinct TTLs.
//!
//! - `msg:{instance}:{phone}:{message_id}` — the duplicate-webhook window,
//!   written at ingress via set-if-absent.
//! - `idem:{conversation_id}:{idempotency_key}` — delivered idempotency
//!   keys, the delivery worker's final at-most-once check.
//!
//! Both paths degrade OPEN on store outage: a false "not seen" is
//! acceptable because the outbox state machine is the second line of
//! defense, while a false "seen" would silently drop user messages.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use porteiro_core::types::ConversationId;

use crate::kv::KvStore;

pub struct DedupStore {
    kv: Arc<dyn KvStore>,
    message_ttl: Duration,
    idem_ttl: Duration,
}

fn msg_key(instance: &str, phone: &str, message_id: &str) -> String {
    format!("msg:{instance}:{phone}:{message_id}")
}

fn idem_key(conversation_id: &ConversationId, idempotency_key: &str) -> String {
    format!("idem:{conversation_id}:{idempotency_key}")
}

impl DedupStore {
    pub fn new(kv: Arc<dyn KvStore>, message_ttl: Duration, idem_ttl: Duration) -> Self {
        Self {
            kv,
            message_ttl,
            idem_ttl,
        }
    }

    /// Record a message id and report whether this was its first observation
    /// within the dedup window. Store errors report "first" (fail-open).
    pub async fn first_observation(&self, instance: &str, phone: &str, message_id: &str) -> bool {
        let key = msg_key(instance, phone, message_id);
        match self.kv.set_if_absent(&key, "1", self.message_ttl).await {
            Ok(first) => first,
            Err(e) => {
                warn!(error = %e, key = %key, "message dedup unavailable, allowing processing");
                true
            }
        }
    }

    /// Has this idempotency key already been delivered? Empty keys and store
    /// errors read as "not seen".
    pub async fn seen_idem(&self, conversation_id: &ConversationId, idempotency_key: &str) -> bool {
        if idempotency_key.is_empty() {
            warn!(conversation_id = %conversation_id, "empty idempotency key");
            return false;
        }
        let key = idem_key(conversation_id, idempotency_key);
        match self.kv.get(&key).await {
            Ok(seen) => {
                debug!(key = %key, seen = seen.is_some(), "idempotency check");
                seen.is_some()
            }
            Err(e) => {
                warn!(error = %e, key = %key, "idempotency check unavailable, assuming unseen");
                false
            }
        }
    }

    /// Mark an idempotency key as delivered. Returns `false` (without
    /// propagating) when the store is down; the conditional outbox update
    /// still prevents duplicate sends from this worker.
    pub async fn mark_idem(&self, conversation_id: &ConversationId, idempotency_key: &str) -> bool {
        if idempotency_key.is_empty() {
            warn!(conversation_id = %conversation_id, "refusing to mark empty idempotency key");
            return false;
        }
        let key = idem_key(conversation_id, idempotency_key);
        match self.kv.set(&key, "1", self.idem_ttl).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, key = %key, "failed to mark idempotency key");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKv;

    fn store() -> DedupStore {
        DedupStore::new(
            Arc::new(MemoryKv::new()),
            Duration::from_secs(60),
            Duration::from_secs(86_400),
        )
    }

    #[tokio::test]
    async fn second_observation_is_a_duplicate() {
        let dedup = store();
        assert!(dedup.first_observation("K", "5511999", "M1").await);
        assert!(!dedup.first_observation("K", "5511999", "M1").await);
        // different message id is independent
        assert!(dedup.first_observation("K", "5511999", "M2").await);
    }

    #[tokio::test]
    async fn key_families_do_not_collide() {
        let dedup = store();
        let cid = ConversationId::from("5511999");
        assert!(dedup.first_observation("K", "5511999", "M1").await);
        assert!(!dedup.seen_idem(&cid, "M1").await);
    }

    #[tokio::test]
    async fn idem_round_trip() {
        let dedup = store();
        let cid = ConversationId::from("5511999");
        assert!(!dedup.seen_idem(&cid, "abc123").await);
        assert!(dedup.mark_idem(&cid, "abc123").await);
        assert!(dedup.seen_idem(&cid, "abc123").await);
        // scoped per conversation
        assert!(!dedup.seen_idem(&ConversationId::from("other"), "abc123").await);
    }

    #[tokio::test]
    async fn empty_idem_key_is_never_seen_or_marked() {
        let dedup = store();
        let cid = ConversationId::from("5511999");
        assert!(!dedup.seen_idem(&cid, "").await);
        assert!(!dedup.mark_idem(&cid, "").await);
    }
}
