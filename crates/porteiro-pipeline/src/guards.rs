//! Workflow guards: recursion ceiling and greeting-loop cooldown.
//!
//! Both guards live in the KV store with short TTLs and degrade OPEN: a
//! store outage must never block a legitimate conversation, it only costs
//! us the loop protection until the store returns.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use porteiro_core::events::{self, mask_phone, Event, EventSink};
use porteiro_core::types::ConversationId;
use porteiro_store::KvStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardVerdict {
    Allowed,
    /// The conversation ran more pipeline entries than the ceiling within
    /// the counter TTL. One canned response, then stop.
    RecursionExceeded { count: i64 },
}

/// Current guard state for one conversation (admin/debugging).
#[derive(Debug, Clone, Serialize)]
pub struct GuardStats {
    pub recursion_count: i64,
    pub recursion_limit: u32,
    pub greeting_cooldown_secs: Option<u64>,
}

pub struct Guards {
    kv: Arc<dyn KvStore>,
    sink: Arc<dyn EventSink>,
    recursion_limit: u32,
    recursion_ttl: Duration,
    greeting_cooldown: Duration,
}

fn recursion_key(conversation_id: &ConversationId) -> String {
    format!("recursion_count:{conversation_id}")
}

fn greeting_key(phone: &str) -> String {
    format!("recent_greeting:{phone}")
}

impl Guards {
    pub fn new(
        kv: Arc<dyn KvStore>,
        sink: Arc<dyn EventSink>,
        recursion_limit: u32,
        recursion_ttl: Duration,
        greeting_cooldown: Duration,
    ) -> Self {
        Self {
            kv,
            sink,
            recursion_limit,
            recursion_ttl,
            greeting_cooldown,
        }
    }

    /// Count one pipeline entry for the conversation. The counter TTL
    /// refreshes on every entry, so the window measures inactivity.
    pub async fn check_recursion(&self, conversation_id: &ConversationId) -> GuardVerdict {
        let key = recursion_key(conversation_id);
        let count = match self.kv.incr(&key, self.recursion_ttl).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, conversation_id = %conversation_id, "recursion guard unavailable, allowing");
                return GuardVerdict::Allowed;
            }
        };

        if count > self.recursion_limit as i64 {
            self.sink.emit(
                &Event::new(events::GUARD, "recursion_exceeded")
                    .field("conversation_id", conversation_id)
                    .field("count", count)
                    .field("limit", self.recursion_limit),
            );
            GuardVerdict::RecursionExceeded { count }
        } else {
            GuardVerdict::Allowed
        }
    }

    /// `true` when a greeting reply may go out now; arms the cooldown as a
    /// side effect. `false` means a greeting was delivered within the
    /// cooldown window — answer with a neutral follow-up instead.
    pub async fn greeting_allowed(&self, phone: &str) -> bool {
        let key = greeting_key(phone);
        match self
            .kv
            .set_if_absent(&key, "1", self.greeting_cooldown)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                self.sink.emit(
                    &Event::new(events::GUARD, "greeting_loop_prevented")
                        .field("phone", mask_phone(phone)),
                );
                false
            }
            Err(e) => {
                warn!(error = %e, phone = %mask_phone(phone), "greeting guard unavailable, allowing");
                true
            }
        }
    }

    pub async fn stats(&self, conversation_id: &ConversationId, phone: &str) -> GuardStats {
        let recursion_count = match self.kv.get(&recursion_key(conversation_id)).await {
            Ok(Some(raw)) => raw.parse().unwrap_or(0),
            _ => 0,
        };
        let greeting_cooldown_secs = match self.kv.ttl(&greeting_key(phone)).await {
            Ok(ttl) => ttl.map(|d| d.as_secs()),
            Err(_) => None,
        };
        GuardStats {
            recursion_count,
            recursion_limit: self.recursion_limit,
            greeting_cooldown_secs,
        }
    }

    /// Clear all guard state for a conversation (admin action).
    pub async fn reset(&self, conversation_id: &ConversationId, phone: &str) {
        let _ = self.kv.delete(&recursion_key(conversation_id)).await;
        let _ = self.kv.delete(&greeting_key(phone)).await;
    }
}
