//! Turn aggregation: per-phone message buffer, debounce flush, turn lock.
//!
//! The controller owns two KV keys per phone:
//!   - `turn:{phone}:buffer` — ordered JSON list of `{id, text, ts}` records
//!   - `turn:{phone}:lock`   — mutual exclusion token for planning
//!
//! State machine per phone: Idle → Buffering (first append) → Quiet
//! (debounce elapsed) → Planning (lock held, buffer consumed) → Idle.
//! Appends arriving while a turn is Planning land in a fresh buffer and
//! form the *next* turn, because flush removes the buffer atomically.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use porteiro_core::events::{self, mask_phone, Event, EventSink};
use porteiro_core::types::{BufferedMessage, ConversationId, Turn};
use porteiro_store::KvStore;

use crate::turn_id::make_turn_id;

/// Retry budget for buffer appends. Ad-hoc retries elsewhere are forbidden;
/// the delivery loop is the only other retry site.
const APPEND_ATTEMPTS: u32 = 2;

pub struct TurnController {
    kv: Arc<dyn KvStore>,
    sink: Arc<dyn EventSink>,
    debounce_ms: i64,
    buffer_ttl: Duration,
    lock_ttl: Duration,
}

/// Lock and buffer state for one phone, for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct TurnStatus {
    pub locked: bool,
    pub lock_ttl_secs: Option<u64>,
    pub buffer_size: usize,
    pub buffer_ttl_secs: Option<u64>,
}

fn buffer_key(phone: &str) -> String {
    format!("turn:{phone}:buffer")
}

fn lock_key(phone: &str) -> String {
    format!("turn:{phone}:lock")
}

impl TurnController {
    pub fn new(
        kv: Arc<dyn KvStore>,
        sink: Arc<dyn EventSink>,
        debounce_ms: i64,
        buffer_ttl: Duration,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            kv,
            sink,
            debounce_ms,
            buffer_ttl,
            lock_ttl,
        }
    }

    /// Append one inbound message to the phone's buffer.
    ///
    /// This is the ingress-side retry chokepoint: one bounded retry on a
    /// store error, then fail OPEN — the message is dropped from
    /// aggregation (the upstream redelivers) and the failure is logged; the
    /// caller's webhook response is unaffected. A message id already in the
    /// buffer is skipped, keeping the buffer duplicate-free even if the
    /// ingress dedup record expired between redeliveries.
    pub async fn append(&self, phone: &str, msg_id: &str, text: &str, ts_ms: i64) {
        for attempt in 1..=APPEND_ATTEMPTS {
            match self.try_append(phone, msg_id, text, ts_ms).await {
                Ok(None) => {
                    debug!(phone = %mask_phone(phone), msg_id = %msg_id, "message already buffered");
                    return;
                }
                Ok(Some(buffer_size)) => {
                    self.sink.emit(
                        &Event::new(events::TURN, "appended")
                            .field("phone", mask_phone(phone))
                            .field("msg_id", msg_id)
                            .field("buffer_size", buffer_size)
                            .field("text_len", text.len()),
                    );
                    return;
                }
                Err(e) if attempt < APPEND_ATTEMPTS => {
                    debug!(error = %e, phone = %mask_phone(phone), attempt, "buffer append failed, retrying");
                }
                Err(e) => {
                    warn!(error = %e, phone = %mask_phone(phone), "buffer append failed, message not aggregated");
                }
            }
        }
    }

    /// One append attempt. `Ok(None)` means the id was already buffered;
    /// `Ok(Some(n))` is the buffer size after the write.
    async fn try_append(
        &self,
        phone: &str,
        msg_id: &str,
        text: &str,
        ts_ms: i64,
    ) -> porteiro_store::Result<Option<usize>> {
        let key = buffer_key(phone);
        let raw = self.kv.get(&key).await?;
        let mut buf = parse_buffer(&key, raw.as_deref());

        if buf.iter().any(|m| m.id == msg_id) {
            return Ok(None);
        }

        buf.push(BufferedMessage {
            id: msg_id.to_string(),
            text: text.to_string(),
            ts: ts_ms,
        });

        // Vec<BufferedMessage> serialization cannot fail; default to the
        // empty list rather than wiring serde errors through the store type.
        let serialized = serde_json::to_string(&buf).unwrap_or_else(|_| "[]".to_string());
        self.kv.set(&key, &serialized, self.buffer_ttl).await?;
        Ok(Some(buf.len()))
    }

    /// Flush the phone's buffer into a [`Turn`] if the debounce window has
    /// elapsed since the last message. Returns `None` while messages are
    /// still arriving, when the buffer is empty, or on store outage.
    ///
    /// Consumption is atomic (read-and-delete): of two workers racing on
    /// the same quiet buffer, exactly one obtains the snapshot.
    pub async fn flush_if_quiet(&self, phone: &str, now_ms: i64) -> Option<Turn> {
        let key = buffer_key(phone);
        let buf = match self.kv.get(&key).await {
            Ok(raw) => parse_buffer(&key, raw.as_deref()),
            Err(e) => {
                warn!(error = %e, phone = %mask_phone(phone), "buffer read failed, flush skipped");
                return None;
            }
        };

        let last = match buf.last() {
            Some(last) => last,
            None => {
                self.sink.emit(
                    &Event::new(events::TURN, "flush_empty").field("phone", mask_phone(phone)),
                );
                return None;
            }
        };

        let since_last = now_ms - last.ts;
        if since_last < self.debounce_ms {
            debug!(
                phone = %mask_phone(phone),
                since_last_ms = since_last,
                debounce_ms = self.debounce_ms,
                "buffer not quiet yet"
            );
            return None;
        }

        // Atomically consume. The taken value is authoritative: it may have
        // grown since the read above, and it may be gone if another worker
        // won the race.
        let taken = match self.kv.take(&key).await {
            Ok(taken) => taken?,
            Err(e) => {
                warn!(error = %e, phone = %mask_phone(phone), "buffer take failed, flush skipped");
                return None;
            }
        };
        let buf = parse_buffer(&key, Some(&taken));
        let (first, last) = match (buf.first(), buf.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return None,
        };

        let turn_id = make_turn_id(phone, &first.id, first.ts);
        let text = buf
            .iter()
            .map(|m| m.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        let turn = Turn {
            turn_id: turn_id.clone(),
            conversation_id: ConversationId::from_phone(phone),
            phone: phone.to_string(),
            text,
            first_ts: first.ts,
            last_ts: last.ts,
            messages: buf,
        };

        self.sink.emit(
            &Event::new(events::TURN, "flush_ready")
                .field("phone", mask_phone(phone))
                .field("turn_id", &turn_id)
                .field("msg_count", turn.message_count())
                .field("text_len", turn.text.len())
                .field("span_ms", turn.span_ms()),
        );

        Some(turn)
    }

    /// Try to acquire the phone's turn lock. `true` grants the right to run
    /// the planner for the current buffer; `false` means another worker
    /// holds it — do NOT plan, a later flush will pick the buffer up.
    /// Store outage reads as not-acquired.
    pub async fn try_acquire_lock(&self, phone: &str) -> bool {
        let key = lock_key(phone);
        match self.kv.set_if_absent(&key, "1", self.lock_ttl).await {
            Ok(true) => {
                self.sink.emit(
                    &Event::new(events::TURN, "lock_acquired")
                        .field("phone", mask_phone(phone))
                        .field("ttl_secs", self.lock_ttl.as_secs()),
                );
                true
            }
            Ok(false) => {
                self.sink.emit(
                    &Event::new(events::TURN, "lock_waiting").field("phone", mask_phone(phone)),
                );
                false
            }
            Err(e) => {
                warn!(error = %e, phone = %mask_phone(phone), "lock store unavailable, not planning");
                false
            }
        }
    }

    /// Release the turn lock. Idempotent; on store failure the TTL cleans up.
    pub async fn release_lock(&self, phone: &str) {
        let key = lock_key(phone);
        match self.kv.delete(&key).await {
            Ok(_) => {
                self.sink.emit(
                    &Event::new(events::TURN, "lock_released").field("phone", mask_phone(phone)),
                );
            }
            Err(e) => {
                warn!(error = %e, phone = %mask_phone(phone), "lock release failed, TTL will expire it");
            }
        }
    }

    /// Inspect lock and buffer state for a phone (admin/debugging).
    pub async fn status(&self, phone: &str) -> TurnStatus {
        let locked = matches!(self.kv.get(&lock_key(phone)).await, Ok(Some(_)));
        let lock_ttl_secs = match self.kv.ttl(&lock_key(phone)).await {
            Ok(ttl) => ttl.map(|d| d.as_secs()),
            Err(_) => None,
        };
        let buf = match self.kv.get(&buffer_key(phone)).await {
            Ok(raw) => parse_buffer(&buffer_key(phone), raw.as_deref()),
            Err(_) => Vec::new(),
        };
        let buffer_ttl_secs = match self.kv.ttl(&buffer_key(phone)).await {
            Ok(ttl) => ttl.map(|d| d.as_secs()),
            Err(_) => None,
        };
        TurnStatus {
            locked,
            lock_ttl_secs,
            buffer_size: buf.len(),
            buffer_ttl_secs,
        }
    }
}

/// Decode a stored buffer. An unparseable payload is reset to empty rather
/// than propagating corruption into every later append.
fn parse_buffer(key: &str, raw: Option<&str>) -> Vec<BufferedMessage> {
    match raw {
        None => Vec::new(),
        Some(raw) => match serde_json::from_str(raw) {
            Ok(buf) => buf,
            Err(e) => {
                warn!(key = %key, error = %e, "corrupt buffer payload, resetting");
                Vec::new()
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use porteiro_core::events::NoopSink;
    use porteiro_store::MemoryKv;

    const DEBOUNCE_MS: i64 = 1200;

    fn controller() -> (TurnController, Arc<MemoryKv>) {
        let kv = Arc::new(MemoryKv::new());
        let ctl = TurnController::new(
            kv.clone(),
            Arc::new(NoopSink),
            DEBOUNCE_MS,
            Duration::from_secs(60),
            Duration::from_secs(15),
        );
        (ctl, kv)
    }

    #[tokio::test]
    async fn flush_waits_for_the_debounce_window() {
        let (ctl, _) = controller();
        ctl.append("5511999", "M1", "oi", 1000).await;

        assert!(ctl.flush_if_quiet("5511999", 1000 + DEBOUNCE_MS - 1).await.is_none());
        let turn = ctl.flush_if_quiet("5511999", 1000 + DEBOUNCE_MS).await.unwrap();
        assert_eq!(turn.turn_id.as_str(), "ce220cd4adac20cc");
        assert_eq!(turn.text, "oi");
        assert_eq!(turn.message_count(), 1);
    }

    #[tokio::test]
    async fn burst_aggregates_in_arrival_order() {
        let (ctl, _) = controller();
        ctl.append("5511999", "M1", "oi", 1000).await;
        ctl.append("5511999", "M2", "bom", 1400).await;
        ctl.append("5511999", "M3", "dia", 1800).await;

        let turn = ctl.flush_if_quiet("5511999", 3000).await.unwrap();
        assert_eq!(turn.text, "oi\nbom\ndia");
        assert_eq!(turn.span_ms(), 800);
        // one turn id for the whole burst, derived from the first message
        assert_eq!(turn.turn_id, make_turn_id("5511999", "M1", 1000));
    }

    #[tokio::test]
    async fn empty_texts_are_dropped_from_aggregation_but_kept_in_the_snapshot() {
        let (ctl, _) = controller();
        ctl.append("5511999", "M1", "oi", 1000).await;
        ctl.append("5511999", "M2", "   ", 1100).await;
        ctl.append("5511999", "M3", "dia", 1200).await;

        let turn = ctl.flush_if_quiet("5511999", 5000).await.unwrap();
        assert_eq!(turn.text, "oi\ndia");
        assert_eq!(turn.message_count(), 3);
    }

    #[tokio::test]
    async fn duplicate_message_id_appends_once() {
        let (ctl, _) = controller();
        ctl.append("5511999", "M1", "oi", 1000).await;
        ctl.append("5511999", "M1", "oi", 1000).await;

        let turn = ctl.flush_if_quiet("5511999", 5000).await.unwrap();
        assert_eq!(turn.message_count(), 1);
    }

    #[tokio::test]
    async fn flush_consumes_the_buffer() {
        let (ctl, _) = controller();
        ctl.append("5511999", "M1", "oi", 1000).await;
        assert!(ctl.flush_if_quiet("5511999", 5000).await.is_some());
        // consumed: a second flush sees an empty buffer
        assert!(ctl.flush_if_quiet("5511999", 5000).await.is_none());
    }

    #[tokio::test]
    async fn appends_after_flush_start_a_new_turn() {
        let (ctl, _) = controller();
        ctl.append("5511999", "M1", "oi", 1000).await;
        let first = ctl.flush_if_quiet("5511999", 5000).await.unwrap();

        ctl.append("5511999", "M2", "mais", 6000).await;
        let second = ctl.flush_if_quiet("5511999", 9000).await.unwrap();
        assert_ne!(first.turn_id, second.turn_id);
        assert_eq!(second.text, "mais");
    }

    #[tokio::test]
    async fn corrupt_buffer_resets_instead_of_poisoning() {
        let (ctl, kv) = controller();
        kv.set("turn:5511999:buffer", "{not json", Duration::from_secs(60))
            .await
            .unwrap();
        ctl.append("5511999", "M1", "oi", 1000).await;

        let turn = ctl.flush_if_quiet("5511999", 5000).await.unwrap();
        assert_eq!(turn.message_count(), 1);
        assert_eq!(turn.text, "oi");
    }

    #[tokio::test]
    async fn lock_is_exclusive_and_release_is_idempotent() {
        let (ctl, _) = controller();
        assert!(ctl.try_acquire_lock("5511999").await);
        assert!(!ctl.try_acquire_lock("5511999").await);
        // independent per phone
        assert!(ctl.try_acquire_lock("5511888").await);

        ctl.release_lock("5511999").await;
        ctl.release_lock("5511999").await;
        assert!(ctl.try_acquire_lock("5511999").await);
    }

    #[tokio::test]
    async fn status_reports_buffer_and_lock() {
        let (ctl, _) = controller();
        ctl.append("5511999", "M1", "oi", 1000).await;
        ctl.try_acquire_lock("5511999").await;

        let status = ctl.status("5511999").await;
        assert!(status.locked);
        assert_eq!(status.buffer_size, 1);
        assert!(status.buffer_ttl_secs.is_some());
    }
}
