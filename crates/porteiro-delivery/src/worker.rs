//! Delivery worker: rehydrate a turn's outbox and send it, at most once.
//!
//! At-most-once user-visible delivery is the conjunction of three
//! mechanisms, in order of authority:
//!   1. the idempotency-key record, written BEFORE the status flip — a
//!      crash between the two converges to `dedup_hit` on the next run;
//!   2. the outbox's conditional `queued → sent` update — of two racing
//!      workers exactly one wins the flip;
//!   3. whatever message-id dedup the provider itself offers (not relied on).
//!
//! Ordering matters: items go out in `item_index` order and a transient
//! failure halts the turn so a later item can never overtake a failed one.
//! A `failed` row re-enters `queued` only through an explicit operator
//! retry; until then it blocks its turn and the worker walks away.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use porteiro_core::breaker::CircuitBreaker;
use porteiro_core::events::{self, Event, EventSink};
use porteiro_core::types::{ConversationId, TurnId};
use porteiro_outbox::{OutboxRepository, OutboxStatus};
use porteiro_store::DedupStore;

use crate::error::Result;
use crate::gateway::{GatewayError, OutboundGateway};

pub struct DeliveryWorker {
    outbox: Arc<OutboxRepository>,
    dedup: Arc<DedupStore>,
    gateway: Arc<dyn OutboundGateway>,
    breaker: Arc<CircuitBreaker>,
    sink: Arc<dyn EventSink>,
    /// Wall-clock budget for one delivery trigger. Items not reached before
    /// the deadline stay pending and ride the next trigger.
    deadline: Duration,
}

/// Counts for one delivery run.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DeliveryReport {
    pub sent: u32,
    pub dedup_hits: u32,
    pub failed: u32,
    /// Items left pending (deadline hit or halted behind a transient failure).
    pub remaining: u32,
}

impl DeliveryWorker {
    pub fn new(
        outbox: Arc<OutboxRepository>,
        dedup: Arc<DedupStore>,
        gateway: Arc<dyn OutboundGateway>,
        breaker: Arc<CircuitBreaker>,
        sink: Arc<dyn EventSink>,
        deadline: Duration,
    ) -> Self {
        Self {
            outbox,
            dedup,
            gateway,
            breaker,
            sink,
            deadline,
        }
    }

    /// Deliver every pending item of `(conversation_id, turn_id)` in order.
    ///
    /// Safe to invoke any number of times: after a fully successful run the
    /// next call finds nothing pending and is a no-op.
    pub async fn deliver(
        &self,
        conversation_id: &ConversationId,
        turn_id: &TurnId,
    ) -> Result<DeliveryReport> {
        let started = Instant::now();
        self.sink.emit(
            &Event::new(events::PIPELINE, "delivery_start")
                .field("conversation_id", conversation_id)
                .field("turn_id", turn_id),
        );

        let items = self.outbox.load_pending(conversation_id, turn_id)?;
        let total = items.len() as u32;
        let mut report = DeliveryReport::default();
        let deadline = started + self.deadline;

        for item in items {
            if Instant::now() >= deadline {
                warn!(
                    conversation_id = %conversation_id,
                    turn_id = %turn_id,
                    item_index = item.item_index,
                    "delivery deadline exceeded, remaining items stay queued"
                );
                break;
            }

            // Failed rows wait for an explicit operator retry; ordering
            // forbids sending anything queued behind them.
            if item.status == OutboxStatus::Failed {
                debug!(
                    conversation_id = %conversation_id,
                    turn_id = %turn_id,
                    item_index = item.item_index,
                    "failed item awaits operator retry, turn halted"
                );
                break;
            }

            // Final at-most-once check: a key marked delivered means a
            // previous attempt got at least as far as the gateway call.
            if self.dedup.seen_idem(conversation_id, &item.idempotency_key).await {
                self.sink.emit(
                    &Event::new(events::DELIVERY, "dedup_hit")
                        .field("conversation_id", conversation_id)
                        .field("turn_id", turn_id)
                        .field("idempotency_key", &item.idempotency_key),
                );
                let provider_id = item
                    .provider_message_id
                    .clone()
                    .unwrap_or_else(|| "converged".to_string());
                self.outbox
                    .mark_sent(conversation_id, turn_id, item.item_index, &provider_id)?;
                report.dedup_hits += 1;
                continue;
            }

            if let Err(open) = self.breaker.try_acquire() {
                self.sink.emit(
                    &Event::new(events::GUARD, "circuit_open")
                        .field("conversation_id", conversation_id)
                        .field("turn_id", turn_id)
                        .field("retry_in_ms", open.retry_in_ms),
                );
                self.outbox
                    .mark_failed(conversation_id, turn_id, item.item_index, "circuit_open")?;
                report.failed += 1;
                break;
            }

            match timeout_at(deadline, self.gateway.send(&item.payload)).await {
                Ok(Ok(receipt)) => {
                    self.breaker.on_success();
                    // Idem first, status second: a crash in between is
                    // converged by the dedup_hit branch above.
                    self.dedup.mark_idem(conversation_id, &item.idempotency_key).await;
                    self.outbox.mark_sent(
                        conversation_id,
                        turn_id,
                        item.item_index,
                        &receipt.provider_message_id,
                    )?;
                    self.sink.emit(
                        &Event::new(events::DELIVERY, "sent")
                            .field("conversation_id", conversation_id)
                            .field("turn_id", turn_id)
                            .field("item_index", item.item_index)
                            .field("provider_message_id", &receipt.provider_message_id),
                    );
                    report.sent += 1;
                }
                Ok(Err(e)) if e.is_transient() => {
                    self.breaker.on_failure();
                    self.outbox
                        .mark_failed(conversation_id, turn_id, item.item_index, e.reason())?;
                    self.sink.emit(
                        &Event::new(events::DELIVERY, "failed")
                            .field("conversation_id", conversation_id)
                            .field("turn_id", turn_id)
                            .field("item_index", item.item_index)
                            .field("reason", e.reason()),
                    );
                    report.failed += 1;
                    // Ordering: do not let later items overtake this one.
                    break;
                }
                Ok(Err(e)) => {
                    self.outbox
                        .mark_failed(conversation_id, turn_id, item.item_index, e.reason())?;
                    self.sink.emit(
                        &Event::new(events::DELIVERY, "failed")
                            .field("conversation_id", conversation_id)
                            .field("turn_id", turn_id)
                            .field("item_index", item.item_index)
                            .field("reason", e.reason()),
                    );
                    report.failed += 1;
                    // Permanent: retrying cannot help, move to the next item.
                }
                Err(_elapsed) => {
                    self.breaker.on_failure();
                    self.outbox.mark_failed(
                        conversation_id,
                        turn_id,
                        item.item_index,
                        "deadline_exceeded",
                    )?;
                    report.failed += 1;
                    break;
                }
            }
        }

        report.remaining = total - report.sent - report.dedup_hits - report.failed;
        self.sink.emit(
            &Event::new(events::PIPELINE, "delivery_complete")
                .field("conversation_id", conversation_id)
                .field("turn_id", turn_id)
                .field("sent", report.sent)
                .field("dedup_hits", report.dedup_hits)
                .field("failed", report.failed)
                .field("remaining", report.remaining)
                .field("duration_ms", started.elapsed().as_millis()),
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use rusqlite::Connection;

    use porteiro_core::events::NoopSink;
    use porteiro_core::types::{MessagePayload, PlannedMessage};
    use porteiro_store::MemoryKv;

    use crate::gateway::SendReceipt;

    /// Scripted gateway: pops one outcome per send, records payload texts.
    struct FakeGateway {
        script: Mutex<VecDeque<std::result::Result<SendReceipt, GatewayError>>>,
        sends: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl FakeGateway {
        fn new(outcomes: Vec<std::result::Result<SendReceipt, GatewayError>>) -> Self {
            Self {
                script: Mutex::new(outcomes.into()),
                sends: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }

        fn ok(id: &str) -> std::result::Result<SendReceipt, GatewayError> {
            Ok(SendReceipt {
                provider_message_id: id.to_string(),
                status: "sent".to_string(),
            })
        }

        fn send_log(&self) -> Vec<String> {
            self.sends.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OutboundGateway for FakeGateway {
        async fn send(
            &self,
            payload: &MessagePayload,
        ) -> std::result::Result<SendReceipt, GatewayError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.sends.lock().unwrap().push(payload.text.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| FakeGateway::ok("default"))
        }
    }

    struct Fixture {
        outbox: Arc<OutboxRepository>,
        dedup: Arc<DedupStore>,
        gateway: Arc<FakeGateway>,
        worker: DeliveryWorker,
        cid: ConversationId,
        tid: TurnId,
    }

    fn fixture(gateway: FakeGateway) -> Fixture {
        let sink: Arc<dyn EventSink> = Arc::new(NoopSink);
        let outbox = Arc::new(
            OutboxRepository::new(Connection::open_in_memory().unwrap(), sink.clone()).unwrap(),
        );
        let dedup = Arc::new(DedupStore::new(
            Arc::new(MemoryKv::new()),
            Duration::from_secs(60),
            Duration::from_secs(86_400),
        ));
        let gateway = Arc::new(gateway);
        let breaker = Arc::new(CircuitBreaker::new("gateway", 2, Duration::from_secs(15)));
        let worker = DeliveryWorker::new(
            outbox.clone(),
            dedup.clone(),
            gateway.clone(),
            breaker,
            sink,
            Duration::from_secs(30),
        );
        Fixture {
            outbox,
            dedup,
            gateway,
            worker,
            cid: ConversationId::from("5511999"),
            tid: TurnId::from("turn01"),
        }
    }

    fn planned(text: &str, key: &str) -> PlannedMessage {
        PlannedMessage {
            payload: MessagePayload::whatsapp_text("5511999", text),
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn delivers_in_order_and_marks_sent() {
        let f = fixture(FakeGateway::new(vec![
            FakeGateway::ok("p0"),
            FakeGateway::ok("p1"),
        ]));
        f.outbox
            .save(&f.cid, &f.tid, &[planned("first", "k0"), planned("second", "k1")])
            .unwrap();

        let report = f.worker.deliver(&f.cid, &f.tid).await.unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(f.gateway.send_log(), vec!["first", "second"]);
        assert!(f.dedup.seen_idem(&f.cid, "k0").await);
        assert!(f.dedup.seen_idem(&f.cid, "k1").await);
        assert!(f.outbox.load_pending(&f.cid, &f.tid).unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeated_delivery_after_success_is_a_no_op() {
        let f = fixture(FakeGateway::new(vec![FakeGateway::ok("p0")]));
        f.outbox.save(&f.cid, &f.tid, &[planned("oi", "k0")]).unwrap();

        f.worker.deliver(&f.cid, &f.tid).await.unwrap();
        let second = f.worker.deliver(&f.cid, &f.tid).await.unwrap();
        assert_eq!(second.sent, 0);
        assert_eq!(second.dedup_hits, 0);
        // the gateway saw exactly one send
        assert_eq!(f.gateway.send_log().len(), 1);
    }

    #[tokio::test]
    async fn crash_between_idem_and_mark_sent_converges_via_dedup_hit() {
        let f = fixture(FakeGateway::new(vec![]));
        f.outbox.save(&f.cid, &f.tid, &[planned("oi", "k0")]).unwrap();
        // Simulate a worker that died after marking the idempotency key but
        // before flipping the row.
        f.dedup.mark_idem(&f.cid, "k0").await;

        let report = f.worker.deliver(&f.cid, &f.tid).await.unwrap();
        assert_eq!(report.dedup_hits, 1);
        assert_eq!(report.sent, 0);
        // no duplicate send went out, and the row converged to sent
        assert!(f.gateway.send_log().is_empty());
        assert!(f.outbox.load_pending(&f.cid, &f.tid).unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_failure_halts_the_turn_until_operator_retry() {
        let f = fixture(FakeGateway::new(vec![
            FakeGateway::ok("p0"),
            Err(GatewayError::Transient("503".into())),
            FakeGateway::ok("p1"),
        ]));
        f.outbox
            .save(&f.cid, &f.tid, &[planned("a", "k0"), planned("b", "k1"), planned("c", "k2")])
            .unwrap();

        let first = f.worker.deliver(&f.cid, &f.tid).await.unwrap();
        assert_eq!(first.sent, 1);
        assert_eq!(first.failed, 1);
        assert_eq!(first.remaining, 1);
        // item 2 was never attempted
        assert_eq!(f.gateway.send_log(), vec!["a", "b"]);

        // without an operator retry the failed row blocks the whole turn
        let stalled = f.worker.deliver(&f.cid, &f.tid).await.unwrap();
        assert_eq!(stalled.sent, 0);
        assert_eq!(stalled.remaining, 2);
        assert_eq!(f.gateway.send_log(), vec!["a", "b"]);

        // explicit retry re-queues item 1; the next trigger finishes in order
        assert_eq!(f.outbox.retry_failed(&f.cid, &f.tid).unwrap(), 1);
        let second = f.worker.deliver(&f.cid, &f.tid).await.unwrap();
        assert_eq!(second.sent, 2);
        assert_eq!(f.gateway.send_log(), vec!["a", "b", "b", "c"]);
        assert!(f.outbox.load_pending(&f.cid, &f.tid).unwrap().is_empty());
    }

    #[tokio::test]
    async fn permanent_failure_records_and_continues() {
        let f = fixture(FakeGateway::new(vec![
            Err(GatewayError::Permanent("bad recipient".into())),
            FakeGateway::ok("p1"),
        ]));
        f.outbox
            .save(&f.cid, &f.tid, &[planned("a", "k0"), planned("b", "k1")])
            .unwrap();

        let report = f.worker.deliver(&f.cid, &f.tid).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.sent, 1);
        assert_eq!(f.gateway.send_log(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_touching_the_gateway() {
        let f = fixture(FakeGateway::new(vec![
            Err(GatewayError::Transient("x".into())),
            Err(GatewayError::Transient("x".into())),
        ]));
        f.outbox
            .save(&f.cid, &f.tid, &[planned("a", "k0"), planned("b", "k1")])
            .unwrap();

        // two transient failures open the breaker (threshold 2); each
        // attempt needs an operator retry to make the row sendable again
        f.worker.deliver(&f.cid, &f.tid).await.unwrap();
        f.outbox.retry_failed(&f.cid, &f.tid).unwrap();
        f.worker.deliver(&f.cid, &f.tid).await.unwrap();
        f.outbox.retry_failed(&f.cid, &f.tid).unwrap();

        let before = f.gateway.send_log().len();
        let report = f.worker.deliver(&f.cid, &f.tid).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(f.gateway.send_log().len(), before, "gateway not called while open");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_leaves_remaining_items_queued() {
        let mut gateway = FakeGateway::new(vec![FakeGateway::ok("p0"), FakeGateway::ok("p1")]);
        gateway.delay = Duration::from_secs(31); // beyond the 30s budget
        let f = fixture(gateway);
        f.outbox
            .save(&f.cid, &f.tid, &[planned("a", "k0"), planned("b", "k1")])
            .unwrap();

        let report = f.worker.deliver(&f.cid, &f.tid).await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(report.failed, 1); // the in-flight item is marked failed
        assert_eq!(report.remaining, 1); // the untouched one stays queued
        let pending = f.outbox.load_pending(&f.cid, &f.tid).unwrap();
        assert_eq!(pending.len(), 2);
    }
}
