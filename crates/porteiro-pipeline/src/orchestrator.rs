//! Pipeline orchestrator: preprocess → classify → route → plan → persist
//! → dispatch, exactly once per turn.
//!
//! Only the worker holding the turn lock may call [`Orchestrator::run`].
//! Every outbound message — including canned guard responses and the
//! failure apology — leaves through the outbox; there is no other send
//! path in the core.

use std::sync::Arc;
use std::time::Instant;

use tracing::error;

use porteiro_core::breaker::CircuitBreaker;
use porteiro_core::events::{self, Event, EventSink};
use porteiro_core::flags::FeatureFlags;
use porteiro_core::types::{PlannedMessage, Turn};
use porteiro_delivery::{DeliveryReport, DeliveryWorker};
use porteiro_outbox::OutboxRepository;

use crate::classify::{Category, Classifier};
use crate::guards::{GuardVerdict, Guards};
use crate::plan::{canned_plan, fallback_text, Planner};
use crate::preprocess::{sanitize, RateLimiter};
use crate::route::route;

pub struct Orchestrator {
    classifier: Arc<dyn Classifier>,
    planner: Arc<dyn Planner>,
    guards: Arc<Guards>,
    rate_limiter: RateLimiter,
    classifier_breaker: Arc<CircuitBreaker>,
    outbox: Arc<OutboxRepository>,
    delivery: Arc<DeliveryWorker>,
    sink: Arc<dyn EventSink>,
    flags: Arc<FeatureFlags>,
    contact_phone: String,
    max_text_chars: usize,
}

/// What one pipeline run did for the user.
#[derive(Debug)]
pub enum RunOutcome {
    /// The full pipeline ran; the planner's messages were dispatched.
    Completed {
        planned: usize,
        report: DeliveryReport,
    },
    /// A guard or stage failure collapsed the turn into one canned message.
    ShortCircuit {
        reason: &'static str,
        report: DeliveryReport,
    },
    /// The outbox store was unreachable. Nothing was sent; the failure
    /// preceded planning persistence, so the user receives nothing.
    PersistFailed,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        classifier: Arc<dyn Classifier>,
        planner: Arc<dyn Planner>,
        guards: Arc<Guards>,
        rate_limiter: RateLimiter,
        classifier_breaker: Arc<CircuitBreaker>,
        outbox: Arc<OutboxRepository>,
        delivery: Arc<DeliveryWorker>,
        sink: Arc<dyn EventSink>,
        flags: Arc<FeatureFlags>,
        contact_phone: &str,
        max_text_chars: usize,
    ) -> Self {
        Self {
            classifier,
            planner,
            guards,
            rate_limiter,
            classifier_breaker,
            outbox,
            delivery,
            sink,
            flags,
            contact_phone: contact_phone.to_string(),
            max_text_chars,
        }
    }

    /// Run the pipeline for one flushed turn.
    pub async fn run(&self, turn: &Turn) -> RunOutcome {
        let cid = &turn.conversation_id;
        let tid = &turn.turn_id;

        // Guards precede every stage.
        if let GuardVerdict::RecursionExceeded { .. } = self.guards.check_recursion(cid).await {
            let plan = canned_plan(
                &turn.phone,
                tid,
                "recursion",
                "Vamos recomeçar? Me diga em poucas palavras como posso ajudar.",
            );
            return self
                .short_circuit(turn, plan, "recursion_limit_exceeded")
                .await;
        }

        // 1. Preprocess
        let started = Instant::now();
        self.emit_stage("preprocess_start", turn, |e| e);
        if !self.rate_limiter.check(&turn.phone).await {
            self.emit_stage("preprocess_failed", turn, |e| e.field("reason", "rate_limited"));
            let plan = canned_plan(
                &turn.phone,
                tid,
                "rate_limit",
                "Você está enviando mensagens muito rápido. Aguarde um instante e tente de novo.",
            );
            return self.short_circuit(turn, plan, "rate_limited").await;
        }
        let clean = sanitize(&turn.text, self.max_text_chars);
        self.emit_stage("preprocess_complete", turn, |e| {
            e.field("text_len", clean.len())
                .field("duration_ms", started.elapsed().as_millis())
        });

        // 2. Classify (circuit-breaker wrapped)
        let started = Instant::now();
        self.emit_stage("classify_start", turn, |e| e);
        let classification = match self.classifier_breaker.try_acquire() {
            Err(open) => {
                self.sink.emit(
                    &Event::new(events::GUARD, "circuit_open")
                        .field("conversation_id", cid)
                        .field("turn_id", tid)
                        .field("retry_in_ms", open.retry_in_ms),
                );
                self.emit_stage("classify_failed", turn, |e| e.field("reason", "circuit_open"));
                return self.fallback(turn).await;
            }
            Ok(()) => match self.classifier.classify(&clean).await {
                Ok(classification) => {
                    self.classifier_breaker.on_success();
                    classification
                }
                Err(e) => {
                    self.classifier_breaker.on_failure();
                    self.emit_stage("classify_failed", turn, |ev| ev.field("reason", &e));
                    return self.fallback(turn).await;
                }
            },
        };
        self.emit_stage("classify_complete", turn, |e| {
            e.field("category", classification.category.as_str())
                .field("confidence", classification.confidence)
                .field("duration_ms", started.elapsed().as_millis())
        });

        // Greeting-loop cooldown applies once we know this is a greeting.
        if classification.category == Category::Greeting
            && !self.guards.greeting_allowed(&turn.phone).await
        {
            let plan = canned_plan(
                &turn.phone,
                tid,
                "greeting_repeat",
                "Estou por aqui! Me conte o que você precisa: agendamento, valores ou informações?",
            );
            return self
                .short_circuit(turn, plan, "greeting_loop_prevented")
                .await;
        }

        // 3. Route
        let started = Instant::now();
        self.emit_stage("route_start", turn, |e| e);
        let decision = route(&classification);
        self.emit_stage("route_complete", turn, |e| {
            e.field("target", decision.target)
                .field("action", decision.action.as_str())
                .field("final_confidence", decision.final_confidence)
                .field("duration_ms", started.elapsed().as_millis())
        });

        // 4. Plan
        let started = Instant::now();
        self.emit_stage("plan_start", turn, |e| e);
        let items = match self.planner.plan(turn, &classification, &decision) {
            Ok(items) => items,
            Err(e) => {
                self.emit_stage("plan_failed", turn, |ev| ev.field("reason", &e));
                return self.fallback(turn).await;
            }
        };
        self.emit_stage("plan_complete", turn, |e| {
            e.field("items", items.len())
                .field("duration_ms", started.elapsed().as_millis())
        });

        // 5 + 6. Persist and dispatch
        let planned = items.len();
        match self.persist_and_deliver(turn, &items).await {
            Some(report) => RunOutcome::Completed { planned, report },
            None => RunOutcome::PersistFailed,
        }
    }

    /// Persist the fallback apology and dispatch it. Used whenever
    /// classify or plan cannot produce a real answer.
    async fn fallback(&self, turn: &Turn) -> RunOutcome {
        let plan = canned_plan(
            &turn.phone,
            &turn.turn_id,
            "fallback",
            &fallback_text(&self.contact_phone),
        );
        self.short_circuit(turn, plan, "fallback").await
    }

    async fn short_circuit(
        &self,
        turn: &Turn,
        plan: Vec<PlannedMessage>,
        reason: &'static str,
    ) -> RunOutcome {
        match self.persist_and_deliver(turn, &plan).await {
            Some(report) => RunOutcome::ShortCircuit { reason, report },
            None => RunOutcome::PersistFailed,
        }
    }

    /// Step 5 (persist) and step 6 (dispatch). `None` means the outbox
    /// store is down — the one failure the pipeline cannot route around,
    /// because sending outside the outbox is forbidden.
    async fn persist_and_deliver(
        &self,
        turn: &Turn,
        items: &[PlannedMessage],
    ) -> Option<DeliveryReport> {
        let cid = &turn.conversation_id;
        let tid = &turn.turn_id;

        let started = Instant::now();
        self.emit_stage("outbox_start", turn, |e| e);
        match self.outbox.save(cid, tid, items) {
            Ok(_) => {
                self.emit_stage("outbox_complete", turn, |e| {
                    e.field("items", items.len())
                        .field("duration_ms", started.elapsed().as_millis())
                });
            }
            Err(e) => {
                error!(conversation_id = %cid, turn_id = %tid, error = %e, "outbox persist failed");
                self.emit_stage("outbox_failed", turn, |ev| ev.field("reason", &e));
                return None;
            }
        }

        if !self.flags.delivery_enabled() {
            // Rows stay queued; re-enabling the flag plus an operator retry
            // (or the next trigger for this turn) drains them.
            tracing::warn!(conversation_id = %cid, turn_id = %tid, "delivery disabled, items left queued");
            return Some(DeliveryReport::default());
        }

        match self.delivery.deliver(cid, tid).await {
            Ok(report) => Some(report),
            Err(e) => {
                // Rows are persisted and stay pending; a later trigger or an
                // operator retry finishes the job.
                error!(conversation_id = %cid, turn_id = %tid, error = %e, "delivery aborted");
                self.emit_stage("delivery_failed", turn, |ev| ev.field("reason", &e));
                Some(DeliveryReport::default())
            }
        }
    }

    fn emit_stage(
        &self,
        name: &'static str,
        turn: &Turn,
        build: impl FnOnce(Event) -> Event,
    ) {
        let event = Event::new(events::PIPELINE, name)
            .field("conversation_id", &turn.conversation_id)
            .field("turn_id", &turn.turn_id);
        self.sink.emit(&build(event));
    }
}
