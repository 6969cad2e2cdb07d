//! Webhook ingress: the ordered rules that decide what an inbound event
//! becomes, before any pipeline work happens.
//!
//! Rules, in order: self-echo → ignored; empty text → ignored; known
//! message id → duplicate; otherwise record the id, append to the turn
//! buffer, and schedule a deferred flush. Returns synchronously — the
//! pipeline run is fire-and-forget from the webhook's point of view.

use serde::Serialize;
use serde_json::Value;

use porteiro_core::events::{self, mask_phone, Event};
use porteiro_core::now_ms;
use porteiro_evolution::{extract_inbound, Extracted};

use crate::app::AppState;
use crate::flusher;

/// Webhook processing outcome, serialized verbatim as the HTTP response.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum IngressOutcome {
    Accepted {
        message_id: String,
        receipt_id: String,
    },
    Ignored {
        reason: &'static str,
    },
    Duplicate {
        message_id: String,
    },
    Error {
        error: String,
    },
}

/// Process one webhook event body.
///
/// Storage trouble on this path fails OPEN (the upstream redelivers), so
/// the only `Error` outcomes originate in the HTTP layer (bad JSON).
pub async fn handle_event(state: &AppState, body: &Value) -> IngressOutcome {
    let msg = match extract_inbound(body, &state.config.webhook.default_instance, now_ms()) {
        Extracted::Ignored { reason } => {
            state
                .sink
                .emit(&Event::new(events::WEBHOOK, "ignored").field("reason", reason));
            return IngressOutcome::Ignored { reason };
        }
        Extracted::Message(msg) => msg,
    };

    state.sink.emit(
        &Event::new(events::WEBHOOK, "received")
            .field("phone", mask_phone(&msg.phone))
            .field("message_id", &msg.message_id)
            .field("instance", &msg.instance),
    );

    if !state
        .dedup
        .first_observation(&msg.instance, &msg.phone, &msg.message_id)
        .await
    {
        state.sink.emit(
            &Event::new(events::WEBHOOK, "duplicate")
                .field("phone", mask_phone(&msg.phone))
                .field("message_id", &msg.message_id),
        );
        return IngressOutcome::Duplicate {
            message_id: msg.message_id,
        };
    }

    state
        .turns
        .append(&msg.phone, &msg.message_id, &msg.text, msg.timestamp_ms)
        .await;

    flusher::schedule(
        &state.flush_tx,
        &msg.phone,
        state.config.turn.debounce_ms,
    );

    IngressOutcome::Accepted {
        message_id: msg.message_id,
        receipt_id: uuid::Uuid::new_v4().to_string(),
    }
}
