//! Response planning.
//!
//! A planner turns `(turn, classification, route)` into an ordered list of
//! outbound messages, each with a stable idempotency key. Planners must be
//! pure with respect to the turn snapshot: planning the same turn twice
//! yields the same keys, which is what lets the outbox and the dedup store
//! collapse re-runs into one user-visible message.

use sha2::{Digest, Sha256};
use thiserror::Error;

use porteiro_core::types::{MessagePayload, PlannedMessage, Turn, TurnId};

use crate::classify::{Category, Classification};
use crate::route::{RouteAction, RouteDecision};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("planner failed: {0}")]
    Failed(String),
}

pub trait Planner: Send + Sync {
    fn plan(
        &self,
        turn: &Turn,
        classification: &Classification,
        route: &RouteDecision,
    ) -> Result<Vec<PlannedMessage>, PlanError>;
}

/// `sha256("{turn_id}:{index}:{text}")[:16]` — the default idempotency key
/// for planner output.
pub fn derive_idempotency_key(turn_id: &TurnId, index: usize, text: &str) -> String {
    let raw = format!("{turn_id}:{index}:{text}");
    hex::encode(Sha256::digest(raw.as_bytes()))[..16].to_string()
}

/// `sha256("{phone}:{turn_id}:{label}")[:16]` — key for canned responses
/// (fallback apology, guard short-circuits). Deterministic per turn, so a
/// re-run of the same failing turn cannot double-send the canned message.
pub fn canned_key(phone: &str, turn_id: &TurnId, label: &str) -> String {
    let raw = format!("{phone}:{turn_id}:{label}");
    hex::encode(Sha256::digest(raw.as_bytes()))[..16].to_string()
}

/// Single canned message plan, keyed by `canned_key`.
pub fn canned_plan(phone: &str, turn_id: &TurnId, label: &str, text: &str) -> Vec<PlannedMessage> {
    vec![PlannedMessage {
        payload: MessagePayload::whatsapp_text(phone, text),
        idempotency_key: canned_key(phone, turn_id, label),
    }]
}

/// The static apology used whenever the pipeline cannot produce a real
/// answer. Directs the user to a human phone number.
pub fn fallback_text(contact_phone: &str) -> String {
    format!(
        "Desculpe, estamos com uma instabilidade no momento. \
         Por favor, tente novamente em alguns minutos ou ligue para {contact_phone}."
    )
}

/// Template-based planner: one WhatsApp text message per turn, chosen by
/// the routing decision.
pub struct TemplatePlanner {
    /// Human contact offered on escalation and fallback.
    pub contact_phone: String,
}

impl TemplatePlanner {
    pub fn new(contact_phone: &str) -> Self {
        Self {
            contact_phone: contact_phone.to_string(),
        }
    }

    fn response_text(&self, classification: &Classification, route: &RouteDecision) -> String {
        match route.action {
            RouteAction::Escalate => format!(
                "Claro! Para falar com a nossa equipe, ligue para {} \
                 ou aguarde que um atendente continuará por aqui.",
                self.contact_phone
            ),
            RouteAction::Fallback => {
                "Desculpe, não entendi muito bem. Pode reformular? \
                 Posso ajudar com horários, valores e informações sobre a unidade."
                    .to_string()
            }
            RouteAction::Proceed => match classification.category {
                Category::Greeting => {
                    "Olá! Bem-vindo(a). Posso ajudar com agendamentos, \
                     valores e informações sobre a unidade. O que você procura?"
                        .to_string()
                }
                Category::Scheduling => {
                    "Ótimo! Para agendar uma visita, me diga qual período \
                     prefere: manhã ou tarde?"
                        .to_string()
                }
                Category::Information => format!(
                    "Os valores e o funcionamento variam por programa. \
                     Posso detalhar por aqui, ou se preferir ligue para {}.",
                    self.contact_phone
                ),
                Category::Qualification => {
                    "Perfeito, obrigado pelas informações! Para indicar a \
                     melhor opção, qual a idade e a série escolar?"
                        .to_string()
                }
                // Handoff always escalates; General always falls back.
                Category::Handoff | Category::General => {
                    "Posso ajudar com agendamentos, valores e informações \
                     sobre a unidade. O que você procura?"
                        .to_string()
                }
            },
        }
    }
}

impl Planner for TemplatePlanner {
    fn plan(
        &self,
        turn: &Turn,
        classification: &Classification,
        route: &RouteDecision,
    ) -> Result<Vec<PlannedMessage>, PlanError> {
        let text = self.response_text(classification, route);
        let key = derive_idempotency_key(&turn.turn_id, 0, &text);
        Ok(vec![PlannedMessage {
            payload: MessagePayload::whatsapp_text(&turn.phone, &text),
            idempotency_key: key,
        }])
    }
}
