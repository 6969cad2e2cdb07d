use serde::{Deserialize, Serialize};

use porteiro_core::types::MessagePayload;

/// Outbox row state machine: `queued → {sent, failed}`; `failed → queued`
/// only via explicit operator retry; `sent` is terminal. `discarded` marks
/// rows an operator abandoned without sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Queued,
    Sent,
    Failed,
    Discarded,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Queued => "queued",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
            OutboxStatus::Discarded => "discarded",
        }
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(OutboxStatus::Queued),
            "sent" => Ok(OutboxStatus::Sent),
            "failed" => Ok(OutboxStatus::Failed),
            "discarded" => Ok(OutboxStatus::Discarded),
            other => Err(format!("unknown outbox status: {other}")),
        }
    }
}

/// One persisted planned message, keyed `(conversation_id, turn_id, item_index)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxItem {
    pub conversation_id: String,
    pub turn_id: String,
    pub item_index: u32,
    pub payload: MessagePayload,
    pub idempotency_key: String,
    pub status: OutboxStatus,
    pub fail_reason: Option<String>,
    pub created_at: String,
    pub sent_at: Option<String>,
    pub provider_message_id: Option<String>,
}

/// Per-status row counts for a conversation (optionally one turn).
#[derive(Debug, Clone, Default, Serialize)]
pub struct OutboxStats {
    pub queued: u64,
    pub sent: u64,
    pub failed: u64,
    pub discarded: u64,
}

impl OutboxStats {
    pub fn total(&self) -> u64 {
        self.queued + self.sent + self.failed + self.discarded
    }
}
