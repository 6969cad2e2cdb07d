use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier for a conversation.
///
/// Today this is the sender's phone number verbatim; keeping it a newtype
/// means the derivation can change without touching every signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn from_phone(phone: &str) -> Self {
        Self(phone.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Deterministic turn identifier (16 hex chars of a SHA-256 digest).
///
/// Equal inputs produce equal ids on any worker — see `porteiro-turn`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(pub String);

impl TurnId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TurnId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One inbound WhatsApp message, already extracted from the webhook payload.
///
/// Transient: dropped once the turn controller has appended it to a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Gateway instance the message arrived on.
    pub instance: String,
    /// Gateway-assigned message id, unique within an instance.
    pub message_id: String,
    /// Sender phone number (digits, no JID suffix).
    pub phone: String,
    pub text: String,
    /// True when the message is our own outbound echoed back.
    pub from_self: bool,
    /// Gateway clock, milliseconds. Advisory only.
    pub timestamp_ms: i64,
}

/// One entry of a turn buffer. Serialized as the buffer's wire format,
/// so the field names are part of the stored representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedMessage {
    pub id: String,
    pub text: String,
    pub ts: i64,
}

/// A flushed turn: the unit of user intent the pipeline runs on, exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub turn_id: TurnId,
    pub conversation_id: ConversationId,
    pub phone: String,
    /// Non-empty message texts joined by `"\n"`, preserving arrival order.
    pub text: String,
    /// Snapshot of the buffer that produced this turn.
    pub messages: Vec<BufferedMessage>,
    pub first_ts: i64,
    pub last_ts: i64,
}

impl Turn {
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Milliseconds between the first and last message of the turn.
    pub fn span_ms(&self) -> i64 {
        self.last_ts - self.first_ts
    }
}

/// Outbound message payload. Opaque to the outbox and delivery machinery;
/// only the gateway adapter interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub channel: String,
    pub recipient: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl MessagePayload {
    pub fn whatsapp_text(recipient: &str, text: &str) -> Self {
        Self {
            channel: "whatsapp".to_string(),
            recipient: recipient.to_string(),
            text: text.to_string(),
            metadata: None,
        }
    }
}

/// A message the planner decided to send, before it reaches the outbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedMessage {
    pub payload: MessagePayload,
    /// Deterministic token identifying this intended send; delivered at most once.
    pub idempotency_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_id_from_phone_is_verbatim() {
        let cid = ConversationId::from_phone("5511999999999");
        assert_eq!(cid.as_str(), "5511999999999");
    }

    #[test]
    fn buffered_message_wire_format() {
        let msg = BufferedMessage {
            id: "M1".into(),
            text: "oi".into(),
            ts: 1000,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"id":"M1","text":"oi","ts":1000}"#);
    }

    #[test]
    fn turn_span_is_last_minus_first() {
        let turn = Turn {
            turn_id: TurnId::from("abc"),
            conversation_id: ConversationId::from("5511999"),
            phone: "5511999".into(),
            text: "oi\nbom".into(),
            messages: vec![
                BufferedMessage {
                    id: "M1".into(),
                    text: "oi".into(),
                    ts: 1000,
                },
                BufferedMessage {
                    id: "M2".into(),
                    text: "bom".into(),
                    ts: 1800,
                },
            ],
            first_ts: 1000,
            last_ts: 1800,
        };
        assert_eq!(turn.span_ms(), 800);
        assert_eq!(turn.message_count(), 2);
    }

    #[test]
    fn payload_metadata_absent_when_none() {
        let payload = MessagePayload::whatsapp_text("5511999", "hello");
        let json = serde_json::to_string(&payload).unwrap();
        assert!(!json.contains("metadata"));
    }
}
