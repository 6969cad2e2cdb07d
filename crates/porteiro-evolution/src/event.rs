//! Defensive extraction of inbound messages from Evolution API webhooks.
//!
//! The gateway occasionally sends an empty LIST where a mapping is
//! documented (`data`, `data.key`, `data.message`,
//! `data.message.extendedTextMessage`). Every nested access therefore goes
//! through a shape check: a list-where-map violation degrades to
//! `ignored/invalid_data_type`, never to an error.

use serde_json::{Map, Value};

use porteiro_core::types::InboundMessage;

/// Outcome of payload extraction. `Ignored` carries the structured reason
/// that ends up in the webhook response and the event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
    Message(InboundMessage),
    Ignored { reason: &'static str },
}

/// A field documented as a mapping: absent is tolerated (`None`), any
/// non-object value is a shape violation.
fn as_object(value: Option<&Value>) -> Result<Option<&Map<String, Value>>, ()> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(()),
    }
}

fn str_field<'a>(map: Option<&'a Map<String, Value>>, key: &str) -> &'a str {
    map.and_then(|m| m.get(key))
        .and_then(Value::as_str)
        .unwrap_or("")
}

/// Extract `(instance, message_id, phone, from_self, text, ts)` from a raw
/// webhook payload.
///
/// Rules, in order: shape violations → `invalid_data_type`; `fromMe`
/// (missing counts as true — an ambiguous echo must not be answered) →
/// `from_me`; empty text → `no_text`. `messageTimestamp` is seconds on the
/// gateway clock; `fallback_ts_ms` (the server clock) fills in when it is
/// absent or malformed.
pub fn extract_inbound(body: &Value, default_instance: &str, fallback_ts_ms: i64) -> Extracted {
    let invalid = Extracted::Ignored {
        reason: "invalid_data_type",
    };

    let root = match body.as_object() {
        Some(root) => root,
        None => return invalid,
    };
    let data = match as_object(root.get("data")) {
        Ok(data) => data,
        Err(()) => return invalid,
    };
    let key = match as_object(data.and_then(|d| d.get("key"))) {
        Ok(key) => key,
        Err(()) => return invalid,
    };

    let from_self = key
        .and_then(|k| k.get("fromMe"))
        .and_then(Value::as_bool)
        .unwrap_or(true);
    if from_self {
        return Extracted::Ignored { reason: "from_me" };
    }

    let message = match as_object(data.and_then(|d| d.get("message"))) {
        Ok(message) => message,
        Err(()) => return invalid,
    };
    let extended = match as_object(message.and_then(|m| m.get("extendedTextMessage"))) {
        Ok(extended) => extended,
        Err(()) => return invalid,
    };
    let text = {
        let conversation = str_field(message, "conversation");
        if conversation.is_empty() {
            str_field(extended, "text")
        } else {
            conversation
        }
    }
    .trim()
    .to_string();
    if text.is_empty() {
        return Extracted::Ignored { reason: "no_text" };
    }

    let message_id = str_field(key, "id");
    let remote_jid = str_field(key, "remoteJid");
    let phone = remote_jid.split('@').next().unwrap_or("");
    if message_id.is_empty() || phone.is_empty() {
        return invalid;
    }

    let instance = match root.get("instance").and_then(Value::as_str) {
        Some(instance) if !instance.is_empty() => instance,
        _ => default_instance,
    };

    let timestamp_ms = data
        .and_then(|d| d.get("messageTimestamp"))
        .and_then(Value::as_i64)
        .map(|secs| secs * 1000)
        .unwrap_or(fallback_ts_ms);

    Extracted::Message(InboundMessage {
        instance: instance.to_string(),
        message_id: message_id.to_string(),
        phone: phone.to_string(),
        text,
        from_self,
        timestamp_ms,
    })
}
