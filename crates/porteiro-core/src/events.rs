//! Structured event log with a stable pipe-delimited wire schema.
//!
//! Every pipeline stage emits events like
//! `PIPELINE|event=classify_complete|conversation_id=5511999|duration_ms=3`.
//! The schema (family + event vocabulary) is stable; the transport is an
//! injected [`EventSink`] so nothing in the core depends on a concrete
//! logging backend.

use std::fmt;

// Event families. The vocabulary per family is fixed by the wire contract.
pub const WEBHOOK: &str = "WEBHOOK";
pub const TURN: &str = "TURN";
pub const PIPELINE: &str = "PIPELINE";
pub const OUTBOX: &str = "OUTBOX";
pub const DELIVERY: &str = "DELIVERY";
pub const GUARD: &str = "GUARD";

/// One structured event: a family, an event name, and ordered key=value fields.
#[derive(Debug, Clone)]
pub struct Event {
    pub family: &'static str,
    pub name: &'static str,
    pub fields: Vec<(&'static str, String)>,
}

impl Event {
    pub fn new(family: &'static str, name: &'static str) -> Self {
        Self {
            family,
            name,
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        self.fields.push((key, value.to_string()));
        self
    }

    /// Render the pipe-delimited line: `FAMILY|event=name|k1=v1|k2=v2`.
    pub fn render(&self) -> String {
        let mut line = format!("{}|event={}", self.family, self.name);
        for (k, v) in &self.fields {
            line.push('|');
            line.push_str(k);
            line.push('=');
            line.push_str(v);
        }
        line
    }
}

/// Observer interface for the event log. One concrete implementation is
/// injected at startup; components never construct their own sink.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

/// Renders events through `tracing` at a level derived from the event name.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &Event) {
        let line = event.render();
        if event.name.contains("failed") || event.name.contains("error") {
            tracing::error!(target: "porteiro::events", "{line}");
        } else if event.family == GUARD || event.name == "rehydrate_miss" {
            tracing::warn!(target: "porteiro::events", "{line}");
        } else {
            tracing::info!(target: "porteiro::events", "{line}");
        }
    }
}

/// Discards every event. Test helper.
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: &Event) {}
}

/// Records every event in memory. Test helper for asserting the emitted
/// vocabulary.
#[derive(Default)]
pub struct CollectingSink {
    events: std::sync::Mutex<Vec<Event>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// `"FAMILY|name"` pairs in emission order.
    pub fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| format!("{}|{}", e.family, e.name))
            .collect()
    }

    pub fn rendered(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(Event::render).collect()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Last four digits of a phone number, for logs. Full numbers never appear
/// in the event stream.
pub fn mask_phone(phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() >= 4 {
        format!("****{}", &digits[digits.len() - 4..])
    } else {
        "****".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_is_pipe_delimited_in_field_order() {
        let event = Event::new(PIPELINE, "classify_complete")
            .field("conversation_id", "5511999")
            .field("duration_ms", 3);
        assert_eq!(
            event.render(),
            "PIPELINE|event=classify_complete|conversation_id=5511999|duration_ms=3"
        );
    }

    #[test]
    fn render_without_fields() {
        let event = Event::new(TURN, "flush_empty");
        assert_eq!(event.render(), "TURN|event=flush_empty");
    }

    #[test]
    fn mask_keeps_last_four_digits() {
        assert_eq!(mask_phone("5511999990000"), "****0000");
        assert_eq!(mask_phone("99"), "****");
    }

    #[test]
    fn mask_ignores_non_digits() {
        assert_eq!(mask_phone("+55 (11) 9999-1234"), "****1234");
    }
}
