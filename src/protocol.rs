//! Inbound status-channel messages.
//!
//! The backend pushes JSON objects without a common envelope; the shape is
//! told apart by which fields are present. Checks run in priority order so a
//! clarification payload is never also read as a status update.

use crate::clarification::ClarificationSession;
use crate::loop_events::{LoopEventEntry, LoopEventKind};
use serde::Deserialize;
use serde_json::{Map, Value};

const CLARIFICATION_TYPE: &str = "clarification_needed";

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Clarification(ClarificationSession),
    LoopEvent(LoopEventEntry),
    /// Either field may be absent; each is mapped independently.
    Status {
        status: Option<String>,
        current_node: Option<String>,
    },
    /// A JSON object with no recognised shape
    Ignored,
    /// Not a JSON object, or a typed payload missing required fields
    Raw(String),
}

#[derive(Deserialize)]
struct ClarificationWire {
    session_id: String,
    #[serde(default)]
    questions: Vec<String>,
    #[serde(default)]
    partial_summary: String,
    #[serde(default)]
    round: Option<u32>,
}

impl From<ClarificationWire> for ClarificationSession {
    fn from(wire: ClarificationWire) -> Self {
        Self {
            session_id: wire.session_id,
            questions: wire.questions,
            partial_summary: wire.partial_summary,
            // Round counters are 1-based; a missing or zero round means the first one.
            round: wire.round.unwrap_or(1).max(1),
        }
    }
}

#[derive(Deserialize)]
struct LoopEventWire {
    issue_key: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    timestamp: Option<String>,
}

/// Classify one text frame.
pub fn classify(text: &str) -> InboundMessage {
    let object = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(object)) => object,
        _ => return InboundMessage::Raw(text.to_string()),
    };

    let message_type = object.get("type").and_then(Value::as_str);

    if message_type == Some(CLARIFICATION_TYPE) {
        return match serde_json::from_value::<ClarificationWire>(Value::Object(object)) {
            Ok(wire) => InboundMessage::Clarification(wire.into()),
            Err(_) => InboundMessage::Raw(text.to_string()),
        };
    }

    if let Some(kind) = message_type.and_then(LoopEventKind::from_wire) {
        return match serde_json::from_value::<LoopEventWire>(Value::Object(object)) {
            Ok(wire) => InboundMessage::LoopEvent(LoopEventEntry {
                kind,
                issue_key: wire.issue_key,
                summary: wire.summary,
                success: wire.success,
                timestamp: wire
                    .timestamp
                    .unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
            }),
            Err(_) => InboundMessage::Raw(text.to_string()),
        };
    }

    let status = string_field(&object, "status");
    let current_node = string_field(&object, "current_node");
    if status.is_some() || current_node.is_some() {
        return InboundMessage::Status {
            status,
            current_node,
        };
    }

    InboundMessage::Ignored
}

/// Parse a clarification payload outside the status channel, e.g. from an
/// HTTP response body. Round defaults the same way.
pub(crate) fn clarification_from_value(value: Value) -> Option<ClarificationSession> {
    serde_json::from_value::<ClarificationWire>(value)
        .ok()
        .map(ClarificationSession::from)
}

fn string_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(str::to_string)
}
