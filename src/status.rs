//! Mapping from backend status codes to the client pipeline state.
//!
//! The backend reports progress either as a `status` code or as the name of
//! the `current_node` it is executing. Both vocabularies overlap, so a single
//! table covers them. Codes missing from the table are dropped: newer backends
//! may emit transitional codes this client does not know about yet.

use serde::{Deserialize, Serialize};

/// Client-side pipeline state. Exactly one value holds at any time and the UI
/// renders from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    /// Nothing running, ready to record
    #[default]
    Idle,
    /// Capturing audio locally
    Recording,
    /// Backend is transcribing, extracting intent or creating the ticket
    Processing,
    /// Backend is waiting for answers to clarification questions
    Clarifying,
    /// Job finished
    Done,
    /// Job failed (the connection stays usable for the next job)
    Error,
}

impl PipelineStatus {
    /// Check if this state allows starting a new recording
    pub fn can_start_recording(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Idle | PipelineStatus::Done | PipelineStatus::Error
        )
    }

    /// Check if this state allows stopping a recording
    pub fn can_stop_recording(&self) -> bool {
        matches!(self, PipelineStatus::Recording)
    }

    /// Terminal for the current job (not for the connection)
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStatus::Done | PipelineStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Idle => "idle",
            PipelineStatus::Recording => "recording",
            PipelineStatus::Processing => "processing",
            PipelineStatus::Clarifying => "clarifying",
            PipelineStatus::Done => "done",
            PipelineStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of mapping one backend code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusMapping {
    pub status: PipelineStatus,
    /// Advisory progress text. `None` clears any label currently shown.
    pub label: Option<&'static str>,
}

const STATUS_TABLE: &[(&str, PipelineStatus, Option<&str>)] = &[
    ("recording", PipelineStatus::Recording, Some("Recording…")),
    ("transcribing", PipelineStatus::Processing, Some("Transcribing audio…")),
    ("extracting", PipelineStatus::Processing, Some("Extracting intent…")),
    ("creating", PipelineStatus::Processing, Some("Creating ticket…")),
    ("creating_ticket", PipelineStatus::Processing, Some("Creating ticket…")),
    ("clarifying", PipelineStatus::Clarifying, None),
    ("completed", PipelineStatus::Done, None),
    ("done", PipelineStatus::Done, None),
    ("error", PipelineStatus::Error, None),
];

/// Map a raw `status` code or `current_node` name.
///
/// Returns `None` for codes outside the table; callers must then leave both
/// status and label untouched.
pub fn map_code(code: &str) -> Option<StatusMapping> {
    STATUS_TABLE
        .iter()
        .find(|(known, _, _)| *known == code)
        .map(|&(_, status, label)| StatusMapping { status, label })
}
