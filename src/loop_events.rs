use serde::{Deserialize, Serialize};

/// Kind of milestone reported by the ticket workflow runner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoopEventKind {
    TicketQueued,
    LoopStarted,
    LoopCompleted,
}

impl LoopEventKind {
    /// Parse the wire `type` discriminator
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "ticket_queued" => Some(LoopEventKind::TicketQueued),
            "loop_started" => Some(LoopEventKind::LoopStarted),
            "loop_completed" => Some(LoopEventKind::LoopCompleted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoopEventKind::TicketQueued => "ticket_queued",
            LoopEventKind::LoopStarted => "loop_started",
            LoopEventKind::LoopCompleted => "loop_completed",
        }
    }
}

/// A milestone notification. Entries are never mutated once recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoopEventEntry {
    #[serde(rename = "type")]
    pub kind: LoopEventKind,
    pub issue_key: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
    /// RFC 3339 timestamp
    pub timestamp: String,
}

impl LoopEventEntry {
    /// One-line description for logs and terminal output
    pub fn describe(&self) -> String {
        match self.kind {
            LoopEventKind::TicketQueued => match &self.summary {
                Some(summary) => format!("{} queued: {}", self.issue_key, summary),
                None => format!("{} queued", self.issue_key),
            },
            LoopEventKind::LoopStarted => format!("{} picked up by loop", self.issue_key),
            LoopEventKind::LoopCompleted => match self.success {
                Some(true) => format!("{} completed successfully", self.issue_key),
                Some(false) => format!("{} completed with failures", self.issue_key),
                None => format!("{} completed", self.issue_key),
            },
        }
    }
}

/// Ordered audit trail of loop events, independent of the job status.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct LoopEventHistory {
    entries: Vec<LoopEventEntry>,
}

impl LoopEventHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: LoopEventEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[LoopEventEntry] {
        &self.entries
    }

    /// Most recent event for `issue_key`, if any
    pub fn latest_for(&self, issue_key: &str) -> Option<&LoopEventEntry> {
        self.entries.iter().rev().find(|e| e.issue_key == issue_key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
