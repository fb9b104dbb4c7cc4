//! Line-oriented terminal front end.
//!
//! Parsing and rendering are pure so they can be tested without a tty; the
//! loop that ties them to stdin lives in `lib.rs`.

use crate::clarification::ClarificationSession;
use crate::state::PipelineSnapshot;
use crate::status::PipelineStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Quit,
    SetUrl(String),
    ShowStatus,
    Health,
    Reset,
    Help,
    /// Answer text or a new request, depending on whether a clarification is live
    Text(String),
    Empty,
    Unknown(String),
}

pub const HELP: &str = "\
Type a request and press Enter to run the pipeline.
While a clarification is open, the next line is sent as the answer.
Commands:
  :url <base>   change the server URL (status channel switches on next reconnect)
  :status       show the current state
  :health       check the server health
  :reset        return to idle
  :help         this text
  :quit         exit";

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }

    let Some(command) = line.strip_prefix(':') else {
        return Input::Text(line.to_string());
    };

    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };

    match name {
        "q" | "quit" | "exit" => Input::Quit,
        "url" if !arg.is_empty() => Input::SetUrl(arg.to_string()),
        "status" => Input::ShowStatus,
        "health" => Input::Health,
        "reset" => Input::Reset,
        "h" | "help" => Input::Help,
        _ => Input::Unknown(line.to_string()),
    }
}

/// What the terminal last printed. Small enough to keep per change; the log
/// is tracked by length only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rendered {
    connected: bool,
    status: PipelineStatus,
    progress_label: Option<String>,
    log_len: usize,
    clarification: Option<ClarificationSession>,
}

impl Rendered {
    pub fn of(snapshot: &PipelineSnapshot) -> Self {
        Self {
            connected: snapshot.connected,
            status: snapshot.status,
            progress_label: snapshot.progress_label.clone(),
            log_len: snapshot.log.len(),
            clarification: snapshot.clarification.current().cloned(),
        }
    }
}

/// Lines to print for what changed since `prev` was rendered.
pub fn describe_changes(prev: &Rendered, next: &PipelineSnapshot) -> Vec<String> {
    let mut lines = Vec::new();

    if prev.connected != next.connected {
        lines.push(if next.connected {
            "● status channel connected".to_string()
        } else {
            "○ status channel disconnected".to_string()
        });
    }

    if prev.status != next.status {
        lines.push(format!("status: {}", next.status));
    }

    if prev.progress_label != next.progress_label {
        if let Some(label) = &next.progress_label {
            lines.push(format!("  {}", label));
        }
    }

    // The log only grows, so anything past the old length is new.
    for entry in next.log.entries().iter().skip(prev.log_len) {
        lines.push(format!("[{}] {}", entry.level.as_str(), entry.message));
    }

    if let Some(session) = next.clarification.current() {
        if prev.clarification.as_ref() != Some(session) {
            lines.push(format!(
                "Clarification needed (round {}): {}",
                session.round, session.partial_summary
            ));
            for (i, question) in session.questions.iter().enumerate() {
                lines.push(format!("  {}. {}", i + 1, question));
            }
            lines.push("Type your answer and press Enter.".to_string());
        }
    }

    lines
}

/// Full state summary for `:status`
pub fn describe_snapshot(snapshot: &PipelineSnapshot) -> Vec<String> {
    let mut lines = vec![format!(
        "status: {}{}",
        snapshot.status,
        snapshot
            .progress_label
            .as_deref()
            .map(|l| format!(" ({})", l))
            .unwrap_or_default()
    )];
    lines.push(format!(
        "status channel: {}",
        if snapshot.connected { "connected" } else { "disconnected" }
    ));
    if let Some(job_id) = &snapshot.job_id {
        lines.push(format!("job: {}", job_id));
    }
    if !snapshot.transcription.is_empty() {
        lines.push(format!("transcription: {}", snapshot.transcription));
    }
    if let Some(session) = snapshot.clarification.current() {
        lines.push(format!(
            "clarification: session {} round {} ({} questions)",
            session.session_id,
            session.round,
            session.questions.len()
        ));
    }
    for event in snapshot.loop_events.entries().iter().rev().take(5) {
        lines.push(format!("  {}", event.describe()));
    }
    lines
}
