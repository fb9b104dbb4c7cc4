//! Process-wide pipeline state shown by the UI.
//!
//! The store is written from two sides only: the connection manager, through
//! its [`StatusSink`] implementation, and the UI-driven actions below.
//! Readers take snapshots or subscribe to changes.

use crate::api::PipelineOutcome;
use crate::clarification::{ClarificationSession, ClarificationTracker};
use crate::connection::StatusSink;
use crate::event_log::{EventLog, LogLevel};
use crate::loop_events::{LoopEventEntry, LoopEventHistory};
use crate::status::PipelineStatus;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Everything the UI renders from
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineSnapshot {
    pub status: PipelineStatus,
    /// Advisory progress text, never used for control decisions
    pub progress_label: Option<String>,
    pub transcription: String,
    pub log: EventLog,
    pub clarification: ClarificationTracker,
    pub loop_events: LoopEventHistory,
    /// Status channel indicator
    pub connected: bool,
    /// Id of the job started from this client, if any
    pub job_id: Option<String>,
}

/// Errors from UI-driven actions
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Cannot start a new job while {0}")]
    Busy(PipelineStatus),

    #[error("Pipeline is not recording")]
    NotRecording,

    #[error("No clarification is pending")]
    NoClarification,
}

/// Shared handle to the pipeline state. Cloning shares the same state.
#[derive(Debug, Clone)]
pub struct PipelineStore {
    tx: Arc<watch::Sender<PipelineSnapshot>>,
}

impl Default for PipelineStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(PipelineSnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    /// Clone of the current state
    pub fn snapshot(&self) -> PipelineSnapshot {
        self.tx.borrow().clone()
    }

    /// Receiver notified after every mutation
    pub fn subscribe(&self) -> watch::Receiver<PipelineSnapshot> {
        self.tx.subscribe()
    }

    pub fn current_status(&self) -> PipelineStatus {
        self.tx.borrow().status
    }

    pub fn live_clarification(&self) -> Option<ClarificationSession> {
        self.tx.borrow().clarification.current().cloned()
    }

    /// Begin capturing audio for a new job. Returns the job id.
    pub fn start_recording(&self) -> Result<String, StoreError> {
        let job_id = self.begin_job(PipelineStatus::Recording, Some("Recording…"))?;
        log::info!("Job {}: recording started", job_id);
        Ok(job_id)
    }

    /// Recording finished; the audio is on its way to the server.
    pub fn stop_recording(&self) -> Result<(), StoreError> {
        let mut result = Ok(());
        self.tx.send_if_modified(|s| {
            if !s.status.can_stop_recording() {
                result = Err(StoreError::NotRecording);
                return false;
            }
            s.status = PipelineStatus::Processing;
            s.progress_label = Some("Uploading audio…".to_string());
            s.log.info("Recording stopped");
            true
        });
        result
    }

    /// Begin a job from already-transcribed text. Returns the job id.
    pub fn start_text_job(&self, text: &str) -> Result<String, StoreError> {
        let job_id = self.begin_job(PipelineStatus::Processing, Some("Submitting…"))?;
        self.set_transcription(text);
        log::info!("Job {}: submitted {} chars of text", job_id, text.len());
        Ok(job_id)
    }

    fn begin_job(&self, status: PipelineStatus, label: Option<&str>) -> Result<String, StoreError> {
        let mut result = Err(StoreError::Busy(PipelineStatus::Idle));
        self.tx.send_if_modified(|s| {
            if !s.status.can_start_recording() {
                result = Err(StoreError::Busy(s.status));
                return false;
            }
            let job_id = Uuid::new_v4().to_string();
            s.status = status;
            s.progress_label = label.map(str::to_string);
            s.transcription.clear();
            s.clarification.clear();
            s.job_id = Some(job_id.clone());
            s.log.info(format!("Job {} started", job_id));
            result = Ok(job_id);
            true
        });
        result
    }

    pub fn set_transcription(&self, text: &str) {
        self.tx.send_modify(|s| {
            s.transcription = text.to_string();
        });
    }

    /// Hand the live clarification over to the answer submission.
    ///
    /// Clears the session and moves the pipeline back to processing while the
    /// server re-extracts.
    pub fn take_clarification_for_answer(&self) -> Result<ClarificationSession, StoreError> {
        let mut result = Err(StoreError::NoClarification);
        self.tx.send_if_modified(|s| {
            let Some(session) = s.clarification.clear() else {
                return false;
            };
            s.status = PipelineStatus::Processing;
            s.progress_label = Some("Re-extracting intent…".to_string());
            s.log.info(format!(
                "Answered clarification round {} for session {}",
                session.round, session.session_id
            ));
            result = Ok(session);
            true
        });
        result
    }

    /// Fold an HTTP pipeline response into the state.
    pub fn apply_outcome(&self, outcome: &PipelineOutcome) {
        match outcome {
            PipelineOutcome::TicketCreated {
                ticket_key,
                ticket_url,
                transcribed_text,
                ..
            } => self.tx.send_modify(|s| {
                s.clarification.clear();
                s.status = PipelineStatus::Done;
                s.progress_label = None;
                if !transcribed_text.is_empty() {
                    s.transcription = transcribed_text.clone();
                }
                s.log.info(format!("Ticket created: {} ({})", ticket_key, ticket_url));
            }),
            PipelineOutcome::ClarificationNeeded { session, .. } => {
                self.tx.send_modify(|s| open_clarification(s, session.clone()));
            }
            PipelineOutcome::Transcription { text, .. } => self.tx.send_modify(|s| {
                s.transcription = text.clone();
                s.status = PipelineStatus::Done;
                s.progress_label = None;
                s.log.info("Transcription received (pipeline endpoint unavailable)");
            }),
        }
    }

    /// Informational log entry from the UI side
    pub fn note(&self, message: &str) {
        self.tx.send_modify(|s| s.log.info(message));
    }

    /// A UI-side action failed; terminal for the job only.
    pub fn fail(&self, message: &str) {
        self.tx.send_modify(|s| {
            s.status = PipelineStatus::Error;
            s.progress_label = None;
            s.clarification.clear();
            s.log.error(message);
        });
    }

    /// Back to idle, keeping the log and loop-event history
    pub fn reset(&self) {
        self.tx.send_modify(|s| {
            s.status = PipelineStatus::Idle;
            s.progress_label = None;
            s.transcription.clear();
            s.clarification.clear();
            s.job_id = None;
        });
    }
}

fn open_clarification(s: &mut PipelineSnapshot, session: ClarificationSession) {
    let round = session.round;
    match s.clarification.open(session) {
        Ok(()) => {
            s.status = PipelineStatus::Clarifying;
            s.progress_label = None;
            s.log.info(format!("Clarification needed (round {})", round));
        }
        Err(e) => s.log.warn(e.to_string()),
    }
}

impl StatusSink for PipelineStore {
    fn log(&self, level: LogLevel, message: &str) {
        self.tx.send_modify(|s| s.log.log(level, message, None));
    }

    fn status(&self, status: PipelineStatus) {
        self.tx.send_modify(|s| {
            s.status = status;
            if status.is_terminal() {
                s.clarification.clear();
            }
        });
    }

    fn progress_label(&self, label: Option<&str>) {
        self.tx.send_if_modified(|s| {
            let next = label.map(str::to_string);
            if s.progress_label == next {
                return false;
            }
            s.progress_label = next;
            true
        });
    }

    fn connection_state(&self, connected: bool) {
        self.tx.send_if_modified(|s| {
            if s.connected == connected {
                return false;
            }
            s.connected = connected;
            true
        });
    }

    fn clarification(&self, session: ClarificationSession) {
        self.tx.send_modify(|s| open_clarification(s, session));
    }

    fn loop_event(&self, event: LoopEventEntry) {
        self.tx.send_modify(|s| {
            s.log.info(event.describe());
            s.loop_events.push(event);
        });
    }
}
