//! Multi-round clarification sessions.
//!
//! When the backend cannot extract an unambiguous intent it asks the user
//! questions, possibly over several rounds. At most one session is live; each
//! new round replaces the previous one wholesale.

use serde::{Deserialize, Serialize};

/// One clarification round as announced by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationSession {
    pub session_id: String,
    /// Questions in the order the backend asked them
    pub questions: Vec<String>,
    /// What the backend understood so far
    pub partial_summary: String,
    /// 1-based round counter
    pub round: u32,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClarificationError {
    #[error("Clarification session id is empty")]
    MissingSessionId,

    #[error("Stale clarification round {received} for session {session_id} (current round {current})")]
    StaleRound {
        session_id: String,
        current: u32,
        received: u32,
    },
}

/// Holds the live clarification session, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ClarificationTracker {
    current: Option<ClarificationSession>,
}

impl ClarificationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `session`, replacing any previous one.
    ///
    /// Rounds are monotonic within a session: a lower round for the same
    /// session id is rejected and the current session is kept.
    pub fn open(&mut self, session: ClarificationSession) -> Result<(), ClarificationError> {
        if session.session_id.trim().is_empty() {
            return Err(ClarificationError::MissingSessionId);
        }

        if let Some(current) = &self.current {
            if current.session_id == session.session_id && session.round < current.round {
                return Err(ClarificationError::StaleRound {
                    session_id: session.session_id,
                    current: current.round,
                    received: session.round,
                });
            }
        }

        self.current = Some(session);
        Ok(())
    }

    /// Remove the live session. Status transitions are the caller's business.
    pub fn clear(&mut self) -> Option<ClarificationSession> {
        self.current.take()
    }

    pub fn current(&self) -> Option<&ClarificationSession> {
        self.current.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }
}
