//! User-facing actions.
//!
//! Each command drives the HTTP side of a job and folds the result into the
//! pipeline store. Front ends call these and render the store.

pub mod config;
pub mod pipeline;

use crate::api::{ApiError, BackendClient};
use crate::settings::{SettingsError, SettingsStore};
use crate::state::{PipelineStore, StoreError};

/// Error returned by commands, flattened for display
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CommandError {
    pub message: String,
    pub error_type: String,
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.error_type)
    }
}

impl std::error::Error for CommandError {}

impl From<ApiError> for CommandError {
    fn from(err: ApiError) -> Self {
        let error_type = match &err {
            ApiError::Network(e) if e.is_timeout() => "timeout",
            ApiError::Network(_) => "network",
            ApiError::Server { .. } => "server",
            ApiError::InvalidResponse { .. } => "protocol",
            ApiError::EmptyText => "validation",
        };
        Self {
            message: err.to_string(),
            error_type: error_type.to_string(),
        }
    }
}

impl From<StoreError> for CommandError {
    fn from(err: StoreError) -> Self {
        Self {
            message: err.to_string(),
            error_type: "state".to_string(),
        }
    }
}

impl From<SettingsError> for CommandError {
    fn from(err: SettingsError) -> Self {
        let error_type = match &err {
            SettingsError::InvalidServerUrl(_) => "validation",
            _ => "config",
        };
        Self {
            message: err.to_string(),
            error_type: error_type.to_string(),
        }
    }
}

impl From<String> for CommandError {
    fn from(message: String) -> Self {
        Self {
            message,
            error_type: "unknown".to_string(),
        }
    }
}

/// What every command needs. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub store: PipelineStore,
    pub settings: SettingsStore,
    http: BackendClient,
}

impl AppContext {
    pub fn new(
        store: PipelineStore,
        settings: SettingsStore,
        http: BackendClient,
    ) -> Self {
        Self {
            store,
            settings,
            http,
        }
    }

    /// Build the HTTP client from the settings' request timeout.
    pub fn from_settings(store: PipelineStore, settings: SettingsStore) -> Result<Self, CommandError> {
        let current = settings.get();
        let http = BackendClient::new(&current.server_url, current.request_timeout())?;
        Ok(Self::new(store, settings, http))
    }

    /// Client pointed at the server URL in effect right now
    pub fn backend(&self) -> BackendClient {
        self.http.with_base_url(&self.settings.server_url())
    }
}
