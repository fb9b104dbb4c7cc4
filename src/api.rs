//! HTTP client for the pipeline server's job endpoints.
//!
//! The status channel only observes jobs; these calls start them and answer
//! clarification rounds. Audio capture and WAV encoding happen elsewhere.

use crate::clarification::ClarificationSession;
use crate::protocol::clarification_from_value;
use reqwest::{multipart, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

pub const PIPELINE_AUDIO_PATH: &str = "/api/pipeline/run/audio";
pub const PIPELINE_TEXT_PATH: &str = "/api/pipeline/run";
pub const CLARIFY_PATH: &str = "/api/pipeline/clarify";
pub const TRANSCRIBE_PATH: &str = "/api/transcribe";
pub const HEALTH_PATH: &str = "/health";

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors from pipeline API calls
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Server error {status} on {endpoint}: {body}")]
    Server {
        status: u16,
        endpoint: &'static str,
        body: String,
    },

    #[error("Unexpected response from {endpoint}: {reason}")]
    InvalidResponse {
        endpoint: &'static str,
        reason: String,
    },

    #[error("Text must not be empty")]
    EmptyText,
}

/// What a pipeline call produced
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    TicketCreated {
        ticket_key: String,
        ticket_url: String,
        summary: String,
        transcribed_text: String,
    },
    ClarificationNeeded {
        session: ClarificationSession,
        ambiguity_score: Option<f64>,
    },
    /// Only the transcription endpoint was available
    Transcription {
        text: String,
        language: Option<String>,
    },
}

/// `GET /health` body. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HealthReport {
    pub status: String,
    #[serde(default)]
    pub ws_connections: Option<u64>,
    #[serde(default)]
    pub jira_configured: Option<bool>,
}

#[derive(Deserialize)]
struct TicketWire {
    ticket_key: String,
    #[serde(default)]
    ticket_url: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    transcribed_text: String,
}

#[derive(Deserialize)]
struct TranscriptionWire {
    text: String,
    #[serde(default)]
    language: Option<String>,
}

/// Turn a JSON response body into an outcome.
pub fn parse_outcome(endpoint: &'static str, value: Value) -> Result<PipelineOutcome, ApiError> {
    let invalid = |reason: String| ApiError::InvalidResponse { endpoint, reason };

    if !value.is_object() {
        return Err(invalid(format!("expected a JSON object, got {}", value)));
    }

    if value.get("status").and_then(Value::as_str) == Some("clarification_needed") {
        let ambiguity_score = value.get("ambiguity_score").and_then(Value::as_f64);
        let session = clarification_from_value(value)
            .ok_or_else(|| invalid("clarification without session_id".to_string()))?;
        return Ok(PipelineOutcome::ClarificationNeeded {
            session,
            ambiguity_score,
        });
    }

    if value.get("ticket_key").is_some() {
        let ticket: TicketWire =
            serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;
        return Ok(PipelineOutcome::TicketCreated {
            ticket_key: ticket.ticket_key,
            ticket_url: ticket.ticket_url,
            summary: ticket.summary,
            transcribed_text: ticket.transcribed_text,
        });
    }

    if value.get("text").is_some() {
        let wire: TranscriptionWire =
            serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;
        return Ok(PipelineOutcome::Transcription {
            text: wire.text,
            language: wire.language,
        });
    }

    Err(invalid("no ticket, clarification or transcription".to_string()))
}

/// Client for the pipeline server
#[derive(Debug, Clone)]
pub struct BackendClient {
    client: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Create a client around an existing HTTP client
    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Same HTTP client, different server
    pub fn with_base_url(&self, base_url: &str) -> Self {
        Self::with_client(self.client.clone(), base_url)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Upload a recording to the full pipeline.
    ///
    /// Servers without the pipeline route answer 404/405; the recording then
    /// goes to the plain transcription endpoint instead.
    pub async fn send_audio(&self, wav: &[u8]) -> Result<PipelineOutcome, ApiError> {
        let response = self.post_audio(PIPELINE_AUDIO_PATH, wav).await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND || status == StatusCode::METHOD_NOT_ALLOWED {
            log::warn!(
                "{} unavailable ({}), falling back to {}",
                PIPELINE_AUDIO_PATH,
                status,
                TRANSCRIBE_PATH
            );
            let fallback = self.post_audio(TRANSCRIBE_PATH, wav).await?;
            return read_outcome(TRANSCRIBE_PATH, fallback).await;
        }

        read_outcome(PIPELINE_AUDIO_PATH, response).await
    }

    async fn post_audio(&self, path: &str, wav: &[u8]) -> Result<reqwest::Response, ApiError> {
        let part = multipart::Part::bytes(wav.to_vec())
            .file_name("recording.wav")
            .mime_str("audio/wav")?;
        let form = multipart::Form::new().part("audio", part);

        log::debug!("POST {} ({} bytes)", path, wav.len());
        Ok(self
            .client
            .post(self.endpoint(path))
            .multipart(form)
            .send()
            .await?)
    }

    /// Run the pipeline on already-transcribed text.
    pub async fn run_text(&self, text: &str) -> Result<PipelineOutcome, ApiError> {
        let text = non_empty(text)?;
        let response = self
            .client
            .post(self.endpoint(PIPELINE_TEXT_PATH))
            .json(&json!({ "text": text }))
            .send()
            .await?;
        read_outcome(PIPELINE_TEXT_PATH, response).await
    }

    /// Answer the questions of a clarification round.
    pub async fn submit_clarification(
        &self,
        session_id: &str,
        answer: &str,
    ) -> Result<PipelineOutcome, ApiError> {
        let answer = non_empty(answer)?;
        let response = self
            .client
            .post(self.endpoint(CLARIFY_PATH))
            .json(&json!({ "session_id": session_id, "text": answer }))
            .send()
            .await?;
        read_outcome(CLARIFY_PATH, response).await
    }

    pub async fn health(&self) -> Result<HealthReport, ApiError> {
        let response = self.client.get(self.endpoint(HEALTH_PATH)).send().await?;
        let value = read_json(HEALTH_PATH, response).await?;
        serde_json::from_value(value).map_err(|e| ApiError::InvalidResponse {
            endpoint: HEALTH_PATH,
            reason: e.to_string(),
        })
    }
}

fn non_empty(text: &str) -> Result<&str, ApiError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ApiError::EmptyText);
    }
    Ok(trimmed)
}

async fn read_json(endpoint: &'static str, response: reqwest::Response) -> Result<Value, ApiError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(ApiError::Server {
            status: status.as_u16(),
            endpoint,
            body,
        });
    }

    response.json().await.map_err(|e| ApiError::InvalidResponse {
        endpoint,
        reason: e.to_string(),
    })
}

async fn read_outcome(
    endpoint: &'static str,
    response: reqwest::Response,
) -> Result<PipelineOutcome, ApiError> {
    let value = read_json(endpoint, response).await?;
    parse_outcome(endpoint, value)
}
