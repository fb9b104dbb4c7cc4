//! Commands that start jobs and answer clarifications.

use super::{AppContext, CommandError};
use crate::api::{ApiError, HealthReport, PipelineOutcome};

fn fold_result(
    ctx: &AppContext,
    action: &str,
    result: Result<PipelineOutcome, ApiError>,
) -> Result<PipelineOutcome, CommandError> {
    match result {
        Ok(outcome) => {
            ctx.store.apply_outcome(&outcome);
            Ok(outcome)
        }
        Err(e) => {
            log::error!("{} failed: {}", action, e);
            ctx.store.fail(&format!("{} failed: {}", action, e));
            Err(e.into())
        }
    }
}

fn require_text(text: &str) -> Result<&str, CommandError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ApiError::EmptyText.into());
    }
    Ok(trimmed)
}

/// Run the pipeline on typed or externally transcribed text.
pub async fn submit_text(ctx: &AppContext, text: &str) -> Result<PipelineOutcome, CommandError> {
    let text = require_text(text)?;
    ctx.store.start_text_job(text)?;
    let result = ctx.backend().run_text(text).await;
    fold_result(ctx, "Pipeline run", result)
}

/// Answer the live clarification round.
///
/// A blank answer leaves the session open so the user can try again.
pub async fn answer_clarification(
    ctx: &AppContext,
    answer: &str,
) -> Result<PipelineOutcome, CommandError> {
    let answer = require_text(answer)?;
    let session = ctx.store.take_clarification_for_answer()?;
    let result = ctx
        .backend()
        .submit_clarification(&session.session_id, answer)
        .await;
    fold_result(ctx, "Clarification", result)
}

/// Mark the start of audio capture. Capture itself happens outside this crate.
pub fn start_recording(ctx: &AppContext) -> Result<String, CommandError> {
    Ok(ctx.store.start_recording()?)
}

/// Capture finished: upload the WAV bytes and fold in the result.
pub async fn upload_recording(
    ctx: &AppContext,
    wav: &[u8],
) -> Result<PipelineOutcome, CommandError> {
    ctx.store.stop_recording()?;
    let result = ctx.backend().send_audio(wav).await;
    fold_result(ctx, "Audio upload", result)
}

/// Ask the server for its health. Does not touch pipeline state.
pub async fn check_health(ctx: &AppContext) -> Result<HealthReport, CommandError> {
    Ok(ctx.backend().health().await?)
}
