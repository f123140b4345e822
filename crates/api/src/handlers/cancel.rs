use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use vr180_core::error::CoreError;
use vr180_core::types::JobId;

use crate::error::{parse_job_id, AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub job_id: JobId,
    pub status: &'static str,
}

/// POST /cancel/{job_id}
///
/// Requests cancellation of a live run. The job turns `failed` with a
/// `CANCELLED` error once the run has stopped; poll `/status` to observe
/// it. Returns 409 for a job that already finished.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<(StatusCode, Json<CancelResponse>)> {
    let id = parse_job_id(&job_id)?;
    let job = state
        .store
        .get(id)
        .await
        .ok_or(AppError::Core(CoreError::job_not_found(id)))?;

    if job.status.is_terminal() {
        return Err(AppError::Core(CoreError::Conflict(format!(
            "job {id} is already {}",
            job.status
        ))));
    }

    if !state.runner.cancel(id) {
        return Err(AppError::Core(CoreError::Conflict(format!(
            "job {id} has no live run to cancel"
        ))));
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            job_id: id,
            status: "cancelling",
        }),
    ))
}
