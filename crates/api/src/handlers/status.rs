use axum::extract::{Path, State};
use axum::Json;
use vr180_core::error::CoreError;
use vr180_core::job::Job;

use crate::error::{parse_job_id, AppError, AppResult};
use crate::state::AppState;

/// GET /status/{job_id}
///
/// Returns the full job record.
pub async fn get_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<Job>> {
    let id = parse_job_id(&job_id)?;
    let job = state
        .store
        .get(id)
        .await
        .ok_or(AppError::Core(CoreError::job_not_found(id)))?;
    Ok(Json(job))
}
