pub mod health;
pub mod jobs;

use axum::Router;

use crate::state::AppState;

/// Every public route.
///
/// ```text
/// GET  /health
/// POST /upload                 multipart video upload
/// GET  /status/{job_id}        job record
/// GET  /download/{job_id}      rendered output (Range supported)
/// POST /cancel/{job_id}        cancel a live run
/// ```
pub fn all() -> Router<AppState> {
    Router::new().merge(health::router()).merge(jobs::router())
}
