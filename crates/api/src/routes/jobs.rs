use axum::routing::{get, post};
use axum::Router;

use crate::handlers::{cancel, download, status, upload};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/upload", post(upload::upload_video))
        .route("/status/{job_id}", get(status::get_status))
        .route("/download/{job_id}", get(download::download_output))
        .route("/cancel/{job_id}", post(cancel::cancel_job))
}
