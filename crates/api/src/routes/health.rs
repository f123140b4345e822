use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    pub uptime_secs: u64,
    pub jobs: JobsHealth,
}

#[derive(Serialize)]
pub struct JobsHealth {
    pub total: usize,
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    /// Runs currently holding or waiting for an admission slot.
    pub active_runs: usize,
}

/// GET /health -- liveness plus a summary of the job registry.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let counts = state.store.counts().await;

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        jobs: JobsHealth {
            total: counts.total,
            queued: counts.queued,
            processing: counts.processing,
            completed: counts.completed,
            failed: counts.failed,
            active_runs: state.runner.active_count(),
        },
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
