use std::sync::Arc;
use std::time::Instant;

use vr180_pipeline::runner::JobRunner;
use vr180_pipeline::store::JobStore;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable: every field is a handle or behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Job registry shared with the pipeline.
    pub store: JobStore,
    /// Live pipeline runs.
    pub runner: Arc<JobRunner>,
    /// Process start, reported by `/health`.
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig, store: JobStore, runner: Arc<JobRunner>) -> Self {
        Self {
            config: Arc::new(config),
            store,
            runner,
            started_at: Instant::now(),
        }
    }
}
