//! Frame-processing collaborator.
//!
//! Depth estimation, stereo synthesis, outpainting, blur and upscaling run
//! in a separate service. The pipeline hands it one [`WorkUnit`] per frame
//! and waits for the output file to appear on the shared filesystem.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use vr180_core::job::StageName;
use vr180_core::types::JobId;

use crate::retry::{with_retry, RetryPolicy};

/// One frame of work for one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkUnit {
    pub job_id: JobId,
    pub stage: StageName,
    /// Zero-based frame index within the job.
    pub index: usize,
    /// Input files, primary frame first.
    pub inputs: Vec<PathBuf>,
    /// Where the backend must write its result.
    pub output: PathBuf,
}

/// Errors from a processing backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("backend request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend answered with a non-2xx status code.
    #[error("backend API error ({status}): {body}")]
    Api { status: u16, body: String },

    /// The backend accepted the unit but reported it failed.
    #[error("backend task failed: {0}")]
    TaskFailed(String),

    #[error("unit was cancelled")]
    Cancelled,
}

impl BackendError {
    /// Connection problems, 5xx and 429 are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Request(e) => e.is_connect() || e.is_timeout(),
            BackendError::Api { status, .. } => *status == 429 || (500..600).contains(status),
            BackendError::TaskFailed(_) | BackendError::Cancelled => false,
        }
    }
}

/// Callback receiving a unit's own progress, `0..=100`.
pub type UnitProgress<'a> = &'a (dyn Fn(u8) + Send + Sync);

#[async_trait]
pub trait ProcessingBackend: Send + Sync {
    /// Process `unit` to completion.
    ///
    /// Returns once `unit.output` has been written. Implementations should
    /// stop promptly and return [`BackendError::Cancelled`] when `cancel`
    /// fires.
    async fn process(
        &self,
        unit: &WorkUnit,
        progress: UnitProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), BackendError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    task_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    status: TaskState,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

/// Processing service reached over HTTP.
///
/// * `POST {base}/tasks` with the unit as JSON returns `{"task_id": ...}`.
/// * `GET {base}/tasks/{id}` returns `{"status", "progress", "error"}`.
/// * `DELETE {base}/tasks/{id}` abandons a task.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
    retry: RetryPolicy,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, poll_interval: Duration, retry: RetryPolicy) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, poll_interval, retry)
    }

    /// Reuse an existing [`reqwest::Client`] for connection pooling.
    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        poll_interval: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            poll_interval,
            retry,
        }
    }

    async fn submit(&self, unit: &WorkUnit) -> Result<String, BackendError> {
        let response = self
            .client
            .post(format!("{}/tasks", self.base_url))
            .json(unit)
            .send()
            .await?;
        let submitted: SubmitResponse = Self::parse_response(response).await?;
        Ok(submitted.task_id)
    }

    async fn poll(&self, task_id: &str) -> Result<TaskStatus, BackendError> {
        let response = self
            .client
            .get(format!("{}/tasks/{task_id}", self.base_url))
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn abandon(&self, task_id: &str) {
        let result = self
            .client
            .delete(format!("{}/tasks/{task_id}", self.base_url))
            .send()
            .await;
        if let Err(e) = result {
            tracing::warn!(task_id, error = %e, "Failed to cancel backend task");
        }
    }

    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(BackendError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, BackendError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl ProcessingBackend for HttpBackend {
    async fn process(
        &self,
        unit: &WorkUnit,
        progress: UnitProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), BackendError> {
        let task_id = with_retry(
            &self.retry,
            cancel,
            "backend submit",
            BackendError::is_transient,
            || self.submit(unit),
        )
        .await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.abandon(&task_id).await;
                    return Err(BackendError::Cancelled);
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let polled = with_retry(
                &self.retry,
                cancel,
                "backend poll",
                BackendError::is_transient,
                || self.poll(&task_id),
            )
            .await;
            let status = match polled {
                Ok(status) => status,
                Err(_) if cancel.is_cancelled() => {
                    self.abandon(&task_id).await;
                    return Err(BackendError::Cancelled);
                }
                Err(e) => return Err(e),
            };

            if let Some(p) = status.progress {
                progress(p.clamp(0.0, 100.0) as u8);
            }

            match status.status {
                TaskState::Queued | TaskState::Running => {}
                TaskState::Completed => {
                    progress(100);
                    return Ok(());
                }
                TaskState::Failed => {
                    return Err(BackendError::TaskFailed(
                        status.error.unwrap_or_else(|| "no reason given".to_string()),
                    ));
                }
            }
        }
    }
}
