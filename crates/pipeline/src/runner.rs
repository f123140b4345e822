//! Registry of live pipeline runs.
//!
//! Each submitted job gets one detached task that waits for an admission
//! permit and then runs the orchestrator. The runner keeps the task's
//! handle and cancellation token so the API can cancel a run, the retention
//! sweeper can tell whether a job is still running, and shutdown can drain
//! everything.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vr180_core::error::CoreError;
use vr180_core::job::{JobError, JobErrorCode, JobStatus};
use vr180_core::types::JobId;

use crate::orchestrator::PipelineOrchestrator;

struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    done: watch::Receiver<Option<JobStatus>>,
}

impl RunHandle {
    fn is_live(&self) -> bool {
        !self.task.is_finished()
    }
}

pub struct JobRunner {
    orchestrator: Arc<PipelineOrchestrator>,
    admission: Arc<Semaphore>,
    runs: Mutex<HashMap<JobId, RunHandle>>,
    shutdown: CancellationToken,
}

impl JobRunner {
    /// Create a runner allowing `max_concurrent` runs at once (minimum 1).
    pub fn new(orchestrator: Arc<PipelineOrchestrator>, max_concurrent: usize) -> Self {
        Self {
            orchestrator,
            admission: Arc::new(Semaphore::new(max_concurrent.max(1))),
            runs: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<PipelineOrchestrator> {
        &self.orchestrator
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<JobId, RunHandle>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a detached run for a queued job.
    ///
    /// Rejects a job that already has a live run, and every job once
    /// shutdown has begun.
    pub fn submit(&self, job_id: JobId) -> Result<(), CoreError> {
        if self.shutdown.is_cancelled() {
            return Err(CoreError::Conflict(
                "service is shutting down, not accepting new runs".to_string(),
            ));
        }

        let mut runs = self.runs();
        runs.retain(|_, handle| handle.is_live());
        if runs.contains_key(&job_id) {
            return Err(CoreError::Conflict(format!("job {job_id} already has a live run")));
        }

        let cancel = self.shutdown.child_token();
        let (done_tx, done_rx) = watch::channel(None);
        let task = tokio::spawn(drive(
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.admission),
            job_id,
            cancel.clone(),
            done_tx,
        ));

        runs.insert(
            job_id,
            RunHandle {
                cancel,
                task,
                done: done_rx,
            },
        );
        tracing::debug!(job_id = %job_id, "Run submitted");
        Ok(())
    }

    pub fn is_active(&self, job_id: JobId) -> bool {
        self.runs().get(&job_id).is_some_and(RunHandle::is_live)
    }

    /// Request cancellation of a live run. Returns false if there is none.
    pub fn cancel(&self, job_id: JobId) -> bool {
        match self.runs().get(&job_id) {
            Some(handle) if handle.is_live() => {
                handle.cancel.cancel();
                tracing::info!(job_id = %job_id, "Run cancellation requested");
                true
            }
            _ => false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.runs().values().filter(|h| h.is_live()).count()
    }

    /// Wait for a run to finish and return the job's terminal status.
    ///
    /// `None` if the job was never submitted or its task died without
    /// reporting.
    pub async fn wait(&self, job_id: JobId) -> Option<JobStatus> {
        let mut done = self.runs().get(&job_id)?.done.clone();
        let status = match done.wait_for(Option::is_some).await {
            Ok(status) => *status,
            Err(_) => None,
        };
        status
    }

    /// Cancel every run and wait up to `grace` for them to record their
    /// outcome.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.runs().drain().map(|(_, h)| h.task).collect();
        if tasks.is_empty() {
            return;
        }

        tracing::info!(runs = tasks.len(), "Draining pipeline runs");
        if tokio::time::timeout(grace, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            tracing::warn!(
                grace_secs = grace.as_secs(),
                "Pipeline runs did not stop within the grace period",
            );
        }
    }
}

async fn drive(
    orchestrator: Arc<PipelineOrchestrator>,
    admission: Arc<Semaphore>,
    job_id: JobId,
    cancel: CancellationToken,
    done: watch::Sender<Option<JobStatus>>,
) {
    let permit = tokio::select! {
        permit = admission.acquire_owned() => permit.ok(),
        _ = cancel.cancelled() => None,
    };

    let status = match permit {
        Some(_permit) => orchestrator.run(job_id, cancel).await,
        None => {
            orchestrator
                .abandon(
                    job_id,
                    JobError::new(JobErrorCode::Cancelled, "run was cancelled before it started"),
                )
                .await
        }
    };

    let _ = done.send(Some(status));
}
