use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use vr180_core::job::{JobError, JobErrorCode, JobStatus, StageName};
use vr180_core::types::JobId;

use crate::backend::ProcessingBackend;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::executor::{StageContext, StageExecutor};
use crate::store::JobStore;
use crate::transcoder::Transcoder;
use crate::workspace::JobWorkspace;

/// How long a timed-out run gets to stop its collaborators before it is
/// dropped.
const WIND_DOWN: Duration = Duration::from_secs(5);

/// Drives one job through the five stages in order.
///
/// Stages run strictly sequentially and a failed stage stops the run;
/// completed stages and their artifacts are kept. The whole run shares one
/// wall-clock budget.
pub struct PipelineOrchestrator {
    store: JobStore,
    executor: StageExecutor,
    jobs_dir: PathBuf,
    run_timeout: Duration,
}

impl PipelineOrchestrator {
    pub fn new(
        store: JobStore,
        backend: Arc<dyn ProcessingBackend>,
        transcoder: Arc<dyn Transcoder>,
        config: PipelineConfig,
    ) -> Self {
        let jobs_dir = config.jobs_dir.clone();
        let run_timeout = config.job_timeout;
        Self {
            executor: StageExecutor::new(store.clone(), backend, transcoder, config),
            store,
            jobs_dir,
            run_timeout,
        }
    }

    pub fn workspace(&self, job_id: JobId) -> JobWorkspace {
        JobWorkspace::new(&self.jobs_dir, job_id)
    }

    /// Run a queued job to a terminal state and return that state.
    ///
    /// Failures are recorded on the job, never returned. A job that is not
    /// queued (already started, cancelled while waiting, evicted) is left
    /// alone.
    pub async fn run(&self, job_id: JobId, cancel: CancellationToken) -> JobStatus {
        let input = match self
            .store
            .mutate(job_id, |job| {
                job.start()?;
                Ok(job.input.clone())
            })
            .await
        {
            Ok(input) => input,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Job could not be started");
                return self.status_of(job_id).await;
            }
        };

        tracing::info!(job_id = %job_id, "Pipeline run started");
        let started = Instant::now();

        let run_cancel = cancel.child_token();
        let run = self.run_stages(job_id, &input, &run_cancel);
        tokio::pin!(run);

        let outcome = tokio::select! {
            outcome = &mut run => outcome,
            _ = tokio::time::sleep(self.run_timeout) => {
                run_cancel.cancel();
                let _ = tokio::time::timeout(WIND_DOWN, &mut run).await;
                Err(PipelineError::Timeout(self.run_timeout))
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let recorded = match outcome {
            Ok(output) => {
                tracing::info!(
                    job_id = %job_id,
                    output = %output.display(),
                    elapsed_ms,
                    "Pipeline run completed",
                );
                self.store.mutate(job_id, |job| job.complete(output)).await
            }
            Err(err) => {
                tracing::warn!(
                    job_id = %job_id,
                    code = ?err.code(),
                    error = %err,
                    elapsed_ms,
                    "Pipeline run failed",
                );
                self.store
                    .mutate(job_id, |job| {
                        let error = err.to_job_error(job.active_stage());
                        job.fail(error)
                    })
                    .await
            }
        };

        if let Err(e) = recorded {
            tracing::error!(job_id = %job_id, error = %e, "Failed to record run outcome");
            let _ = self
                .store
                .mutate(job_id, |job| {
                    job.fail(JobError::new(JobErrorCode::Internal, e.to_string()))
                })
                .await;
        }

        self.status_of(job_id).await
    }

    /// Fail a job that never got to run.
    pub async fn abandon(&self, job_id: JobId, error: JobError) -> JobStatus {
        if let Err(e) = self.store.mutate(job_id, |job| job.fail(error)).await {
            tracing::debug!(job_id = %job_id, error = %e, "Job not abandoned");
        }
        self.status_of(job_id).await
    }

    async fn run_stages(
        &self,
        job_id: JobId,
        input: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError> {
        let workspace = self.workspace(job_id);
        workspace.ensure().await.map_err(PipelineError::Workspace)?;

        let ctx = StageContext {
            job_id,
            input,
            workspace: &workspace,
            cancel,
        };

        for stage in StageName::ALL {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            self.store
                .mutate(job_id, |job| job.begin_stage(stage))
                .await?;
            tracing::info!(job_id = %job_id, stage = %stage, "Stage started");
            let started = Instant::now();

            let summary = self.executor.execute(stage, &ctx).await?;

            self.store
                .mutate(job_id, |job| job.complete_stage(stage))
                .await?;
            tracing::info!(
                job_id = %job_id,
                stage = %stage,
                processed = summary.processed,
                skipped = summary.skipped,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Stage completed",
            );
        }

        Ok(workspace.output_path())
    }

    async fn status_of(&self, job_id: JobId) -> JobStatus {
        self.store
            .get(job_id)
            .await
            .map(|job| job.status)
            .unwrap_or(JobStatus::Failed)
    }
}
