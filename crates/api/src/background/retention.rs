//! Periodic eviction of expired jobs.
//!
//! A job expires once it has not been updated for the retention TTL. Its
//! record, stored upload and working directory are removed together. Jobs
//! with a live pipeline run are never evicted; they are skipped and picked
//! up by a later sweep once the run has finished.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use vr180_pipeline::runner::JobRunner;
use vr180_pipeline::store::JobStore;

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: usize,
    pub skipped_active: usize,
}

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Run the retention loop until `cancel` is triggered.
pub async fn run(
    store: JobStore,
    runner: Arc<JobRunner>,
    ttl: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(
        ttl_secs = ttl.as_secs(),
        interval_secs = interval.as_secs(),
        "Job retention sweeper started"
    );

    // `interval` panics on a zero period.
    let mut ticker = tokio::time::interval(interval.max(MIN_SWEEP_INTERVAL));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Job retention sweeper stopping");
                break;
            }
            _ = ticker.tick() => {
                let report = sweep(&store, &runner, ttl).await;
                if report.evicted > 0 {
                    tracing::info!(
                        evicted = report.evicted,
                        skipped_active = report.skipped_active,
                        "Job retention: evicted expired jobs"
                    );
                } else {
                    tracing::debug!("Job retention: nothing to evict");
                }
            }
        }
    }
}

/// Evict every job last updated more than `ttl` ago.
pub async fn sweep(store: &JobStore, runner: &JobRunner, ttl: Duration) -> SweepReport {
    let mut report = SweepReport::default();

    let Some(cutoff) = chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
    else {
        return report;
    };

    for id in store.stale_ids(cutoff).await {
        if runner.is_active(id) {
            tracing::warn!(job_id = %id, "Job retention: expired job still has a live run, skipping");
            report.skipped_active += 1;
            continue;
        }

        // Re-checked under the store lock: a job touched since listing stays.
        let Some(job) = store.remove_if_stale(id, cutoff).await else {
            continue;
        };

        if let Err(e) = runner.orchestrator().workspace(id).remove().await {
            tracing::error!(job_id = %id, error = %e, "Job retention: failed to remove workspace");
        }
        match tokio::fs::remove_file(&job.input).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Job retention: failed to remove upload");
            }
        }

        report.evicted += 1;
    }

    report
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use uuid::Uuid;
    use vr180_core::job::Job;
    use vr180_pipeline::orchestrator::PipelineOrchestrator;
    use vr180_pipeline::testing::{fast_config, FakeBackend, FakeTranscoder};

    use super::*;

    struct Harness {
        tmp: tempfile::TempDir,
        store: JobStore,
        runner: Arc<JobRunner>,
    }

    fn harness(backend: FakeBackend) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let store = JobStore::new();
        let orchestrator = PipelineOrchestrator::new(
            store.clone(),
            Arc::new(backend),
            Arc::new(FakeTranscoder::new(2)),
            fast_config(&tmp.path().join("jobs")),
        );
        Harness {
            runner: Arc::new(JobRunner::new(Arc::new(orchestrator), 2)),
            store,
            tmp,
        }
    }

    /// Put a job whose upload exists on disk and whose last update was
    /// `age` ago.
    async fn seed(h: &Harness, age: chrono::Duration) -> (Job, PathBuf) {
        let id = Uuid::new_v4();
        let input = h.tmp.path().join(format!("{id}.mp4"));
        std::fs::write(&input, b"source").unwrap();
        let mut job = Job::new(id, input.clone(), "clip.mp4", 6);
        job.updated_at = Utc::now() - age;
        job.created_at = job.updated_at;
        h.store.put(job.clone()).await;
        (job, input)
    }

    #[tokio::test]
    async fn expired_job_is_evicted_with_its_files() {
        let h = harness(FakeBackend::new());
        let (job, input) = seed(&h, chrono::Duration::hours(2)).await;
        let workspace = h.runner.orchestrator().workspace(job.id);
        workspace.ensure().await.unwrap();

        let report = sweep(&h.store, &h.runner, Duration::from_secs(3600)).await;

        assert_eq!(report.evicted, 1);
        assert!(h.store.get(job.id).await.is_none());
        assert!(!input.exists());
        assert!(!workspace.root().exists());
    }

    #[tokio::test]
    async fn fresh_job_is_kept() {
        let h = harness(FakeBackend::new());
        let (job, input) = seed(&h, chrono::Duration::minutes(5)).await;

        let report = sweep(&h.store, &h.runner, Duration::from_secs(3600)).await;

        assert_eq!(report, SweepReport::default());
        assert!(h.store.get(job.id).await.is_some());
        assert!(input.exists());
    }

    #[tokio::test]
    async fn job_with_live_run_is_skipped() {
        let h = harness(FakeBackend::new().with_delay(Duration::from_millis(200)));
        let (job, input) = seed(&h, chrono::Duration::zero()).await;
        h.runner.submit(job.id).unwrap();

        // A zero TTL makes every job stale, including the running one.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let report = sweep(&h.store, &h.runner, Duration::ZERO).await;

        assert_eq!(report.evicted, 0);
        assert_eq!(report.skipped_active, 1);
        assert!(h.store.get(job.id).await.is_some());
        assert!(input.exists());

        h.runner.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn missing_files_do_not_block_eviction() {
        let h = harness(FakeBackend::new());
        let (job, input) = seed(&h, chrono::Duration::hours(2)).await;
        std::fs::remove_file(&input).unwrap();

        let report = sweep(&h.store, &h.runner, Duration::from_secs(60)).await;

        assert_eq!(report.evicted, 1);
        assert!(h.store.get(job.id).await.is_none());
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let h = harness(FakeBackend::new());
        let (job, _) = seed(&h, chrono::Duration::hours(2)).await;
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(
            h.store.clone(),
            Arc::clone(&h.runner),
            Duration::from_secs(60),
            Duration::from_millis(10),
            cancel.clone(),
        ));

        // The first tick fires immediately.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.store.get(job.id).await.is_none());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn zero_interval_does_not_kill_the_sweeper() {
        let h = harness(FakeBackend::new());
        let (job, _) = seed(&h, chrono::Duration::hours(2)).await;
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(
            h.store.clone(),
            Arc::clone(&h.runner),
            Duration::from_secs(60),
            Duration::ZERO,
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!task.is_finished());
        assert!(h.store.get(job.id).await.is_none());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
