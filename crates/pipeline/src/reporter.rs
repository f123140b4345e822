//! Throttled stage-progress writes.

use std::time::{Duration, Instant};

use vr180_core::error::CoreError;
use vr180_core::job::StageName;
use vr180_core::types::JobId;

use crate::store::JobStore;

/// Writes one stage's progress into the store, at most once per interval.
///
/// A value is written only when its integer percent exceeds the last one
/// written and `min_interval` has passed since that write. Values held back
/// by the interval are kept and written by [`ProgressReporter::flush`].
pub struct ProgressReporter {
    store: JobStore,
    job_id: JobId,
    stage: StageName,
    min_interval: Duration,
    written: u8,
    last_write: Option<Instant>,
    pending: Option<u8>,
}

impl ProgressReporter {
    pub fn new(store: JobStore, job_id: JobId, stage: StageName, min_interval: Duration) -> Self {
        Self {
            store,
            job_id,
            stage,
            min_interval,
            written: 0,
            last_write: None,
            pending: None,
        }
    }

    pub async fn report(&mut self, progress: u8) -> Result<(), CoreError> {
        let progress = progress.min(100);
        if progress <= self.written || self.pending.is_some_and(|p| progress <= p) {
            return Ok(());
        }
        let throttled = self
            .last_write
            .is_some_and(|at| at.elapsed() < self.min_interval);
        if throttled {
            self.pending = Some(progress);
            return Ok(());
        }
        self.write(progress).await
    }

    /// Write any value held back by the interval.
    pub async fn flush(&mut self) -> Result<(), CoreError> {
        match self.pending.take() {
            Some(progress) => self.write(progress).await,
            None => Ok(()),
        }
    }

    async fn write(&mut self, progress: u8) -> Result<(), CoreError> {
        let stage = self.stage;
        self.store
            .mutate(self.job_id, |job| job.record_stage_progress(stage, progress))
            .await?;
        self.written = progress;
        self.pending = None;
        self.last_write = Some(Instant::now());
        Ok(())
    }
}

/// A step's slice of its stage's `0..=100` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSpan {
    pub start: u8,
    pub width: u8,
}

impl ProgressSpan {
    /// Map a step-local percentage into the stage range.
    pub fn map(self, local: u8) -> u8 {
        let local = u32::from(local.min(100));
        let offset = u32::from(self.width) * local / 100;
        (u32::from(self.start) + offset).min(100) as u8
    }

    pub fn end(self) -> u8 {
        self.map(100)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use uuid::Uuid;
    use vr180_core::job::Job;

    use super::*;

    async fn processing_store() -> (JobStore, JobId) {
        let store = JobStore::new();
        let mut job = Job::new(Uuid::new_v4(), PathBuf::from("in.mp4"), "in.mp4", 1);
        job.start().unwrap();
        job.begin_stage(StageName::Depth).unwrap();
        let id = job.id;
        store.put(job).await;
        (store, id)
    }

    async fn stored(store: &JobStore, id: JobId) -> u8 {
        store.get(id).await.unwrap().stage(StageName::Depth).progress
    }

    #[tokio::test]
    async fn writes_only_increases() {
        let (store, id) = processing_store().await;
        let mut reporter = ProgressReporter::new(store.clone(), id, StageName::Depth, Duration::ZERO);

        reporter.report(10).await.unwrap();
        reporter.report(5).await.unwrap();
        reporter.report(10).await.unwrap();
        assert_eq!(stored(&store, id).await, 10);

        reporter.report(30).await.unwrap();
        assert_eq!(stored(&store, id).await, 30);
    }

    #[tokio::test]
    async fn throttled_values_are_flushed() {
        let (store, id) = processing_store().await;
        let mut reporter =
            ProgressReporter::new(store.clone(), id, StageName::Depth, Duration::from_secs(60));

        reporter.report(10).await.unwrap();
        reporter.report(20).await.unwrap();
        reporter.report(25).await.unwrap();
        assert_eq!(stored(&store, id).await, 10);

        reporter.flush().await.unwrap();
        assert_eq!(stored(&store, id).await, 25);

        // Nothing pending: a second flush writes nothing new.
        reporter.flush().await.unwrap();
        assert_eq!(stored(&store, id).await, 25);
    }

    #[test]
    fn span_maps_into_stage_range() {
        let extract = ProgressSpan { start: 0, width: 30 };
        let units = ProgressSpan { start: 30, width: 70 };
        assert_eq!(extract.map(50), 15);
        assert_eq!(extract.end(), 30);
        assert_eq!(units.map(0), 30);
        assert_eq!(units.map(50), 65);
        assert_eq!(units.end(), 100);
    }
}
