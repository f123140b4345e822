//! Shared in-memory job registry.
//!
//! [`JobStore`] is a cheap cloneable handle; every clone sees the same
//! records and every write is visible to readers as soon as the lock is
//! released. Writes also signal [`JobStore::changed`], which the snapshot
//! writer waits on.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Notify, RwLock};
use vr180_core::error::CoreError;
use vr180_core::job::{Job, JobStatus};
use vr180_core::types::{JobId, Timestamp};

/// Number of jobs in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: usize,
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Clone, Default)]
pub struct JobStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore").finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Inner {
    jobs: RwLock<HashMap<JobId, Job>>,
    changed: Notify,
}

impl JobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `jobs`.
    pub fn from_jobs(jobs: impl IntoIterator<Item = Job>) -> Self {
        let map = jobs.into_iter().map(|job| (job.id, job)).collect();
        Self {
            inner: Arc::new(Inner {
                jobs: RwLock::new(map),
                changed: Notify::new(),
            }),
        }
    }

    pub async fn get(&self, id: JobId) -> Option<Job> {
        self.inner.jobs.read().await.get(&id).cloned()
    }

    /// Insert or replace a record.
    pub async fn put(&self, job: Job) {
        self.inner.jobs.write().await.insert(job.id, job);
        self.inner.changed.notify_one();
    }

    /// Apply `f` to the stored record under the write lock.
    ///
    /// Returns [`CoreError::NotFound`] for an unknown id and passes through
    /// whatever `f` returns. Job transition methods validate before they
    /// touch any field, so a rejected transition leaves the record as it was.
    pub async fn mutate<R>(
        &self,
        id: JobId,
        f: impl FnOnce(&mut Job) -> Result<R, CoreError>,
    ) -> Result<R, CoreError> {
        let result = {
            let mut jobs = self.inner.jobs.write().await;
            let job = jobs.get_mut(&id).ok_or_else(|| CoreError::job_not_found(id))?;
            f(job)?
        };
        self.inner.changed.notify_one();
        Ok(result)
    }

    pub async fn remove(&self, id: JobId) -> Option<Job> {
        let removed = self.inner.jobs.write().await.remove(&id);
        if removed.is_some() {
            self.inner.changed.notify_one();
        }
        removed
    }

    /// Remove `id` only if it still has not been updated since `cutoff`.
    ///
    /// The check and the removal happen under one write lock, so a job that
    /// was touched after the caller decided to evict it survives.
    pub async fn remove_if_stale(&self, id: JobId, cutoff: Timestamp) -> Option<Job> {
        let removed = {
            let mut jobs = self.inner.jobs.write().await;
            match jobs.get(&id) {
                Some(job) if job.updated_at < cutoff => jobs.remove(&id),
                _ => None,
            }
        };
        if removed.is_some() {
            self.inner.changed.notify_one();
        }
        removed
    }

    /// All records, oldest first.
    pub async fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.inner.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    /// Ids of records last updated before `cutoff`.
    pub async fn stale_ids(&self, cutoff: Timestamp) -> Vec<JobId> {
        self.inner
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.updated_at < cutoff)
            .map(|job| job.id)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.jobs.read().await.is_empty()
    }

    pub async fn counts(&self) -> StatusCounts {
        let jobs = self.inner.jobs.read().await;
        let mut counts = StatusCounts {
            total: jobs.len(),
            ..Default::default()
        };
        for job in jobs.values() {
            match job.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Resolves after the next write.
    ///
    /// Signals coalesce: any number of writes made while nobody is waiting
    /// wake exactly one future call.
    pub async fn changed(&self) {
        self.inner.changed.notified().await;
    }
}
