//! Durable JSON snapshot of the job registry.
//!
//! The whole registry is written to `<path>.tmp` and renamed over `path`,
//! so a crash mid-write leaves the previous snapshot intact. Writing is
//! driven by [`run_snapshot_writer`], which waits on store changes and
//! coalesces bursts of writes into one flush.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use vr180_core::job::{Job, JobError, JobErrorCode};
use vr180_core::types::Timestamp;

use crate::error::PersistenceError;
use crate::store::JobStore;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotFile {
    version: u32,
    saved_at: Timestamp,
    jobs: Vec<Job>,
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PersistenceError + '_ {
    move |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Read the jobs stored at `path`. A missing file yields `None`.
pub async fn read_snapshot(path: &Path) -> Result<Option<Vec<Job>>, PersistenceError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path)(e)),
    };
    let file: SnapshotFile =
        serde_json::from_slice(&bytes).map_err(|source| PersistenceError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
    if file.version != SNAPSHOT_VERSION {
        return Err(PersistenceError::UnsupportedVersion(file.version));
    }
    Ok(Some(file.jobs))
}

/// Atomically replace the snapshot at `path` with `jobs`.
pub async fn write_snapshot(path: &Path, jobs: Vec<Job>) -> Result<(), PersistenceError> {
    let file = SnapshotFile {
        version: SNAPSHOT_VERSION,
        saved_at: Utc::now(),
        jobs,
    };
    let bytes = serde_json::to_vec(&file)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_error(parent))?;
    }
    let tmp = temp_path(path);
    tokio::fs::write(&tmp, &bytes).await.map_err(io_error(&tmp))?;
    tokio::fs::rename(&tmp, path).await.map_err(io_error(path))?;
    Ok(())
}

/// Build the startup store from the snapshot at `path`.
///
/// Jobs that were still queued or processing when the snapshot was taken
/// cannot be resumed and are failed with `INTERRUPTED`. A missing file
/// gives an empty store; read or parse failures are returned so the caller
/// can log them and start empty.
pub async fn restore_store(path: &Path) -> Result<JobStore, PersistenceError> {
    let Some(mut jobs) = read_snapshot(path).await? else {
        return Ok(JobStore::new());
    };

    let mut interrupted = 0usize;
    for job in jobs.iter_mut().filter(|job| !job.status.is_terminal()) {
        let error = JobError::new(
            JobErrorCode::Interrupted,
            "service restarted while the job was in flight",
        );
        let error = match job.active_stage() {
            Some(stage) => error.with_stage(stage),
            None => error,
        };
        if job.fail(error).is_ok() {
            interrupted += 1;
        }
    }

    tracing::info!(
        path = %path.display(),
        jobs = jobs.len(),
        interrupted,
        "Restored job snapshot",
    );
    Ok(JobStore::from_jobs(jobs))
}

async fn flush(store: &JobStore, path: &Path) {
    let jobs = store.list().await;
    let count = jobs.len();
    match write_snapshot(path, jobs).await {
        Ok(()) => tracing::debug!(path = %path.display(), jobs = count, "Snapshot written"),
        Err(e) => tracing::error!(error = %e, "Failed to write job snapshot"),
    }
}

/// Persist `store` to `path` after every change until `cancel` fires.
///
/// With a non-zero `debounce` the writer waits that long after the first
/// change before flushing, folding further changes into the same write. A
/// final flush runs on cancellation so the last state reaches disk.
pub async fn run_snapshot_writer(
    store: JobStore,
    path: PathBuf,
    debounce: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(
        path = %path.display(),
        debounce_ms = debounce.as_millis() as u64,
        "Snapshot writer started",
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = store.changed() => {}
        }

        if !debounce.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(debounce) => {}
            }
        }

        flush(&store, &path).await;
    }

    flush(&store, &path).await;
    tracing::info!("Snapshot writer stopped");
}
