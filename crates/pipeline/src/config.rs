use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Tunables for the orchestration engine.
///
/// The API binary fills this from the environment; tests build it directly
/// and shrink the timings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root for per-job working directories (`<jobs_dir>/<job_id>/...`).
    pub jobs_dir: PathBuf,
    /// Wall-clock budget for one whole run.
    pub job_timeout: Duration,
    /// Runs allowed to execute at once; further jobs wait queued.
    pub max_concurrent_jobs: usize,
    /// Frames per batch handed to the processing backend.
    pub batch_size: usize,
    /// Units of one batch in flight at the same time.
    pub batch_concurrency: usize,
    /// Share of a best-effort step's frames that may fail and be carried
    /// forward before the stage itself fails.
    pub max_skipped_frame_ratio: f64,
    /// Minimum spacing between two progress writes for the same stage.
    pub progress_write_interval: Duration,
    /// Rate frames are extracted at and re-encoded with.
    pub extract_fps: f64,
    /// Final output resolution (2:1 side-by-side).
    pub output_width: u32,
    pub output_height: u32,
    pub output_codec: String,
    /// Retry policy for calls to the processing backend.
    pub backend_retry: RetryPolicy,
    /// How often a submitted backend task is polled.
    pub backend_poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            jobs_dir: PathBuf::from("storage/jobs"),
            job_timeout: Duration::from_secs(3600),
            max_concurrent_jobs: 2,
            batch_size: 8,
            batch_concurrency: 4,
            max_skipped_frame_ratio: 0.5,
            progress_write_interval: Duration::from_millis(250),
            extract_fps: 30.0,
            output_width: 3840,
            output_height: 1920,
            output_codec: "libx264".to_string(),
            backend_retry: RetryPolicy::default(),
            backend_poll_interval: Duration::from_millis(500),
        }
    }
}
