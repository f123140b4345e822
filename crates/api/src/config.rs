use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use vr180_core::media::MAX_UPLOAD_BYTES;
use vr180_pipeline::config::PipelineConfig;

/// Server configuration loaded from environment variables.
///
/// [`Default`] gives the local-development values; [`ServerConfig::from_env`]
/// overrides them from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    pub request_timeout_secs: u64,
    /// How long shutdown waits for running jobs to record their outcome.
    pub shutdown_timeout_secs: u64,
    /// Root for uploads and job workspaces.
    pub storage_dir: PathBuf,
    /// Where the job registry is persisted; `None` keeps it in memory only.
    pub snapshot_path: Option<PathBuf>,
    pub snapshot_debounce_ms: u64,
    pub max_upload_bytes: u64,
    /// Jobs untouched for longer than this are evicted.
    pub retention_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub processing_backend_url: String,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub pipeline: PipelineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let storage_dir = PathBuf::from("storage");
        Self {
            host: "0.0.0.0".into(),
            port: 3001,
            cors_origins: vec![
                "http://localhost:5173".into(),
                "http://localhost:8501".into(),
            ],
            request_timeout_secs: 600,
            shutdown_timeout_secs: 30,
            pipeline: PipelineConfig {
                jobs_dir: storage_dir.join("jobs"),
                ..PipelineConfig::default()
            },
            storage_dir,
            snapshot_path: None,
            snapshot_debounce_ms: 0,
            max_upload_bytes: MAX_UPLOAD_BYTES,
            retention_ttl_secs: 86_400,
            sweep_interval_secs: 600,
            processing_backend_url: "http://127.0.0.1:8000".into(),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
        }
    }
}

/// Read `key`, falling back to `default`. Panics on an unparsable value so
/// misconfiguration fails at startup.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .unwrap_or_else(|_| panic!("{key} has an invalid value: {raw:?}")),
        Err(_) => default,
    }
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default                                         |
    /// |------------------------------|-------------------------------------------------|
    /// | `HOST`                       | `0.0.0.0`                                       |
    /// | `PORT`                       | `3001`                                          |
    /// | `CORS_ORIGINS`               | `http://localhost:5173,http://localhost:8501`   |
    /// | `REQUEST_TIMEOUT_SECS`       | `600`                                           |
    /// | `SHUTDOWN_TIMEOUT_SECS`      | `30`                                            |
    /// | `STORAGE_DIR`                | `storage`                                       |
    /// | `SNAPSHOT_PATH`              | unset                                           |
    /// | `SNAPSHOT_DEBOUNCE_MS`       | `0`                                             |
    /// | `MAX_UPLOAD_BYTES`           | `500000000`                                     |
    /// | `MAX_CONCURRENT_JOBS`        | `2`                                             |
    /// | `JOB_TIMEOUT_SECS`           | `3600`                                          |
    /// | `BATCH_SIZE`                 | `8`                                             |
    /// | `BATCH_CONCURRENCY`          | `4`                                             |
    /// | `PROGRESS_WRITE_INTERVAL_MS` | `250`                                           |
    /// | `RETENTION_TTL_SECS`         | `86400`                                         |
    /// | `SWEEP_INTERVAL_SECS`        | `600`                                           |
    /// | `PROCESSING_BACKEND_URL`     | `http://127.0.0.1:8000`                         |
    /// | `FFMPEG_PATH`                | `ffmpeg`                                        |
    /// | `FFPROBE_PATH`               | `ffprobe`                                       |
    /// | `EXTRACT_FPS`                | `30`                                            |
    /// | `OUTPUT_WIDTH`               | `3840`                                          |
    /// | `OUTPUT_HEIGHT`              | `1920`                                          |
    /// | `MAX_SKIPPED_FRAME_RATIO`    | `0.5`                                           |
    ///
    /// Panics when a value does not parse or fails [`ServerConfig::check`].
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cors_origins: Vec<String> = match std::env::var("CORS_ORIGINS") {
            Ok(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => defaults.cors_origins,
        };

        let storage_dir: PathBuf = env_or("STORAGE_DIR", defaults.storage_dir);
        let snapshot_path = std::env::var("SNAPSHOT_PATH")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let base = defaults.pipeline;
        let pipeline = PipelineConfig {
            jobs_dir: storage_dir.join("jobs"),
            job_timeout: Duration::from_secs(env_or("JOB_TIMEOUT_SECS", base.job_timeout.as_secs())),
            max_concurrent_jobs: env_or("MAX_CONCURRENT_JOBS", base.max_concurrent_jobs),
            batch_size: env_or("BATCH_SIZE", base.batch_size),
            batch_concurrency: env_or("BATCH_CONCURRENCY", base.batch_concurrency),
            progress_write_interval: Duration::from_millis(env_or(
                "PROGRESS_WRITE_INTERVAL_MS",
                base.progress_write_interval.as_millis() as u64,
            )),
            extract_fps: env_or("EXTRACT_FPS", base.extract_fps),
            output_width: env_or("OUTPUT_WIDTH", base.output_width),
            output_height: env_or("OUTPUT_HEIGHT", base.output_height),
            max_skipped_frame_ratio: env_or("MAX_SKIPPED_FRAME_RATIO", base.max_skipped_frame_ratio),
            ..base
        };

        let config = Self {
            host: env_or("HOST", defaults.host),
            port: env_or("PORT", defaults.port),
            cors_origins,
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs),
            shutdown_timeout_secs: env_or("SHUTDOWN_TIMEOUT_SECS", defaults.shutdown_timeout_secs),
            storage_dir,
            snapshot_path,
            snapshot_debounce_ms: env_or("SNAPSHOT_DEBOUNCE_MS", defaults.snapshot_debounce_ms),
            max_upload_bytes: env_or("MAX_UPLOAD_BYTES", defaults.max_upload_bytes),
            retention_ttl_secs: env_or("RETENTION_TTL_SECS", defaults.retention_ttl_secs),
            sweep_interval_secs: env_or("SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs),
            processing_backend_url: env_or("PROCESSING_BACKEND_URL", defaults.processing_backend_url),
            ffmpeg_path: env_or("FFMPEG_PATH", defaults.ffmpeg_path),
            ffprobe_path: env_or("FFPROBE_PATH", defaults.ffprobe_path),
            pipeline,
        };
        if let Err(msg) = config.check() {
            panic!("invalid configuration: {msg}");
        }
        config
    }

    /// Reject values the runtime cannot work with. Zero intervals would stall
    /// the sweeper and zero-width batches would never make progress.
    pub fn check(&self) -> Result<(), String> {
        let positive = [
            ("SWEEP_INTERVAL_SECS", self.sweep_interval_secs),
            ("RETENTION_TTL_SECS", self.retention_ttl_secs),
            ("MAX_UPLOAD_BYTES", self.max_upload_bytes),
            ("JOB_TIMEOUT_SECS", self.pipeline.job_timeout.as_secs()),
            ("MAX_CONCURRENT_JOBS", self.pipeline.max_concurrent_jobs as u64),
            ("BATCH_SIZE", self.pipeline.batch_size as u64),
            ("BATCH_CONCURRENCY", self.pipeline.batch_concurrency as u64),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(format!("{key} must be greater than zero"));
        }
        let ratio = self.pipeline.max_skipped_frame_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(format!("MAX_SKIPPED_FRAME_RATIO must be within 0..=1, got {ratio}"));
        }
        let fps = self.pipeline.extract_fps;
        if !(fps.is_finite() && fps > 0.0) {
            return Err("EXTRACT_FPS must be greater than zero".into());
        }
        Ok(())
    }

    /// Directory holding stored uploads.
    pub fn uploads_dir(&self) -> PathBuf {
        self.storage_dir.join("uploads")
    }
}
