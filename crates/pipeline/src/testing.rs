//! In-process stand-ins for the transcoder and processing backend.
//!
//! They touch the filesystem the same way the real collaborators do
//! (numbered frame files, an output video) so a full run can be driven in
//! tests without ffmpeg or a GPU service.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use vr180_core::ffmpeg::{FfmpegError, TranscodeInput, TranscodeRequest};
use vr180_core::job::StageName;

use crate::backend::{BackendError, ProcessingBackend, UnitProgress, WorkUnit};
use crate::config::PipelineConfig;
use crate::transcoder::{TranscodeError, Transcoder};
use crate::workspace::{frame_path, list_frames};

/// Size of the video written by [`FakeTranscoder`].
pub const FAKE_OUTPUT_BYTES: usize = 4096;

/// Deterministic content of the fake output video.
pub fn fake_output_bytes() -> Vec<u8> {
    (0..FAKE_OUTPUT_BYTES).map(|i| (i % 251) as u8).collect()
}

/// A config with tiny timings, rooted at `jobs_dir`.
pub fn fast_config(jobs_dir: &Path) -> PipelineConfig {
    PipelineConfig {
        jobs_dir: jobs_dir.to_path_buf(),
        job_timeout: Duration::from_secs(30),
        batch_size: 4,
        batch_concurrency: 2,
        progress_write_interval: Duration::ZERO,
        backend_poll_interval: Duration::from_millis(5),
        ..PipelineConfig::default()
    }
}

async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Writes `frames` placeholder frames on extraction and a fixed byte
/// pattern on encode.
pub struct FakeTranscoder {
    frames: usize,
    fail_extraction: bool,
    fail_encode: bool,
    delay: Duration,
}

impl FakeTranscoder {
    pub fn new(frames: usize) -> Self {
        Self {
            frames,
            fail_extraction: false,
            fail_encode: false,
            delay: Duration::ZERO,
        }
    }

    pub fn failing_extraction(mut self) -> Self {
        self.fail_extraction = true;
        self
    }

    pub fn failing_encode(mut self) -> Self {
        self.fail_encode = true;
        self
    }

    /// Sleep this long per frame written.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn failure(what: &str) -> TranscodeError {
        FfmpegError::ExecutionFailed {
            exit_code: Some(1),
            stderr: format!("simulated {what} failure"),
        }
        .into()
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn transcode(
        &self,
        request: &TranscodeRequest,
        progress: UnitProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), TranscodeError> {
        match &request.input {
            TranscodeInput::File(_) => {
                if self.fail_extraction {
                    return Err(Self::failure("extraction"));
                }
                let dir = request.output.parent().unwrap_or(Path::new("."));
                for index in 0..self.frames {
                    if !pause(self.delay, cancel).await {
                        return Err(TranscodeError::Cancelled);
                    }
                    tokio::fs::write(frame_path(dir, index), format!("frame {index}"))
                        .await
                        .map_err(FfmpegError::IoError)?;
                    progress(((index + 1) * 100 / self.frames) as u8);
                }
            }
            TranscodeInput::ImageSequence { pattern, .. } => {
                if self.fail_encode {
                    return Err(Self::failure("encode"));
                }
                let dir = pattern.parent().unwrap_or(Path::new("."));
                let frames = list_frames(dir).await.map_err(FfmpegError::IoError)?;
                if frames.is_empty() {
                    return Err(Self::failure("empty sequence"));
                }
                if !pause(self.delay, cancel).await {
                    return Err(TranscodeError::Cancelled);
                }
                tokio::fs::write(&request.output, fake_output_bytes())
                    .await
                    .map_err(FfmpegError::IoError)?;
            }
        }
        progress(100);
        Ok(())
    }
}

/// Copies each unit's primary input to its output.
///
/// Records how many units ran and the highest number in flight at once.
#[derive(Default)]
pub struct FakeBackend {
    delay: Duration,
    failing_units: HashSet<(StageName, usize)>,
    failing_stages: HashSet<StageName>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    processed: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long per unit.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail frame `index` of `stage`.
    pub fn failing_unit(mut self, stage: StageName, index: usize) -> Self {
        self.failing_units.insert((stage, index));
        self
    }

    /// Fail every frame of `stage`.
    pub fn failing_stage(mut self, stage: StageName) -> Self {
        self.failing_stages.insert(stage);
        self
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn run(&self, unit: &WorkUnit, cancel: &CancellationToken) -> Result<(), BackendError> {
        if !pause(self.delay, cancel).await {
            return Err(BackendError::Cancelled);
        }
        if self.failing_stages.contains(&unit.stage)
            || self.failing_units.contains(&(unit.stage, unit.index))
        {
            return Err(BackendError::TaskFailed(format!(
                "simulated failure on {} frame {}",
                unit.stage, unit.index
            )));
        }
        let source = unit
            .inputs
            .first()
            .ok_or_else(|| BackendError::TaskFailed("unit has no inputs".into()))?;
        tokio::fs::copy(source, &unit.output)
            .await
            .map_err(|e| BackendError::TaskFailed(e.to_string()))?;
        self.processed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ProcessingBackend for FakeBackend {
    async fn process(
        &self,
        unit: &WorkUnit,
        progress: UnitProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), BackendError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = self.run(unit, cancel).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if result.is_ok() {
            progress(100);
        }
        result
    }
}
