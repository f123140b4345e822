//! Video transcoding collaborator.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use vr180_core::ffmpeg::{
    self, build_args, parse_progress_line, percent_of, FfmpegError, ProgressLine,
    TranscodeInput, TranscodeRequest,
};

use crate::backend::UnitProgress;
use crate::workspace::list_frames;

/// Keep this much of ffmpeg's stderr for error reports.
const STDERR_TAIL_BYTES: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error(transparent)]
    Ffmpeg(#[from] FfmpegError),

    #[error("transcode was cancelled")]
    Cancelled,
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Run `request` to completion, reporting `0..=100` through `progress`.
    ///
    /// Must stop the underlying work and return
    /// [`TranscodeError::Cancelled`] when `cancel` fires.
    async fn transcode(
        &self,
        request: &TranscodeRequest,
        progress: UnitProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), TranscodeError>;
}

/// What a run's progress is measured against.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Expected {
    Seconds(f64),
    Frames(u64),
    Unknown,
}

/// [`Transcoder`] backed by the `ffmpeg` and `ffprobe` binaries.
pub struct FfmpegTranscoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    async fn expected(&self, input: &TranscodeInput) -> Expected {
        match input {
            TranscodeInput::File(path) => match ffmpeg::probe_video(&self.ffprobe, path).await {
                Ok(probe) => match ffmpeg::parse_duration(&probe) {
                    secs if secs > 0.0 => Expected::Seconds(secs),
                    _ => Expected::Unknown,
                },
                Err(e) => {
                    tracing::debug!(
                        path = %path.display(),
                        error = %e,
                        "Probe failed, transcode progress will not be reported",
                    );
                    Expected::Unknown
                }
            },
            TranscodeInput::ImageSequence { pattern, .. } => {
                let dir = pattern.parent().unwrap_or(pattern);
                match list_frames(dir).await {
                    Ok(frames) if !frames.is_empty() => Expected::Frames(frames.len() as u64),
                    _ => Expected::Unknown,
                }
            }
        }
    }
}

fn tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

fn percent_for(line: ProgressLine, expected: Expected) -> Option<u8> {
    match (line, expected) {
        (ProgressLine::OutTime(us), Expected::Seconds(total)) => {
            Some(percent_of(us as f64 / 1_000_000.0, total))
        }
        (ProgressLine::Frame(frame), Expected::Frames(total)) => {
            Some(percent_of(frame as f64, total as f64))
        }
        _ => None,
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        request: &TranscodeRequest,
        progress: UnitProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), TranscodeError> {
        let expected = self.expected(&request.input).await;

        let mut child = Command::new(&self.ffmpeg)
            .args(build_args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(FfmpegError::NotFound)?;

        let (Some(stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(FfmpegError::ParseError("ffmpeg output pipes were not captured".into()).into());
        };

        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    stderr_task.abort();
                    return Err(TranscodeError::Cancelled);
                }
                line = lines.next_line() => match line.map_err(FfmpegError::IoError)? {
                    Some(line) => {
                        if let Some(p) = parse_progress_line(&line).and_then(|l| percent_for(l, expected)) {
                            progress(p);
                        }
                    }
                    None => break,
                },
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                stderr_task.abort();
                return Err(TranscodeError::Cancelled);
            }
            status = child.wait() => status.map_err(FfmpegError::IoError)?,
        };
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(FfmpegError::ExecutionFailed {
                exit_code: status.code(),
                stderr: tail(&stderr),
            }
            .into());
        }

        progress(100);
        Ok(())
    }
}
