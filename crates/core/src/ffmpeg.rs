//! FFmpeg/FFprobe command helpers.
//!
//! Probing, argument construction and `-progress` output parsing shared by
//! the frame-extraction and final-encode steps. Process supervision
//! (streaming stdout, cancellation) lives with the transcoder in the
//! pipeline crate.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Error type for FFmpeg/FFprobe operations.
#[derive(Debug, thiserror::Error)]
pub enum FfmpegError {
    #[error("ffprobe/ffmpeg binary not found: {0}")]
    NotFound(std::io::Error),

    #[error("ffprobe/ffmpeg execution failed (exit code {exit_code:?}): {stderr}")]
    ExecutionFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("failed to parse ffprobe output: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("video file not found: {0}")]
    VideoNotFound(String),
}

// ---------------------------------------------------------------------------
// ffprobe JSON output structures
// ---------------------------------------------------------------------------

/// Top-level ffprobe JSON output (`-print_format json -show_format -show_streams`).
#[derive(Debug, Deserialize)]
pub struct FfprobeOutput {
    pub streams: Vec<FfprobeStream>,
    pub format: FfprobeFormat,
}

/// A single stream from ffprobe output.
#[derive(Debug, Deserialize)]
pub struct FfprobeStream {
    pub codec_type: Option<String>,
    pub duration: Option<String>,
}

/// Format-level metadata from ffprobe.
#[derive(Debug, Deserialize)]
pub struct FfprobeFormat {
    pub duration: Option<String>,
}

/// Run `ffprobe` on a video file and return the parsed JSON output.
pub async fn probe_video(ffprobe: &Path, path: &Path) -> Result<FfprobeOutput, FfmpegError> {
    if !path.exists() {
        return Err(FfmpegError::VideoNotFound(
            path.to_string_lossy().to_string(),
        ));
    }

    let output = tokio::process::Command::new(ffprobe)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .output()
        .await
        .map_err(FfmpegError::NotFound)?;

    if !output.status.success() {
        return Err(FfmpegError::ExecutionFailed {
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str::<FfprobeOutput>(&stdout)
        .map_err(|e| FfmpegError::ParseError(format!("{e}: {stdout}")))
}

/// Find the first video stream in the ffprobe output.
fn first_video_stream(probe: &FfprobeOutput) -> Option<&FfprobeStream> {
    probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
}

/// Parse the video duration in seconds from ffprobe output.
pub fn parse_duration(probe: &FfprobeOutput) -> f64 {
    // Try format-level duration first.
    if let Some(secs) = probe.format.duration.as_deref().and_then(|d| d.parse::<f64>().ok()) {
        return secs;
    }
    first_video_stream(probe)
        .and_then(|s| s.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Command construction
// ---------------------------------------------------------------------------

/// Input side of an ffmpeg invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscodeInput {
    /// A regular media file.
    File(PathBuf),
    /// A numbered image sequence such as `frames/frame_%06d.png`.
    ImageSequence { pattern: PathBuf, frame_rate: f64 },
}

/// One ffmpeg run: input, output and the filters applied between them.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeRequest {
    pub input: TranscodeInput,
    pub output: PathBuf,
    /// Extra `-vf` filters, applied before scaling.
    pub filters: Vec<String>,
    /// Target output resolution.
    pub scale: Option<(u32, u32)>,
    /// Copy the audio track of this file into the output.
    pub audio_from: Option<PathBuf>,
    /// Video codec for the output; `None` lets ffmpeg pick from the extension.
    pub video_codec: Option<String>,
}

impl TranscodeRequest {
    pub fn new(input: TranscodeInput, output: impl Into<PathBuf>) -> Self {
        Self {
            input,
            output: output.into(),
            filters: Vec::new(),
            scale: None,
            audio_from: None,
            video_codec: None,
        }
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filters.push(filter.into());
        self
    }

    pub fn scale(mut self, width: u32, height: u32) -> Self {
        self.scale = Some((width, height));
        self
    }

    pub fn audio_from(mut self, source: impl Into<PathBuf>) -> Self {
        self.audio_from = Some(source.into());
        self
    }

    pub fn video_codec(mut self, codec: impl Into<String>) -> Self {
        self.video_codec = Some(codec.into());
        self
    }
}

/// Build the ffmpeg argument list for a request.
///
/// Progress is written as `key=value` lines to stdout (`-progress pipe:1`)
/// and the interactive stats line is suppressed.
pub fn build_args(req: &TranscodeRequest) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-y".into(), "-nostdin".into(), "-hide_banner".into()];

    match &req.input {
        TranscodeInput::File(path) => {
            args.push(OsString::from("-i"));
            args.push(path.as_os_str().to_owned());
        }
        TranscodeInput::ImageSequence {
            pattern,
            frame_rate,
        } => {
            args.push(OsString::from("-framerate"));
            args.push(OsString::from(format!("{frame_rate}")));
            args.push(OsString::from("-i"));
            args.push(pattern.as_os_str().to_owned());
        }
    }

    if let Some(audio) = &req.audio_from {
        args.push(OsString::from("-i"));
        args.push(audio.as_os_str().to_owned());
        for flag in ["-map", "0:v:0", "-map", "1:a?", "-c:a", "copy", "-shortest"] {
            args.push(OsString::from(flag));
        }
    }

    let mut filters = req.filters.clone();
    if let Some((w, h)) = req.scale {
        filters.push(format!("scale={w}:{h}"));
    }
    if !filters.is_empty() {
        args.push(OsString::from("-vf"));
        args.push(OsString::from(filters.join(",")));
    }

    if let Some(codec) = &req.video_codec {
        args.push(OsString::from("-c:v"));
        args.push(OsString::from(codec));
        args.push(OsString::from("-pix_fmt"));
        args.push(OsString::from("yuv420p"));
    }

    for flag in ["-progress", "pipe:1", "-nostats"] {
        args.push(OsString::from(flag));
    }
    args.push(req.output.as_os_str().to_owned());
    args
}

// ---------------------------------------------------------------------------
// -progress output
// ---------------------------------------------------------------------------

/// A meaningful line of ffmpeg `-progress` output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressLine {
    /// Output timestamp reached, in microseconds.
    OutTime(u64),
    /// Number of frames written so far.
    Frame(u64),
    /// `progress=end`, the final block.
    End,
}

/// Parse one `key=value` line of `-progress` output.
///
/// `out_time_ms` is in microseconds despite its name, same as `out_time_us`.
pub fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time_us" | "out_time_ms" => value.parse().ok().map(ProgressLine::OutTime),
        "frame" => value.parse().ok().map(ProgressLine::Frame),
        "progress" if value == "end" => Some(ProgressLine::End),
        _ => None,
    }
}

/// Fraction of `total` reached by `done`, as a whole percent in `0..=100`.
pub fn percent_of(done: f64, total: f64) -> u8 {
    if total <= 0.0 || !done.is_finite() {
        return 0;
    }
    ((done / total) * 100.0).clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(json: &str) -> FfprobeOutput {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn duration_prefers_format_then_stream() {
        let p = probe(r#"{"streams":[{"codec_type":"video","duration":"4.0"}],"format":{"duration":"5.5"}}"#);
        assert_eq!(parse_duration(&p), 5.5);

        let p = probe(r#"{"streams":[{"codec_type":"video","duration":"4.0"}],"format":{}}"#);
        assert_eq!(parse_duration(&p), 4.0);
    }

    #[test]
    fn missing_duration_is_zero() {
        let p = probe(r#"{"streams":[{"codec_type":"audio","duration":"3.0"}],"format":{"duration":"n/a"}}"#);
        assert_eq!(parse_duration(&p), 0.0);
    }

    #[test]
    fn progress_lines_are_recognised() {
        assert_eq!(parse_progress_line("out_time_ms=1500000"), Some(ProgressLine::OutTime(1_500_000)));
        assert_eq!(parse_progress_line("out_time_us=20"), Some(ProgressLine::OutTime(20)));
        assert_eq!(parse_progress_line("frame=17\n"), Some(ProgressLine::Frame(17)));
        assert_eq!(parse_progress_line("progress=end"), Some(ProgressLine::End));
        assert_eq!(parse_progress_line("progress=continue"), None);
        assert_eq!(parse_progress_line("out_time_ms=N/A"), None);
        assert_eq!(parse_progress_line("bitrate=1.0kbits/s"), None);
    }

    #[test]
    fn percent_is_clamped() {
        assert_eq!(percent_of(5.0, 10.0), 50);
        assert_eq!(percent_of(12.0, 10.0), 100);
        assert_eq!(percent_of(1.0, 0.0), 0);
    }

    #[test]
    fn extraction_args_include_filters_scale_and_progress() {
        let req = TranscodeRequest::new(
            TranscodeInput::File(PathBuf::from("in.mp4")),
            "frames/frame_%06d.png",
        )
        .filter("fps=30")
        .scale(1920, 1080);

        let args: Vec<String> = build_args(&req)
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let vf = args.iter().position(|a| a == "-vf").unwrap();
        assert_eq!(args[vf + 1], "fps=30,scale=1920:1080");
        assert!(args.windows(2).any(|w| w[0] == "-progress" && w[1] == "pipe:1"));
        assert_eq!(args.last().unwrap(), "frames/frame_%06d.png");
    }

    #[test]
    fn encode_args_map_audio_from_original() {
        let req = TranscodeRequest::new(
            TranscodeInput::ImageSequence {
                pattern: PathBuf::from("up/frame_%06d.png"),
                frame_rate: 30.0,
            },
            "out.mp4",
        )
        .audio_from("in.mp4")
        .video_codec("libx264");

        let args: Vec<String> = build_args(&req)
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(args[3..7], ["-framerate", "30", "-i", "up/frame_%06d.png"]);
        assert!(args.windows(2).any(|w| w[0] == "-map" && w[1] == "1:a?"));
        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "libx264"));
        assert!(!args.contains(&"-vf".to_string()));
    }
}
