//! On-disk layout of one job's intermediate artifacts.
//!
//! ```text
//! <jobs_dir>/<job_id>/
//!     frames/        extracted source frames
//!     depth/ stereo/ outpainting/ blur/ upscaling/
//!     output/vr180.mp4
//! ```
//!
//! Frame files are named `frame_000001.png` onwards, matching ffmpeg's
//! image2 numbering so a stage directory can be fed back to the encoder.

use std::io;
use std::path::{Path, PathBuf};

use vr180_core::job::StageName;
use vr180_core::types::JobId;

const FRAMES_DIR: &str = "frames";
const OUTPUT_DIR: &str = "output";
const OUTPUT_FILE: &str = "vr180.mp4";
const FRAME_PREFIX: &str = "frame_";
const FRAME_EXT: &str = "png";

#[derive(Debug, Clone)]
pub struct JobWorkspace {
    root: PathBuf,
}

impl JobWorkspace {
    pub fn new(jobs_dir: &Path, job_id: JobId) -> Self {
        Self {
            root: jobs_dir.join(job_id.to_string()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn frames_dir(&self) -> PathBuf {
        self.root.join(FRAMES_DIR)
    }

    pub fn stage_dir(&self, stage: StageName) -> PathBuf {
        self.root.join(stage.as_str())
    }

    pub fn output_path(&self) -> PathBuf {
        self.root.join(OUTPUT_DIR).join(OUTPUT_FILE)
    }

    /// Directories whose frames feed `stage`, primary input first.
    pub fn stage_inputs(&self, stage: StageName) -> Vec<PathBuf> {
        match stage {
            StageName::Depth => vec![self.frames_dir()],
            StageName::Stereo => vec![self.frames_dir(), self.stage_dir(StageName::Depth)],
            StageName::Outpainting => vec![self.stage_dir(StageName::Stereo)],
            StageName::Blur => vec![self.stage_dir(StageName::Outpainting)],
            StageName::Upscaling => vec![self.stage_dir(StageName::Blur)],
        }
    }

    /// Create every working directory. Safe to call repeatedly.
    pub async fn ensure(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(self.frames_dir()).await?;
        for stage in StageName::ALL {
            tokio::fs::create_dir_all(self.stage_dir(stage)).await?;
        }
        tokio::fs::create_dir_all(self.root.join(OUTPUT_DIR)).await
    }

    /// Delete the whole workspace. A missing directory is not an error.
    pub async fn remove(&self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Path of frame `index` (zero-based) inside `dir`.
pub fn frame_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("{FRAME_PREFIX}{:06}.{FRAME_EXT}", index + 1))
}

/// ffmpeg image2 pattern matching [`frame_path`].
pub fn frame_pattern(dir: &Path) -> PathBuf {
    dir.join(format!("{FRAME_PREFIX}%06d.{FRAME_EXT}"))
}

/// Frame files in `dir`, sorted by name. A missing directory has none.
pub async fn list_frames(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut frames = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_frame = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(FRAME_PREFIX))
            && path.extension().and_then(|e| e.to_str()) == Some(FRAME_EXT);
        if is_frame {
            frames.push(path);
        }
    }
    frames.sort();
    Ok(frames)
}
