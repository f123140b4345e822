use std::path::PathBuf;
use std::time::Duration;

use vr180_core::error::CoreError;
use vr180_core::job::{JobError, JobErrorCode, StageName};

/// Why a pipeline run stopped before producing an output.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("stage {stage} failed: {message}")]
    Stage { stage: StageName, message: String },

    #[error("run exceeded its wall-clock budget of {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("run was cancelled")]
    Cancelled,

    #[error("failed to prepare job workspace: {0}")]
    Workspace(#[source] std::io::Error),

    #[error(transparent)]
    Store(#[from] CoreError),
}

impl PipelineError {
    pub fn stage(stage: StageName, message: impl Into<String>) -> Self {
        PipelineError::Stage {
            stage,
            message: message.into(),
        }
    }

    pub fn code(&self) -> JobErrorCode {
        match self {
            PipelineError::Stage { .. } => JobErrorCode::StageError,
            PipelineError::Timeout(_) => JobErrorCode::Timeout,
            PipelineError::Cancelled => JobErrorCode::Cancelled,
            PipelineError::Workspace(_) | PipelineError::Store(_) => JobErrorCode::Internal,
        }
    }

    /// Convert into the error recorded on the failed job.
    ///
    /// `active` is the stage that was processing when the run stopped; a
    /// stage error names its own stage and ignores it.
    pub fn to_job_error(&self, active: Option<StageName>) -> JobError {
        let stage = match self {
            PipelineError::Stage { stage, .. } => Some(*stage),
            _ => active,
        };
        let error = JobError::new(self.code(), self.to_string());
        match stage {
            Some(stage) => error.with_stage(stage),
            None => error,
        }
    }
}

/// Failure reading or writing the job snapshot file.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("snapshot I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot at {} is not valid JSON: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}
