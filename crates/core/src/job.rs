//! Job and stage records plus the forward-only state machine over them.
//!
//! A [`Job`] owns exactly five [`Stage`]s in the fixed order given by
//! [`StageName::ALL`]. Every mutation goes through a transition method that
//! rejects illegal moves with [`CoreError::Conflict`] instead of silently
//! applying them, so a misbehaving caller cannot walk a job backwards or out
//! of a terminal state.

use std::fmt;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::progress;
use crate::types::{JobId, Timestamp};

/// Number of pipeline stages every job carries.
pub const STAGE_COUNT: usize = 5;

/// Overall progress is held below this value until the job completes.
const MAX_PROGRESS_BEFORE_COMPLETION: u8 = 99;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// The five fixed processing phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Depth,
    Stereo,
    Outpainting,
    Blur,
    Upscaling,
}

impl StageName {
    /// Declared execution order.
    pub const ALL: [StageName; STAGE_COUNT] = [
        StageName::Depth,
        StageName::Stereo,
        StageName::Outpainting,
        StageName::Blur,
        StageName::Upscaling,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageName::Depth => "depth",
            StageName::Stereo => "stereo",
            StageName::Outpainting => "outpainting",
            StageName::Blur => "blur",
            StageName::Upscaling => "upscaling",
        }
    }

    /// Position of this stage in [`StageName::ALL`].
    pub fn index(self) -> usize {
        match self {
            StageName::Depth => 0,
            StageName::Stereo => 1,
            StageName::Outpainting => 2,
            StageName::Blur => 3,
            StageName::Upscaling => 4,
        }
    }

    /// The stage that must complete before this one may start.
    pub fn predecessor(self) -> Option<StageName> {
        match self.index() {
            0 => None,
            i => Some(StageName::ALL[i - 1]),
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job ended up `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobErrorCode {
    /// A stage's underlying operation failed irrecoverably.
    StageError,
    /// The run exceeded its wall-clock budget.
    Timeout,
    /// A client or shutdown cancelled the run.
    Cancelled,
    /// Orchestrator bookkeeping failed (workspace setup, store access).
    Internal,
    /// The process restarted while the job was in flight.
    Interrupted,
}

/// Error recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobError {
    pub code: JobErrorCode,
    pub message: String,
    /// Stage that was running when the failure happened, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageName>,
}

impl JobError {
    pub fn new(code: JobErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            stage: None,
        }
    }

    pub fn with_stage(mut self, stage: StageName) -> Self {
        self.stage = Some(stage);
        self
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: StageName,
    pub status: StageStatus,
    /// Percent complete, always within `0..=100`.
    pub progress: u8,
}

impl Stage {
    fn pending(name: StageName) -> Self {
        Self {
            name,
            status: StageStatus::Pending,
            progress: 0,
        }
    }
}

/// One upload-to-output processing run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub stages: [Stage; STAGE_COUNT],
    /// Overall progress, see [`progress::aggregate`].
    pub progress: u8,
    /// Stored upload.
    pub input: PathBuf,
    /// Rendered output; present only once the job is completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    pub original_filename: String,
    pub input_size_bytes: u64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl Job {
    /// Create a freshly queued job with all five stages pending.
    pub fn new(
        id: JobId,
        input: PathBuf,
        original_filename: impl Into<String>,
        input_size_bytes: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Queued,
            stages: StageName::ALL.map(Stage::pending),
            progress: 0,
            input,
            output: None,
            original_filename: original_filename.into(),
            input_size_bytes,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn stage(&self, name: StageName) -> &Stage {
        &self.stages[name.index()]
    }

    /// The stage currently running, if any.
    pub fn active_stage(&self) -> Option<StageName> {
        self.stages
            .iter()
            .find(|s| s.status == StageStatus::Processing)
            .map(|s| s.name)
    }

    /// `queued -> processing`.
    pub fn start(&mut self) -> Result<(), CoreError> {
        if self.status != JobStatus::Queued {
            return Err(self.illegal(format!("cannot start a {} job", self.status)));
        }
        let now = Utc::now();
        self.status = JobStatus::Processing;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Move `stage` from pending to processing.
    ///
    /// Requires the job to be processing and the preceding stage (if any)
    /// to be completed.
    pub fn begin_stage(&mut self, stage: StageName) -> Result<(), CoreError> {
        self.require_processing()?;
        if let Some(prev) = stage.predecessor() {
            if self.stage(prev).status != StageStatus::Completed {
                return Err(self.illegal(format!(
                    "stage {stage} cannot start before {prev} has completed"
                )));
            }
        }
        let slot = &mut self.stages[stage.index()];
        if slot.status != StageStatus::Pending {
            return Err(CoreError::Conflict(format!(
                "stage {stage} of job {} is not pending",
                self.id
            )));
        }
        slot.status = StageStatus::Processing;
        self.touch();
        Ok(())
    }

    /// Raise a processing stage's progress.
    ///
    /// Values are clamped to 100 and never lower the stored value. Returns
    /// whether anything changed.
    pub fn record_stage_progress(
        &mut self,
        stage: StageName,
        progress: u8,
    ) -> Result<bool, CoreError> {
        self.require_processing()?;
        let slot = &mut self.stages[stage.index()];
        if slot.status != StageStatus::Processing {
            return Err(CoreError::Conflict(format!(
                "stage {stage} of job {} is not processing",
                self.id
            )));
        }
        let progress = progress.min(100);
        if progress <= slot.progress {
            return Ok(false);
        }
        slot.progress = progress;
        self.refresh_progress();
        self.touch();
        Ok(true)
    }

    /// Mark a processing stage completed.
    pub fn complete_stage(&mut self, stage: StageName) -> Result<(), CoreError> {
        self.require_processing()?;
        let slot = &mut self.stages[stage.index()];
        if slot.status != StageStatus::Processing {
            return Err(CoreError::Conflict(format!(
                "stage {stage} of job {} is not processing",
                self.id
            )));
        }
        slot.status = StageStatus::Completed;
        slot.progress = 100;
        self.refresh_progress();
        self.touch();
        Ok(())
    }

    /// `processing -> completed`. Every stage must already be completed.
    pub fn complete(&mut self, output: PathBuf) -> Result<(), CoreError> {
        self.require_processing()?;
        if let Some(open) = self
            .stages
            .iter()
            .find(|s| s.status != StageStatus::Completed)
        {
            return Err(self.illegal(format!(
                "cannot complete job while stage {} is {:?}",
                open.name, open.status
            )));
        }
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.output = Some(output);
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// `queued | processing -> failed`.
    ///
    /// A stage that was mid-flight is flagged `error`; later stages stay
    /// pending and earlier completed stages keep their weight.
    pub fn fail(&mut self, error: JobError) -> Result<(), CoreError> {
        if self.status.is_terminal() {
            return Err(self.illegal(format!("cannot fail a {} job", self.status)));
        }
        for stage in self.stages.iter_mut() {
            if stage.status == StageStatus::Processing {
                stage.status = StageStatus::Error;
            }
        }
        let now = Utc::now();
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    fn require_processing(&self) -> Result<(), CoreError> {
        if self.status != JobStatus::Processing {
            return Err(self.illegal(format!("job is {}, not processing", self.status)));
        }
        Ok(())
    }

    fn illegal(&self, detail: String) -> CoreError {
        CoreError::Conflict(format!("job {}: {detail}", self.id))
    }

    fn refresh_progress(&mut self) {
        let aggregated = progress::aggregate(&self.stages).min(MAX_PROGRESS_BEFORE_COMPLETION);
        self.progress = self.progress.max(aggregated);
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use uuid::Uuid;

    use super::*;

    fn queued() -> Job {
        Job::new(Uuid::new_v4(), PathBuf::from("in.mp4"), "in.mp4", 1024)
    }

    fn processing() -> Job {
        let mut job = queued();
        job.start().unwrap();
        job
    }

    #[test]
    fn new_job_has_five_pending_stages_in_order() {
        let job = queued();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress, 0);
        let names: Vec<_> = job.stages.iter().map(|s| s.name).collect();
        assert_eq!(names, StageName::ALL.to_vec());
        assert!(job.stages.iter().all(|s| s.status == StageStatus::Pending));
    }

    #[test]
    fn stage_cannot_start_before_predecessor_completes() {
        let mut job = processing();
        assert_matches!(job.begin_stage(StageName::Stereo), Err(CoreError::Conflict(_)));

        job.begin_stage(StageName::Depth).unwrap();
        assert_matches!(job.begin_stage(StageName::Stereo), Err(CoreError::Conflict(_)));

        job.complete_stage(StageName::Depth).unwrap();
        job.begin_stage(StageName::Stereo).unwrap();
        assert_eq!(job.active_stage(), Some(StageName::Stereo));
    }

    #[test]
    fn stage_progress_is_clamped_and_monotonic() {
        let mut job = processing();
        job.begin_stage(StageName::Depth).unwrap();

        assert!(job.record_stage_progress(StageName::Depth, 40).unwrap());
        assert!(!job.record_stage_progress(StageName::Depth, 30).unwrap());
        assert_eq!(job.stage(StageName::Depth).progress, 40);

        job.record_stage_progress(StageName::Depth, 250).unwrap();
        assert_eq!(job.stage(StageName::Depth).progress, 100);
    }

    #[test]
    fn progress_on_pending_stage_is_rejected() {
        let mut job = processing();
        assert_matches!(
            job.record_stage_progress(StageName::Blur, 10),
            Err(CoreError::Conflict(_))
        );
    }

    #[test]
    fn overall_progress_stays_below_100_until_completed() {
        let mut job = processing();
        for stage in StageName::ALL {
            job.begin_stage(stage).unwrap();
            job.record_stage_progress(stage, 100).unwrap();
            job.complete_stage(stage).unwrap();
        }
        assert_eq!(job.progress, 99);
        assert_eq!(job.status, JobStatus::Processing);

        job.complete(PathBuf::from("out.mp4")).unwrap();
        assert_eq!(job.progress, 100);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.output.as_deref(), Some(std::path::Path::new("out.mp4")));
    }

    #[test]
    fn complete_requires_every_stage_completed() {
        let mut job = processing();
        job.begin_stage(StageName::Depth).unwrap();
        job.complete_stage(StageName::Depth).unwrap();
        assert_matches!(job.complete(PathBuf::from("out.mp4")), Err(CoreError::Conflict(_)));
        assert!(job.output.is_none());
    }

    #[test]
    fn fail_marks_running_stage_and_leaves_rest_pending() {
        let mut job = processing();
        job.begin_stage(StageName::Depth).unwrap();
        job.complete_stage(StageName::Depth).unwrap();
        job.begin_stage(StageName::Stereo).unwrap();
        job.record_stage_progress(StageName::Stereo, 50).unwrap();
        let before = job.progress;

        job.fail(JobError::new(JobErrorCode::StageError, "backend down").with_stage(StageName::Stereo))
            .unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.stage(StageName::Depth).status, StageStatus::Completed);
        assert_eq!(job.stage(StageName::Stereo).status, StageStatus::Error);
        for stage in &job.stages[2..] {
            assert_eq!(stage.status, StageStatus::Pending);
        }
        assert_eq!(job.progress, before);
        assert_eq!(job.error.as_ref().unwrap().code, JobErrorCode::StageError);
    }

    #[test]
    fn terminal_jobs_reject_further_transitions() {
        let mut job = processing();
        job.fail(JobError::new(JobErrorCode::Timeout, "too slow")).unwrap();

        assert_matches!(job.start(), Err(CoreError::Conflict(_)));
        assert_matches!(job.begin_stage(StageName::Depth), Err(CoreError::Conflict(_)));
        assert_matches!(
            job.fail(JobError::new(JobErrorCode::Cancelled, "again")),
            Err(CoreError::Conflict(_))
        );
        assert_eq!(job.error.as_ref().unwrap().code, JobErrorCode::Timeout);
    }

    #[test]
    fn queued_job_can_fail_without_starting() {
        let mut job = queued();
        job.fail(JobError::new(JobErrorCode::Cancelled, "cancelled"))
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.started_at.is_none());
    }

    #[test]
    fn serializes_with_camel_case_and_lowercase_enums() {
        let mut job = processing();
        job.fail(JobError::new(JobErrorCode::Timeout, "budget exceeded"))
            .unwrap();
        let json = serde_json::to_value(&job).unwrap();

        assert_eq!(json["status"], "failed");
        assert_eq!(json["stages"][0]["name"], "depth");
        assert_eq!(json["stages"][0]["status"], "pending");
        assert_eq!(json["error"]["code"], "TIMEOUT");
        assert!(json["createdAt"].is_string());
        assert!(json.get("output").is_none());
    }
}
