//! Runs one stage of a job.
//!
//! Every stage follows a fixed plan of steps. Frame steps hand one
//! [`WorkUnit`] per frame to the processing backend, in batches of
//! `batch_size` with at most `batch_concurrency` units in flight. Transcode
//! steps (frame extraction, final encode) run through the [`Transcoder`].
//!
//! Each step declares a [`FailurePolicy`]. A best-effort frame step logs a
//! failing unit and copies its primary input to the unit's output, so the
//! next stage still sees a contiguous frame sequence. It still fails the
//! stage once every unit has failed or the skipped share exceeds
//! `max_skipped_frame_ratio`. A load-bearing step fails the stage on the
//! first error.

use std::path::Path;
use std::sync::Arc;

use futures::{stream, StreamExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use vr180_core::ffmpeg::{TranscodeInput, TranscodeRequest};
use vr180_core::job::StageName;
use vr180_core::types::JobId;

use crate::backend::{BackendError, ProcessingBackend, WorkUnit};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::reporter::{ProgressReporter, ProgressSpan};
use crate::store::JobStore;
use crate::transcoder::{TranscodeError, Transcoder};
use crate::workspace::{frame_path, frame_pattern, list_frames, JobWorkspace};

/// What happens when part of a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log and skip the failing unit; the stage carries on.
    BestEffort,
    /// Abort the stage and fail the job.
    LoadBearing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Decode the uploaded video into numbered frames.
    ExtractFrames,
    /// Send every frame of the stage's input through the backend.
    ProcessFrames,
    /// Encode the last stage's frames into the output video.
    EncodeOutput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedStep {
    pub kind: StepKind,
    pub policy: FailurePolicy,
    /// Share of the stage's progress, in percent. A plan's weights sum to 100.
    pub weight: u8,
}

const DEPTH_PLAN: &[PlannedStep] = &[
    PlannedStep {
        kind: StepKind::ExtractFrames,
        policy: FailurePolicy::LoadBearing,
        weight: 30,
    },
    PlannedStep {
        kind: StepKind::ProcessFrames,
        policy: FailurePolicy::BestEffort,
        weight: 70,
    },
];

const FRAMES_PLAN: &[PlannedStep] = &[PlannedStep {
    kind: StepKind::ProcessFrames,
    policy: FailurePolicy::BestEffort,
    weight: 100,
}];

const UPSCALING_PLAN: &[PlannedStep] = &[
    PlannedStep {
        kind: StepKind::ProcessFrames,
        policy: FailurePolicy::BestEffort,
        weight: 70,
    },
    PlannedStep {
        kind: StepKind::EncodeOutput,
        policy: FailurePolicy::LoadBearing,
        weight: 30,
    },
];

/// The steps `stage` runs, in order.
pub fn stage_plan(stage: StageName) -> &'static [PlannedStep] {
    match stage {
        StageName::Depth => DEPTH_PLAN,
        StageName::Stereo | StageName::Outpainting | StageName::Blur => FRAMES_PLAN,
        StageName::Upscaling => UPSCALING_PLAN,
    }
}

/// Everything a stage needs to know about the job it runs for.
pub struct StageContext<'a> {
    pub job_id: JobId,
    /// The stored upload.
    pub input: &'a Path,
    pub workspace: &'a JobWorkspace,
    pub cancel: &'a CancellationToken,
}

/// Unit counts for one stage execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageSummary {
    pub processed: usize,
    pub skipped: usize,
}

pub struct StageExecutor {
    store: JobStore,
    backend: Arc<dyn ProcessingBackend>,
    transcoder: Arc<dyn Transcoder>,
    config: PipelineConfig,
}

impl StageExecutor {
    pub fn new(
        store: JobStore,
        backend: Arc<dyn ProcessingBackend>,
        transcoder: Arc<dyn Transcoder>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            backend,
            transcoder,
            config,
        }
    }

    /// Run every step of `stage`'s plan and leave its progress at 100.
    ///
    /// The stage must already be processing in the store; completing it is
    /// the caller's job.
    pub async fn execute(
        &self,
        stage: StageName,
        ctx: &StageContext<'_>,
    ) -> Result<StageSummary, PipelineError> {
        let mut reporter = ProgressReporter::new(
            self.store.clone(),
            ctx.job_id,
            stage,
            self.config.progress_write_interval,
        );
        let mut summary = StageSummary::default();
        let mut start = 0u8;

        for step in stage_plan(stage) {
            if ctx.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let span = ProgressSpan {
                start,
                width: step.weight,
            };

            match step.kind {
                StepKind::ExtractFrames => self.extract_frames(stage, ctx, &mut reporter, span).await,
                StepKind::ProcessFrames => {
                    self.process_frames(stage, step.policy, ctx, &mut reporter, span, &mut summary)
                        .await
                }
                StepKind::EncodeOutput => self.encode_output(stage, ctx, &mut reporter, span).await,
            }?;

            start = span.end();
            reporter.report(start).await?;
        }

        reporter.flush().await?;
        Ok(summary)
    }

    async fn extract_frames(
        &self,
        stage: StageName,
        ctx: &StageContext<'_>,
        reporter: &mut ProgressReporter,
        span: ProgressSpan,
    ) -> Result<(), PipelineError> {
        let frames_dir = ctx.workspace.frames_dir();
        let request = TranscodeRequest::new(
            TranscodeInput::File(ctx.input.to_path_buf()),
            frame_pattern(&frames_dir),
        )
        .filter(format!("fps={}", self.config.extract_fps));

        self.transcode(stage, &request, ctx, reporter, span).await?;

        let frames = list_frames(&frames_dir)
            .await
            .map_err(|e| PipelineError::stage(stage, format!("cannot list extracted frames: {e}")))?;
        if frames.is_empty() {
            return Err(PipelineError::stage(stage, "frame extraction produced no frames"));
        }
        tracing::info!(job_id = %ctx.job_id, frames = frames.len(), "Frames extracted");
        Ok(())
    }

    async fn encode_output(
        &self,
        stage: StageName,
        ctx: &StageContext<'_>,
        reporter: &mut ProgressReporter,
        span: ProgressSpan,
    ) -> Result<(), PipelineError> {
        let source = ctx.workspace.stage_dir(stage);
        let frames = list_frames(&source)
            .await
            .map_err(|e| PipelineError::stage(stage, format!("cannot list frames to encode: {e}")))?;
        if frames.is_empty() {
            return Err(PipelineError::stage(stage, "no frames to encode"));
        }

        let output = ctx.workspace.output_path();
        let request = TranscodeRequest::new(
            TranscodeInput::ImageSequence {
                pattern: frame_pattern(&source),
                frame_rate: self.config.extract_fps,
            },
            &output,
        )
        .scale(self.config.output_width, self.config.output_height)
        .audio_from(ctx.input)
        .video_codec(self.config.output_codec.clone());

        self.transcode(stage, &request, ctx, reporter, span).await?;

        if !tokio::fs::try_exists(&output).await.unwrap_or(false) {
            return Err(PipelineError::stage(stage, "encoder produced no output file"));
        }
        Ok(())
    }

    /// Run one transcoder call, forwarding its progress into `span`.
    async fn transcode(
        &self,
        stage: StageName,
        request: &TranscodeRequest,
        ctx: &StageContext<'_>,
        reporter: &mut ProgressReporter,
        span: ProgressSpan,
    ) -> Result<(), PipelineError> {
        let (tx, mut rx) = watch::channel(0u8);
        let on_progress = move |p: u8| {
            tx.send_if_modified(|current| {
                if p > *current {
                    *current = p;
                    true
                } else {
                    false
                }
            });
        };

        let work = self.transcoder.transcode(request, &on_progress, ctx.cancel);
        tokio::pin!(work);

        let result = loop {
            tokio::select! {
                result = &mut work => break result,
                Ok(()) = rx.changed() => {
                    let local = *rx.borrow_and_update();
                    reporter.report(span.map(local)).await?;
                }
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(TranscodeError::Cancelled) => Err(PipelineError::Cancelled),
            Err(e) => Err(PipelineError::stage(stage, e.to_string())),
        }
    }

    async fn process_frames(
        &self,
        stage: StageName,
        policy: FailurePolicy,
        ctx: &StageContext<'_>,
        reporter: &mut ProgressReporter,
        span: ProgressSpan,
        summary: &mut StageSummary,
    ) -> Result<(), PipelineError> {
        let input_dirs = ctx.workspace.stage_inputs(stage);
        let frame_count = list_frames(&input_dirs[0])
            .await
            .map_err(|e| PipelineError::stage(stage, format!("cannot list input frames: {e}")))?
            .len();
        if frame_count == 0 {
            return Err(PipelineError::stage(stage, "no input frames"));
        }

        let output_dir = ctx.workspace.stage_dir(stage);
        let units: Vec<WorkUnit> = (0..frame_count)
            .map(|index| WorkUnit {
                job_id: ctx.job_id,
                stage,
                index,
                inputs: input_dirs.iter().map(|dir| frame_path(dir, index)).collect(),
                output: frame_path(&output_dir, index),
            })
            .collect();

        let batch_size = self.config.batch_size.max(1);
        let width = self.config.batch_concurrency.max(1);
        let total_batches = units.len().div_ceil(batch_size);
        let max_skipped = skip_allowance(frame_count, self.config.max_skipped_frame_ratio);
        let mut skipped = 0usize;

        for (batch_index, batch) in units.chunks(batch_size).enumerate() {
            if ctx.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let mut pending = Vec::with_capacity(batch.len());
            for unit in batch {
                pending.push(async move { (unit, self.process_unit(unit, ctx.cancel).await) });
            }
            let outcomes: Vec<(&WorkUnit, Result<(), BackendError>)> = stream::iter(pending)
                .buffer_unordered(width)
                .collect()
                .await;

            for (unit, outcome) in outcomes {
                match outcome {
                    Ok(()) => summary.processed += 1,
                    Err(BackendError::Cancelled) => return Err(PipelineError::Cancelled),
                    Err(e) if policy == FailurePolicy::LoadBearing => {
                        return Err(PipelineError::stage(
                            stage,
                            format!("frame {} failed: {e}", unit.index),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(
                            job_id = %ctx.job_id,
                            stage = %stage,
                            frame = unit.index,
                            error = %e,
                            "Frame failed, carrying input forward",
                        );
                        skipped += 1;
                        if skipped > max_skipped {
                            return Err(PipelineError::stage(
                                stage,
                                format!(
                                    "{skipped} of {frame_count} frames failed, last on frame {}: {e}",
                                    unit.index
                                ),
                            ));
                        }
                        carry_forward(unit).await?;
                        summary.skipped += 1;
                    }
                }
            }

            let local = ((batch_index + 1) * 100 / total_batches) as u8;
            reporter.report(span.map(local)).await?;
            tracing::debug!(
                job_id = %ctx.job_id,
                stage = %stage,
                batch = batch_index + 1,
                batches = total_batches,
                "Batch finished",
            );
        }

        Ok(())
    }

    async fn process_unit(
        &self,
        unit: &WorkUnit,
        cancel: &CancellationToken,
    ) -> Result<(), BackendError> {
        let on_progress = |p: u8| {
            tracing::trace!(stage = %unit.stage, frame = unit.index, progress = p, "Unit progress");
        };
        // The backend observes `cancel` itself so it can release remote work.
        self.backend.process(unit, &on_progress, cancel).await
    }
}

/// Frames a best-effort step may skip out of `frame_count`.
///
/// Never the whole step: a step where every unit failed produced nothing.
fn skip_allowance(frame_count: usize, ratio: f64) -> usize {
    let ratio = if ratio.is_finite() { ratio.clamp(0.0, 1.0) } else { 0.0 };
    let allowed = (frame_count as f64 * ratio).floor() as usize;
    allowed.min(frame_count.saturating_sub(1))
}

/// Stand in for a failed unit's output with its primary input.
async fn carry_forward(unit: &WorkUnit) -> Result<(), PipelineError> {
    let Some(source) = unit.inputs.first() else {
        return Ok(());
    };
    tokio::fs::copy(source, &unit.output)
        .await
        .map_err(PipelineError::Workspace)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_weights_sum_to_100() {
        for stage in StageName::ALL {
            let total: u32 = stage_plan(stage).iter().map(|s| u32::from(s.weight)).sum();
            assert_eq!(total, 100, "{stage}");
        }
    }

    #[test]
    fn transcode_steps_are_load_bearing_and_frame_steps_best_effort() {
        for stage in StageName::ALL {
            for step in stage_plan(stage) {
                let expected = match step.kind {
                    StepKind::ExtractFrames | StepKind::EncodeOutput => FailurePolicy::LoadBearing,
                    StepKind::ProcessFrames => FailurePolicy::BestEffort,
                };
                assert_eq!(step.policy, expected, "{stage} {:?}", step.kind);
            }
        }
    }

    #[test]
    fn skip_allowance_never_covers_every_frame() {
        assert_eq!(skip_allowance(6, 0.5), 3);
        assert_eq!(skip_allowance(6, 1.0), 5);
        assert_eq!(skip_allowance(1, 1.0), 0);
        assert_eq!(skip_allowance(10, 0.0), 0);
        assert_eq!(skip_allowance(10, f64::NAN), 0);
        assert_eq!(skip_allowance(3, 0.5), 1);
    }

    #[test]
    fn extraction_opens_the_first_stage_and_encode_closes_the_last() {
        assert_eq!(stage_plan(StageName::Depth)[0].kind, StepKind::ExtractFrames);
        assert_eq!(
            stage_plan(StageName::Upscaling).last().map(|s| s.kind),
            Some(StepKind::EncodeOutput)
        );
        assert_eq!(stage_plan(StageName::Blur).len(), 1);
    }
}
