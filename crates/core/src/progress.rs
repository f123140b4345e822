//! Overall job progress from per-stage state.

use crate::job::{Stage, StageStatus, STAGE_COUNT};

/// Combine stage states into a single percentage.
///
/// Each of the five stages carries an equal fifth of the total. A completed
/// stage contributes its full share, a processing stage contributes its
/// share scaled by its own progress, and pending or errored stages
/// contribute nothing. The result is floored and clamped to `0..=100`.
///
/// Monotonicity across updates is the caller's concern: [`crate::job::Job`]
/// keeps the maximum of its previous and newly aggregated value.
pub fn aggregate(stages: &[Stage]) -> u8 {
    let points: u32 = stages
        .iter()
        .map(|stage| match stage.status {
            StageStatus::Completed => 100,
            StageStatus::Processing => u32::from(stage.progress.min(100)),
            StageStatus::Pending | StageStatus::Error => 0,
        })
        .sum();

    (points / STAGE_COUNT as u32).min(100) as u8
}
