//! The pure phase transition table.

use std::fmt;

use crate::errors::TransitionError;
use crate::state::Phase;

/// Why the machine wants to leave its current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Integration and wave branches exist
    BranchesReady,
    /// Every task of the wave passed and the change-set is up
    WavePublished,
    /// A task of the wave cannot pass
    TaskBlocked,
    /// The review system returned approved or changes-requested
    ReviewDecided,
    ReviewApproved,
    ChangesRequested,
    MergeSucceeded { more_waves: bool },
    /// Operator reset to a fresh attempt at the current wave
    Reset,
    /// Operator recovery of a damaged document
    Recover(Phase),
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Recover(phase) => write!(f, "Recover({})", phase),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Phases `recover` may force a document into.
pub const RECOVERABLE_PHASES: [Phase; 3] =
    [Phase::Execute, Phase::AwaitingReview, Phase::ReadyToMerge];

/// Look up the phase `trigger` leads to from `from`.
pub fn next_phase(from: Phase, trigger: Trigger) -> Result<Phase, TransitionError> {
    use Phase::*;

    let to = match (from, trigger) {
        (_, Trigger::Recover(target)) if RECOVERABLE_PHASES.contains(&target) => target,
        (Completed, _) => return Err(TransitionError::Terminal { phase: from }),
        (_, Trigger::Reset) => Execute,
        (Init, Trigger::BranchesReady) => Execute,
        (Execute, Trigger::WavePublished) => AwaitingReview,
        (Execute, Trigger::TaskBlocked) => Failed,
        (AwaitingReview, Trigger::ReviewDecided) => ReviewProcessing,
        (ReviewProcessing, Trigger::ReviewApproved) => ReadyToMerge,
        (ReviewProcessing, Trigger::ChangesRequested) => Execute,
        (ReadyToMerge, Trigger::MergeSucceeded { more_waves: true }) => Execute,
        (ReadyToMerge, Trigger::MergeSucceeded { more_waves: false }) => Completed,
        (Failed, _) => return Err(TransitionError::Terminal { phase: from }),
        _ => return Err(TransitionError::Invalid { from, trigger }),
    };

    Ok(to)
}
