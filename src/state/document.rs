//! The persisted state document of one pipeline instance.
//!
//! The document is the only shared mutable resource: every invocation of
//! the delivery machine reconstructs its working state from it, advances one
//! step and writes it back whole.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dag::Wave;

/// Current on-disk schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Phase of the delivery state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Init,
    Execute,
    AwaitingReview,
    ReviewProcessing,
    ReadyToMerge,
    Completed,
    Failed,
}

impl Phase {
    /// Check if the phase is terminal (no automatic progress possible).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Phases that only make sense once a change-set has been published.
    pub fn requires_change_set(&self) -> bool {
        matches!(
            self,
            Self::AwaitingReview | Self::ReviewProcessing | Self::ReadyToMerge
        )
    }

    /// Phases that operate on the current wave's branch.
    pub fn requires_wave_branch(&self) -> bool {
        matches!(
            self,
            Self::Execute | Self::AwaitingReview | Self::ReviewProcessing | Self::ReadyToMerge
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "INIT",
            Phase::Execute => "EXECUTE",
            Phase::AwaitingReview => "AWAITING_REVIEW",
            Phase::ReviewProcessing => "REVIEW_PROCESSING",
            Phase::ReadyToMerge => "READY_TO_MERGE",
            Phase::Completed => "COMPLETED",
            Phase::Failed => "FAILED",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().replace('-', "_").as_str() {
            "INIT" => Ok(Phase::Init),
            "EXECUTE" => Ok(Phase::Execute),
            "AWAITING_REVIEW" => Ok(Phase::AwaitingReview),
            "REVIEW_PROCESSING" => Ok(Phase::ReviewProcessing),
            "READY_TO_MERGE" => Ok(Phase::ReadyToMerge),
            "COMPLETED" => Ok(Phase::Completed),
            "FAILED" => Ok(Phase::Failed),
            _ => Err(format!(
                "Invalid phase '{}'. Valid values: init, execute, awaiting_review, \
                 review_processing, ready_to_merge, completed, failed",
                s
            )),
        }
    }
}

/// Decision reported by the external review system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReviewDecision {
    Pending,
    Approved,
    ChangesRequested,
}

impl fmt::Display for ReviewDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReviewDecision::Pending => write!(f, "pending"),
            ReviewDecision::Approved => write!(f, "approved"),
            ReviewDecision::ChangesRequested => write!(f, "changesRequested"),
        }
    }
}

/// Review polling sub-state of the current wave.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewStatus {
    pub poll_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ReviewDecision>,
    pub blocking_count: u32,
    /// When the wave branch was last pushed for review; verdicts submitted
    /// before this describe older code and are ignored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviews_since: Option<DateTime<Utc>>,
}

/// Review feedback the current wave must address before republishing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewFix {
    /// Review cycle that produced the feedback (1-based)
    pub cycle: u32,
    pub blocking_count: u32,
    pub resolved: bool,
}

/// Execution sub-state of the current wave.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_fix: Option<ReviewFix>,
}

impl ExecutionState {
    /// Check if there is review feedback still waiting to be addressed.
    pub fn has_outstanding_fix(&self) -> bool {
        self.review_fix.as_ref().is_some_and(|f| !f.resolved)
    }
}

/// One merged wave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub wave: u32,
    pub pull_request_ref: String,
    pub merged_at: DateTime<Utc>,
    pub review_cycles: u32,
}

/// The state document of one pipeline instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub schema_version: u32,
    pub pipeline_id: String,
    pub instance_id: Uuid,
    /// Normalized spec identifier used in branch names
    pub spec_id: String,
    pub current_wave: u32,
    pub total_waves: u32,
    pub phase: Phase,
    /// Phase the pipeline was in when it failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_from: Option<Phase>,
    #[serde(default)]
    pub integration_branch: Option<String>,
    #[serde(default)]
    pub wave_branch: Option<String>,
    #[serde(default)]
    pub pull_request_ref: Option<String>,
    #[serde(default)]
    pub review_status: ReviewStatus,
    #[serde(default)]
    pub execution: ExecutionState,
    /// Review cycles spent on the current wave
    #[serde(default)]
    pub review_cycles: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// The immutable wave plan
    pub waves: Vec<Wave>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineState {
    /// Create a fresh document in INIT for the given plan.
    pub fn new(pipeline_id: &str, spec_id: &str, waves: Vec<Wave>) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            pipeline_id: pipeline_id.to_string(),
            instance_id: Uuid::new_v4(),
            spec_id: spec_id.to_string(),
            current_wave: 1,
            total_waves: waves.len() as u32,
            phase: Phase::Init,
            failed_from: None,
            integration_branch: None,
            wave_branch: None,
            pull_request_ref: None,
            review_status: ReviewStatus::default(),
            execution: ExecutionState::default(),
            review_cycles: 0,
            last_error: None,
            history: Vec::new(),
            waves,
            created_at: now,
            updated_at: now,
        }
    }

    /// The plan entry for the wave in progress, if any.
    pub fn current_wave_plan(&self) -> Option<&Wave> {
        self.waves.iter().find(|w| w.number == self.current_wave)
    }

    pub fn has_more_waves(&self) -> bool {
        self.current_wave < self.total_waves
    }

    /// Clear review and execution sub-state for a fresh attempt at a wave.
    pub fn reset_sub_state(&mut self) {
        self.review_status = ReviewStatus::default();
        self.execution = ExecutionState::default();
        self.review_cycles = 0;
        self.last_error = None;
        self.failed_from = None;
    }

    /// Check every document invariant; returns all violations found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut violations = Vec::new();

        if self.schema_version != SCHEMA_VERSION {
            violations.push(format!(
                "schema_version {} is not supported (expected {})",
                self.schema_version, SCHEMA_VERSION
            ));
        }
        if self.pipeline_id.trim().is_empty() {
            violations.push("pipeline_id is empty".to_string());
        }
        if self.total_waves == 0 {
            violations.push("total_waves must be at least 1".to_string());
        }
        if self.total_waves as usize != self.waves.len() {
            violations.push(format!(
                "total_waves is {} but the plan has {} waves",
                self.total_waves,
                self.waves.len()
            ));
        }
        for (i, wave) in self.waves.iter().enumerate() {
            if wave.number as usize != i + 1 {
                violations.push(format!(
                    "wave at position {} is numbered {}",
                    i + 1,
                    wave.number
                ));
            }
            if wave.tasks.is_empty() {
                violations.push(format!("wave {} has no tasks", wave.number));
            }
        }

        if self.current_wave < 1 || self.current_wave > self.total_waves + 1 {
            violations.push(format!(
                "current_wave {} is outside 1..={}",
                self.current_wave,
                self.total_waves + 1
            ));
        }
        let past_last = self.current_wave == self.total_waves + 1;
        let completed = self.phase == Phase::Completed;
        if past_last != completed {
            violations.push(format!(
                "current_wave {} of {} is inconsistent with phase {}",
                self.current_wave, self.total_waves, self.phase
            ));
        }

        if self.phase != Phase::Init && self.integration_branch.is_none() {
            violations.push(format!("phase {} requires an integration branch", self.phase));
        }
        if self.phase.requires_wave_branch() && self.wave_branch.is_none() {
            violations.push(format!("phase {} requires a wave branch", self.phase));
        }
        if self.phase.requires_change_set() && self.pull_request_ref.is_none() {
            violations.push(format!("phase {} requires a pull request ref", self.phase));
        }
        if self.phase == Phase::Failed && self.last_error.is_none() {
            violations.push("phase FAILED requires last_error".to_string());
        }

        let mut previous = 0;
        for entry in &self.history {
            if entry.wave <= previous {
                violations.push(format!("history entry for wave {} is out of order", entry.wave));
            }
            if entry.wave >= self.current_wave {
                violations.push(format!(
                    "history entry for wave {} is not before current wave {}",
                    entry.wave, self.current_wave
                ));
            }
            previous = entry.wave;
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}
