//! Typed error hierarchy for the waveforge orchestrator.
//!
//! One enum per subsystem, plus an umbrella:
//! - `PlanError`: task graph loading and wave partitioning
//! - `LedgerError`: artifact ledger writes and queries
//! - `StoreError`: state document persistence and locking
//! - `TransitionError`: rejected state machine transitions
//! - `BranchError`: branch coordination refusals
//! - `ServiceError`: version control, review and publishing services
//! - `PipelineError`: everything the delivery machine can surface

use std::path::PathBuf;

use thiserror::Error;

use crate::machine::Trigger;
use crate::state::Phase;

/// Errors raised while building the task graph or partitioning it into waves.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Task graph is empty: a pipeline needs at least one task")]
    Empty,

    #[error("Duplicate task id: {id}")]
    DuplicateTask { id: String },

    #[error("Unknown dependency '{dependency}' in task '{task}': no task with that id exists")]
    UnknownDependency { task: String, dependency: String },

    #[error("Cycle detected in task dependencies. Involved tasks: {tasks:?}")]
    Cycle { tasks: Vec<String> },

    #[error("Failed to read task file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse task file at {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Errors from the artifact ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Task {task} does not exist in the task graph")]
    UnknownTask { task: String },

    #[error("Task {task} has status {status}; artifacts are recorded only for passed tasks")]
    NotPassed { task: String, status: String },

    #[error("Task {task} already has a different artifact record; overwriting would lose provenance")]
    DuplicateArtifact { task: String },

    #[error("No artifacts recorded for task {task}")]
    NotFound { task: String },
}

/// Errors from the state document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("No state document for pipeline '{pipeline}'")]
    NotFound { pipeline: String },

    #[error("Pipeline '{pipeline}' is locked by another invocation")]
    Locked { pipeline: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State document at {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("State document for pipeline '{pipeline}' violates invariants: {}", .violations.join("; "))]
    Invalid {
        pipeline: String,
        violations: Vec<String>,
    },

    #[error("Failed to serialize document: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// A transition request the state machine refuses.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("Invalid transition: {trigger:?} is not allowed from {from}")]
    Invalid { from: Phase, trigger: Trigger },

    #[error("Pipeline is in terminal phase {phase}")]
    Terminal { phase: Phase },
}

/// Errors from the branch coordinator.
#[derive(Debug, Error)]
pub enum BranchError {
    #[error("Refusing to delete branch '{branch}': {reason}")]
    Protected { branch: String, reason: String },

    #[error("Branch '{branch}' is neither a wave nor an integration branch")]
    UnknownBranch { branch: String },

    #[error("Spec identifier '{spec}' normalizes to an empty branch component")]
    InvalidSpec { spec: String },

    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Errors from the external service adapters.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} {args} failed: {stderr}")]
    Command {
        program: String,
        args: String,
        stderr: String,
    },

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invalid change-set reference '{reference}'")]
    InvalidRef { reference: String },

    #[error("Service not configured: {0}")]
    NotConfigured(String),

    #[error("{0}")]
    Other(String),
}

/// Everything a delivery machine step can fail with.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Branch(#[from] BranchError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("Task {task} is not part of wave {wave}")]
    TaskNotInWave { task: String, wave: u32 },

    #[error("Task {task} cannot pass until its predecessors verify: {reason}")]
    UnverifiedDependencies { task: String, reason: String },

    #[error("Operation requires phase EXECUTE, pipeline is in {phase}")]
    NotExecuting { phase: Phase },

    #[error("Pipeline '{pipeline}' already exists")]
    AlreadyExists { pipeline: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_error_cycle_lists_tasks() {
        let err = PlanError::Cycle {
            tasks: vec!["a".to_string(), "b".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("Cycle"));
        assert!(msg.contains("\"a\""));
    }

    #[test]
    fn store_error_invalid_joins_violations() {
        let err = StoreError::Invalid {
            pipeline: "auth".to_string(),
            violations: vec!["first".to_string(), "second".to_string()],
        };
        assert!(err.to_string().contains("first; second"));
    }

    #[test]
    fn pipeline_error_converts_from_ledger_error() {
        let inner = LedgerError::DuplicateArtifact {
            task: "3".to_string(),
        };
        let err: PipelineError = inner.into();
        match &err {
            PipelineError::Ledger(LedgerError::DuplicateArtifact { task }) => {
                assert_eq!(task, "3");
            }
            _ => panic!("Expected PipelineError::Ledger(DuplicateArtifact)"),
        }
    }

    #[test]
    fn transition_error_names_phase_and_trigger() {
        let err = TransitionError::Invalid {
            from: Phase::Init,
            trigger: Trigger::MergeSucceeded { more_waves: true },
        };
        let msg = err.to_string();
        assert!(msg.contains("INIT"));
        assert!(msg.contains("MergeSucceeded"));
    }

    #[test]
    fn branch_error_wraps_service_error() {
        let err: BranchError = ServiceError::Other("remote unreachable".into()).into();
        assert!(matches!(err, BranchError::Service(ServiceError::Other(_))));
        assert_eq!(err.to_string(), "remote unreachable");
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&PlanError::Empty);
        assert_std_error(&LedgerError::NotFound { task: "1".into() });
        assert_std_error(&StoreError::Locked {
            pipeline: "p".into(),
        });
        assert_std_error(&ServiceError::NotConfigured("github".into()));
        assert_std_error(&PipelineError::NotExecuting {
            phase: Phase::Completed,
        });
    }
}
