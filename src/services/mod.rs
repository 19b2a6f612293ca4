//! Traits for the external collaborators of the delivery machine.
//!
//! The machine never talks to git, GitHub or a worker directly; it only sees
//! these traits. Live adapters:
//! - [`git::GitCli`] for version control
//! - [`github::GitHubClient`] for review status and change-set publishing
//! - [`shell::ShellTaskExecutor`] for running tasks
//!
//! [`memory`] holds in-process fakes used by tests and dry runs.

pub mod git;
pub mod github;
pub mod memory;
pub mod shell;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;
use crate::ledger::SymbolLocator;
use crate::state::ReviewDecision;
use crate::task::{Task, TaskArtifacts};

/// Where a branch lookup or deletion applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchScope {
    Local,
    Remote,
    Any,
}

impl fmt::Display for BranchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchScope::Local => write!(f, "local"),
            BranchScope::Remote => write!(f, "remote"),
            BranchScope::Any => write!(f, "any"),
        }
    }
}

/// A published change-set (pull request).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetRef {
    /// Identifier the review system understands (PR number for GitHub)
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// What the review system currently says about a change-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewSnapshot {
    pub decision: ReviewDecision,
    pub blocking_count: u32,
}

impl ReviewSnapshot {
    pub fn pending() -> Self {
        Self {
            decision: ReviewDecision::Pending,
            blocking_count: 0,
        }
    }
}

/// Result of running one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Pass(TaskArtifacts),
    Blocked(String),
}

/// Everything a task executor needs to know about where it runs.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub pipeline_id: String,
    pub wave: u32,
    pub wave_branch: String,
    pub integration_branch: String,
    pub project_dir: PathBuf,
    /// Review cycle whose feedback is being addressed, 0 on first pass
    pub review_cycle: u32,
}

#[async_trait]
pub trait VersionControlService: Send + Sync {
    /// Create `name` starting at `from`.
    async fn create_branch(&self, name: &str, from: &str) -> Result<(), ServiceError>;

    async fn branch_exists(&self, name: &str, scope: BranchScope) -> Result<bool, ServiceError>;

    /// Switch the working tree to `name`.
    async fn checkout(&self, name: &str) -> Result<(), ServiceError>;

    async fn push(&self, branch: &str) -> Result<(), ServiceError>;

    async fn delete_branch(&self, name: &str, scope: BranchScope) -> Result<(), ServiceError>;

    async fn current_branch(&self) -> Result<String, ServiceError>;
}

#[async_trait]
pub trait ReviewService: Send + Sync {
    /// Current verdict on `change_set`, counting only reviews submitted
    /// after `since` when it is set.
    async fn get_review_status(
        &self,
        change_set: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<ReviewSnapshot, ServiceError>;
}

#[async_trait]
pub trait ChangeSetPublisher: Send + Sync {
    /// Open a change-set merging `branch` into `target`.
    async fn publish(&self, branch: &str, target: &str) -> Result<ChangeSetRef, ServiceError>;

    async fn merge(&self, change_set: &str) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext)
    -> Result<TaskOutcome, ServiceError>;

    /// Address outstanding review feedback on the wave branch.
    ///
    /// Returns `false` when the feedback must be handled by an operator.
    async fn address_feedback(&self, ctx: &ExecutionContext) -> Result<bool, ServiceError>;
}

/// The full set of collaborators a delivery machine runs against.
#[derive(Clone)]
pub struct Services {
    pub vcs: Arc<dyn VersionControlService>,
    pub review: Arc<dyn ReviewService>,
    pub publisher: Arc<dyn ChangeSetPublisher>,
    /// `None` when tasks are completed outside the process
    pub executor: Option<Arc<dyn TaskExecutor>>,
    pub locator: Arc<dyn SymbolLocator>,
}
