//! In-memory service implementations.
//!
//! Every fake records what was asked of it so tests can assert on the
//! sequence of side effects, and can be told to fail on demand.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::ServiceError;
use crate::ledger::SymbolLocator;
use crate::services::{
    BranchScope, ChangeSetPublisher, ChangeSetRef, ExecutionContext, ReviewService,
    ReviewSnapshot, Services, TaskExecutor, TaskOutcome, VersionControlService,
};
use crate::task::{Task, TaskArtifacts};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct RepoState {
    local: BTreeSet<String>,
    remote: BTreeSet<String>,
    /// branch -> branch it was created from
    parents: HashMap<String, String>,
    current: String,
    pushes: Vec<String>,
    deleted: Vec<(String, BranchScope)>,
    fail_push: bool,
}

/// A repository with local and remote branch sets.
#[derive(Debug)]
pub struct MemoryVcs {
    state: Mutex<RepoState>,
}

impl MemoryVcs {
    /// A repository whose trunk exists locally, remotely and is checked out.
    pub fn new(trunk: &str) -> Self {
        let mut state = RepoState {
            current: trunk.to_string(),
            ..Default::default()
        };
        state.local.insert(trunk.to_string());
        state.remote.insert(trunk.to_string());
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn has_local(&self, name: &str) -> bool {
        lock(&self.state).local.contains(name)
    }

    pub fn has_remote(&self, name: &str) -> bool {
        lock(&self.state).remote.contains(name)
    }

    pub fn parent_of(&self, name: &str) -> Option<String> {
        lock(&self.state).parents.get(name).cloned()
    }

    pub fn pushes(&self) -> Vec<String> {
        lock(&self.state).pushes.clone()
    }

    pub fn deleted(&self) -> Vec<(String, BranchScope)> {
        lock(&self.state).deleted.clone()
    }

    pub fn set_current(&self, name: &str) {
        lock(&self.state).current = name.to_string();
    }

    pub fn add_local(&self, name: &str) {
        lock(&self.state).local.insert(name.to_string());
    }

    pub fn fail_pushes(&self, fail: bool) {
        lock(&self.state).fail_push = fail;
    }
}

#[async_trait]
impl VersionControlService for MemoryVcs {
    async fn create_branch(&self, name: &str, from: &str) -> Result<(), ServiceError> {
        let mut state = lock(&self.state);
        if !state.local.contains(from) && !state.remote.contains(from) {
            return Err(ServiceError::Other(format!("start point '{}' does not exist", from)));
        }
        if state.local.contains(name) {
            return Err(ServiceError::Other(format!("branch '{}' already exists", name)));
        }
        state.local.insert(name.to_string());
        state.parents.insert(name.to_string(), from.to_string());
        Ok(())
    }

    async fn branch_exists(&self, name: &str, scope: BranchScope) -> Result<bool, ServiceError> {
        let state = lock(&self.state);
        Ok(match scope {
            BranchScope::Local => state.local.contains(name),
            BranchScope::Remote => state.remote.contains(name),
            BranchScope::Any => state.local.contains(name) || state.remote.contains(name),
        })
    }

    async fn checkout(&self, name: &str) -> Result<(), ServiceError> {
        let mut state = lock(&self.state);
        if !state.local.contains(name) {
            return Err(ServiceError::Other(format!("branch '{}' does not exist", name)));
        }
        state.current = name.to_string();
        Ok(())
    }

    async fn push(&self, branch: &str) -> Result<(), ServiceError> {
        let mut state = lock(&self.state);
        if state.fail_push {
            return Err(ServiceError::Other("remote unreachable".into()));
        }
        if !state.local.contains(branch) {
            return Err(ServiceError::Other(format!("branch '{}' does not exist", branch)));
        }
        state.remote.insert(branch.to_string());
        state.pushes.push(branch.to_string());
        Ok(())
    }

    async fn delete_branch(&self, name: &str, scope: BranchScope) -> Result<(), ServiceError> {
        let mut state = lock(&self.state);
        if matches!(scope, BranchScope::Local | BranchScope::Any) {
            state.local.remove(name);
        }
        if matches!(scope, BranchScope::Remote | BranchScope::Any) {
            state.remote.remove(name);
        }
        state.deleted.push((name.to_string(), scope));
        Ok(())
    }

    async fn current_branch(&self) -> Result<String, ServiceError> {
        Ok(lock(&self.state).current.clone())
    }
}

/// A review system that replays scripted snapshots per change-set.
///
/// A scripted snapshot counts as submitted when it is first returned. Once a
/// change-set's script is exhausted its last snapshot repeats until a poll
/// asks only for verdicts newer than it. An unscripted change-set is always
/// pending.
#[derive(Debug, Default)]
pub struct MemoryReview {
    scripts: Mutex<HashMap<String, VecDeque<ReviewSnapshot>>>,
    last: Mutex<HashMap<String, (ReviewSnapshot, DateTime<Utc>)>>,
    calls: AtomicU32,
}

impl MemoryReview {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, change_set: &str, snapshots: Vec<ReviewSnapshot>) {
        lock(&self.scripts).insert(change_set.to_string(), snapshots.into());
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReviewService for MemoryReview {
    async fn get_review_status(
        &self,
        change_set: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<ReviewSnapshot, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = lock(&self.scripts)
            .get_mut(change_set)
            .and_then(|queue| queue.pop_front());
        let mut last = lock(&self.last);
        if let Some(snapshot) = next {
            last.insert(change_set.to_string(), (snapshot, Utc::now()));
            return Ok(snapshot);
        }
        Ok(match last.get(change_set) {
            Some((_, at)) if since.is_some_and(|since| *at <= since) => ReviewSnapshot::pending(),
            Some((snapshot, _)) => *snapshot,
            None => ReviewSnapshot::pending(),
        })
    }
}

#[derive(Debug, Default)]
struct PublisherState {
    published: Vec<(String, String)>,
    merged: Vec<String>,
    fail_merge: bool,
    fail_publish: bool,
}

/// A change-set host that numbers pull requests from 1.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    next: AtomicU32,
    state: Mutex<PublisherState>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(branch, target)` pairs in publish order.
    pub fn published(&self) -> Vec<(String, String)> {
        lock(&self.state).published.clone()
    }

    pub fn merged(&self) -> Vec<String> {
        lock(&self.state).merged.clone()
    }

    pub fn fail_merges(&self, fail: bool) {
        lock(&self.state).fail_merge = fail;
    }

    pub fn fail_publishes(&self, fail: bool) {
        lock(&self.state).fail_publish = fail;
    }
}

#[async_trait]
impl ChangeSetPublisher for MemoryPublisher {
    async fn publish(&self, branch: &str, target: &str) -> Result<ChangeSetRef, ServiceError> {
        let mut state = lock(&self.state);
        if state.fail_publish {
            return Err(ServiceError::Api {
                status: 502,
                message: "bad gateway".into(),
            });
        }
        let id = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        state
            .published
            .push((branch.to_string(), target.to_string()));
        Ok(ChangeSetRef {
            id: id.to_string(),
            url: None,
        })
    }

    async fn merge(&self, change_set: &str) -> Result<(), ServiceError> {
        let mut state = lock(&self.state);
        if state.fail_merge {
            return Err(ServiceError::Api {
                status: 405,
                message: "Pull request is not mergeable".into(),
            });
        }
        state.merged.push(change_set.to_string());
        Ok(())
    }
}

/// An executor with per-task scripted outcomes; unscripted tasks pass.
#[derive(Debug, Default)]
pub struct MemoryExecutor {
    outcomes: Mutex<HashMap<String, TaskOutcome>>,
    executed: Mutex<Vec<String>>,
    feedback_calls: AtomicU32,
    handles_feedback: Mutex<bool>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self {
            handles_feedback: Mutex::new(true),
            ..Default::default()
        }
    }

    pub fn set_outcome(&self, task_id: &str, outcome: TaskOutcome) {
        lock(&self.outcomes).insert(task_id.to_string(), outcome);
    }

    pub fn handles_feedback(&self, handles: bool) {
        *lock(&self.handles_feedback) = handles;
    }

    /// Task ids in completion order.
    pub fn executed(&self) -> Vec<String> {
        lock(&self.executed).clone()
    }

    pub fn feedback_calls(&self) -> u32 {
        self.feedback_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskExecutor for MemoryExecutor {
    async fn execute(
        &self,
        task: &Task,
        _ctx: &ExecutionContext,
    ) -> Result<TaskOutcome, ServiceError> {
        lock(&self.executed).push(task.id.clone());
        Ok(lock(&self.outcomes)
            .get(&task.id)
            .cloned()
            .unwrap_or_else(|| TaskOutcome::Pass(TaskArtifacts::default())))
    }

    async fn address_feedback(&self, _ctx: &ExecutionContext) -> Result<bool, ServiceError> {
        self.feedback_calls.fetch_add(1, Ordering::SeqCst);
        Ok(*lock(&self.handles_feedback))
    }
}

/// A fixed set of symbols that "exist" in the codebase.
#[derive(Debug, Default)]
pub struct MemorySymbols {
    symbols: BTreeSet<String>,
}

impl MemorySymbols {
    pub fn new(symbols: &[&str]) -> Self {
        Self {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl SymbolLocator for MemorySymbols {
    fn locate(&self, symbol: &str) -> bool {
        self.symbols.contains(symbol)
    }
}

/// One of every fake, with typed handles for assertions.
#[derive(Clone)]
pub struct MemoryServices {
    pub vcs: Arc<MemoryVcs>,
    pub review: Arc<MemoryReview>,
    pub publisher: Arc<MemoryPublisher>,
    pub executor: Arc<MemoryExecutor>,
    pub symbols: Arc<MemorySymbols>,
}

impl MemoryServices {
    pub fn new(trunk: &str) -> Self {
        Self {
            vcs: Arc::new(MemoryVcs::new(trunk)),
            review: Arc::new(MemoryReview::new()),
            publisher: Arc::new(MemoryPublisher::new()),
            executor: Arc::new(MemoryExecutor::new()),
            symbols: Arc::new(MemorySymbols::default()),
        }
    }

    pub fn services(&self) -> Services {
        Services {
            executor: Some(self.executor.clone()),
            ..self.services_without_executor()
        }
    }

    /// Services for pipelines whose tasks are completed by an operator.
    pub fn services_without_executor(&self) -> Services {
        Services {
            vcs: self.vcs.clone(),
            review: self.review.clone(),
            publisher: self.publisher.clone(),
            executor: None,
            locator: self.symbols.clone(),
        }
    }
}
