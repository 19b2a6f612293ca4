//! One step of the delivery machine per invocation.
//!
//! Every public operation takes the pipeline lock, loads the documents,
//! does one transition's worth of work, persists and returns. Nothing is
//! kept in memory between invocations.

use std::fmt;
use std::path::PathBuf;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::branch::{BranchCoordinator, BranchNames};
use crate::dag::{DagBuilder, Wave, WavePartitioner, compare_task_ids};
use crate::errors::{PipelineError, ServiceError, StoreError, TransitionError};
use crate::ledger::ArtifactLedger;
use crate::machine::transitions::{Trigger, next_phase};
use crate::review::{PollConfig, PollReport, ReviewPoller};
use crate::services::{ExecutionContext, Services, TaskOutcome};
use crate::state::{
    HistoryEntry, Phase, PipelineState, ReviewDecision, ReviewFix, ReviewStatus, StateStore,
};
use crate::task::{TaskArtifacts, TaskBook, TaskStatus};

/// Tunables of a delivery machine.
#[derive(Debug, Clone)]
pub struct MachineSettings {
    pub trunk: String,
    pub poll: PollConfig,
    pub max_parallel: usize,
    /// Working tree the tasks run in
    pub project_dir: PathBuf,
}

/// What one step did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Transitioned { from: Phase, to: Phase },
    /// Nothing to do until something external happens
    Waiting {
        phase: Phase,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        poll: Option<PollReport>,
    },
    /// Review budget exhausted without a decision; phase unchanged
    NeedsManualCheck { report: PollReport },
    /// Terminal phase
    Idle { phase: Phase },
}

impl StepOutcome {
    /// Check if re-invoking `step` right away can make progress.
    pub fn made_progress(&self) -> bool {
        matches!(self, StepOutcome::Transitioned { .. })
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Transitioned { from, to } => write!(f, "{} → {}", from, to),
            StepOutcome::Waiting { phase, reason, .. } => write!(f, "{}: {}", phase, reason),
            StepOutcome::NeedsManualCheck { report } => write!(
                f,
                "AWAITING_REVIEW: no decision after {} polls ({} ms); check the change-set manually",
                report.poll_count, report.elapsed_ms
            ),
            StepOutcome::Idle { phase } => write!(f, "{}: nothing to do", phase),
        }
    }
}

/// Result of an operator reset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResetReport {
    pub from: Phase,
    pub wave: u32,
    pub unblocked: Vec<String>,
}

/// Read-only view of a pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: PipelineState,
    pub tasks: TaskBook,
}

impl StatusReport {
    /// `(passed, total)` task counts of the current wave.
    pub fn wave_progress(&self) -> (usize, usize) {
        match self.state.current_wave_plan() {
            Some(wave) => {
                let passed = wave
                    .tasks
                    .iter()
                    .filter(|id| {
                        self.tasks
                            .get(id)
                            .is_some_and(|t| t.status == TaskStatus::Pass)
                    })
                    .count();
                (passed, wave.tasks.len())
            }
            None => (0, 0),
        }
    }
}

pub struct DeliveryMachine {
    store: StateStore,
    services: Services,
    settings: MachineSettings,
    branches: BranchCoordinator,
    poller: ReviewPoller,
    ledger: ArtifactLedger,
}

fn transition(doc: &mut PipelineState, trigger: Trigger) -> Result<StepOutcome, TransitionError> {
    let from = doc.phase;
    let to = next_phase(from, trigger)?;
    doc.phase = to;
    info!(
        pipeline = %doc.pipeline_id,
        wave = doc.current_wave,
        from = %from,
        to = %to,
        trigger = %trigger,
        "Phase transition"
    );
    Ok(StepOutcome::Transitioned { from, to })
}

impl DeliveryMachine {
    pub fn new(store: StateStore, services: Services, settings: MachineSettings) -> Self {
        let branches = BranchCoordinator::new(services.vcs.clone(), &settings.trunk);
        let poller = ReviewPoller::new(settings.poll, services.review.clone());
        let ledger = ArtifactLedger::new(settings.project_dir.clone(), services.locator.clone());
        Self {
            store,
            services,
            settings,
            branches,
            poller,
            ledger,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn settings(&self) -> &MachineSettings {
        &self.settings
    }

    pub fn branches(&self) -> &BranchCoordinator {
        &self.branches
    }

    pub fn ledger(&self) -> &ArtifactLedger {
        &self.ledger
    }

    /// Partition the task graph and persist a new pipeline in INIT.
    pub fn create(
        &self,
        pipeline_id: &str,
        spec: &str,
        book: TaskBook,
    ) -> Result<PipelineState, PipelineError> {
        let names = BranchNames::new(spec)?;
        let graph = DagBuilder::new(book.tasks.clone()).build()?;
        let waves = WavePartitioner::partition(&graph)?;

        let _lock = self.store.lock(pipeline_id)?;
        if self.store.exists(pipeline_id) {
            return Err(PipelineError::AlreadyExists {
                pipeline: pipeline_id.to_string(),
            });
        }

        let mut doc = PipelineState::new(pipeline_id, names.spec(), waves);
        self.store.save_tasks(pipeline_id, &book)?;
        self.store.save(pipeline_id, &mut doc)?;

        info!(
            pipeline = pipeline_id,
            spec = names.spec(),
            tasks = book.tasks.len(),
            waves = doc.total_waves,
            "Created pipeline"
        );
        Ok(doc)
    }

    /// Advance the pipeline by exactly one step.
    pub async fn step(&self, pipeline_id: &str) -> Result<StepOutcome, PipelineError> {
        let _lock = self.store.lock(pipeline_id)?;
        let mut doc = self.store.load(pipeline_id)?;

        match doc.phase {
            Phase::Init => self.step_init(&mut doc).await,
            Phase::Execute => self.step_execute(&mut doc).await,
            Phase::AwaitingReview => self.step_awaiting_review(&mut doc).await,
            Phase::ReviewProcessing => self.step_review_processing(&mut doc),
            Phase::ReadyToMerge => self.step_ready_to_merge(&mut doc).await,
            Phase::Completed | Phase::Failed => Ok(StepOutcome::Idle { phase: doc.phase }),
        }
    }

    async fn step_init(&self, doc: &mut PipelineState) -> Result<StepOutcome, PipelineError> {
        let pipeline_id = doc.pipeline_id.clone();
        self.establish_branches(doc).await?;
        let outcome = transition(doc, Trigger::BranchesReady)?;
        self.store.save(&pipeline_id, doc)?;
        Ok(outcome)
    }

    async fn establish_branches(&self, doc: &mut PipelineState) -> Result<(), PipelineError> {
        let report = self.branches.setup(&doc.spec_id, doc.current_wave).await?;
        doc.integration_branch = Some(report.integration_branch);
        doc.wave_branch = Some(report.wave_branch);
        Ok(())
    }

    fn context(&self, doc: &PipelineState) -> ExecutionContext {
        ExecutionContext {
            pipeline_id: doc.pipeline_id.clone(),
            wave: doc.current_wave,
            wave_branch: doc.wave_branch.clone().unwrap_or_default(),
            integration_branch: doc.integration_branch.clone().unwrap_or_default(),
            project_dir: self.settings.project_dir.clone(),
            review_cycle: doc.review_cycles,
        }
    }

    fn current_wave(doc: &PipelineState) -> Result<Wave, PipelineError> {
        doc.current_wave_plan().cloned().ok_or_else(|| {
            StoreError::Invalid {
                pipeline: doc.pipeline_id.clone(),
                violations: vec![format!("wave {} is not in the plan", doc.current_wave)],
            }
            .into()
        })
    }

    async fn step_execute(&self, doc: &mut PipelineState) -> Result<StepOutcome, PipelineError> {
        let pipeline_id = doc.pipeline_id.clone();
        let wave = Self::current_wave(doc)?;
        let ctx = self.context(doc);

        if doc.execution.has_outstanding_fix() {
            let handled = match &self.services.executor {
                Some(executor) => executor.address_feedback(&ctx).await?,
                None => false,
            };
            if !handled {
                let cycle = doc.execution.review_fix.as_ref().map_or(0, |f| f.cycle);
                return Ok(StepOutcome::Waiting {
                    phase: Phase::Execute,
                    reason: format!(
                        "review feedback from cycle {} must be addressed; run `waveforge review resolved` when done",
                        cycle
                    ),
                    poll: None,
                });
            }
            if let Some(fix) = doc.execution.review_fix.as_mut() {
                fix.resolved = true;
            }
            info!(pipeline = %pipeline_id, wave = wave.number, "Review feedback addressed");
            self.store.save(&pipeline_id, doc)?;
        }

        let mut book = self.store.load_tasks(&pipeline_id)?;
        let runnable = self.verify_runnable(&mut book, &wave)?;

        if let Some(executor) = self.services.executor.clone()
            && !runnable.is_empty()
        {
            for id in &runnable {
                if let Some(task) = book.get_mut(id) {
                    task.status = TaskStatus::InProgress;
                }
            }
            self.store.save_tasks(&pipeline_id, &book)?;

            let tasks: Vec<_> = runnable
                .iter()
                .filter_map(|id| book.get(id).cloned())
                .collect();
            info!(
                pipeline = %pipeline_id,
                wave = wave.number,
                tasks = tasks.len(),
                max_parallel = self.settings.max_parallel,
                "Dispatching tasks"
            );

            let mut results: Vec<(String, Result<TaskOutcome, ServiceError>)> =
                stream::iter(tasks.into_iter().map(|task| {
                    let executor = executor.clone();
                    let ctx = ctx.clone();
                    async move {
                        let result = executor.execute(&task, &ctx).await;
                        (task.id, result)
                    }
                }))
                .buffer_unordered(self.settings.max_parallel.max(1))
                .collect()
                .await;
            results.sort_by(|a, b| compare_task_ids(&a.0, &b.0));

            let first_error = Self::record_results(&mut book, results)?;
            self.store.save_tasks(&pipeline_id, &book)?;
            if let Some(e) = first_error {
                return Err(e.into());
            }
        } else {
            self.store.save_tasks(&pipeline_id, &book)?;
        }

        if let Some(task) = book.first_blocked(&wave.tasks) {
            let reason = task.last_error.clone().unwrap_or_else(|| "blocked".to_string());
            doc.last_error = Some(format!("Task {} blocked: {}", task.id, reason));
            doc.failed_from = Some(Phase::Execute);
            let outcome = transition(doc, Trigger::TaskBlocked)?;
            self.store.save(&pipeline_id, doc)?;
            return Ok(outcome);
        }

        if !book.all_pass(&wave.tasks) {
            let passed = wave
                .tasks
                .iter()
                .filter(|id| book.get(id).is_some_and(|t| t.status == TaskStatus::Pass))
                .count();
            return Ok(StepOutcome::Waiting {
                phase: Phase::Execute,
                reason: format!(
                    "{} of {} tasks in wave {} pass",
                    passed,
                    wave.tasks.len(),
                    wave.number
                ),
                poll: None,
            });
        }

        self.publish(doc).await
    }

    /// Verify predecessor artifacts of every dispatchable task of the wave.
    ///
    /// Tasks whose predecessors fail verification are blocked; the rest are
    /// returned in wave order.
    fn verify_runnable(
        &self,
        book: &mut TaskBook,
        wave: &Wave,
    ) -> Result<Vec<String>, PipelineError> {
        let mut runnable = Vec::new();
        for id in &wave.tasks {
            let Some(task) = book.get(id).cloned() else {
                continue;
            };
            if !matches!(task.status, TaskStatus::Pending | TaskStatus::InProgress) {
                continue;
            }

            let check = self.ledger.verify_dependencies(book, &task)?;
            if check.is_satisfied() {
                runnable.push(id.clone());
            } else {
                let reason = format!(
                    "artifact verification failed: {}",
                    check.describe_failure()
                );
                warn!(task = %id, reason = %reason, "Blocking task");
                book.block(id, &reason);
            }
        }
        Ok(runnable)
    }

    fn record_results(
        book: &mut TaskBook,
        results: Vec<(String, Result<TaskOutcome, ServiceError>)>,
    ) -> Result<Option<ServiceError>, PipelineError> {
        let mut first_error = None;
        for (id, result) in results {
            match result {
                Ok(TaskOutcome::Pass(artifacts)) => {
                    if let Some(task) = book.get_mut(&id) {
                        task.status = TaskStatus::Pass;
                        task.last_error = None;
                    }
                    ArtifactLedger::record(book, &id, artifacts)?;
                    info!(task = %id, "Task passed");
                }
                Ok(TaskOutcome::Blocked(reason)) => {
                    warn!(task = %id, reason = %reason, "Task blocked");
                    book.block(&id, &reason);
                }
                Err(e) => {
                    // Executor trouble is not a task verdict; retry on the next step.
                    warn!(task = %id, error = %e, "Task executor failed");
                    if let Some(task) = book.get_mut(&id) {
                        task.status = TaskStatus::Pending;
                    }
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        Ok(first_error)
    }

    async fn publish(&self, doc: &mut PipelineState) -> Result<StepOutcome, PipelineError> {
        let pipeline_id = doc.pipeline_id.clone();
        let wave_branch = doc.wave_branch.clone().ok_or_else(|| StoreError::Invalid {
            pipeline: pipeline_id.clone(),
            violations: vec!["EXECUTE without a wave branch".to_string()],
        })?;

        self.services.vcs.push(&wave_branch).await?;

        if doc.pull_request_ref.is_none() {
            let target = self.branches.resolve_merge_target(&wave_branch)?;
            let change_set = self.services.publisher.publish(&wave_branch, &target).await?;
            info!(
                pipeline = %pipeline_id,
                wave = doc.current_wave,
                change_set = %change_set.id,
                target = %target,
                "Published change-set"
            );
            doc.pull_request_ref = Some(change_set.id);
        }

        // Verdicts left on an earlier push of this change-set no longer apply.
        doc.review_status = ReviewStatus {
            reviews_since: Some(Utc::now()),
            ..ReviewStatus::default()
        };
        let outcome = transition(doc, Trigger::WavePublished)?;
        self.store.save(&pipeline_id, doc)?;
        Ok(outcome)
    }

    async fn step_awaiting_review(
        &self,
        doc: &mut PipelineState,
    ) -> Result<StepOutcome, PipelineError> {
        let pipeline_id = doc.pipeline_id.clone();
        let change_set = doc.pull_request_ref.clone().unwrap_or_default();

        let report = self
            .poller
            .check_once(&mut doc.review_status, &change_set)
            .await?;

        if report.decision != ReviewDecision::Pending {
            let outcome = transition(doc, Trigger::ReviewDecided)?;
            self.store.save(&pipeline_id, doc)?;
            return Ok(outcome);
        }

        self.store.save(&pipeline_id, doc)?;
        if report.timed_out {
            return Ok(StepOutcome::NeedsManualCheck { report });
        }
        Ok(StepOutcome::Waiting {
            phase: Phase::AwaitingReview,
            reason: format!(
                "review pending after {} polls ({} of {} ms)",
                report.poll_count, report.elapsed_ms, self.settings.poll.max_poll_duration_ms
            ),
            poll: Some(report),
        })
    }

    fn step_review_processing(
        &self,
        doc: &mut PipelineState,
    ) -> Result<StepOutcome, PipelineError> {
        let pipeline_id = doc.pipeline_id.clone();
        let decision = doc.review_status.decision.unwrap_or(ReviewDecision::Pending);
        let blocking = doc.review_status.blocking_count;

        let outcome = if decision == ReviewDecision::Approved && blocking == 0 {
            transition(doc, Trigger::ReviewApproved)?
        } else {
            let outcome = transition(doc, Trigger::ChangesRequested)?;
            doc.review_cycles += 1;
            doc.execution.review_fix = Some(ReviewFix {
                cycle: doc.review_cycles,
                blocking_count: blocking,
                resolved: false,
            });
            info!(
                pipeline = %pipeline_id,
                wave = doc.current_wave,
                cycle = doc.review_cycles,
                blocking,
                "Review requested changes"
            );
            outcome
        };

        self.store.save(&pipeline_id, doc)?;
        Ok(outcome)
    }

    async fn step_ready_to_merge(
        &self,
        doc: &mut PipelineState,
    ) -> Result<StepOutcome, PipelineError> {
        let pipeline_id = doc.pipeline_id.clone();
        let change_set = doc.pull_request_ref.clone().unwrap_or_default();
        let more_waves = doc.has_more_waves();

        // Checked before any side effect so a rejected merge leaves no trace.
        next_phase(doc.phase, Trigger::MergeSucceeded { more_waves })?;

        self.services.publisher.merge(&change_set).await?;
        let merged_branch = doc.wave_branch.clone();

        doc.history.push(HistoryEntry {
            wave: doc.current_wave,
            pull_request_ref: change_set,
            merged_at: Utc::now(),
            review_cycles: doc.review_cycles,
        });

        if more_waves {
            doc.current_wave += 1;
            self.establish_branches(doc).await?;
        } else {
            doc.current_wave = doc.total_waves + 1;
            doc.wave_branch = None;
            if let Some(integration) = doc.integration_branch.clone()
                && let Err(e) = self.services.vcs.checkout(&integration).await
            {
                warn!(branch = %integration, error = %e, "Could not check out integration branch");
            }
        }
        doc.pull_request_ref = None;
        doc.reset_sub_state();

        let outcome = transition(doc, Trigger::MergeSucceeded { more_waves })?;
        self.store.save(&pipeline_id, doc)?;

        if let Some(branch) = merged_branch
            && let Err(e) = self.branches.cleanup(&branch).await
        {
            warn!(branch = %branch, error = %e, "Cleanup of merged wave branch failed");
        }

        Ok(outcome)
    }

    /// Operator reset: a fresh attempt at the current wave.
    pub async fn reset(&self, pipeline_id: &str) -> Result<ResetReport, PipelineError> {
        let _lock = self.store.lock(pipeline_id)?;
        let mut doc = self.store.load(pipeline_id)?;
        let from = doc.phase;
        next_phase(from, Trigger::Reset)?;

        if doc.integration_branch.is_none() || doc.wave_branch.is_none() {
            self.establish_branches(&mut doc).await?;
        }

        let wave = Self::current_wave(&doc)?;
        let mut book = self.store.load_tasks(pipeline_id)?;
        let unblocked = book.unblock(&wave.tasks);

        doc.reset_sub_state();
        doc.pull_request_ref = None;
        transition(&mut doc, Trigger::Reset)?;

        self.store.save_tasks(pipeline_id, &book)?;
        self.store.save(pipeline_id, &mut doc)?;

        Ok(ResetReport {
            from,
            wave: doc.current_wave,
            unblocked,
        })
    }

    /// Force a damaged document into a known-good phase.
    ///
    /// Branch names are re-derived for the current wave; the result is saved
    /// only if it validates.
    pub fn recover(&self, pipeline_id: &str, target: Phase) -> Result<PipelineState, PipelineError> {
        let _lock = self.store.lock(pipeline_id)?;
        let mut doc = self.store.load_unchecked(pipeline_id)?;
        let from = doc.phase;
        next_phase(from, Trigger::Recover(target))?;

        let names = BranchNames::new(&doc.spec_id)?;
        doc.total_waves = doc.waves.len() as u32;
        doc.integration_branch = Some(names.integration());
        doc.wave_branch = Some(names.wave(doc.current_wave));
        doc.phase = target;
        doc.last_error = None;
        doc.failed_from = None;
        if target == Phase::Execute {
            doc.pull_request_ref = None;
            doc.execution = Default::default();
        }

        self.store.save(pipeline_id, &mut doc)?;
        warn!(
            pipeline = pipeline_id,
            from = %from,
            to = %target,
            wave = doc.current_wave,
            "Recovered pipeline state"
        );
        Ok(doc)
    }

    fn require_task_in_wave(doc: &PipelineState, task_id: &str) -> Result<(), PipelineError> {
        if doc.phase != Phase::Execute {
            return Err(PipelineError::NotExecuting { phase: doc.phase });
        }
        let in_wave = doc
            .current_wave_plan()
            .is_some_and(|wave| wave.contains(task_id));
        if !in_wave {
            return Err(PipelineError::TaskNotInWave {
                task: task_id.to_string(),
                wave: doc.current_wave,
            });
        }
        Ok(())
    }

    /// Mark a task of the current wave passed with the given artifacts.
    pub fn complete_task(
        &self,
        pipeline_id: &str,
        task_id: &str,
        artifacts: TaskArtifacts,
    ) -> Result<(), PipelineError> {
        let _lock = self.store.lock(pipeline_id)?;
        let doc = self.store.load(pipeline_id)?;
        Self::require_task_in_wave(&doc, task_id)?;

        let mut book = self.store.load_tasks(pipeline_id)?;
        if let Some(task) = book.get(task_id) {
            let check = self.ledger.verify_dependencies(&book, task)?;
            if !check.is_satisfied() {
                return Err(PipelineError::UnverifiedDependencies {
                    task: task_id.to_string(),
                    reason: check.describe_failure(),
                });
            }
        }
        if let Some(task) = book.get_mut(task_id) {
            task.status = TaskStatus::Pass;
            task.last_error = None;
        }
        ArtifactLedger::record(&mut book, task_id, artifacts)?;
        self.store.save_tasks(pipeline_id, &book)?;

        info!(pipeline = pipeline_id, task = task_id, "Task completed by operator");
        Ok(())
    }

    /// Mark a task of the current wave blocked.
    pub fn block_task(
        &self,
        pipeline_id: &str,
        task_id: &str,
        reason: &str,
    ) -> Result<(), PipelineError> {
        let _lock = self.store.lock(pipeline_id)?;
        let doc = self.store.load(pipeline_id)?;
        Self::require_task_in_wave(&doc, task_id)?;

        let mut book = self.store.load_tasks(pipeline_id)?;
        book.block(task_id, reason);
        self.store.save_tasks(pipeline_id, &book)?;

        warn!(pipeline = pipeline_id, task = task_id, reason, "Task blocked by operator");
        Ok(())
    }

    /// Mark outstanding review feedback as addressed.
    ///
    /// Returns `false` when there was nothing outstanding.
    pub fn resolve_review_fix(&self, pipeline_id: &str) -> Result<bool, PipelineError> {
        let _lock = self.store.lock(pipeline_id)?;
        let mut doc = self.store.load(pipeline_id)?;
        if doc.phase != Phase::Execute {
            return Err(PipelineError::NotExecuting { phase: doc.phase });
        }
        if !doc.execution.has_outstanding_fix() {
            return Ok(false);
        }
        if let Some(fix) = doc.execution.review_fix.as_mut() {
            fix.resolved = true;
        }
        self.store.save(pipeline_id, &mut doc)?;
        Ok(true)
    }

    pub fn status(&self, pipeline_id: &str) -> Result<StatusReport, PipelineError> {
        let state = self.store.load(pipeline_id)?;
        let tasks = self.store.load_tasks(pipeline_id)?;
        Ok(StatusReport { state, tasks })
    }

    pub fn poll_config(&self) -> &PollConfig {
        self.poller.config()
    }

    pub fn services(&self) -> &Services {
        &self.services
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{PlanError, StoreError};
    use crate::services::ReviewSnapshot;
    use crate::services::memory::{MemoryServices, MemorySymbols};
    use crate::task::Task;
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        mem: MemoryServices,
        machine: DeliveryMachine,
    }

    fn five_tasks() -> Vec<Task> {
        vec![
            Task::new("1", "Schema", &[]),
            Task::new("2", "Repository", &[]),
            Task::new("3", "Config", &[]),
            Task::new("4", "API", &["1", "2"]),
            Task::new("5", "CLI", &["3"]),
        ]
    }

    fn build(tasks: Vec<Task>, mem: MemoryServices, with_executor: bool) -> Fixture {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join(".waveforge"));
        let settings = MachineSettings {
            trunk: "main".to_string(),
            poll: PollConfig {
                poll_interval_ms: 1_000,
                max_poll_duration_ms: 3_000,
            },
            max_parallel: 2,
            project_dir: dir.path().to_path_buf(),
        };
        let services = if with_executor {
            mem.services()
        } else {
            mem.services_without_executor()
        };
        let machine = DeliveryMachine::new(store, services, settings);
        machine
            .create("auth", "auth", TaskBook::new(tasks))
            .unwrap();
        Fixture {
            _dir: dir,
            mem,
            machine,
        }
    }

    fn fixture() -> Fixture {
        build(five_tasks(), MemoryServices::new("main"), true)
    }

    fn approved() -> ReviewSnapshot {
        ReviewSnapshot {
            decision: ReviewDecision::Approved,
            blocking_count: 0,
        }
    }

    fn phase(fx: &Fixture) -> Phase {
        fx.machine.status("auth").unwrap().state.phase
    }

    async fn step(fx: &Fixture) -> StepOutcome {
        fx.machine.step("auth").await.unwrap()
    }

    /// Drive one wave from EXECUTE through an approving review to the merge.
    async fn deliver_wave(fx: &Fixture, change_set: &str) -> StepOutcome {
        assert_eq!(
            step(fx).await,
            StepOutcome::Transitioned {
                from: Phase::Execute,
                to: Phase::AwaitingReview
            }
        );
        fx.mem.review.script(change_set, vec![approved()]);
        step(fx).await;
        step(fx).await;
        assert_eq!(phase(fx), Phase::ReadyToMerge);
        step(fx).await
    }

    #[tokio::test]
    async fn test_create_partitions_and_persists_init() {
        let fx = fixture();
        let status = fx.machine.status("auth").unwrap();

        assert_eq!(status.state.phase, Phase::Init);
        assert_eq!(status.state.total_waves, 2);
        assert_eq!(status.state.waves[0].tasks, vec!["1", "2", "3"]);
        assert_eq!(status.state.waves[1].tasks, vec!["4", "5"]);
        assert_eq!(status.tasks.tasks.len(), 5);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates_and_cycles() {
        let fx = fixture();
        let err = fx
            .machine
            .create("auth", "auth", TaskBook::new(five_tasks()))
            .unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyExists { .. }));

        let cyclic = vec![Task::new("a", "", &["b"]), Task::new("b", "", &["a"])];
        let err = fx
            .machine
            .create("loop", "loop", TaskBook::new(cyclic))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Plan(PlanError::Cycle { .. })));
        assert!(!fx.machine.store().exists("loop"));
    }

    #[tokio::test]
    async fn test_full_delivery_of_two_waves() {
        let fx = fixture();

        assert_eq!(
            step(&fx).await,
            StepOutcome::Transitioned {
                from: Phase::Init,
                to: Phase::Execute
            }
        );

        let outcome = deliver_wave(&fx, "1").await;
        assert_eq!(
            outcome,
            StepOutcome::Transitioned {
                from: Phase::ReadyToMerge,
                to: Phase::Execute
            }
        );

        let state = fx.machine.status("auth").unwrap().state;
        assert_eq!(state.current_wave, 2);
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.history[0].pull_request_ref, "1");
        assert_eq!(state.wave_branch.as_deref(), Some("feature/auth-wave-2"));
        assert!(state.pull_request_ref.is_none());
        assert_eq!(state.review_status, ReviewStatus::default());
        assert_eq!(
            fx.mem.vcs.parent_of("feature/auth-wave-2").as_deref(),
            Some("feature/auth")
        );
        assert!(!fx.mem.vcs.has_local("feature/auth-wave-1"));
        assert!(!fx.mem.vcs.has_remote("feature/auth-wave-1"));

        let outcome = deliver_wave(&fx, "2").await;
        assert_eq!(
            outcome,
            StepOutcome::Transitioned {
                from: Phase::ReadyToMerge,
                to: Phase::Completed
            }
        );

        let state = fx.machine.status("auth").unwrap().state;
        assert_eq!(state.current_wave, 3);
        assert!(state.wave_branch.is_none());
        assert_eq!(state.history.len(), 2);
        assert_eq!(
            fx.mem.publisher.published(),
            vec![
                ("feature/auth-wave-1".to_string(), "feature/auth".to_string()),
                ("feature/auth-wave-2".to_string(), "feature/auth".to_string()),
            ]
        );
        assert_eq!(fx.mem.publisher.merged(), vec!["1", "2"]);
        assert_eq!(step(&fx).await, StepOutcome::Idle { phase: Phase::Completed });
    }

    #[tokio::test]
    async fn test_blocked_task_fails_then_reset_retries_wave() {
        let fx = fixture();
        fx.mem
            .executor
            .set_outcome("2", TaskOutcome::Blocked("tests failed".into()));
        step(&fx).await;

        assert_eq!(
            step(&fx).await,
            StepOutcome::Transitioned {
                from: Phase::Execute,
                to: Phase::Failed
            }
        );
        let status = fx.machine.status("auth").unwrap();
        let last_error = status.state.last_error.clone().unwrap();
        assert!(last_error.contains("Task 2"));
        assert!(last_error.contains("tests failed"));
        assert_eq!(status.tasks.get("1").unwrap().status, TaskStatus::Pass);
        assert_eq!(step(&fx).await, StepOutcome::Idle { phase: Phase::Failed });

        let report = fx.machine.reset("auth").await.unwrap();
        assert_eq!(report.from, Phase::Failed);
        assert_eq!(report.unblocked, vec!["2"]);

        let status = fx.machine.status("auth").unwrap();
        assert_eq!(status.state.phase, Phase::Execute);
        assert!(status.state.last_error.is_none());
        assert_eq!(status.tasks.get("1").unwrap().status, TaskStatus::Pass);

        fx.mem
            .executor
            .set_outcome("2", TaskOutcome::Pass(TaskArtifacts::default()));
        assert_eq!(
            step(&fx).await,
            StepOutcome::Transitioned {
                from: Phase::Execute,
                to: Phase::AwaitingReview
            }
        );
        // passed tasks are not dispatched again
        let executed = fx.mem.executor.executed();
        assert_eq!(executed.iter().filter(|id| *id == "1").count(), 1);
        assert_eq!(executed.iter().filter(|id| *id == "2").count(), 2);
    }

    #[tokio::test]
    async fn test_changes_requested_loops_back_without_republishing() {
        let fx = fixture();
        step(&fx).await;
        step(&fx).await;
        fx.mem.review.script(
            "1",
            vec![ReviewSnapshot {
                decision: ReviewDecision::ChangesRequested,
                blocking_count: 2,
            }],
        );
        step(&fx).await;
        assert_eq!(
            step(&fx).await,
            StepOutcome::Transitioned {
                from: Phase::ReviewProcessing,
                to: Phase::Execute
            }
        );

        let state = fx.machine.status("auth").unwrap().state;
        assert_eq!(state.review_cycles, 1);
        assert_eq!(
            state.execution.review_fix,
            Some(ReviewFix {
                cycle: 1,
                blocking_count: 2,
                resolved: false
            })
        );
        assert_eq!(state.pull_request_ref.as_deref(), Some("1"));

        assert_eq!(
            step(&fx).await,
            StepOutcome::Transitioned {
                from: Phase::Execute,
                to: Phase::AwaitingReview
            }
        );
        assert_eq!(fx.mem.executor.feedback_calls(), 1);
        assert_eq!(fx.mem.publisher.published().len(), 1);
        let state = fx.machine.status("auth").unwrap().state;
        assert_eq!(state.review_status.poll_count, 0);

        fx.mem.review.script("1", vec![approved()]);
        step(&fx).await;
        step(&fx).await;
        step(&fx).await;
        let state = fx.machine.status("auth").unwrap().state;
        assert_eq!(state.history[0].review_cycles, 1);
        assert_eq!(state.review_cycles, 0);
    }

    #[tokio::test]
    async fn test_verdict_on_earlier_push_does_not_count_again() {
        let fx = fixture();
        step(&fx).await;
        step(&fx).await;
        // The reviewer never revisits: the same verdict stays on the change-set.
        fx.mem.review.script(
            "1",
            vec![ReviewSnapshot {
                decision: ReviewDecision::ChangesRequested,
                blocking_count: 1,
            }],
        );
        step(&fx).await;
        step(&fx).await;
        assert_eq!(phase(&fx), Phase::Execute);
        assert_eq!(
            step(&fx).await,
            StepOutcome::Transitioned {
                from: Phase::Execute,
                to: Phase::AwaitingReview
            }
        );

        for _ in 0..2 {
            let outcome = step(&fx).await;
            assert!(matches!(
                outcome,
                StepOutcome::Waiting {
                    phase: Phase::AwaitingReview,
                    ..
                }
            ));
        }
        let state = fx.machine.status("auth").unwrap().state;
        assert_eq!(state.phase, Phase::AwaitingReview);
        assert_eq!(state.review_cycles, 1);
        assert_eq!(state.review_status.decision, Some(ReviewDecision::Pending));
        assert!(state.review_status.reviews_since.is_some());
        assert_eq!(fx.mem.executor.feedback_calls(), 1);
    }

    #[tokio::test]
    async fn test_review_fix_waits_for_operator_without_executor() {
        let fx = build(five_tasks(), MemoryServices::new("main"), false);
        step(&fx).await;
        for id in ["1", "2", "3"] {
            fx.machine
                .complete_task("auth", id, TaskArtifacts::default())
                .unwrap();
        }
        step(&fx).await;
        fx.mem.review.script(
            "1",
            vec![ReviewSnapshot {
                decision: ReviewDecision::ChangesRequested,
                blocking_count: 1,
            }],
        );
        step(&fx).await;
        step(&fx).await;
        assert_eq!(phase(&fx), Phase::Execute);

        assert!(matches!(step(&fx).await, StepOutcome::Waiting { .. }));
        assert!(fx.machine.resolve_review_fix("auth").unwrap());
        assert!(!fx.machine.resolve_review_fix("auth").unwrap());
        assert_eq!(
            step(&fx).await,
            StepOutcome::Transitioned {
                from: Phase::Execute,
                to: Phase::AwaitingReview
            }
        );
    }

    #[tokio::test]
    async fn test_external_completion_of_tasks() {
        let fx = build(five_tasks(), MemoryServices::new("main"), false);
        step(&fx).await;

        match step(&fx).await {
            StepOutcome::Waiting { reason, .. } => assert!(reason.contains("0 of 3")),
            other => panic!("Expected Waiting, got {:?}", other),
        }

        let err = fx
            .machine
            .complete_task("auth", "4", TaskArtifacts::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::TaskNotInWave { wave: 1, .. }));

        for id in ["1", "2"] {
            fx.machine
                .complete_task("auth", id, TaskArtifacts::default())
                .unwrap();
        }
        assert!(matches!(step(&fx).await, StepOutcome::Waiting { .. }));

        fx.machine
            .complete_task("auth", "3", TaskArtifacts::default())
            .unwrap();
        assert_eq!(
            step(&fx).await,
            StepOutcome::Transitioned {
                from: Phase::Execute,
                to: Phase::AwaitingReview
            }
        );

        let err = fx
            .machine
            .block_task("auth", "4", "no longer needed")
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotExecuting { .. }));
    }

    #[tokio::test]
    async fn test_operator_block_fails_on_next_step() {
        let fx = build(five_tasks(), MemoryServices::new("main"), false);
        step(&fx).await;
        fx.machine.block_task("auth", "3", "needs a design call").unwrap();

        assert_eq!(
            step(&fx).await,
            StepOutcome::Transitioned {
                from: Phase::Execute,
                to: Phase::Failed
            }
        );
        let state = fx.machine.status("auth").unwrap().state;
        assert!(state.last_error.unwrap().contains("needs a design call"));
    }

    #[tokio::test]
    async fn test_review_timeout_is_advisory() {
        let fx = fixture();
        step(&fx).await;
        step(&fx).await;

        assert!(matches!(step(&fx).await, StepOutcome::Waiting { .. }));
        assert!(matches!(step(&fx).await, StepOutcome::Waiting { .. }));
        match step(&fx).await {
            StepOutcome::NeedsManualCheck { report } => {
                assert_eq!(report.poll_count, 3);
                assert!(!report.continue_polling);
            }
            other => panic!("Expected NeedsManualCheck, got {:?}", other),
        }

        let state = fx.machine.status("auth").unwrap().state;
        assert_eq!(state.phase, Phase::AwaitingReview);
        assert_eq!(state.review_status.poll_count, 3);

        // A late decision is still honoured.
        fx.mem.review.script("1", vec![approved()]);
        assert!(step(&fx).await.made_progress());
    }

    #[tokio::test]
    async fn test_merge_failure_keeps_ready_to_merge() {
        let fx = fixture();
        step(&fx).await;
        step(&fx).await;
        fx.mem.review.script("1", vec![approved()]);
        step(&fx).await;
        step(&fx).await;

        fx.mem.publisher.fail_merges(true);
        let err = fx.machine.step("auth").await.unwrap_err();
        assert!(matches!(err, PipelineError::Service(_)));
        let state = fx.machine.status("auth").unwrap().state;
        assert_eq!(state.phase, Phase::ReadyToMerge);
        assert!(state.history.is_empty());

        fx.mem.publisher.fail_merges(false);
        assert!(step(&fx).await.made_progress());
        assert_eq!(phase(&fx), Phase::Execute);
    }

    #[tokio::test]
    async fn test_push_failure_keeps_execute() {
        let fx = fixture();
        step(&fx).await;

        fx.mem.vcs.fail_pushes(true);
        assert!(fx.machine.step("auth").await.is_err());
        let status = fx.machine.status("auth").unwrap();
        assert_eq!(status.state.phase, Phase::Execute);
        assert_eq!(status.wave_progress(), (3, 3));

        fx.mem.vcs.fail_pushes(false);
        assert!(step(&fx).await.made_progress());
        assert_eq!(phase(&fx), Phase::AwaitingReview);
    }

    #[tokio::test]
    async fn test_missing_predecessor_symbol_blocks_dependent() {
        let tasks = vec![
            Task::new("1", "Schema", &[]),
            Task::new("2", "API", &["1"]).expecting(&["Schema"]),
        ];
        let fx = build(tasks, MemoryServices::new("main"), true);
        fx.mem.executor.set_outcome(
            "1",
            TaskOutcome::Pass(TaskArtifacts {
                exports_added: vec!["Schema".into()],
                ..Default::default()
            }),
        );

        step(&fx).await;
        deliver_wave(&fx, "1").await;

        // The ledger says Schema exists but the codebase does not have it.
        assert_eq!(
            step(&fx).await,
            StepOutcome::Transitioned {
                from: Phase::Execute,
                to: Phase::Failed
            }
        );
        let status = fx.machine.status("auth").unwrap();
        assert_eq!(status.tasks.get("2").unwrap().status, TaskStatus::Blocked);
        assert!(status.state.last_error.unwrap().contains("Schema"));
        assert!(!fx.mem.executor.executed().contains(&"2".to_string()));
    }

    /// Operator-driven run: task 1 claims Schema, which the codebase lacks.
    async fn operator_delivers_unverified_schema() -> Fixture {
        let tasks = vec![
            Task::new("1", "Schema", &[]),
            Task::new("2", "API", &["1"]).expecting(&["Schema"]),
        ];
        let fx = build(tasks, MemoryServices::new("main"), false);
        step(&fx).await;
        assert!(matches!(step(&fx).await, StepOutcome::Waiting { .. }));
        fx.machine
            .complete_task(
                "auth",
                "1",
                TaskArtifacts {
                    exports_added: vec!["Schema".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        deliver_wave(&fx, "1").await;
        assert_eq!(phase(&fx), Phase::Execute);
        fx
    }

    #[tokio::test]
    async fn test_missing_predecessor_symbol_blocks_dependent_without_executor() {
        let fx = operator_delivers_unverified_schema().await;

        assert_eq!(
            step(&fx).await,
            StepOutcome::Transitioned {
                from: Phase::Execute,
                to: Phase::Failed
            }
        );
        let status = fx.machine.status("auth").unwrap();
        assert_eq!(status.tasks.get("2").unwrap().status, TaskStatus::Blocked);
        assert!(status.state.last_error.unwrap().contains("Schema"));
    }

    #[tokio::test]
    async fn test_complete_task_refuses_unverified_dependencies() {
        let fx = operator_delivers_unverified_schema().await;

        let err = fx
            .machine
            .complete_task("auth", "2", TaskArtifacts::default())
            .unwrap_err();
        assert!(matches!(
            &err,
            PipelineError::UnverifiedDependencies { task, reason }
                if task == "2" && reason.contains("Schema")
        ));
        let status = fx.machine.status("auth").unwrap();
        assert_eq!(status.tasks.get("2").unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_verified_predecessor_symbol_lets_dependent_run() {
        let tasks = vec![
            Task::new("1", "Schema", &[]),
            Task::new("2", "API", &["1"]).expecting(&["Schema"]),
        ];
        let mut mem = MemoryServices::new("main");
        mem.symbols = Arc::new(MemorySymbols::new(&["Schema"]));
        let fx = build(tasks, mem, true);
        fx.mem.executor.set_outcome(
            "1",
            TaskOutcome::Pass(TaskArtifacts {
                exports_added: vec!["Schema".into()],
                ..Default::default()
            }),
        );

        step(&fx).await;
        deliver_wave(&fx, "1").await;

        assert_eq!(
            step(&fx).await,
            StepOutcome::Transitioned {
                from: Phase::Execute,
                to: Phase::AwaitingReview
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_document_requires_recover() {
        let fx = fixture();
        step(&fx).await;

        let store = fx.machine.store();
        let mut doc = store.load("auth").unwrap();
        doc.phase = Phase::AwaitingReview;
        std::fs::write(
            store.state_path("auth"),
            serde_json::to_vec_pretty(&doc).unwrap(),
        )
        .unwrap();

        let err = fx.machine.step("auth").await.unwrap_err();
        assert!(matches!(err, PipelineError::Store(StoreError::Invalid { .. })));

        // Recovering into a phase the document cannot support is refused.
        let before = std::fs::read(store.state_path("auth")).unwrap();
        assert!(fx.machine.recover("auth", Phase::ReadyToMerge).is_err());
        assert_eq!(std::fs::read(store.state_path("auth")).unwrap(), before);

        let recovered = fx.machine.recover("auth", Phase::Execute).unwrap();
        assert_eq!(recovered.phase, Phase::Execute);
        assert_eq!(recovered.wave_branch.as_deref(), Some("feature/auth-wave-1"));
        assert!(step(&fx).await.made_progress());
    }

    #[tokio::test]
    async fn test_concurrent_invocation_is_refused() {
        let fx = fixture();
        let _held = fx.machine.store().lock("auth").unwrap();

        let err = fx.machine.step("auth").await.unwrap_err();
        assert!(matches!(err, PipelineError::Store(StoreError::Locked { .. })));
    }

    #[tokio::test]
    async fn test_reset_refuses_completed_pipeline() {
        let fx = build(
            vec![Task::new("1", "only", &[])],
            MemoryServices::new("main"),
            true,
        );
        step(&fx).await;
        deliver_wave(&fx, "1").await;
        assert_eq!(phase(&fx), Phase::Completed);

        let err = fx.machine.reset("auth").await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Transition(TransitionError::Terminal { .. })
        ));
    }
}
