//! The recovery controller: the perceive, plan, act, validate loop.
//!
//! All failure handling lives in the transition table below; collaborators
//! only report typed errors.
//!
//! | From | Event | To |
//! |------|-------|----|
//! | Idle | start | Perceiving |
//! | Perceiving | iteration ceiling reached | Aborted |
//! | Perceiving | snapshot | Planning |
//! | Perceiving | bridge error, retries left | Perceiving |
//! | Perceiving | bridge error, retries exhausted | Failed |
//! | Planning | action | Executing |
//! | Planning | done(success) | Succeeded |
//! | Planning | done(failure) | Failed |
//! | Planning | transient provider error, retries left | Planning |
//! | Planning | malformed output, budget left | Planning |
//! | Planning | retries or budget exhausted | Failed |
//! | Planning | iteration ceiling reached | Aborted |
//! | Executing | applied | Validating |
//! | Executing | device unavailable | Perceiving |
//! | Executing | other failure, budget left | Planning |
//! | Executing | other failure, budget exhausted | Failed |
//! | Validating | goal met | Succeeded |
//! | Validating | not yet met | Perceiving |
//! | Validating | ambiguous, budget left | Planning |
//! | Validating | ambiguous, budget exhausted | Failed |
//! | any | cancelled | Aborted |

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{self, Config};
use crate::device::{DeviceLease, PrimitiveAction};
use crate::error::{ConfigError, ErrorKind, PlanError};
use crate::executor::ActionExecutor;
use crate::perception::{Snapshot, SnapshotBuilder};
use crate::reasoning::{ActionProposal, PlanRequest, Planner};
use crate::task::{AbortReason, FailureNote, Step, StepOutcome, Task, TaskResult, TaskStatus};
use crate::validator::{ResultValidator, ScreenDiffValidator, ValidationRequest, Verdict};

/// Failures kept as planner context
const MAX_FAILURE_NOTES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoopState {
    Idle,
    Perceiving,
    Planning,
    Executing,
    Validating,
    Succeeded,
    Failed,
    Aborted,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LoopState::Succeeded | LoopState::Failed | LoopState::Aborted
        )
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-task counters, owned by the controller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryState {
    pub consecutive_failures: u32,
    pub total_iterations: u32,
    pub last_error: Option<ErrorKind>,
    pub perceive_retries: u32,
    pub plan_retries: u32,
}

/// Loop ceilings and timeouts
#[derive(Debug, Clone, PartialEq)]
pub struct LoopConfig {
    pub max_perceive_retries: u32,
    pub max_plan_retries: u32,
    pub max_consecutive_failures: u32,
    pub max_total_iterations: u32,
    /// Bounds each action and each device capture
    pub action_timeout: Duration,
    /// Bounds each planning call
    pub plan_timeout: Duration,
    pub validation_timeout: Duration,
    /// Pause between an action and the observation of its effect
    pub settle_delay: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::from_config(config::get())
    }
}

impl LoopConfig {
    pub fn from_config(config: &Config) -> Self {
        let limits = &config.limits;
        Self {
            max_perceive_retries: limits.max_perceive_retries,
            max_plan_retries: limits.max_plan_retries,
            max_consecutive_failures: limits.max_consecutive_failures,
            max_total_iterations: limits.max_total_iterations,
            action_timeout: limits.action_timeout,
            plan_timeout: limits.plan_timeout,
            validation_timeout: limits.validation_timeout,
            settle_delay: Duration::from_millis(config.device.settle_delay_ms),
        }
    }

    pub fn max_perceive_retries(mut self, n: u32) -> Self {
        self.max_perceive_retries = n;
        self
    }

    pub fn max_plan_retries(mut self, n: u32) -> Self {
        self.max_plan_retries = n;
        self
    }

    pub fn max_consecutive_failures(mut self, n: u32) -> Self {
        self.max_consecutive_failures = n;
        self
    }

    pub fn max_total_iterations(mut self, n: u32) -> Self {
        self.max_total_iterations = n;
        self
    }

    pub fn action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    pub fn plan_timeout(mut self, timeout: Duration) -> Self {
        self.plan_timeout = timeout;
        self
    }

    pub fn validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = timeout;
        self
    }

    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Retry counts may be zero; ceilings and timeouts may not
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::Zero("max_consecutive_failures"));
        }
        if self.max_total_iterations == 0 {
            return Err(ConfigError::Zero("max_total_iterations"));
        }
        if self.action_timeout.is_zero() {
            return Err(ConfigError::Zero("action_timeout"));
        }
        if self.plan_timeout.is_zero() {
            return Err(ConfigError::Zero("plan_timeout"));
        }
        if self.validation_timeout.is_zero() {
            return Err(ConfigError::Zero("validation_timeout"));
        }
        Ok(())
    }
}

/// Observable progress of a running task
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// The loop moved between states; `recovery` is the state after the move
    Transition {
        task_id: Uuid,
        from: LoopState,
        to: LoopState,
        recovery: RecoveryState,
    },
    /// A snapshot was taken
    Snapshot(Arc<Snapshot>),
    /// A step was appended to the task
    Step(Step),
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

pub struct RecoveryControllerBuilder {
    lease: DeviceLease,
    planner: Planner,
    validator: Option<Arc<dyn ResultValidator>>,
    config: Option<LoopConfig>,
    on_progress: Option<ProgressCallback>,
}

impl RecoveryControllerBuilder {
    pub fn validator(mut self, validator: Arc<dyn ResultValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn config(mut self, config: LoopConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Result<RecoveryController, ConfigError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        Ok(RecoveryController {
            lease: self.lease,
            planner: self.planner.timeout(config.plan_timeout),
            validator: self
                .validator
                .unwrap_or_else(|| Arc::new(ScreenDiffValidator::new())),
            executor: ActionExecutor::new(config.action_timeout),
            snapshots: SnapshotBuilder::new(config.action_timeout),
            config,
            on_progress: self.on_progress,
        })
    }
}

/// Drives one task on one leased device
pub struct RecoveryController {
    lease: DeviceLease,
    planner: Planner,
    validator: Arc<dyn ResultValidator>,
    executor: ActionExecutor,
    snapshots: SnapshotBuilder,
    config: LoopConfig,
    on_progress: Option<ProgressCallback>,
}

impl RecoveryController {
    pub fn builder(lease: DeviceLease, planner: Planner) -> RecoveryControllerBuilder {
        RecoveryControllerBuilder {
            lease,
            planner,
            validator: None,
            config: None,
            on_progress: None,
        }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Run `instruction` to a terminal result.
    ///
    /// Consumes the controller, so the device lease is released when the task
    /// ends however it ends.
    pub async fn run_task(
        self,
        instruction: impl Into<String>,
        cancel: CancellationToken,
    ) -> TaskResult {
        let task = Task::new(instruction);
        let span = tracing::info_span!("task", task_id = %task.id(), device = %self.lease.device());
        let run = TaskRun {
            ctl: &self,
            cancel,
            task,
            state: LoopState::Idle,
            recovery: RecoveryState::default(),
            failures: Vec::new(),
            current: None,
            fresh: None,
            pending: None,
            applied: None,
            summary: None,
            abort_reason: None,
        };
        run.drive().instrument(span).await
    }
}

/// Run a task with the given collaborators.
///
/// Never fails: an invalid configuration yields a `Failed` result.
pub async fn run_task(
    instruction: impl Into<String>,
    config: LoopConfig,
    lease: DeviceLease,
    planner: Planner,
    validator: Arc<dyn ResultValidator>,
    cancel: CancellationToken,
) -> TaskResult {
    let instruction = instruction.into();
    match RecoveryController::builder(lease, planner)
        .validator(validator)
        .config(config)
        .build()
    {
        Ok(controller) => controller.run_task(instruction, cancel).await,
        Err(err) => rejected(instruction, &err.to_string()),
    }
}

fn rejected(instruction: String, reason: &str) -> TaskResult {
    let mut task = Task::new(instruction);
    task.advance(TaskStatus::Running);
    task.advance(TaskStatus::Failed);
    let now = Utc::now();
    TaskResult {
        task_id: task.id(),
        instruction: task.instruction().to_string(),
        status: task.status(),
        steps: Vec::new(),
        summary: format!("invalid configuration: {}", reason),
        last_error: None,
        abort_reason: None,
        recovery: RecoveryState::default(),
        started_at: now,
        finished_at: now,
        duration_ms: 0,
    }
}

/// Mutable state of one run
struct TaskRun<'a> {
    ctl: &'a RecoveryController,
    cancel: CancellationToken,
    task: Task,
    state: LoopState,
    recovery: RecoveryState,
    failures: Vec<FailureNote>,
    /// Snapshot the next plan is made against
    current: Option<Arc<Snapshot>>,
    /// Post-action snapshot reused by the next perception
    fresh: Option<Arc<Snapshot>>,
    pending: Option<ActionProposal>,
    applied: Option<(ActionProposal, Vec<PrimitiveAction>)>,
    summary: Option<String>,
    abort_reason: Option<AbortReason>,
}

impl TaskRun<'_> {
    async fn drive(mut self) -> TaskResult {
        let started_at = Utc::now();
        tracing::info!(instruction = %self.task.instruction(), "task started");

        while !self.state.is_terminal() {
            if self.cancel.is_cancelled() {
                let next = self.cancelled();
                self.transition(next);
                break;
            }
            let next = match self.state {
                LoopState::Idle => LoopState::Perceiving,
                LoopState::Perceiving => self.perceive().await,
                LoopState::Planning => self.plan().await,
                LoopState::Executing => self.execute().await,
                LoopState::Validating => self.validate().await,
                LoopState::Succeeded | LoopState::Failed | LoopState::Aborted => break,
            };
            self.transition(next);
        }

        self.finish(started_at)
    }

    /// Race `fut` against cancellation
    async fn guarded<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            out = fut => Some(out),
        }
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(callback) = &self.ctl.on_progress {
            callback(&event);
        }
    }

    fn transition(&mut self, next: LoopState) {
        let from = self.state;
        if from == LoopState::Idle && next != LoopState::Aborted {
            self.task.advance(TaskStatus::Running);
        }
        match next {
            LoopState::Succeeded => {
                self.task.advance(TaskStatus::Succeeded);
            }
            LoopState::Failed => {
                self.task.advance(TaskStatus::Failed);
            }
            LoopState::Aborted => {
                self.task.advance(TaskStatus::Aborted);
            }
            _ => {}
        }
        self.state = next;

        if from != next {
            tracing::info!(
                from = %from,
                to = %next,
                iteration = self.recovery.total_iterations,
                consecutive_failures = self.recovery.consecutive_failures,
                "state transition"
            );
        }
        self.emit(ProgressEvent::Transition {
            task_id: self.task.id(),
            from,
            to: next,
            recovery: self.recovery.clone(),
        });
    }

    fn cancelled(&mut self) -> LoopState {
        tracing::warn!(state = %self.state, "task cancelled");
        if let Some((proposal, primitives)) = self.applied.take() {
            // The action reached the device but was never judged
            self.record(Some(proposal), StepOutcome::Applied { primitives }, None);
        }
        self.abort_reason = Some(AbortReason::Cancelled);
        LoopState::Aborted
    }

    fn record(
        &mut self,
        proposal: Option<ActionProposal>,
        outcome: StepOutcome,
        verdict: Option<Verdict>,
    ) {
        let snapshot_id = self
            .current
            .as_ref()
            .map(|s| s.id)
            .unwrap_or_else(Uuid::nil);
        let step = self
            .task
            .record(snapshot_id, proposal, outcome, verdict)
            .clone();
        tracing::debug!(step = %step.describe(), "step recorded");
        self.emit(ProgressEvent::Step(step));
    }

    /// Record an iteration that failed before any action was proposed
    fn record_failure(&mut self, kind: ErrorKind, reason: &str) {
        self.record(
            None,
            StepOutcome::Failed {
                kind,
                reason: reason.to_string(),
                primitives: Vec::new(),
            },
            None,
        );
    }

    fn iteration_ceiling_reached(&self) -> bool {
        self.recovery.total_iterations >= self.ctl.config.max_total_iterations
    }

    fn note_failure(&mut self, kind: ErrorKind, reason: String) {
        self.recovery.last_error = Some(kind);
        self.failures.push(FailureNote { kind, reason });
        if self.failures.len() > MAX_FAILURE_NOTES {
            self.failures.remove(0);
        }
    }

    /// Count a non-productive iteration; returns whether the budget is spent
    fn consume_budget(&mut self, kind: ErrorKind, reason: String) -> bool {
        self.recovery.consecutive_failures += 1;
        tracing::warn!(
            kind = %kind,
            reason = %reason,
            consecutive_failures = self.recovery.consecutive_failures,
            max = self.ctl.config.max_consecutive_failures,
            "recoverable failure"
        );
        self.note_failure(kind, reason);
        self.recovery.consecutive_failures >= self.ctl.config.max_consecutive_failures
    }

    fn productive_step(&mut self) {
        self.recovery.consecutive_failures = 0;
        self.failures.clear();
    }

    async fn perceive(&mut self) -> LoopState {
        // Checked here too so a terminal capture failure cannot add a step
        // past the ceiling
        if self.iteration_ceiling_reached() {
            return self.iteration_limit();
        }
        if let Some(snapshot) = self.fresh.take() {
            self.current = Some(snapshot);
            return LoopState::Planning;
        }

        let ctl = self.ctl;
        let bridge = &*ctl.lease;
        let built = match self.guarded(ctl.snapshots.build(bridge)).await {
            None => return self.cancelled(),
            Some(built) => built,
        };

        match built {
            Ok(snapshot) => {
                self.recovery.perceive_retries = 0;
                self.emit(ProgressEvent::Snapshot(Arc::clone(&snapshot)));
                self.current = Some(snapshot);
                LoopState::Planning
            }
            Err(err) => {
                self.recovery.perceive_retries += 1;
                tracing::warn!(
                    error = %err,
                    retries = self.recovery.perceive_retries,
                    max = self.ctl.config.max_perceive_retries,
                    "capture failed"
                );
                self.note_failure(err.kind(), err.to_string());
                if self.recovery.perceive_retries > self.ctl.config.max_perceive_retries {
                    self.record_failure(err.kind(), &err.to_string());
                    self.summary = Some(format!("device could not be observed: {}", err));
                    return LoopState::Failed;
                }
                if self
                    .guarded(tokio::time::sleep(self.ctl.config.settle_delay))
                    .await
                    .is_none()
                {
                    return self.cancelled();
                }
                LoopState::Perceiving
            }
        }
    }

    fn iteration_limit(&mut self) -> LoopState {
        tracing::warn!(max = self.ctl.config.max_total_iterations, "iteration ceiling reached");
        self.abort_reason = Some(AbortReason::IterationLimit);
        LoopState::Aborted
    }

    async fn plan(&mut self) -> LoopState {
        if self.iteration_ceiling_reached() {
            return self.iteration_limit();
        }
        let Some(snapshot) = self.current.clone() else {
            return LoopState::Perceiving;
        };
        self.recovery.total_iterations += 1;

        let request = PlanRequest {
            instruction: self.task.instruction(),
            snapshot: &snapshot,
            history: self.task.steps(),
            recent_failures: &self.failures,
        };
        let proposed = match self.guarded(self.ctl.planner.propose_action(&request)).await {
            None => return self.cancelled(),
            Some(proposed) => proposed,
        };

        match proposed {
            Ok(ActionProposal::Done { success, summary }) => {
                let proposal = ActionProposal::Done {
                    success,
                    summary: summary.clone(),
                };
                self.summary = Some(summary);
                let outcome = StepOutcome::Applied {
                    primitives: Vec::new(),
                };
                if success {
                    self.productive_step();
                    self.record(Some(proposal), outcome, Some(Verdict::GoalMet));
                    LoopState::Succeeded
                } else {
                    self.record(Some(proposal), outcome, None);
                    LoopState::Failed
                }
            }
            Ok(proposal) => {
                tracing::info!(proposal = %proposal, "action proposed");
                self.recovery.plan_retries = 0;
                self.pending = Some(proposal);
                LoopState::Executing
            }
            Err(PlanError::NoProviders) => {
                let reason = PlanError::NoProviders.to_string();
                self.record_failure(ErrorKind::ProviderUnavailable, &reason);
                self.note_failure(ErrorKind::ProviderUnavailable, reason.clone());
                self.summary = Some(reason);
                LoopState::Failed
            }
            Err(err) if err.kind().is_transient() => {
                self.recovery.plan_retries += 1;
                tracing::warn!(
                    error = %err,
                    retries = self.recovery.plan_retries,
                    max = self.ctl.config.max_plan_retries,
                    "planning failed"
                );
                self.record_failure(err.kind(), &err.to_string());
                self.note_failure(err.kind(), err.to_string());
                if self.recovery.plan_retries > self.ctl.config.max_plan_retries {
                    return LoopState::Failed;
                }
                LoopState::Planning
            }
            Err(err) => {
                self.record_failure(err.kind(), &err.to_string());
                if self.consume_budget(err.kind(), err.to_string()) {
                    LoopState::Failed
                } else {
                    LoopState::Planning
                }
            }
        }
    }

    async fn execute(&mut self) -> LoopState {
        let (Some(proposal), Some(snapshot)) = (self.pending.take(), self.current.clone()) else {
            return LoopState::Planning;
        };

        let ctl = self.ctl;
        let bridge = &*ctl.lease;
        let executed = match self
            .guarded(ctl.executor.execute(bridge, &snapshot, &proposal))
            .await
        {
            None => {
                self.record(Some(proposal), StepOutcome::Interrupted, None);
                return self.cancelled();
            }
            Some(executed) => executed,
        };

        match executed {
            Ok(primitives) => {
                self.applied = Some((proposal, primitives));
                LoopState::Validating
            }
            Err(failure) => {
                let kind = failure.kind;
                let reason = failure.reason.clone();
                self.record(
                    Some(proposal),
                    StepOutcome::Failed {
                        kind,
                        reason: failure.reason,
                        primitives: failure.dispatched,
                    },
                    None,
                );
                if kind == ErrorKind::BridgeUnavailable {
                    tracing::warn!(reason = %reason, "device unavailable during action");
                    self.note_failure(kind, reason);
                    self.current = None;
                    return LoopState::Perceiving;
                }
                if self.consume_budget(kind, reason) {
                    return LoopState::Failed;
                }
                self.refresh().await
            }
        }
    }

    /// Re-observe before replanning after a failed action. Keeps the old
    /// snapshot when the device cannot be captured.
    async fn refresh(&mut self) -> LoopState {
        let ctl = self.ctl;
        let bridge = &*ctl.lease;
        match self.guarded(ctl.snapshots.build(bridge)).await {
            None => self.cancelled(),
            Some(Ok(snapshot)) => {
                self.emit(ProgressEvent::Snapshot(Arc::clone(&snapshot)));
                self.current = Some(snapshot);
                LoopState::Planning
            }
            Some(Err(err)) => {
                tracing::debug!(error = %err, "refresh failed, replanning on previous snapshot");
                LoopState::Planning
            }
        }
    }

    async fn validate(&mut self) -> LoopState {
        let Some(before) = self.current.clone() else {
            return LoopState::Perceiving;
        };
        if self.applied.is_none() {
            return LoopState::Perceiving;
        }

        if self
            .guarded(tokio::time::sleep(self.ctl.config.settle_delay))
            .await
            .is_none()
        {
            return self.cancelled();
        }

        let ctl = self.ctl;
        let bridge = &*ctl.lease;
        let after = match self.guarded(ctl.snapshots.build(bridge)).await {
            None => return self.cancelled(),
            Some(Ok(after)) => after,
            Some(Err(err)) => {
                // Applied but unobserved; perception retries bound this
                if let Some((proposal, primitives)) = self.applied.take() {
                    self.record(Some(proposal), StepOutcome::Applied { primitives }, None);
                }
                self.note_failure(err.kind(), err.to_string());
                return LoopState::Perceiving;
            }
        };
        self.emit(ProgressEvent::Snapshot(Arc::clone(&after)));

        let verdict = {
            let Some((proposal, _)) = self.applied.as_ref() else {
                return LoopState::Perceiving;
            };
            let request = ValidationRequest {
                goal: self.task.instruction(),
                proposal,
                before: &before,
                after: &after,
            };
            let judged = timeout(
                self.ctl.config.validation_timeout,
                self.ctl.validator.validate(&request),
            );
            match self.guarded(judged).await {
                None => None,
                Some(Ok(Ok(verdict))) => Some(Ok(verdict)),
                Some(Ok(Err(err))) => Some(Err(err.to_string())),
                Some(Err(_)) => Some(Err(format!(
                    "validation timed out after {:?}",
                    self.ctl.config.validation_timeout
                ))),
            }
        };

        let (verdict, unverified) = match verdict {
            None => return self.cancelled(),
            Some(Ok(verdict)) => (verdict, None),
            Some(Err(reason)) => {
                tracing::warn!(reason = %reason, "validation failed, treating as ambiguous");
                (Verdict::Ambiguous, Some(reason))
            }
        };

        let Some((proposal, primitives)) = self.applied.take() else {
            return LoopState::Perceiving;
        };
        tracing::info!(verdict = %verdict, proposal = %proposal, "action validated");
        self.record(Some(proposal), StepOutcome::Applied { primitives }, Some(verdict));

        match verdict {
            Verdict::GoalMet => {
                self.productive_step();
                LoopState::Succeeded
            }
            Verdict::NotYetMet => {
                self.productive_step();
                self.fresh = Some(after);
                LoopState::Perceiving
            }
            Verdict::Ambiguous => {
                let reason = unverified.unwrap_or_else(|| {
                    "could not confirm progress after the last action".to_string()
                });
                let exhausted = self.consume_budget(ErrorKind::GoalUnverifiable, reason);
                self.current = Some(after);
                if exhausted {
                    LoopState::Failed
                } else {
                    LoopState::Planning
                }
            }
        }
    }

    fn finish(self, started_at: chrono::DateTime<Utc>) -> TaskResult {
        let finished_at = Utc::now();
        let status = self.task.status();
        let steps = self.task.steps().len();
        let summary = match (status, &self.summary) {
            (TaskStatus::Succeeded, Some(s)) if !s.is_empty() => s.clone(),
            (TaskStatus::Succeeded, _) => format!("goal reached after {} step(s)", steps),
            (TaskStatus::Failed, Some(s)) if !s.is_empty() => s.clone(),
            (TaskStatus::Failed, _) => {
                let cause = self
                    .failures
                    .last()
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "no further detail".to_string());
                format!("failed after {} step(s): {}", steps, cause)
            }
            (TaskStatus::Aborted, _) => match self.abort_reason {
                Some(AbortReason::IterationLimit) => format!(
                    "aborted: iteration limit of {} reached after {} step(s)",
                    self.ctl.config.max_total_iterations, steps
                ),
                _ => format!("aborted: cancelled after {} step(s)", steps),
            },
            (other, _) => format!("ended in non-terminal status {}", other),
        };

        tracing::info!(
            status = %status,
            steps,
            iterations = self.recovery.total_iterations,
            last_error = ?self.recovery.last_error,
            "task finished"
        );

        let task_id = self.task.id();
        let instruction = self.task.instruction().to_string();
        TaskResult {
            task_id,
            instruction,
            status,
            steps: self.task.into_steps(),
            summary,
            last_error: self.recovery.last_error,
            abort_reason: self.abort_reason,
            recovery: self.recovery,
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LoopConfig {
        LoopConfig::from_config(&Config::defaults())
    }

    #[test]
    fn test_loop_config_defaults() {
        let config = config();
        assert_eq!(config.max_perceive_retries, 3);
        assert_eq!(config.max_plan_retries, 2);
        assert_eq!(config.max_consecutive_failures, 3);
        assert_eq!(config.max_total_iterations, 50);
        assert_eq!(config.action_timeout, Duration::from_secs(30));
        assert_eq!(config.plan_timeout, Duration::from_secs(60));
        assert_eq!(config.settle_delay, Duration::from_millis(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_loop_config_rejects_zero_ceilings() {
        assert_eq!(
            config().max_consecutive_failures(0).validate(),
            Err(ConfigError::Zero("max_consecutive_failures"))
        );
        assert_eq!(
            config().plan_timeout(Duration::ZERO).validate(),
            Err(ConfigError::Zero("plan_timeout"))
        );
        assert!(config().max_plan_retries(0).validate().is_ok());
    }

    #[test]
    fn test_terminal_states() {
        assert!(LoopState::Aborted.is_terminal());
        assert!(!LoopState::Validating.is_terminal());
        assert_eq!(LoopState::Planning.to_string(), "Planning");
    }
}
