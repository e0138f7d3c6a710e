//! Task, step and result records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::controller::RecoveryState;
use crate::device::PrimitiveAction;
use crate::error::ErrorKind;
use crate::reasoning::ActionProposal;
use crate::validator::Verdict;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Aborted
        )
    }

    /// Allowed moves: Pending -> Running -> terminal, plus Pending -> Aborted
    /// for a task cancelled before it starts.
    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::Running) => true,
            (TaskStatus::Pending, TaskStatus::Aborted) => true,
            (TaskStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Running => "Running",
            TaskStatus::Succeeded => "Succeeded",
            TaskStatus::Failed => "Failed",
            TaskStatus::Aborted => "Aborted",
        };
        f.write_str(s)
    }
}

/// How an executed proposal ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Every primitive was dispatched
    Applied { primitives: Vec<PrimitiveAction> },
    /// Execution failed; `primitives` lists what reached the device before
    Failed {
        kind: ErrorKind,
        reason: String,
        primitives: Vec<PrimitiveAction>,
    },
    /// Cancelled while executing; the device may have received part of it
    Interrupted,
}

impl StepOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, StepOutcome::Applied { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            StepOutcome::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Record of one loop iteration. Never changed once appended to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    /// Snapshot the proposal was planned against, nil when none was captured
    pub snapshot_id: Uuid,
    /// `None` when the iteration failed before an action was proposed
    pub proposal: Option<ActionProposal>,
    pub outcome: StepOutcome,
    pub verdict: Option<Verdict>,
    pub timestamp: DateTime<Utc>,
}

impl Step {
    /// One line for history and summaries
    pub fn describe(&self) -> String {
        let outcome = match &self.outcome {
            StepOutcome::Applied { .. } => "applied".to_string(),
            StepOutcome::Failed { kind, reason, .. } => format!("failed ({}: {})", kind, reason),
            StepOutcome::Interrupted => "interrupted".to_string(),
        };
        let action = match &self.proposal {
            Some(proposal) => proposal.to_string(),
            None => "no action".to_string(),
        };
        match self.verdict {
            Some(verdict) => format!(
                "#{} {} -> {}, verdict {}",
                self.index + 1,
                action,
                outcome,
                verdict
            ),
            None => format!("#{} {} -> {}", self.index + 1, action, outcome),
        }
    }
}

/// A failure the planner should know about when choosing the next action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureNote {
    pub kind: ErrorKind,
    pub reason: String,
}

impl fmt::Display for FailureNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

/// A task under the control of one recovery controller
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    id: Uuid,
    instruction: String,
    created_at: DateTime<Utc>,
    status: TaskStatus,
    steps: Vec<Step>,
}

impl Task {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            instruction: instruction.into(),
            created_at: Utc::now(),
            status: TaskStatus::Pending,
            steps: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Move to `next` if the transition is allowed; returns whether it moved
    pub fn advance(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_advance_to(next) {
            tracing::warn!(task_id = %self.id, from = %self.status, to = %next, "rejected status transition");
            return false;
        }
        self.status = next;
        true
    }

    /// Append a step, assigning its index
    pub fn record(
        &mut self,
        snapshot_id: Uuid,
        proposal: Option<ActionProposal>,
        outcome: StepOutcome,
        verdict: Option<Verdict>,
    ) -> &Step {
        let index = self.steps.len();
        self.steps.push(Step {
            index,
            snapshot_id,
            proposal,
            outcome,
            verdict,
            timestamp: Utc::now(),
        });
        &self.steps[index]
    }

    pub(crate) fn into_steps(self) -> Vec<Step> {
        self.steps
    }
}

/// Why a task was aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    Cancelled,
    IterationLimit,
}

/// Final outcome of [`crate::run_task`]; always terminal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub instruction: String,
    pub status: TaskStatus,
    pub steps: Vec<Step>,
    pub summary: String,
    pub last_error: Option<ErrorKind>,
    pub abort_reason: Option<AbortReason>,
    pub recovery: RecoveryState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }

    pub fn last_step(&self) -> Option<&Step> {
        self.steps.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::KeyCode;

    #[test]
    fn test_status_is_monotonic() {
        let mut task = Task::new("open settings");
        assert!(!task.advance(TaskStatus::Succeeded));
        assert!(task.advance(TaskStatus::Running));
        assert!(!task.advance(TaskStatus::Pending));
        assert!(task.advance(TaskStatus::Failed));
        assert!(!task.advance(TaskStatus::Running));
        assert!(!task.advance(TaskStatus::Succeeded));
        assert_eq!(task.status(), TaskStatus::Failed);
    }

    #[test]
    fn test_record_assigns_indices() {
        let mut task = Task::new("go back");
        let snap = Uuid::new_v4();
        let proposal = ActionProposal::KeyPress { key: KeyCode::Back };
        task.record(
            snap,
            Some(proposal.clone()),
            StepOutcome::Applied {
                primitives: Vec::new(),
            },
            Some(Verdict::NotYetMet),
        );
        let step = task.record(snap, Some(proposal), StepOutcome::Interrupted, None);
        assert_eq!(step.index, 1);
        assert_eq!(task.steps().len(), 2);
        assert_eq!(
            task.steps()[0].describe(),
            "#1 press BACK -> applied, verdict NotYetMet"
        );
    }

    #[test]
    fn test_planning_failure_step_has_no_action() {
        let mut task = Task::new("open settings");
        let step = task.record(
            Uuid::nil(),
            None,
            StepOutcome::Failed {
                kind: ErrorKind::ProviderMalformedOutput,
                reason: "not json".into(),
                primitives: Vec::new(),
            },
            None,
        );
        assert_eq!(step.outcome.error_kind(), Some(ErrorKind::ProviderMalformedOutput));
        assert_eq!(
            step.describe(),
            "#1 no action -> failed (ProviderMalformedOutput: not json)"
        );
        let json = serde_json::to_value(step).unwrap();
        assert!(json["proposal"].is_null());
    }
}
