//! Task record and its status machine.

use std::collections::BTreeSet;

use nutype::nutype;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{AgentId, Capability, TaskId, Timestamp};

/// Human-readable task name.
#[nutype(
    validate(len_char_min = 1, len_char_max = 200),
    derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display, TryFrom, Into)
)]
pub struct TaskName(String);

/// Scheduling priority; larger values are routed first. Bounded so a runaway
/// caller cannot starve the router with an unbounded integer.
#[nutype(
    validate(greater_or_equal = 0, less_or_equal = 10),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 5
)]
pub struct TaskPriority(i32);

impl TaskPriority {
    /// Threshold at and above which the `HighPriority` routing rule fires (§4.4).
    pub const HIGH_PRIORITY_THRESHOLD: i32 = 8;

    /// Whether this priority qualifies for the high-priority routing rule.
    #[must_use]
    pub fn is_high(&self) -> bool {
        self.into_inner() >= Self::HIGH_PRIORITY_THRESHOLD
    }
}

/// Percent complete, clamped to the closed interval `[0, 100]`.
#[nutype(
    validate(less_or_equal = 100),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 0
)]
pub struct Progress(u8);

/// Ceiling on automatic retry attempts for a single task.
#[nutype(
    validate(less_or_equal = 20),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 3
)]
pub struct MaxRetries(u32);

/// Per-task timeout in milliseconds.
#[nutype(
    validate(greater_or_equal = 1000, less_or_equal = 3_600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct TaskTimeoutMs(u64);

impl TaskTimeoutMs {
    /// Converts to a `Duration`.
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }
}

/// Lifecycle state of a task. Transitions are monotonic (I1): once a task
/// reaches a terminal state it never moves again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Waiting in the pending queue, not yet assigned.
    Pending,
    /// Assigned to an agent and being worked.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error the recovery ladder could not resolve.
    Failed,
    /// Cancelled by a caller before completion.
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is one of the three terminal states.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// The outcome recorded once a task reaches a terminal status; mutually
/// exclusive by construction rather than by convention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskOutcome {
    /// Successful result payload, opaque to the engine.
    Result(Value),
    /// Failure reason, surfaced to callers via `GetTask`.
    Error(String),
}

/// An error raised when an illegal task transition is attempted.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task has already reached a terminal state.
    #[error("task {task_id} is already in terminal state {status:?}")]
    AlreadyTerminal {
        /// The task that was mutated.
        task_id: TaskId,
        /// The terminal status it was already in.
        status: TaskStatus,
    },
    /// An `InProgress` transition was attempted without an assigned agent.
    #[error("task {task_id} cannot move to InProgress without an assigned agent")]
    MissingAssignment {
        /// The task that was mutated.
        task_id: TaskId,
    },
    /// The retry counter would exceed `MaxRetries`.
    #[error("task {task_id} has exhausted its {max_retries} retries")]
    RetriesExhausted {
        /// The task that was mutated.
        task_id: TaskId,
        /// The configured retry ceiling.
        max_retries: MaxRetries,
    },
    /// The requested task name failed validation.
    #[error("invalid task name: {reason}")]
    InvalidName {
        /// Why the name was rejected.
        reason: String,
    },
}

/// A unit of work submitted to the engine and tracked through to completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable identity assigned at submission.
    pub id: TaskId,
    /// Human-readable name.
    pub name: TaskName,
    /// Free-form description.
    pub description: Option<String>,
    /// Opaque parameter bag passed through to the worker untouched.
    pub parameters: Value,
    /// Scheduling priority.
    pub priority: TaskPriority,
    /// Capabilities an agent must advertise to be eligible.
    pub required_capabilities: BTreeSet<Capability>,
    /// Optional per-task timeout.
    pub timeout: Option<TaskTimeoutMs>,
    /// Retry ceiling for this task.
    pub max_retries: MaxRetries,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Percent complete as last reported by the assigned worker.
    pub progress: Progress,
    /// Agent currently holding this task, if any.
    pub assigned_agent_id: Option<AgentId>,
    /// Number of automatic retries already attempted.
    pub retry_count: u32,
    /// Terminal outcome, set only once `status` is terminal.
    pub outcome: Option<TaskOutcome>,
    /// Submission time.
    pub created_at: Timestamp,
    /// Last mutation time.
    pub updated_at: Timestamp,
    /// When the task reached a terminal status, if it has.
    pub completed_at: Option<Timestamp>,
}

/// Parameters accepted by `SubmitTask` (§6.1).
#[derive(Debug, Clone, Default)]
pub struct NewTaskRequest {
    /// Human-readable name.
    pub name: String,
    /// Free-form description.
    pub description: Option<String>,
    /// Scheduling priority; defaults to `TaskPriority::default()` when absent.
    pub priority: Option<TaskPriority>,
    /// Opaque parameter bag.
    pub parameters: Option<Value>,
    /// Required capabilities.
    pub required_capabilities: BTreeSet<Capability>,
    /// Per-task timeout.
    pub timeout: Option<TaskTimeoutMs>,
    /// Retry ceiling; defaults to `MaxRetries::default()` when absent.
    pub max_retries: Option<MaxRetries>,
}

impl Task {
    /// Constructs a fresh `Pending` task from a submission request.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` fails `TaskName`'s validation.
    pub fn try_new(id: TaskId, request: NewTaskRequest) -> Result<Self, TaskError> {
        let name = TaskName::try_new(request.name).map_err(|e| TaskError::InvalidName {
            reason: e.to_string(),
        })?;
        let now = Timestamp::now();
        Ok(Self {
            id,
            name,
            description: request.description,
            parameters: request.parameters.unwrap_or(Value::Null),
            priority: request.priority.unwrap_or_default(),
            required_capabilities: request.required_capabilities,
            timeout: request.timeout,
            max_retries: request.max_retries.unwrap_or_default(),
            status: TaskStatus::Pending,
            progress: Progress::default(),
            assigned_agent_id: None,
            retry_count: 0,
            outcome: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        })
    }

    fn ensure_not_terminal(&self) -> Result<(), TaskError> {
        if self.status.is_terminal() {
            return Err(TaskError::AlreadyTerminal {
                task_id: self.id,
                status: self.status,
            });
        }
        Ok(())
    }

    /// Assigns the task to `agent_id` and moves it to `InProgress`.
    ///
    /// # Errors
    ///
    /// Returns an error if the task has already reached a terminal state.
    pub fn assign(&mut self, agent_id: AgentId) -> Result<(), TaskError> {
        self.ensure_not_terminal()?;
        self.assigned_agent_id = Some(agent_id);
        self.status = TaskStatus::InProgress;
        self.updated_at = Timestamp::now();
        Ok(())
    }

    /// Clears the assignment and returns the task to `Pending`, used when its
    /// agent disconnects mid-flight (§4.4 disconnect handling).
    ///
    /// # Errors
    ///
    /// Returns an error if the task has already reached a terminal state.
    pub fn release_for_reassignment(&mut self) -> Result<(), TaskError> {
        self.ensure_not_terminal()?;
        self.assigned_agent_id = None;
        self.status = TaskStatus::Pending;
        self.updated_at = Timestamp::now();
        Ok(())
    }

    /// Records a progress update from the assigned worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the task has already reached a terminal state.
    pub fn update_progress(&mut self, progress: Progress) -> Result<(), TaskError> {
        self.ensure_not_terminal()?;
        self.progress = progress;
        self.updated_at = Timestamp::now();
        Ok(())
    }

    /// Finalizes the task as `Completed` with `result`.
    ///
    /// # Errors
    ///
    /// Returns an error if the task has already reached a terminal state.
    pub fn complete(&mut self, result: Value) -> Result<(), TaskError> {
        self.ensure_not_terminal()?;
        self.status = TaskStatus::Completed;
        self.progress = Progress::try_new(100).unwrap_or_default();
        self.outcome = Some(TaskOutcome::Result(result));
        let now = Timestamp::now();
        self.updated_at = now;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Finalizes the task as `Failed` with `reason`.
    ///
    /// # Errors
    ///
    /// Returns an error if the task has already reached a terminal state.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TaskError> {
        self.ensure_not_terminal()?;
        self.status = TaskStatus::Failed;
        self.outcome = Some(TaskOutcome::Error(reason.into()));
        let now = Timestamp::now();
        self.updated_at = now;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Finalizes the task as `Cancelled`.
    ///
    /// # Errors
    ///
    /// Returns an error if the task has already reached a terminal state.
    pub fn cancel(&mut self) -> Result<(), TaskError> {
        self.ensure_not_terminal()?;
        self.status = TaskStatus::Cancelled;
        let now = Timestamp::now();
        self.updated_at = now;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Increments the retry counter, returning the new count.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::RetriesExhausted` when incrementing would exceed
    /// `max_retries` (I5): the caller is expected to transition the task to
    /// `Failed` instead.
    pub fn increment_retry(&mut self) -> Result<u32, TaskError> {
        if self.retry_count >= self.max_retries.into_inner() {
            return Err(TaskError::RetriesExhausted {
                task_id: self.id,
                max_retries: self.max_retries,
            });
        }
        self.retry_count += 1;
        self.updated_at = Timestamp::now();
        Ok(self.retry_count)
    }

    /// Whether `retry_count` has reached `max_retries` (I5 boundary).
    #[must_use]
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        Task::try_new(
            TaskId::generate(),
            NewTaskRequest {
                name: "do-thing".to_string(),
                max_retries: Some(MaxRetries::try_new(2).unwrap()),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn priority_high_threshold() {
        assert!(TaskPriority::try_new(8).unwrap().is_high());
        assert!(!TaskPriority::try_new(7).unwrap().is_high());
    }

    #[test]
    fn new_task_starts_pending_without_assignment() {
        let task = sample_task();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assigned_agent_id.is_none());
    }

    #[test]
    fn assign_moves_to_in_progress_with_agent_set() {
        let mut task = sample_task();
        let agent = AgentId::generate();
        task.assign(agent).unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assigned_agent_id, Some(agent));
    }

    #[test]
    fn completed_task_rejects_further_transitions() {
        let mut task = sample_task();
        task.assign(AgentId::generate()).unwrap();
        task.complete(Value::Null).unwrap();
        assert!(task.completed_at.is_some());
        let err = task.assign(AgentId::generate()).unwrap_err();
        assert!(matches!(err, TaskError::AlreadyTerminal { .. }));
    }

    #[test]
    fn retry_counter_refuses_to_exceed_max_retries() {
        let mut task = sample_task();
        task.increment_retry().unwrap();
        task.increment_retry().unwrap();
        assert!(task.retries_exhausted());
        let err = task.increment_retry().unwrap_err();
        assert!(matches!(err, TaskError::RetriesExhausted { .. }));
    }

    #[test]
    fn release_for_reassignment_clears_agent_and_reopens_task() {
        let mut task = sample_task();
        task.assign(AgentId::generate()).unwrap();
        task.release_for_reassignment().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assigned_agent_id.is_none());
    }

    #[test]
    fn task_record_round_trips_through_json() {
        let task = sample_task();
        let json = serde_json::to_string(&task).unwrap();
        let restored: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.id, task.id);
        assert_eq!(restored.required_capabilities, task.required_capabilities);
    }
}
