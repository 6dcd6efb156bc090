//! Error classification and the recovery-strategy ladder (§3/§4.6).

use serde::{Deserialize, Serialize};

use super::ids::{AgentId, ErrorContextId, TaskId, Timestamp};

/// Category of a failure observed anywhere in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A transport-level send/receive failure.
    Communication,
    /// A task or liveness deadline expired.
    Timeout,
    /// A worker reported a terminal failure for a task.
    TaskFailure,
    /// The router could not find an eligible agent.
    Routing,
    /// A caller-supplied value failed validation.
    Validation,
    /// An internal engine fault unrelated to a specific task or agent.
    System,
    /// A resource (queue, connection slot, memory) was exhausted.
    ResourceExhaustion,
    /// A dependency the engine relies on failed.
    DependencyFailure,
}

/// Severity of an error context, used to pick the retry ceiling and the
/// initial recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorSeverity {
    /// Transient, low-impact.
    Low,
    /// Worth surfacing but not urgent.
    Medium,
    /// Likely to recur or affect other tasks.
    High,
    /// Demands immediate escalation.
    Critical,
}

impl ErrorSeverity {
    /// Classifies severity heuristically from keywords in the error message
    /// (§4.6): critical/fatal/security → Critical; timeout/connection/network
    /// → High; validation/parameter → Medium; else Low.
    #[must_use]
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if ["critical", "fatal", "security"]
            .iter()
            .any(|kw| lower.contains(kw))
        {
            Self::Critical
        } else if ["timeout", "connection", "network"]
            .iter()
            .any(|kw| lower.contains(kw))
        {
            Self::High
        } else if ["validation", "parameter"].iter().any(|kw| lower.contains(kw)) {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// The next action the recovery ladder should take for an error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryStrategy {
    /// Retry the same task, possibly on the same agent.
    Retry,
    /// Reassign the task to a different agent.
    Reassign,
    /// Fall back to a degraded handling path.
    Fallback,
    /// Surface the error as a system-level event.
    Escalate,
    /// Give up; the task is finalized `Failed`.
    Abort,
    /// Trip the agent's circuit breaker.
    CircuitBreaker,
}

impl RecoveryStrategy {
    /// The rung immediately below this one on the fallback ladder
    /// `Reassign → Retry → Fallback → Escalate → Abort` (§4.6).
    #[must_use]
    pub fn advance(self) -> Self {
        match self {
            Self::Reassign => Self::Retry,
            Self::Retry => Self::Fallback,
            Self::Fallback => Self::Escalate,
            Self::Escalate | Self::Abort | Self::CircuitBreaker => Self::Abort,
        }
    }

    /// Selects the initial strategy for a classified error (§4.6 table).
    #[must_use]
    pub fn select(kind: ErrorKind, severity: ErrorSeverity) -> Self {
        match kind {
            ErrorKind::Communication | ErrorKind::Timeout => Self::Reassign,
            ErrorKind::TaskFailure if severity == ErrorSeverity::Critical => Self::Escalate,
            ErrorKind::TaskFailure | ErrorKind::Routing => Self::Retry,
            ErrorKind::ResourceExhaustion => Self::CircuitBreaker,
            ErrorKind::Validation | ErrorKind::System | ErrorKind::DependencyFailure => Self::Retry,
        }
    }
}

/// Per-type retry ceiling, overridden to `1` for `Critical` severity
/// regardless of type (§4.6).
#[must_use]
pub fn max_retries_for(kind: ErrorKind, severity: ErrorSeverity, config_default: u32) -> u32 {
    if severity == ErrorSeverity::Critical {
        return 1;
    }
    match kind {
        ErrorKind::Communication => 5,
        ErrorKind::Timeout => 3,
        ErrorKind::TaskFailure => 2,
        _ => config_default,
    }
}

/// Exponential backoff delays in milliseconds, clamped at the final entry
/// (§4.6): `[1s, 2s, 5s, 10s]`.
pub const RETRY_BACKOFF_MS: [u64; 4] = [1_000, 2_000, 5_000, 10_000];

/// Looks up the backoff delay for `attempt` (0-indexed), clamping to the
/// longest configured delay once `attempt` runs past the table.
#[must_use]
pub fn backoff_delay_ms(attempt: usize) -> u64 {
    RETRY_BACKOFF_MS[attempt.min(RETRY_BACKOFF_MS.len() - 1)]
}

/// A single classified failure, tracked by the error handler until resolved
/// or finalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Identity of this error context.
    pub id: ErrorContextId,
    /// The task this error pertains to, if any.
    pub task_id: Option<TaskId>,
    /// The agent this error pertains to, if any.
    pub agent_id: Option<AgentId>,
    /// Category of the failure.
    pub kind: ErrorKind,
    /// Severity, classified from `message`.
    pub severity: ErrorSeverity,
    /// Human-readable summary.
    pub message: String,
    /// Free-form structured detail.
    pub details: Option<String>,
    /// When the error was recorded.
    pub timestamp: Timestamp,
    /// Recovery attempts made so far.
    pub retry_count: u32,
    /// Retry ceiling for this context.
    pub max_retries: u32,
    /// Current position on the recovery ladder.
    pub recovery_strategy: RecoveryStrategy,
    /// Whether recovery has concluded (success or abort).
    pub resolved: bool,
    /// When `resolved` became true.
    pub resolved_at: Option<Timestamp>,
}

impl ErrorContext {
    /// Classifies and records a new error context.
    #[must_use]
    pub fn new(
        id: ErrorContextId,
        task_id: Option<TaskId>,
        agent_id: Option<AgentId>,
        kind: ErrorKind,
        message: impl Into<String>,
        details: Option<String>,
        config_default_max_retries: u32,
    ) -> Self {
        let message = message.into();
        let severity = ErrorSeverity::classify(&message);
        let recovery_strategy = RecoveryStrategy::select(kind, severity);
        let max_retries = max_retries_for(kind, severity, config_default_max_retries);
        Self {
            id,
            task_id,
            agent_id,
            kind,
            severity,
            message,
            details,
            timestamp: Timestamp::now(),
            retry_count: 0,
            max_retries,
            recovery_strategy,
            resolved: false,
            resolved_at: None,
        }
    }

    /// Whether this context has exhausted its retry ceiling.
    #[must_use]
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Advances the recovery strategy down the fallback ladder.
    pub fn advance_strategy(&mut self) {
        self.recovery_strategy = self.recovery_strategy.advance();
    }

    /// Marks this context resolved, stamping `resolved_at`.
    pub fn resolve(&mut self) {
        self.resolved = true;
        self.resolved_at = Some(Timestamp::now());
    }
}
