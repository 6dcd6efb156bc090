//! Domain model: the scalar types and records every component reasons about.
//!
//! Submodules are organized one-per-record (`task`, `agent`, `assignment`)
//! plus the cross-cutting pieces (`routing_rule`, `error_context`,
//! `circuit_breaker`) that several components share.

pub mod agent;
pub mod assignment;
pub mod circuit_breaker;
pub mod error_context;
pub mod ids;
pub mod routing_rule;
pub mod task;

pub use agent::{
    Agent, AgentError, AgentName, AgentRegistration, AgentStatus, AgentVersion, MaxConcurrentTasks,
};
pub use assignment::Assignment;
pub use circuit_breaker::{CircuitBreakerMode, CircuitBreakerState};
pub use error_context::{
    backoff_delay_ms, max_retries_for, ErrorContext, ErrorKind, ErrorSeverity, RecoveryStrategy,
    RETRY_BACKOFF_MS,
};
pub use ids::{AgentId, Capability, ConnectionId, ErrorContextId, RoutingRuleId, TaskId, Timestamp};
pub use routing_rule::{default_rules, weighted_score, RoutingContext, RoutingRule};
pub use task::{
    MaxRetries, NewTaskRequest, Progress, Task, TaskError, TaskName, TaskOutcome, TaskPriority,
    TaskStatus, TaskTimeoutMs,
};
