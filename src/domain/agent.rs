//! Agent record, connection linkage, and the health-score formula (§4.3).

use std::collections::BTreeSet;

use nutype::nutype;
use serde::{Deserialize, Serialize};

use super::ids::{Capability, ConnectionId, Timestamp};
use crate::domain::ids::AgentId;

/// Agent display name, advertised at registration.
#[nutype(
    validate(len_char_min = 1, len_char_max = 200),
    derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display, TryFrom, Into)
)]
pub struct AgentName(String);

/// Free-form semantic version string advertised by the worker.
#[nutype(
    validate(len_char_min = 1, len_char_max = 50),
    derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display, TryFrom, Into)
)]
pub struct AgentVersion(String);

/// Upper bound on concurrently in-flight tasks for one agent.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10_000),
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
    default = 1
)]
pub struct MaxConcurrentTasks(u32);

/// Liveness/availability state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    /// Registered, reachable, and accepting new tasks.
    Available,
    /// Registered and reachable, but at capacity.
    Busy,
    /// Not currently reachable over a live connection.
    Offline,
    /// Reachable but reporting an internal error condition.
    Error,
}

/// An error raised when an illegal agent mutation is attempted.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// `CurrentTasks` would exceed `MaxConcurrentTasks` (I3).
    #[error("agent {agent_id} is already at capacity ({max_concurrent_tasks} tasks)")]
    AtCapacity {
        /// The agent that was mutated.
        agent_id: AgentId,
        /// Its configured concurrency ceiling.
        max_concurrent_tasks: MaxConcurrentTasks,
    },
    /// An attempt was made to decrement below zero in-flight tasks.
    #[error("agent {agent_id} has no in-flight tasks to release")]
    NoInFlightTasks {
        /// The agent that was mutated.
        agent_id: AgentId,
    },
}

/// A registered remote worker, its capabilities, and its live connection
/// linkage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Identity claimed by the worker at registration.
    pub id: AgentId,
    /// Display name.
    pub name: AgentName,
    /// Worker-reported version string.
    pub version: AgentVersion,
    /// Capabilities this agent can perform.
    pub capabilities: BTreeSet<Capability>,
    /// Concurrency ceiling.
    pub max_concurrent_tasks: MaxConcurrentTasks,
    /// Number of tasks currently assigned to this agent.
    pub current_tasks: u32,
    /// Liveness/availability state.
    pub status: AgentStatus,
    /// Last heartbeat or registration time.
    pub last_seen: Timestamp,
    /// Time of initial registration.
    pub registered_at: Timestamp,
    /// Optional free-form description.
    pub description: Option<String>,
    /// Optional operator-supplied tags.
    pub tags: Vec<String>,
    /// Lookup key into the transport server's connection table; `None` once
    /// disconnected. Never used to extend the connection's lifetime.
    pub connection_id: Option<ConnectionId>,
    /// Lifetime count of tasks this agent completed successfully.
    pub completed_count: u64,
    /// Lifetime count of tasks this agent failed.
    pub failed_count: u64,
}

/// Fields supplied by a worker's `AgentRegister` message (§6.2).
#[derive(Debug, Clone)]
pub struct AgentRegistration {
    /// Display name.
    pub name: String,
    /// Worker-reported version string.
    pub version: String,
    /// Capabilities this agent can perform.
    pub capabilities: BTreeSet<Capability>,
    /// Concurrency ceiling.
    pub max_concurrent_tasks: MaxConcurrentTasks,
    /// Optional free-form description.
    pub description: Option<String>,
    /// Optional operator-supplied tags.
    pub tags: Vec<String>,
}

impl Agent {
    /// Constructs a newly-registered, `Available` agent bound to `connection_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if `registration`'s name or version fail validation.
    pub fn register(
        id: AgentId,
        connection_id: ConnectionId,
        registration: AgentRegistration,
    ) -> Result<Self, String> {
        let name = AgentName::try_new(registration.name).map_err(|e| e.to_string())?;
        let version = AgentVersion::try_new(registration.version).map_err(|e| e.to_string())?;
        let now = Timestamp::now();
        Ok(Self {
            id,
            name,
            version,
            capabilities: registration.capabilities,
            max_concurrent_tasks: registration.max_concurrent_tasks,
            current_tasks: 0,
            status: AgentStatus::Available,
            last_seen: now,
            registered_at: now,
            description: registration.description,
            tags: registration.tags,
            connection_id: Some(connection_id),
            completed_count: 0,
            failed_count: 0,
        })
    }

    /// Applies a heartbeat: refreshes `last_seen` and the reported status and
    /// current task count. Idempotent (R2): applying the same heartbeat twice
    /// in a row leaves the agent in the same state as applying it once,
    /// except for `last_seen` advancing with the wall clock.
    pub fn apply_heartbeat(&mut self, status: AgentStatus, current_tasks: u32) {
        self.status = status;
        self.current_tasks = current_tasks;
        self.last_seen = Timestamp::now();
    }

    /// Clears the connection linkage and marks the agent `Offline`, per the
    /// `ConnectionId = ⊥ ⇒ Status = Offline` invariant.
    pub fn mark_disconnected(&mut self) {
        self.connection_id = None;
        self.status = AgentStatus::Offline;
    }

    /// Reserves one slot of capacity for a new assignment.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::AtCapacity` if `current_tasks` already equals
    /// `max_concurrent_tasks` (I3).
    pub fn reserve_slot(&mut self) -> Result<(), AgentError> {
        if self.current_tasks >= self.max_concurrent_tasks.into_inner() {
            return Err(AgentError::AtCapacity {
                agent_id: self.id,
                max_concurrent_tasks: self.max_concurrent_tasks,
            });
        }
        self.current_tasks += 1;
        if self.current_tasks >= self.max_concurrent_tasks.into_inner() {
            self.status = AgentStatus::Busy;
        }
        Ok(())
    }

    /// Releases one slot of capacity, recording whether the finished task
    /// succeeded for the success-rate term of the health score.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::NoInFlightTasks` if `current_tasks` is already zero.
    pub fn release_slot(&mut self, succeeded: bool) -> Result<(), AgentError> {
        self.current_tasks = self
            .current_tasks
            .checked_sub(1)
            .ok_or(AgentError::NoInFlightTasks { agent_id: self.id })?;
        if succeeded {
            self.completed_count += 1;
        } else {
            self.failed_count += 1;
        }
        if self.current_tasks < self.max_concurrent_tasks.into_inner()
            && self.status == AgentStatus::Busy
        {
            self.status = AgentStatus::Available;
        }
        Ok(())
    }

    /// `completed / (completed + failed)`, defaulting to 100 for agents with
    /// no completed history yet.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let total = self.completed_count + self.failed_count;
        if total == 0 {
            100.0
        } else {
            (self.completed_count as f64 / total as f64) * 100.0
        }
    }

    /// Computes the health score per the §4.3 formula, clamped to `[0, 100]`.
    #[must_use]
    pub fn health_score(&self, now: Timestamp, heartbeat_interval_ms: u64) -> f64 {
        let mut score = 100.0_f64;
        score *= self.success_rate() / 100.0;

        let last_seen_age_ms = now.elapsed_ms_since(self.last_seen);
        if last_seen_age_ms > heartbeat_interval_ms.saturating_mul(2) {
            score *= 0.8;
        }
        if last_seen_age_ms > heartbeat_interval_ms.saturating_mul(4) {
            score *= 0.5;
        }

        let max_tasks = self.max_concurrent_tasks.into_inner();
        if max_tasks > 0 {
            let load = f64::from(self.current_tasks) / f64::from(max_tasks);
            if load > 0.8 {
                score *= 0.9;
            }
        }

        score.clamp(0.0, 100.0)
    }

    /// `(score > 50) ∧ (status = Available)`.
    #[must_use]
    pub fn is_healthy(&self, now: Timestamp, heartbeat_interval_ms: u64) -> bool {
        self.health_score(now, heartbeat_interval_ms) > 50.0 && self.status == AgentStatus::Available
    }

    /// Fractional load, `currentTasks / maxConcurrentTasks`, used by the
    /// load-balance routing rule and the weighted selection score.
    #[must_use]
    pub fn load(&self) -> f64 {
        let max_tasks = self.max_concurrent_tasks.into_inner();
        if max_tasks == 0 {
            1.0
        } else {
            f64::from(self.current_tasks) / f64::from(max_tasks)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered_agent(max_concurrent: u32) -> Agent {
        Agent::register(
            AgentId::generate(),
            ConnectionId::generate(),
            AgentRegistration {
                name: "worker-1".to_string(),
                version: "1.0.0".to_string(),
                capabilities: BTreeSet::new(),
                max_concurrent_tasks: MaxConcurrentTasks::try_new(max_concurrent).unwrap(),
                description: None,
                tags: vec![],
            },
        )
        .unwrap()
    }

    #[test]
    fn new_agent_is_available_with_connection() {
        let agent = registered_agent(2);
        assert_eq!(agent.status, AgentStatus::Available);
        assert!(agent.connection_id.is_some());
    }

    #[test]
    fn disconnect_clears_connection_and_marks_offline() {
        let mut agent = registered_agent(2);
        agent.mark_disconnected();
        assert!(agent.connection_id.is_none());
        assert_eq!(agent.status, AgentStatus::Offline);
    }

    #[test]
    fn reserve_slot_refuses_beyond_capacity() {
        let mut agent = registered_agent(1);
        agent.reserve_slot().unwrap();
        assert_eq!(agent.status, AgentStatus::Busy);
        let err = agent.reserve_slot().unwrap_err();
        assert!(matches!(err, AgentError::AtCapacity { .. }));
    }

    #[test]
    fn fresh_agent_with_full_success_rate_scores_100() {
        let agent = registered_agent(2);
        let score = agent.health_score(agent.last_seen, 30_000);
        assert!((score - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn stale_agent_score_degrades_with_age() {
        let agent = registered_agent(2);
        let now = Timestamp::new(agent.last_seen.into_inner() + 5 * 30_000);
        let score = agent.health_score(now, 30_000);
        assert!((score - 40.0).abs() < 1e-9, "expected 100*0.8*0.5, got {score}");
    }

    #[test]
    fn heartbeat_applied_twice_is_idempotent_modulo_timestamp() {
        let mut agent = registered_agent(2);
        agent.apply_heartbeat(AgentStatus::Available, 1);
        let after_first = (agent.status, agent.current_tasks);
        agent.apply_heartbeat(AgentStatus::Available, 1);
        assert_eq!((agent.status, agent.current_tasks), after_first);
    }
}
