//! Agent Registry (C3): the live in-memory agent table, capability inverse
//! index, and health-score-driven agent selection (§4.3).

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use thiserror::Error;
use tracing::instrument;

use crate::domain::{
    weighted_score, Agent, AgentId, AgentRegistration, AgentStatus, Capability, ConnectionId,
    RoutingContext,
};

/// Errors raised by the registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No agent with this id is currently registered.
    #[error("agent {agent_id} is not registered")]
    AgentNotFound {
        /// The agent that was looked up.
        agent_id: AgentId,
    },

    /// An agent with this id is already registered.
    #[error("agent {agent_id} is already registered")]
    AgentAlreadyRegistered {
        /// The agent that collided.
        agent_id: AgentId,
    },

    /// The registration payload itself failed domain validation.
    #[error("invalid agent registration: {reason}")]
    InvalidRegistration {
        /// Why the registration was rejected.
        reason: String,
    },
}

/// Criteria for `find_best_agent` (§4.3 Agent selection).
#[derive(Debug, Clone, Default)]
pub struct SelectionCriteria {
    /// Capabilities the candidate agent must advertise.
    pub required_capabilities: BTreeSet<Capability>,
    /// Whether every capability must match (all-of) or any one suffices.
    pub require_all: bool,
}

/// Point-in-time counts by `AgentStatus`, used for `GetStats`/§4.5 sampling.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryStats {
    /// Total registered agents, regardless of status.
    pub total: usize,
    /// Agents currently `Available`.
    pub available: usize,
    /// Agents currently `Busy`.
    pub busy: usize,
    /// Agents currently `Offline`.
    pub offline: usize,
    /// Agents currently `Error`.
    pub error: usize,
}

/// Live in-memory agent table and capability inverse index (§3 Ownership,
/// §4.3). Task and agent records of truth live in C1; this is a
/// reconciled cache plus the derived indexes the router consults.
pub struct Registry {
    agents: DashMap<AgentId, (u64, Agent)>,
    capability_index: DashMap<Capability, HashSet<AgentId>>,
    next_sequence: AtomicU64,
}

impl Registry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
            capability_index: DashMap::new(),
            next_sequence: AtomicU64::new(0),
        }
    }

    fn index_capabilities(&self, agent_id: AgentId, capabilities: &BTreeSet<Capability>) {
        for capability in capabilities {
            self.capability_index
                .entry(capability.clone())
                .or_default()
                .insert(agent_id);
        }
    }

    fn deindex_capabilities(&self, agent_id: AgentId, capabilities: &BTreeSet<Capability>) {
        for capability in capabilities {
            if let Some(mut ids) = self.capability_index.get_mut(capability) {
                ids.remove(&agent_id);
            }
        }
    }

    /// Registers a newly connected agent.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::AgentAlreadyRegistered` if `agent_id` is
    /// already present, or `RegistryError::InvalidRegistration` if the
    /// registration payload fails domain validation.
    #[instrument(skip(self, registration), fields(%agent_id))]
    pub fn register(
        &self,
        agent_id: AgentId,
        connection_id: ConnectionId,
        registration: AgentRegistration,
    ) -> Result<Agent, RegistryError> {
        if self.agents.contains_key(&agent_id) {
            return Err(RegistryError::AgentAlreadyRegistered { agent_id });
        }
        let capabilities = registration.capabilities.clone();
        let agent = Agent::register(agent_id, connection_id, registration)
            .map_err(|reason| RegistryError::InvalidRegistration { reason })?;
        self.index_capabilities(agent_id, &capabilities);
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        self.agents.insert(agent_id, (sequence, agent.clone()));
        Ok(agent)
    }

    /// Applies a heartbeat to a registered agent.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::AgentNotFound` if `agent_id` isn't registered.
    pub fn apply_heartbeat(
        &self,
        agent_id: AgentId,
        status: AgentStatus,
        current_tasks: u32,
    ) -> Result<Agent, RegistryError> {
        let mut entry = self
            .agents
            .get_mut(&agent_id)
            .ok_or(RegistryError::AgentNotFound { agent_id })?;
        entry.1.apply_heartbeat(status, current_tasks);
        Ok(entry.1.clone())
    }

    /// Clears the connection linkage and marks an agent `Offline`, per the
    /// weak-reference discipline in §9.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::AgentNotFound` if `agent_id` isn't registered.
    pub fn mark_disconnected(&self, agent_id: AgentId) -> Result<Agent, RegistryError> {
        let mut entry = self
            .agents
            .get_mut(&agent_id)
            .ok_or(RegistryError::AgentNotFound { agent_id })?;
        entry.1.mark_disconnected();
        Ok(entry.1.clone())
    }

    /// Reserves one slot of capacity on `agent_id` for a new assignment.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::AgentNotFound` if unregistered; propagates
    /// `AgentError::AtCapacity` via the returned `Result`'s inner error when
    /// the agent has no residual capacity (I3).
    pub fn reserve_slot(
        &self,
        agent_id: AgentId,
    ) -> Result<Result<Agent, crate::domain::AgentError>, RegistryError> {
        let mut entry = self
            .agents
            .get_mut(&agent_id)
            .ok_or(RegistryError::AgentNotFound { agent_id })?;
        Ok(entry.1.reserve_slot().map(|()| entry.1.clone()))
    }

    /// Releases one slot of capacity on `agent_id`, recording the outcome.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::AgentNotFound` if unregistered.
    pub fn release_slot(
        &self,
        agent_id: AgentId,
        succeeded: bool,
    ) -> Result<Result<Agent, crate::domain::AgentError>, RegistryError> {
        let mut entry = self
            .agents
            .get_mut(&agent_id)
            .ok_or(RegistryError::AgentNotFound { agent_id })?;
        Ok(entry.1.release_slot(succeeded).map(|()| entry.1.clone()))
    }

    /// Removes an agent entirely (used once its TTL has expired in C1; the
    /// in-memory record never outlives the record of truth).
    pub fn remove(&self, agent_id: AgentId) -> Option<Agent> {
        let (_, (_, agent)) = self.agents.remove(&agent_id)?;
        self.deindex_capabilities(agent_id, &agent.capabilities);
        Some(agent)
    }

    /// Looks up a single agent by id.
    #[must_use]
    pub fn get(&self, agent_id: AgentId) -> Option<Agent> {
        self.agents.get(&agent_id).map(|entry| entry.1.clone())
    }

    /// Agent ids advertising `capability`, per the inverse index (I6).
    #[must_use]
    pub fn agents_with_capability(&self, capability: &Capability) -> HashSet<AgentId> {
        self.capability_index
            .get(capability)
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    /// All registered agents, ordered by registration sequence (oldest
    /// first), which is the tie-break order routing rules assume (§3). A
    /// monotonic counter rather than `registered_at` breaks ties between
    /// agents registered within the same millisecond.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Agent> {
        let mut entries: Vec<(u64, Agent)> = self
            .agents
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by_key(|(sequence, _)| *sequence);
        entries.into_iter().map(|(_, agent)| agent).collect()
    }

    /// Agents that currently hold a live connection (`Status != Offline`).
    #[must_use]
    pub fn connected(&self) -> Vec<Agent> {
        self.snapshot()
            .into_iter()
            .filter(|agent| agent.status != AgentStatus::Offline)
            .collect()
    }

    /// Counts agents by status, for `GetStats`/§4.5 sampling.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for entry in &self.agents {
            stats.total += 1;
            match entry.value().1.status {
                AgentStatus::Available => stats.available += 1,
                AgentStatus::Busy => stats.busy += 1,
                AgentStatus::Offline => stats.offline += 1,
                AgentStatus::Error => stats.error += 1,
            }
        }
        stats
    }

    /// Picks the best agent for `criteria` per the §4.3 weighted-score
    /// formula: filters to healthy, available agents matching the
    /// capability criteria, then returns the argmax by weighted score,
    /// breaking ties by lowest load, then registration order.
    #[must_use]
    pub fn find_best_agent(
        &self,
        criteria: &SelectionCriteria,
        ctx: RoutingContext,
    ) -> Option<AgentId> {
        let mut best: Option<(AgentId, f64, f64)> = None;

        for agent in self.snapshot() {
            if !agent.is_healthy(ctx.now, ctx.heartbeat_interval_ms) {
                continue;
            }
            let matches = if criteria.required_capabilities.is_empty() {
                true
            } else if criteria.require_all {
                criteria
                    .required_capabilities
                    .iter()
                    .all(|cap| agent.capabilities.contains(cap))
            } else {
                criteria
                    .required_capabilities
                    .iter()
                    .any(|cap| agent.capabilities.contains(cap))
            };
            if !matches {
                continue;
            }

            let score = weighted_score(&agent, ctx);
            let load = agent.load();
            best = match best {
                None => Some((agent.id, score, load)),
                Some((best_id, best_score, best_load)) => {
                    if score > best_score
                        || ((score - best_score).abs() < f64::EPSILON && load < best_load)
                    {
                        Some((agent.id, score, load))
                    } else {
                        Some((best_id, best_score, best_load))
                    }
                }
            };
        }

        best.map(|(id, _, _)| id)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConnectionId, MaxConcurrentTasks, Timestamp};

    fn registration(name: &str, caps: &[&str], max: u32) -> AgentRegistration {
        AgentRegistration {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            capabilities: caps
                .iter()
                .map(|c| Capability::try_new((*c).to_string()).unwrap())
                .collect(),
            max_concurrent_tasks: MaxConcurrentTasks::try_new(max).unwrap(),
            description: None,
            tags: vec![],
        }
    }

    fn ctx() -> RoutingContext {
        RoutingContext {
            now: Timestamp::now(),
            heartbeat_interval_ms: 30_000,
        }
    }

    #[test]
    fn register_then_duplicate_registration_fails() {
        let registry = Registry::new();
        let agent_id = AgentId::generate();
        registry
            .register(agent_id, ConnectionId::generate(), registration("a", &[], 2))
            .unwrap();

        let err = registry
            .register(agent_id, ConnectionId::generate(), registration("a", &[], 2))
            .unwrap_err();
        assert!(matches!(err, RegistryError::AgentAlreadyRegistered { .. }));
    }

    #[test]
    fn capability_index_matches_agent_capabilities() {
        let registry = Registry::new();
        let agent_id = AgentId::generate();
        registry
            .register(
                agent_id,
                ConnectionId::generate(),
                registration("a", &["gpu", "nlp"], 2),
            )
            .unwrap();

        let gpu = Capability::try_new("gpu".to_string()).unwrap();
        assert!(registry.agents_with_capability(&gpu).contains(&agent_id));

        registry.remove(agent_id);
        assert!(!registry.agents_with_capability(&gpu).contains(&agent_id));
    }

    #[test]
    fn heartbeat_on_unknown_agent_fails() {
        let registry = Registry::new();
        let err = registry
            .apply_heartbeat(AgentId::generate(), AgentStatus::Available, 0)
            .unwrap_err();
        assert!(matches!(err, RegistryError::AgentNotFound { .. }));
    }

    #[test]
    fn disconnect_marks_agent_offline_but_keeps_record() {
        let registry = Registry::new();
        let agent_id = AgentId::generate();
        registry
            .register(agent_id, ConnectionId::generate(), registration("a", &[], 2))
            .unwrap();

        registry.mark_disconnected(agent_id).unwrap();
        let agent = registry.get(agent_id).unwrap();
        assert_eq!(agent.status, AgentStatus::Offline);
        assert!(agent.connection_id.is_none());
    }

    #[test]
    fn find_best_agent_prefers_lower_load_on_tie() {
        let registry = Registry::new();
        let busy_id = AgentId::generate();
        let idle_id = AgentId::generate();
        registry
            .register(busy_id, ConnectionId::generate(), registration("busy", &[], 4))
            .unwrap();
        registry
            .register(idle_id, ConnectionId::generate(), registration("idle", &[], 4))
            .unwrap();
        registry.reserve_slot(busy_id).unwrap().unwrap();

        let chosen = registry
            .find_best_agent(&SelectionCriteria::default(), ctx())
            .unwrap();
        assert_eq!(chosen, idle_id);
    }

    #[test]
    fn find_best_agent_requires_all_capabilities_when_require_all() {
        let registry = Registry::new();
        let partial_id = AgentId::generate();
        registry
            .register(
                partial_id,
                ConnectionId::generate(),
                registration("partial", &["gpu"], 2),
            )
            .unwrap();

        let criteria = SelectionCriteria {
            required_capabilities: ["gpu", "nlp"]
                .iter()
                .map(|c| Capability::try_new((*c).to_string()).unwrap())
                .collect(),
            require_all: true,
        };
        assert!(registry.find_best_agent(&criteria, ctx()).is_none());
    }

    #[test]
    fn find_best_agent_skips_unhealthy_agents() {
        let registry = Registry::new();
        let agent_id = AgentId::generate();
        registry
            .register(agent_id, ConnectionId::generate(), registration("a", &[], 2))
            .unwrap();
        registry.mark_disconnected(agent_id).unwrap();

        assert!(registry
            .find_best_agent(&SelectionCriteria::default(), ctx())
            .is_none());
    }

    #[test]
    fn snapshot_is_ordered_by_registration_time() {
        let registry = Registry::new();
        let first = AgentId::generate();
        let second = AgentId::generate();
        registry
            .register(first, ConnectionId::generate(), registration("first", &[], 2))
            .unwrap();
        registry
            .register(second, ConnectionId::generate(), registration("second", &[], 2))
            .unwrap();

        let ids: Vec<AgentId> = registry.snapshot().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![first, second]);
    }
}
