//! Task Router (C4): the queue-poll loop that matches pending tasks to
//! agents using the priority-ordered rule table, and reacts to agent
//! disconnects by releasing their in-flight work for reassignment (§4.4).

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::EngineConfig;
use crate::domain::{
    default_rules, AgentId, Assignment, RoutingContext, RoutingRule, RoutingRuleId, Task, TaskId,
};
use crate::registry::Registry;
use crate::store::{Broker, BrokerEvent, Channel};
use crate::transport::TransportServer;

/// Live, in-memory assignment table: which agent a task is out with, and
/// when it went out (§3 `Assignment`). The record of truth for task status
/// lives in C1; this is what C4/C6 consult to release work on disconnect.
pub struct AssignmentTable {
    by_task: DashMap<TaskId, Assignment>,
}

impl AssignmentTable {
    fn new() -> Self {
        Self {
            by_task: DashMap::new(),
        }
    }

    fn insert(&self, assignment: Assignment) {
        self.by_task.insert(assignment.task_id, assignment);
    }

    /// Assignments currently open against `agent_id`, used to release its
    /// work back to `Pending` when it disconnects (§4.4).
    fn for_agent(&self, agent_id: AgentId) -> Vec<Assignment> {
        self.by_task
            .iter()
            .filter(|entry| entry.value().agent_id == agent_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn remove(&self, task_id: TaskId) -> Option<Assignment> {
        self.by_task.remove(&task_id).map(|(_, a)| a)
    }
}

impl Default for AssignmentTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes pending tasks to agents (C4). Owns the rule table, the live
/// assignment index, and a background poll loop plus an agent-disconnect
/// reaction loop.
pub struct Router {
    rules: std::sync::RwLock<Vec<Box<dyn RoutingRule>>>,
    registry: Arc<Registry>,
    broker: Arc<dyn Broker>,
    transport: Arc<TransportServer>,
    assignments: AssignmentTable,
    heartbeat_interval_ms: u64,
    batch_size: u32,
    poll_interval_ms: u64,
}

impl Router {
    /// Builds a router over `default_rules()` (§4.4).
    #[must_use]
    pub fn new(
        config: &EngineConfig,
        registry: Arc<Registry>,
        broker: Arc<dyn Broker>,
        transport: Arc<TransportServer>,
    ) -> Self {
        Self {
            rules: std::sync::RwLock::new(default_rules()),
            registry,
            broker,
            transport,
            assignments: AssignmentTable::new(),
            heartbeat_interval_ms: config.agents_heartbeat_interval_ms.into_inner(),
            batch_size: config.router_batch_size.into_inner(),
            poll_interval_ms: config.router_queue_poll_interval_ms.into_inner(),
        }
    }

    /// Adds a routing rule to the table. Rules are re-sorted by descending
    /// priority, preserving insertion order among ties (§4.4).
    pub fn add_rule(&self, rule: Box<dyn RoutingRule>) {
        let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
        rules.push(rule);
        rules.sort_by_key(|r| std::cmp::Reverse(r.priority()));
    }

    /// Removes the rule with `rule_id`, if present.
    pub fn remove_rule(&self, rule_id: RoutingRuleId) {
        self.rules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|r| r.id() != rule_id);
    }

    /// Enables or disables the rule with `rule_id`, if present.
    pub fn set_rule_enabled(&self, rule_id: RoutingRuleId, enabled: bool) {
        if let Some(rule) = self
            .rules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .iter_mut()
            .find(|r| r.id() == rule_id)
        {
            rule.set_enabled(enabled);
        }
    }

    /// Spawns the queue-poll loop: every `router.queuePollInterval`, fetches
    /// up to `router.batchSize` pending tasks and routes each one (§4.4).
    pub fn spawn_poll_loop(self: &Arc<Self>, shutdown: CancellationToken) {
        let router = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(router.poll_interval_ms));
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        router.route_pending_batch().await;
                    }
                }
            }
        });
    }

    /// Spawns the agent-disconnect reaction loop: subscribes to `Channel::Agents`
    /// and releases any task assigned to a newly `AgentDisconnected`/`AgentStale`
    /// agent back to `Pending` (§4.4 disconnect handling, S5).
    pub fn spawn_disconnect_reaction(self: &Arc<Self>, shutdown: CancellationToken) {
        let router = self.clone();
        let mut events = self.broker.subscribe(Channel::Agents);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = events.recv() => {
                        match event {
                            Ok(event) if matches!(event.event_type.as_str(), "AgentDisconnected" | "AgentStale") => {
                                if let Some(agent_id) = event.agent_id {
                                    router.release_agent_assignments(agent_id).await;
                                }
                            }
                            Ok(_) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "router lagged behind agent channel");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });
    }

    #[instrument(skip(self))]
    async fn route_pending_batch(&self) {
        let pending = match self.broker.get_pending_tasks(self.batch_size).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "failed to fetch pending tasks");
                return;
            }
        };

        for task in pending {
            self.route_task(&task).await;
        }
    }

    /// Routes a single task: evaluates enabled rules in descending priority
    /// order, taking the first one whose condition matches and that
    /// produces a candidate agent. Publishes `RoutingFailed` if no rule
    /// can place it (§4.4, S2).
    pub(crate) async fn route_task(&self, task: &Task) {
        let ctx = RoutingContext {
            now: crate::domain::Timestamp::now(),
            heartbeat_interval_ms: self.heartbeat_interval_ms,
        };
        let agents = self.registry.snapshot();

        let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
        let chosen = rules
            .iter()
            .filter(|rule| rule.enabled() && rule.condition(task))
            .find_map(|rule| rule.select(&agents, task, ctx).map(|agent_id| (rule.id(), agent_id)));

        let Some((rule_id, agent_id)) = chosen else {
            self.broker.publish(
                Channel::Events,
                BrokerEvent::new(
                    "RoutingFailed",
                    None,
                    serde_json::json!({ "taskId": task.id, "reason": "no_suitable_agent" }),
                ),
            );
            return;
        };

        self.assign_and_dispatch(task.id, agent_id, rule_id).await;
    }

    async fn assign_and_dispatch(&self, task_id: TaskId, agent_id: AgentId, rule_id: RoutingRuleId) {
        let Ok(Ok(agent)) = self.registry.reserve_slot(agent_id) else {
            self.broker.publish(
                Channel::Events,
                BrokerEvent::new(
                    "RoutingFailed",
                    Some(agent_id),
                    serde_json::json!({ "taskId": task_id, "reason": "agent_at_capacity" }),
                ),
            );
            return;
        };

        match self.broker.assign_task_to_agent(task_id, agent_id).await {
            Ok(true) => {}
            Ok(false) => {
                let _ = self.registry.release_slot(agent_id, false);
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to persist task assignment");
                let _ = self.registry.release_slot(agent_id, false);
                return;
            }
        }

        let Ok(Some(task)) = self.broker.get_task(task_id).await else {
            return;
        };

        if let Err(e) = self.transport.dispatch_task(agent_id, &task) {
            warn!(error = %e, %agent_id, %task_id, "dispatch failed after assignment");
            self.broker.publish(
                Channel::Events,
                BrokerEvent::new(
                    "RoutingFailed",
                    Some(agent_id),
                    serde_json::json!({ "taskId": task_id, "reason": "dispatch_failed" }),
                ),
            );
            return;
        }

        self.assignments
            .insert(Assignment::new(task_id, agent_id, rule_id));
        info!(%task_id, %agent_id, "task dispatched");
    }

    /// Releases every task currently assigned to `agent_id` back to
    /// `Pending`, so the next poll can reassign it (§4.4).
    async fn release_agent_assignments(&self, agent_id: AgentId) {
        for assignment in self.assignments.for_agent(agent_id) {
            self.assignments.remove(assignment.task_id);
            let Ok(Some(mut task)) = self.broker.get_task(assignment.task_id).await else {
                continue;
            };
            if task.status.is_terminal() {
                continue;
            }
            if task.release_for_reassignment().is_ok()
                && self.broker.publish_task_response(&task).await.is_ok()
            {
                info!(task_id = %assignment.task_id, %agent_id, "released task for reassignment");
            }
        }
    }

    /// Current assignment count, for `GetStats` (§6.1).
    #[must_use]
    pub fn assignment_count(&self) -> usize {
        self.assignments.by_task.len()
    }

    /// Closes and removes the assignment for `task_id`, if one is open,
    /// returning its actual duration in milliseconds (`completed_at -
    /// assigned_at`, §9). Called when a terminal `TaskResponse` lands, so
    /// `assignment_count()`/`in_flight_assignments` reflect reality once
    /// tasks finish without their agent disconnecting.
    pub fn complete_assignment(&self, task_id: TaskId) -> Option<u64> {
        let mut assignment = self.assignments.remove(task_id)?;
        Some(assignment.close())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AgentRegistration, Capability, ConnectionId, MaxConcurrentTasks, NewTaskRequest};
    use crate::transport::PermissiveTokenValidator;
    use std::collections::BTreeSet;

    async fn test_router() -> (
        Arc<Router>,
        Arc<Registry>,
        Arc<dyn Broker>,
        Arc<TransportServer>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::testing();
        config.store_database_path = dir.path().join("r.db");
        let broker: Arc<dyn Broker> =
            Arc::new(crate::store::SqliteBroker::connect(&config).await.unwrap());
        let registry = Arc::new(Registry::new());
        let (transport, _rx) = TransportServer::new(
            &config,
            registry.clone(),
            broker.clone(),
            Arc::new(PermissiveTokenValidator),
        );
        let router = Arc::new(Router::new(
            &config,
            registry.clone(),
            broker.clone(),
            transport.clone(),
        ));
        (router, registry, broker, transport, dir)
    }

    fn registration(caps: &[&str], max: u32) -> AgentRegistration {
        AgentRegistration {
            name: "worker".to_string(),
            version: "1.0.0".to_string(),
            capabilities: caps
                .iter()
                .map(|c| Capability::try_new((*c).to_string()).unwrap())
                .collect::<BTreeSet<_>>(),
            max_concurrent_tasks: MaxConcurrentTasks::try_new(max).unwrap(),
            description: None,
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn task_with_no_eligible_agent_emits_routing_failed() {
        let (router, _registry, broker, _transport, _dir) = test_router().await;
        let mut events = broker.subscribe(Channel::Events);

        let task = Task::try_new(
            TaskId::generate(),
            NewTaskRequest {
                name: "t".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        router.route_task(&task).await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type, "RoutingFailed");
    }

    #[tokio::test]
    async fn task_routes_to_registered_agent_and_records_assignment() {
        let (router, registry, broker, _transport, _dir) = test_router().await;
        let agent_id = AgentId::generate();
        registry
            .register(agent_id, ConnectionId::generate(), registration(&[], 2))
            .unwrap();

        let task = Task::try_new(
            TaskId::generate(),
            NewTaskRequest {
                name: "t".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        broker.publish_task_request(&task).await.unwrap();

        router.route_task(&task).await;

        let stored = broker.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.assigned_agent_id, Some(agent_id));
        assert_eq!(router.assignment_count(), 1);
    }

    #[tokio::test]
    async fn completing_an_assignment_removes_it_and_reports_a_positive_duration() {
        let (router, registry, broker, _transport, _dir) = test_router().await;
        let agent_id = AgentId::generate();
        registry
            .register(agent_id, ConnectionId::generate(), registration(&[], 2))
            .unwrap();

        let task = Task::try_new(
            TaskId::generate(),
            NewTaskRequest {
                name: "t".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        broker.publish_task_request(&task).await.unwrap();
        router.route_task(&task).await;
        assert_eq!(router.assignment_count(), 1);

        let duration = router.complete_assignment(task.id);
        assert!(duration.is_some());
        assert_eq!(router.assignment_count(), 0);
        assert!(router.complete_assignment(task.id).is_none());
    }

    #[tokio::test]
    async fn disconnect_releases_in_flight_task_to_pending() {
        let (router, registry, broker, _transport, _dir) = test_router().await;
        let agent_id = AgentId::generate();
        registry
            .register(agent_id, ConnectionId::generate(), registration(&[], 2))
            .unwrap();

        let task = Task::try_new(
            TaskId::generate(),
            NewTaskRequest {
                name: "t".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        broker.publish_task_request(&task).await.unwrap();
        router.route_task(&task).await;

        router.release_agent_assignments(agent_id).await;

        let stored = broker.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, crate::domain::TaskStatus::Pending);
        assert!(stored.assigned_agent_id.is_none());
        assert_eq!(router.assignment_count(), 0);
    }
}
