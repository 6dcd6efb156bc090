//! Protocol Manager / Facade (C7): the single entry point callers use
//! (§4.7, §6.1). Wires C1-C6 together and owns the `Start`/`Stop` lifecycle.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::config::EngineConfig;
use crate::domain::{
    Agent, AgentId, NewTaskRequest, Progress, RoutingRule, RoutingRuleId, Task, TaskId, Timestamp,
};
use crate::error::EngineError;
use crate::recovery::ErrorHandler;
use crate::registry::{Registry, RegistryStats};
use crate::router::Router;
use crate::status::{Alert, AlertSeverity, StatusTracker, SystemHealthMetrics};
use crate::store::{Broker, Channel, SqliteBroker};
use crate::transport::{PermissiveTokenValidator, TokenValidator, TransportServer};

/// Aggregate `GetStats` response (§6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    /// Pending-task queue length.
    pub queue_depth: usize,
    /// Agent-registry counts by status.
    pub registry: RegistryStats,
    /// Number of tasks currently assigned to an agent.
    pub in_flight_assignments: usize,
    /// Most recent system-health sample, if one has been taken.
    pub system_health: Option<SystemHealthMetrics>,
}

/// Overall verdict of a `PerformHealthCheck` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Everything nominal.
    Healthy,
    /// At least one check is in a warning state.
    Degraded,
    /// At least one check has failed outright.
    Unhealthy,
}

/// A single named check contributing to `PerformHealthCheck`'s verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckEntry {
    /// Machine-readable name, e.g. `"error_rate"`.
    pub name: &'static str,
    /// This check's own verdict.
    pub status: HealthStatus,
    /// Human-readable detail.
    pub detail: String,
}

/// `PerformHealthCheck` response (§4.7, §6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst verdict among `checks`.
    pub status: HealthStatus,
    /// The individual checks that were evaluated.
    pub checks: Vec<HealthCheckEntry>,
    /// When the report was produced.
    pub timestamp: Timestamp,
}

fn worse(a: HealthStatus, b: HealthStatus) -> HealthStatus {
    use HealthStatus::{Degraded, Healthy, Unhealthy};
    match (a, b) {
        (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
        (Degraded, _) | (_, Degraded) => Degraded,
        (Healthy, Healthy) => Healthy,
    }
}

/// The task-delegation engine. Constructing one does not start any
/// background activity; call `start` to bring it up and `stop` to shut it
/// down (§5).
pub struct Engine {
    config: EngineConfig,
    broker: Arc<dyn Broker>,
    registry: Arc<Registry>,
    transport: Arc<TransportServer>,
    router: Arc<Router>,
    status: Arc<StatusTracker>,
    errors: Arc<ErrorHandler>,
    shutdown: CancellationToken,
}

impl Engine {
    /// Opens the store, runs migrations, and wires C2-C6 together, but does
    /// not yet start any background loop (§4.7 `Start`, first half).
    ///
    /// # Errors
    ///
    /// Returns `EngineError::StoreUnavailable` if the database can't be
    /// opened or migrated.
    #[instrument(skip(config))]
    pub async fn build(config: EngineConfig) -> Result<Self, EngineError> {
        Self::build_with_validator(config, Arc::new(PermissiveTokenValidator)).await
    }

    /// As `build`, but with an explicit `TokenValidator` port (§6.2);
    /// production callers supply the real external-auth client, tests use
    /// the always-accept stub.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::StoreUnavailable` if the database can't be
    /// opened or migrated.
    pub async fn build_with_validator(
        config: EngineConfig,
        token_validator: Arc<dyn TokenValidator>,
    ) -> Result<Self, EngineError> {
        let broker: Arc<dyn Broker> = Arc::new(SqliteBroker::connect(&config).await?);
        let registry = Arc::new(Registry::new());
        let (transport, _forward_rx) =
            TransportServer::new(&config, registry.clone(), broker.clone(), token_validator);
        let router = Arc::new(Router::new(
            &config,
            registry.clone(),
            broker.clone(),
            transport.clone(),
        ));
        let status = Arc::new(StatusTracker::new(
            registry.clone(),
            broker.clone(),
            router.clone(),
            config.agents_heartbeat_interval_ms.into_inner(),
            config.metrics_collection_interval_ms.into_inner(),
        ));
        let errors = Arc::new(ErrorHandler::new(
            broker.clone(),
            config.errors_circuit_breaker_threshold.into_inner(),
            config.errors_circuit_breaker_timeout_ms.into_inner(),
            config.tasks_default_retries.into_inner(),
        ));

        transport.set_router(router.clone());
        transport.set_status(status.clone());

        Ok(Self {
            config,
            broker,
            registry,
            transport,
            router,
            status,
            errors,
            shutdown: CancellationToken::new(),
        })
    }

    /// Binds the transport listener and spawns every background loop: C2's
    /// accept loop, C4's queue-poll and disconnect-reaction loops, C5's
    /// metrics-collection loop, and C6's circuit-breaker and failure
    /// sweeps (§4.7 `Start`, §5).
    ///
    /// # Errors
    ///
    /// Returns an error if the configured port can't be bound.
    #[instrument(skip(self))]
    pub async fn start(&self) -> std::io::Result<()> {
        let addr = format!("0.0.0.0:{}", self.config.websocket_port.into_inner());
        let listener = TcpListener::bind(&addr).await?;

        let transport = self.transport.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.serve(listener, shutdown).await {
                tracing::error!(error = %e, "transport server exited with an error");
            }
        });
        self.transport.spawn_stale_agent_sweep(self.shutdown.clone());

        self.router.spawn_poll_loop(self.shutdown.clone());
        self.router.spawn_disconnect_reaction(self.shutdown.clone());

        let broker = self.broker.clone();
        self.status
            .spawn_sampling_loop(self.shutdown.clone(), move |alert: Alert| {
                let broker_event = crate::store::BrokerEvent::new(
                    match alert.severity {
                        AlertSeverity::Critical => "CriticalAlert",
                        AlertSeverity::Warning => "Alert",
                    },
                    None,
                    serde_json::json!({ "condition": alert.condition }),
                );
                broker.publish(Channel::Events, broker_event);
            });

        self.errors.spawn_sweeps(self.shutdown.clone());

        info!("engine started");
        Ok(())
    }

    /// Runs the top-down shutdown sequence: cancels the shared token (which
    /// terminates C2's accept loop and every other spawned loop, dropping
    /// in-flight retries) in one step, since every background activity
    /// shares the same `CancellationToken` (§5).
    #[instrument(skip(self))]
    pub fn stop(&self) {
        self.shutdown.cancel();
        info!("engine stop signalled");
    }

    /// Assigns a fresh `TaskId`, constructs a `Pending` task, and persists
    /// it through C1 (§6.1 `SubmitTask`).
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Validation` if `request` fails domain
    /// validation, or `EngineError::StoreUnavailable` if persistence fails.
    #[instrument(skip(self, request))]
    pub async fn submit_task(&self, request: NewTaskRequest) -> Result<TaskId, EngineError> {
        let task_id = TaskId::generate();
        let task = Task::try_new(task_id, request)
            .map_err(|e| EngineError::Validation { reason: e.to_string() })?;
        self.broker.publish_task_request(&task).await?;
        Ok(task_id)
    }

    /// Looks up a task by id (§6.1 `GetTask`).
    ///
    /// # Errors
    ///
    /// Returns `EngineError::StoreUnavailable` if the lookup itself fails.
    pub async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>, EngineError> {
        Ok(self.broker.get_task(task_id).await?)
    }

    /// Returns `task_id`'s progress history, oldest first (§6.1
    /// `GetTaskProgress`).
    #[must_use]
    pub fn get_task_progress(&self, task_id: TaskId) -> Vec<crate::status::ProgressUpdate> {
        self.status.task_progress(task_id)
    }

    /// Records a progress update against `task_id`, for callers forwarding a
    /// worker's `TaskResponse` into the status history.
    pub fn record_task_progress(
        &self,
        task_id: TaskId,
        progress: Progress,
        status: crate::domain::TaskStatus,
    ) {
        self.status.record_progress(task_id, progress, status);
    }

    /// Agents with a live connection (§6.1 `GetConnectedAgents`).
    #[must_use]
    pub fn get_connected_agents(&self) -> Vec<Agent> {
        self.registry.connected()
    }

    /// Every registered agent, connected or not (§6.1 `GetAllAgents`).
    #[must_use]
    pub fn get_all_agents(&self) -> Vec<Agent> {
        self.registry.snapshot()
    }

    /// Aggregate queue/registry/routing/health counters (§6.1 `GetStats`).
    ///
    /// # Errors
    ///
    /// Returns `EngineError::StoreUnavailable` if the queue-depth lookup
    /// fails.
    pub async fn get_stats(&self) -> Result<EngineStats, EngineError> {
        let queue_depth = self
            .broker
            .get_tasks_by_status(crate::domain::TaskStatus::Pending, u32::MAX)
            .await?
            .len();
        Ok(EngineStats {
            queue_depth,
            registry: self.registry.stats(),
            in_flight_assignments: self.router.assignment_count(),
            system_health: self.status.latest_sample(),
        })
    }

    /// Synthesizes a pass/warn/fail report (§4.7 `PerformHealthCheck`):
    /// service running, system-metrics freshness, agent availability, and
    /// error rate against the 5%/15% pass/warn thresholds.
    #[instrument(skip(self))]
    pub async fn perform_health_check(&self) -> HealthReport {
        let now = Timestamp::now();
        let mut checks = Vec::new();

        checks.push(HealthCheckEntry {
            name: "service_running",
            status: if self.shutdown.is_cancelled() {
                HealthStatus::Unhealthy
            } else {
                HealthStatus::Healthy
            },
            detail: "transport accept loop state".to_string(),
        });

        let sample = self.status.latest_sample();
        let freshness_ms = self.config.metrics_collection_interval_ms.into_inner() * 3;
        checks.push(match sample {
            Some(sample) if now.elapsed_ms_since(sample.timestamp) <= freshness_ms => {
                HealthCheckEntry {
                    name: "metrics_freshness",
                    status: HealthStatus::Healthy,
                    detail: "latest sample within freshness window".to_string(),
                }
            }
            Some(_) => HealthCheckEntry {
                name: "metrics_freshness",
                status: HealthStatus::Degraded,
                detail: "latest sample is stale".to_string(),
            },
            None => HealthCheckEntry {
                name: "metrics_freshness",
                status: HealthStatus::Degraded,
                detail: "no sample has been taken yet".to_string(),
            },
        });

        let connected = self.registry.connected().len();
        checks.push(HealthCheckEntry {
            name: "agent_availability",
            status: if connected > 0 {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            detail: format!("{connected} connected agents"),
        });

        let error_rate = sample.map_or(0.0, |s| s.error_rate);
        checks.push(HealthCheckEntry {
            name: "error_rate",
            status: if error_rate < 5.0 {
                HealthStatus::Healthy
            } else if error_rate < 15.0 {
                HealthStatus::Degraded
            } else {
                HealthStatus::Unhealthy
            },
            detail: format!("{error_rate:.1}% over the last sample"),
        });

        let status = checks
            .iter()
            .fold(HealthStatus::Healthy, |acc, c| worse(acc, c.status));

        HealthReport { status, checks, timestamp: now }
    }

    /// Adds a routing rule to C4's rule table.
    pub fn add_routing_rule(&self, rule: Box<dyn RoutingRule>) {
        self.router.add_rule(rule);
    }

    /// Removes the routing rule with `rule_id`, if present.
    pub fn remove_routing_rule(&self, rule_id: RoutingRuleId) {
        self.router.remove_rule(rule_id);
    }

    /// Enables the routing rule with `rule_id`, if present.
    pub fn enable_routing_rule(&self, rule_id: RoutingRuleId) {
        self.router.set_rule_enabled(rule_id, true);
    }

    /// Disables the routing rule with `rule_id`, if present.
    pub fn disable_routing_rule(&self, rule_id: RoutingRuleId) {
        self.router.set_rule_enabled(rule_id, false);
    }

    /// The agent id a connection currently maps to, if any — exposed for
    /// callers that need to correlate a transport connection with its
    /// registry entry.
    #[must_use]
    pub fn find_agent(&self, agent_id: AgentId) -> Option<Agent> {
        self.registry.get(agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_engine() -> (Engine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::testing();
        config.store_database_path = dir.path().join("f.db");
        config.websocket_port = crate::config::WebSocketPort::try_new(0).unwrap_or_else(|_| {
            crate::config::WebSocketPort::try_new(17_400).expect("port in range")
        });
        let engine = Engine::build(config).await.unwrap();
        (engine, dir)
    }

    #[tokio::test]
    async fn submit_task_returns_an_id_and_persists_it() {
        let (engine, _dir) = test_engine().await;
        let id = engine
            .submit_task(NewTaskRequest {
                name: "t".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let stored = engine.get_task(id).await.unwrap().unwrap();
        assert_eq!(stored.id, id);
        assert_eq!(stored.status, crate::domain::TaskStatus::Pending);
    }

    #[tokio::test]
    async fn get_task_on_unknown_id_returns_none() {
        let (engine, _dir) = test_engine().await;
        assert!(engine.get_task(TaskId::generate()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn health_check_reports_unhealthy_with_no_connected_agents() {
        let (engine, _dir) = test_engine().await;
        let report = engine.perform_health_check().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(
            report
                .checks
                .iter()
                .any(|c| c.name == "agent_availability" && c.status == HealthStatus::Unhealthy)
        );
    }

    #[tokio::test]
    async fn stats_reflect_an_empty_freshly_built_engine() {
        let (engine, _dir) = test_engine().await;
        let stats = engine.get_stats().await.unwrap();
        assert_eq!(stats.registry.total, 0);
        assert_eq!(stats.in_flight_assignments, 0);
    }
}
