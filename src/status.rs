//! Status Tracker (C5): ring-buffered progress/health history and the
//! periodic system-health sample with threshold alerts (§4.5).

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::domain::{AgentId, Progress, TaskId, TaskStatus, Timestamp};
use crate::registry::Registry;
use crate::router::Router;
use crate::store::Broker;

/// Cap on every ring buffer this component owns (§3, §9).
const RING_CAPACITY: usize = 1000;

/// Window of recent assignment durations averaged into
/// `average_task_duration_ms` (§4.5).
const DURATION_SAMPLE_CAP: usize = 100;

/// One progress report for a task, appended on every `TaskResponse` (§3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// When the update was recorded.
    pub timestamp: Timestamp,
    /// Percent complete at this point.
    pub progress: Progress,
    /// The status the task carried when this update landed.
    pub status: TaskStatus,
}

/// One health sample for an agent, appended on every heartbeat (§4.3/§4.5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// When the sample was taken.
    pub timestamp: Timestamp,
    /// The agent's health score at that instant.
    pub score: f64,
}

/// A periodic system-wide sample, synthesized from C1/C3/C4 every
/// `metrics.collectionInterval` (§4.5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SystemHealthMetrics {
    /// When this sample was taken.
    pub timestamp: Timestamp,
    /// Total registered agents, regardless of status.
    pub total_agents: usize,
    /// Agents with a live connection (`status != Offline`).
    pub active_agents: usize,
    /// Agents whose health score currently qualifies as healthy.
    pub healthy_agents: usize,
    /// Agents currently `Busy`.
    pub busy_agents: usize,
    /// Agents currently `Offline`.
    pub offline_agents: usize,
    /// Tasks currently `Pending`.
    pub pending_tasks: usize,
    /// Tasks currently `InProgress`.
    pub in_progress_tasks: usize,
    /// Tasks `Completed` overall.
    pub completed_tasks: usize,
    /// Tasks `Failed` overall.
    pub failed_tasks: usize,
    /// Mean `completedAt - assignedAt` duration across sampled completions, in ms.
    pub average_task_duration_ms: f64,
    /// `busy / total * 100`.
    pub system_load: f64,
    /// Completions observed in the trailing hour.
    pub throughput_per_hour: f64,
    /// `failed / (completed + failed) * 100`.
    pub error_rate: f64,
}

/// Severity tag carried on an alert (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertSeverity {
    /// Worth surfacing, not urgent.
    Warning,
    /// Demands operator attention.
    Critical,
}

/// An alert raised when a sample crosses a §4.5 threshold.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Alert {
    /// How urgent the condition is.
    pub severity: AlertSeverity,
    /// Machine-readable condition name, e.g. `"error_rate"`.
    pub condition: &'static str,
    /// The sample that triggered this alert.
    pub sample: SystemHealthMetrics,
}

fn push_bounded<T>(buffer: &mut VecDeque<T>, value: T) {
    if buffer.len() >= RING_CAPACITY {
        buffer.pop_front();
    }
    buffer.push_back(value);
}

/// Ring buffers and the system-health sampling loop (C5). Reconciles nothing
/// of its own record of truth: every sample is derived fresh from C1/C3/C4's
/// query methods.
pub struct StatusTracker {
    task_progress: DashMap<TaskId, VecDeque<ProgressUpdate>>,
    agent_health: DashMap<AgentId, VecDeque<HealthSnapshot>>,
    system_health: std::sync::Mutex<VecDeque<SystemHealthMetrics>>,
    recent_completions: std::sync::Mutex<VecDeque<Timestamp>>,
    recent_durations_ms: std::sync::Mutex<VecDeque<u64>>,
    registry: Arc<Registry>,
    broker: Arc<dyn Broker>,
    router: Arc<Router>,
    heartbeat_interval_ms: u64,
    collection_interval_ms: u64,
}

impl StatusTracker {
    /// Builds an empty tracker over `registry`/`broker`/`router`.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        broker: Arc<dyn Broker>,
        router: Arc<Router>,
        heartbeat_interval_ms: u64,
        collection_interval_ms: u64,
    ) -> Self {
        Self {
            task_progress: DashMap::new(),
            agent_health: DashMap::new(),
            system_health: std::sync::Mutex::new(VecDeque::new()),
            recent_completions: std::sync::Mutex::new(VecDeque::new()),
            recent_durations_ms: std::sync::Mutex::new(VecDeque::new()),
            registry,
            broker,
            router,
            heartbeat_interval_ms,
            collection_interval_ms,
        }
    }

    /// Appends a progress entry for `task_id` (§3 bounded history).
    pub fn record_progress(&self, task_id: TaskId, progress: Progress, status: TaskStatus) {
        let mut entry = self.task_progress.entry(task_id).or_default();
        push_bounded(
            &mut entry,
            ProgressUpdate {
                timestamp: Timestamp::now(),
                progress,
                status,
            },
        );
        if status == TaskStatus::Completed {
            let mut recent = self.recent_completions.lock().unwrap_or_else(|e| e.into_inner());
            push_bounded(&mut recent, Timestamp::now());
        }
    }

    /// Records the actual duration of a closed assignment (`completed_at -
    /// assigned_at`, §9), sampled into `average_task_duration_ms`. Called
    /// when a router assignment is closed on a terminal `TaskResponse`.
    pub fn record_completion_duration(&self, duration_ms: u64) {
        let mut durations = self
            .recent_durations_ms
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if durations.len() >= DURATION_SAMPLE_CAP {
            durations.pop_front();
        }
        durations.push_back(duration_ms);
    }

    /// Appends a health snapshot for `agent_id`, taken at its current score.
    pub fn record_health(&self, agent_id: AgentId, score: f64) {
        let mut entry = self.agent_health.entry(agent_id).or_default();
        push_bounded(
            &mut entry,
            HealthSnapshot {
                timestamp: Timestamp::now(),
                score,
            },
        );
    }

    /// Progress history for `task_id`, oldest first (§6.1 `GetTaskProgress`).
    #[must_use]
    pub fn task_progress(&self, task_id: TaskId) -> Vec<ProgressUpdate> {
        self.task_progress
            .get(&task_id)
            .map(|entry| entry.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Health history for `agent_id`, oldest first.
    #[must_use]
    pub fn agent_health_history(&self, agent_id: AgentId) -> Vec<HealthSnapshot> {
        self.agent_health
            .get(&agent_id)
            .map(|entry| entry.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The most recent system-health sample, if one has been taken.
    #[must_use]
    pub fn latest_sample(&self) -> Option<SystemHealthMetrics> {
        self.system_health
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .back()
            .copied()
    }

    fn throughput_per_hour(&self, now: Timestamp) -> f64 {
        let recent = self.recent_completions.lock().unwrap_or_else(|e| e.into_inner());
        recent
            .iter()
            .filter(|t| now.elapsed_ms_since(**t) <= 3_600_000)
            .count() as f64
    }

    /// Samples C1/C3/C4 and synthesizes a `SystemHealthMetrics` reading
    /// (§4.5). Returns the sample and any alerts it triggers.
    #[instrument(skip(self))]
    pub async fn sample(&self) -> (SystemHealthMetrics, Vec<Alert>) {
        let now = Timestamp::now();
        let stats = self.registry.stats();
        let healthy_agents = self
            .registry
            .snapshot()
            .iter()
            .filter(|a| a.is_healthy(now, self.heartbeat_interval_ms))
            .count();

        let pending = self
            .broker
            .get_tasks_by_status(TaskStatus::Pending, u32::MAX)
            .await
            .map(|t| t.len())
            .unwrap_or(0);
        let in_progress = self.router.assignment_count();
        let completed = self
            .broker
            .get_tasks_by_status(TaskStatus::Completed, u32::MAX)
            .await
            .map(|t| t.len())
            .unwrap_or(0);
        let failed = self
            .broker
            .get_tasks_by_status(TaskStatus::Failed, u32::MAX)
            .await
            .map(|t| t.len())
            .unwrap_or(0);

        let average_task_duration_ms = self.average_completed_duration();
        let system_load = if stats.total == 0 {
            0.0
        } else {
            (stats.busy as f64 / stats.total as f64) * 100.0
        };
        let error_rate = if completed + failed == 0 {
            0.0
        } else {
            (failed as f64 / (completed + failed) as f64) * 100.0
        };

        let sample = SystemHealthMetrics {
            timestamp: now,
            total_agents: stats.total,
            active_agents: stats.total - stats.offline,
            healthy_agents,
            busy_agents: stats.busy,
            offline_agents: stats.offline,
            pending_tasks: pending,
            in_progress_tasks: in_progress,
            completed_tasks: completed,
            failed_tasks: failed,
            average_task_duration_ms,
            system_load,
            throughput_per_hour: self.throughput_per_hour(now),
            error_rate,
        };

        {
            let mut buffer = self.system_health.lock().unwrap_or_else(|e| e.into_inner());
            push_bounded(&mut buffer, sample);
        }

        (sample, evaluate_alerts(sample))
    }

    /// Mean of the last `DURATION_SAMPLE_CAP` closed-assignment durations
    /// (`completed_at - assigned_at`, recorded via
    /// `record_completion_duration`). `Task.updated_at`/`completed_at` are
    /// stamped from the same instant and can't stand in for this (§9).
    fn average_completed_duration(&self) -> f64 {
        let durations = self
            .recent_durations_ms
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<u64>() as f64 / durations.len() as f64
        }
    }

    /// Spawns the periodic sampling loop (`metrics.collectionInterval`, §4.7
    /// `Start`). Alerts are published as `Events` channel broker events by
    /// the caller wiring this into the facade.
    pub fn spawn_sampling_loop(
        self: &Arc<Self>,
        shutdown: CancellationToken,
        on_alert: impl Fn(Alert) + Send + Sync + 'static,
    ) {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(
                tracker.collection_interval_ms,
            ));
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let (_, alerts) = tracker.sample().await;
                        for alert in alerts {
                            on_alert(alert);
                        }
                    }
                }
            }
        });
    }
}

/// Checks a sample against the four §4.5 threshold conditions.
fn evaluate_alerts(sample: SystemHealthMetrics) -> Vec<Alert> {
    let mut alerts = Vec::new();
    if sample.error_rate > 10.0 {
        alerts.push(Alert {
            severity: AlertSeverity::Critical,
            condition: "error_rate",
            sample,
        });
    }
    if sample.system_load > 80.0 {
        alerts.push(Alert {
            severity: AlertSeverity::Warning,
            condition: "system_load",
            sample,
        });
    }
    if sample.active_agents == 0 && sample.total_agents > 0 {
        alerts.push(Alert {
            severity: AlertSeverity::Critical,
            condition: "no_active_agents",
            sample,
        });
    }
    if sample.throughput_per_hour < 1.0 && sample.pending_tasks > 5 {
        alerts.push(Alert {
            severity: AlertSeverity::Warning,
            condition: "low_throughput",
            sample,
        });
    }
    alerts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::domain::NewTaskRequest;
    use crate::transport::{PermissiveTokenValidator, TransportServer};

    async fn test_tracker() -> (Arc<StatusTracker>, Arc<dyn Broker>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::testing();
        config.store_database_path = dir.path().join("s.db");
        let broker: Arc<dyn Broker> =
            Arc::new(crate::store::SqliteBroker::connect(&config).await.unwrap());
        let registry = Arc::new(Registry::new());
        let (transport, _rx) = TransportServer::new(
            &config,
            registry.clone(),
            broker.clone(),
            Arc::new(PermissiveTokenValidator),
        );
        let router = Arc::new(Router::new(&config, registry.clone(), broker.clone(), transport));
        let tracker = Arc::new(StatusTracker::new(
            registry,
            broker.clone(),
            router,
            config.agents_heartbeat_interval_ms.into_inner(),
            config.metrics_collection_interval_ms.into_inner(),
        ));
        (tracker, broker, dir)
    }

    #[test]
    fn ring_buffer_evicts_oldest_past_capacity() {
        let mut buffer = VecDeque::new();
        for i in 0..(RING_CAPACITY + 10) {
            push_bounded(&mut buffer, i);
        }
        assert_eq!(buffer.len(), RING_CAPACITY);
        assert_eq!(*buffer.front().unwrap(), 10);
    }

    #[tokio::test]
    async fn progress_history_is_recorded_oldest_first() {
        let (tracker, _broker, _dir) = test_tracker().await;
        let task_id = TaskId::generate();
        tracker.record_progress(task_id, Progress::try_new(10).unwrap(), TaskStatus::InProgress);
        tracker.record_progress(task_id, Progress::try_new(50).unwrap(), TaskStatus::InProgress);

        let history = tracker.task_progress(task_id);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].progress.into_inner(), 10);
        assert_eq!(history[1].progress.into_inner(), 50);
    }

    #[tokio::test]
    async fn completion_duration_feeds_the_running_average() {
        let (tracker, _broker, _dir) = test_tracker().await;
        assert!((tracker.average_completed_duration() - 0.0).abs() < f64::EPSILON);

        tracker.record_completion_duration(100);
        tracker.record_completion_duration(200);

        assert!((tracker.average_completed_duration() - 150.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn completion_duration_samples_are_capped_and_evict_oldest() {
        let (tracker, _broker, _dir) = test_tracker().await;
        for _ in 0..DURATION_SAMPLE_CAP {
            tracker.record_completion_duration(100);
        }
        tracker.record_completion_duration(1_000_000);

        let average = tracker.average_completed_duration();
        assert!(average > 100.0, "newest sample should pull the average up");
        assert!(
            average < 1_000_000.0 / DURATION_SAMPLE_CAP as f64 * 2.0,
            "oldest sample should have been evicted, average was {average}"
        );
    }

    #[tokio::test]
    async fn sample_reports_pending_task_count() {
        let (tracker, broker, _dir) = test_tracker().await;
        let task = crate::domain::Task::try_new(
            TaskId::generate(),
            NewTaskRequest {
                name: "t".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        broker.publish_task_request(&task).await.unwrap();

        let (sample, _alerts) = tracker.sample().await;
        assert_eq!(sample.pending_tasks, 1);
        assert!((sample.system_load - 0.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn no_active_agents_alert_fires_once_agents_exist_but_none_are_active() {
        let (tracker, _broker, _dir) = test_tracker().await;
        tracker
            .registry
            .register(
                AgentId::generate(),
                crate::domain::ConnectionId::generate(),
                crate::domain::AgentRegistration {
                    name: "a".to_string(),
                    version: "1.0.0".to_string(),
                    capabilities: Default::default(),
                    max_concurrent_tasks: crate::domain::MaxConcurrentTasks::try_new(1).unwrap(),
                    description: None,
                    tags: vec![],
                },
            )
            .unwrap();
        tracker
            .registry
            .mark_disconnected(tracker.registry.snapshot()[0].id)
            .unwrap();

        let (_sample, alerts) = tracker.sample().await;
        assert!(alerts.iter().any(|a| a.condition == "no_active_agents"));
    }
}
