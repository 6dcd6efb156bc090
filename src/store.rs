//! Message Broker (C1): pub/sub on four logical channels plus persistence
//! of task and agent records behind the KV/sorted-set contract of §4.1/§6.3.
//!
//! The contract is satisfied in-process by an embedded SQLite store (tables
//! `tasks`, `agents`, `queue_entries` standing in for hash sets and sorted
//! sets) and `tokio::sync::broadcast` channels for the four logical
//! channels. Everything above this module talks to the `Broker` trait, not
//! to SQLite directly, so the backing store can be swapped later.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{ConnectOptions, Pool, Sqlite};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use crate::config::EngineConfig;
use crate::domain::{Agent, AgentId, Task, TaskId, TaskStatus, Timestamp};

static MIGRATOR: Migrator = sqlx::migrate!();

/// Capacity of each logical channel's broadcast buffer. A slow subscriber
/// that falls this far behind starts missing messages (`RecvError::Lagged`);
/// callers are expected to keep up rather than batch-drain.
const CHANNEL_CAPACITY: usize = 1024;

/// Errors raised by the persistence/pub-sub layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested record does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// A human-readable description of what was missing.
        what: String,
    },

    /// A task's retry counter is already at its ceiling (I5).
    #[error("task {task_id} has exhausted its retries")]
    RetriesExhausted {
        /// The task that was mutated.
        task_id: TaskId,
    },

    /// The underlying `SQLite` pool rejected or failed a query.
    #[error("database error: {source}")]
    Database {
        /// The underlying `sqlx` error.
        #[from]
        source: sqlx::Error,
    },

    /// A stored record failed to (de)serialize.
    #[error("serialization error: {source}")]
    Serialization {
        /// The underlying serde error.
        #[from]
        source: serde_json::Error,
    },

    /// Creating the database file's parent directory failed.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// The embedded migrations failed to apply.
    #[error("migration failed: {message}")]
    Migration {
        /// Description of the failure from `sqlx::migrate`.
        message: String,
    },
}

/// One of the four logical pub/sub channels (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Task lifecycle events: submissions and assignments.
    Tasks,
    /// Agent lifecycle events: registration, heartbeats, disconnects.
    Agents,
    /// Generic system/error events (routing failures, alerts, escalations).
    Events,
    /// Worker responses: progress updates and terminal outcomes.
    Responses,
}

/// Minimal envelope carried on every broker channel:
/// `{id, type, timestamp, agentId}` plus an opaque payload (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerEvent {
    /// Unique id for this event.
    pub id: String,
    /// Event type tag, e.g. `"TaskRequest"` or `"AgentStale"`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// When the event was published.
    pub timestamp: Timestamp,
    /// The agent this event concerns, if any.
    pub agent_id: Option<AgentId>,
    /// Opaque, event-type-specific detail.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl BrokerEvent {
    /// Builds a new event, stamping a fresh id and the current time.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        agent_id: Option<AgentId>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            timestamp: Timestamp::now(),
            agent_id,
            payload,
        }
    }
}

/// The KV + sorted-set + pub/sub contract C3-C7 bind to (§4.1, §6.3).
#[async_trait]
pub trait Broker: Send + Sync {
    /// Writes a freshly submitted task, enqueues it on `queue:pending`, and
    /// publishes on `tasks`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` if the write fails.
    async fn publish_task_request(&self, task: &Task) -> Result<(), StoreError>;

    /// Persists an already-mutated task record (progress update or terminal
    /// outcome), moves its queue membership accordingly, and publishes on
    /// `responses`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` if the write fails.
    async fn publish_task_response(&self, task: &Task) -> Result<(), StoreError>;

    /// Conditionally assigns `task_id` to `agent_id`: requires the task
    /// record to exist and not already be terminal. Returns `false` if the
    /// task is absent or the assignment was rejected.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` if the underlying query fails.
    async fn assign_task_to_agent(
        &self,
        task_id: TaskId,
        agent_id: AgentId,
    ) -> Result<bool, StoreError>;

    /// Atomically increments a task's retry counter, returning the new
    /// value.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the task doesn't exist, or
    /// `StoreError::RetriesExhausted` if it is already at its ceiling (I5).
    async fn increment_task_retry(&self, task_id: TaskId) -> Result<u32, StoreError>;

    /// Reads a task record by id.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` if the query fails.
    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Returns the top `limit` pending tasks ordered by priority, descending
    /// (the `ZREVRANGE queue:pending` equivalent).
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` if the query fails.
    async fn get_pending_tasks(&self, limit: u32) -> Result<Vec<Task>, StoreError>;

    /// Returns up to `limit` tasks in `status`, most recent first.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` if the query fails.
    async fn get_tasks_by_status(
        &self,
        status: TaskStatus,
        limit: u32,
    ) -> Result<Vec<Task>, StoreError>;

    /// Persists an agent snapshot, refreshing its TTL, and publishes on
    /// `agents`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` if the write fails.
    async fn save_agent_snapshot(&self, agent: &Agent) -> Result<(), StoreError>;

    /// Reads an agent snapshot by id.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` if the query fails.
    async fn get_agent_snapshot(&self, agent_id: AgentId) -> Result<Option<Agent>, StoreError>;

    /// Deletes every task, agent, and queue entry past its TTL. Returns the
    /// number of task/agent rows removed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` if a delete fails.
    async fn purge_expired(&self) -> Result<u64, StoreError>;

    /// Subscribes to `channel`; the returned receiver gets every message
    /// published on it from this point on, exactly once.
    fn subscribe(&self, channel: Channel) -> broadcast::Receiver<BrokerEvent>;

    /// Publishes `event` on `channel`. A channel with no subscribers simply
    /// drops the event.
    fn publish(&self, channel: Channel, event: BrokerEvent);
}

fn status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
    }
}

/// `SQLite`-backed `Broker` implementation (§4.1 implementation note).
#[derive(Clone)]
pub struct SqliteBroker {
    pool: Pool<Sqlite>,
    key_prefix: String,
    task_ttl_ms: u64,
    agent_ttl_ms: u64,
    tasks_tx: broadcast::Sender<BrokerEvent>,
    agents_tx: broadcast::Sender<BrokerEvent>,
    events_tx: broadcast::Sender<BrokerEvent>,
    responses_tx: broadcast::Sender<BrokerEvent>,
}

// Functional core: pure config-to-options translation.
impl SqliteBroker {
    fn create_connect_options(path: &Path) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .pragma("journal_mode", "WAL")
            .pragma("foreign_keys", "ON")
            .disable_statement_logging()
    }

    fn prefixed(&self, id: impl std::fmt::Display) -> String {
        format!("{}:{}", self.key_prefix, id)
    }

    fn task_expires_at(&self, task: &Task) -> i64 {
        task.created_at
            .into_inner()
            .saturating_add(i64::try_from(self.task_ttl_ms).unwrap_or(i64::MAX))
    }

    fn agent_expires_at(&self) -> i64 {
        Timestamp::now()
            .into_inner()
            .saturating_add(i64::try_from(self.agent_ttl_ms).unwrap_or(i64::MAX))
    }
}

// Imperative shell: connection setup, migrations, queries.
impl SqliteBroker {
    /// Opens the database, applies tuning pragmas, and runs embedded
    /// migrations (part of C7's `Start` sequence, §4.7).
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the directory can't be created, the pool
    /// can't connect, or migrations fail.
    #[instrument(skip(config), fields(path = %config.store_database_path.display()))]
    pub async fn connect(config: &EngineConfig) -> Result<Self, StoreError> {
        Self::ensure_parent_directory_exists(&config.store_database_path).await?;
        let pool = Self::create_connection_pool(
            &config.store_database_path,
            config.store_pool_size.into_inner(),
        )
        .await?;
        Self::apply_database_settings(&pool).await?;
        Self::run_migrations(&pool).await?;

        Ok(Self {
            pool,
            key_prefix: config.store_key_prefix.clone(),
            task_ttl_ms: config.tasks_ttl_ms.into_inner(),
            agent_ttl_ms: config.agents_ttl_ms.into_inner(),
            tasks_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            agents_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            events_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            responses_tx: broadcast::channel(CHANNEL_CAPACITY).0,
        })
    }

    async fn ensure_parent_directory_exists(path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn create_connection_pool(
        path: &Path,
        pool_size: u32,
    ) -> Result<Pool<Sqlite>, StoreError> {
        let options = Self::create_connect_options(path);
        Ok(SqlitePoolOptions::new()
            .max_connections(pool_size)
            .connect_with(options)
            .await?)
    }

    async fn apply_database_settings(pool: &Pool<Sqlite>) -> Result<(), StoreError> {
        for pragma in [
            "PRAGMA synchronous = NORMAL",
            "PRAGMA cache_size = -65536",
            "PRAGMA temp_store = MEMORY",
            "PRAGMA mmap_size = 268435456",
        ] {
            sqlx::query(pragma).execute(pool).await?;
        }
        Ok(())
    }

    async fn run_migrations(pool: &Pool<Sqlite>) -> Result<(), StoreError> {
        info!("running embedded migrations");
        MIGRATOR.run(pool).await.map_err(|e| {
            warn!(error = %e, "migration failed");
            StoreError::Migration {
                message: e.to_string(),
            }
        })
    }

    async fn sync_queue_membership(&self, key: &str, task: &Task) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM queue_entries WHERE task_id = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        let entry = match task.status {
            TaskStatus::Pending => Some(("pending", i64::from(task.priority.into_inner()))),
            TaskStatus::InProgress => Some(("in_progress", task.updated_at.into_inner())),
            TaskStatus::Completed => Some((
                "completed",
                task.completed_at.unwrap_or(task.updated_at).into_inner(),
            )),
            TaskStatus::Failed => Some((
                "failed",
                task.completed_at.unwrap_or(task.updated_at).into_inner(),
            )),
            TaskStatus::Cancelled => None,
        };

        if let Some((queue, score)) = entry {
            sqlx::query("INSERT INTO queue_entries (queue, task_id, score) VALUES (?1, ?2, ?3)")
                .bind(queue)
                .bind(key)
                .bind(score)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for SqliteBroker {
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn publish_task_request(&self, task: &Task) -> Result<(), StoreError> {
        let key = self.prefixed(task.id);
        let record = serde_json::to_string(task)?;
        let expires_at = self.task_expires_at(task);

        sqlx::query(
            "INSERT INTO tasks (id, record, status, priority, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                record = excluded.record,
                status = excluded.status,
                priority = excluded.priority,
                expires_at = excluded.expires_at",
        )
        .bind(&key)
        .bind(&record)
        .bind(status_str(task.status))
        .bind(i64::from(task.priority.into_inner()))
        .bind(task.created_at.into_inner())
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        self.sync_queue_membership(&key, task).await?;
        self.publish(
            Channel::Tasks,
            BrokerEvent::new(
                "TaskRequest",
                None,
                serde_json::json!({ "taskId": task.id }),
            ),
        );
        Ok(())
    }

    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn publish_task_response(&self, task: &Task) -> Result<(), StoreError> {
        let key = self.prefixed(task.id);
        let record = serde_json::to_string(task)?;
        let expires_at = self.task_expires_at(task);

        sqlx::query(
            "UPDATE tasks SET record = ?1, status = ?2, priority = ?3, expires_at = ?4
             WHERE id = ?5",
        )
        .bind(&record)
        .bind(status_str(task.status))
        .bind(i64::from(task.priority.into_inner()))
        .bind(expires_at)
        .bind(&key)
        .execute(&self.pool)
        .await?;

        self.sync_queue_membership(&key, task).await?;
        self.publish(
            Channel::Responses,
            BrokerEvent::new(
                "TaskResponse",
                task.assigned_agent_id,
                serde_json::json!({ "taskId": task.id, "status": status_str(task.status) }),
            ),
        );
        Ok(())
    }

    async fn assign_task_to_agent(
        &self,
        task_id: TaskId,
        agent_id: AgentId,
    ) -> Result<bool, StoreError> {
        let key = self.prefixed(task_id);
        let Some(record) = sqlx::query_scalar::<_, String>("SELECT record FROM tasks WHERE id = ?1")
            .bind(&key)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(false);
        };

        let mut task: Task = serde_json::from_str(&record)?;
        if task.assign(agent_id).is_err() {
            return Ok(false);
        }

        let updated = serde_json::to_string(&task)?;
        sqlx::query("UPDATE tasks SET record = ?1, status = ?2 WHERE id = ?3")
            .bind(&updated)
            .bind(status_str(task.status))
            .bind(&key)
            .execute(&self.pool)
            .await?;
        self.sync_queue_membership(&key, &task).await?;
        Ok(true)
    }

    async fn increment_task_retry(&self, task_id: TaskId) -> Result<u32, StoreError> {
        let key = self.prefixed(task_id);
        let record: String = sqlx::query_scalar("SELECT record FROM tasks WHERE id = ?1")
            .bind(&key)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                what: format!("task {task_id}"),
            })?;

        let mut task: Task = serde_json::from_str(&record)?;
        let new_count = task
            .increment_retry()
            .map_err(|_| StoreError::RetriesExhausted { task_id })?;

        let updated = serde_json::to_string(&task)?;
        sqlx::query("UPDATE tasks SET record = ?1 WHERE id = ?2")
            .bind(&updated)
            .bind(&key)
            .execute(&self.pool)
            .await?;
        Ok(new_count)
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        let key = self.prefixed(task_id);
        let row = sqlx::query_scalar::<_, String>("SELECT record FROM tasks WHERE id = ?1")
            .bind(&key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| serde_json::from_str(&r))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn get_pending_tasks(&self, limit: u32) -> Result<Vec<Task>, StoreError> {
        let pattern = format!("{}:%", self.key_prefix);
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT t.record FROM queue_entries q
             JOIN tasks t ON t.id = q.task_id
             WHERE q.queue = 'pending' AND q.task_id LIKE ?1
             ORDER BY q.score DESC
             LIMIT ?2",
        )
        .bind(&pattern)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| serde_json::from_str(r).map_err(StoreError::from))
            .collect()
    }

    async fn get_tasks_by_status(
        &self,
        status: TaskStatus,
        limit: u32,
    ) -> Result<Vec<Task>, StoreError> {
        let pattern = format!("{}:%", self.key_prefix);
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT record FROM tasks
             WHERE id LIKE ?1 AND status = ?2
             ORDER BY created_at DESC
             LIMIT ?3",
        )
        .bind(&pattern)
        .bind(status_str(status))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| serde_json::from_str(r).map_err(StoreError::from))
            .collect()
    }

    async fn save_agent_snapshot(&self, agent: &Agent) -> Result<(), StoreError> {
        let key = self.prefixed(agent.id);
        let record = serde_json::to_string(agent)?;
        let expires_at = self.agent_expires_at();

        sqlx::query(
            "INSERT INTO agents (id, record, updated_at, expires_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                record = excluded.record,
                updated_at = excluded.updated_at,
                expires_at = excluded.expires_at",
        )
        .bind(&key)
        .bind(&record)
        .bind(Timestamp::now().into_inner())
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        self.publish(
            Channel::Agents,
            BrokerEvent::new(
                "AgentSnapshot",
                Some(agent.id),
                serde_json::json!({ "status": format!("{:?}", agent.status) }),
            ),
        );
        Ok(())
    }

    async fn get_agent_snapshot(&self, agent_id: AgentId) -> Result<Option<Agent>, StoreError> {
        let key = self.prefixed(agent_id);
        let row = sqlx::query_scalar::<_, String>("SELECT record FROM agents WHERE id = ?1")
            .bind(&key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| serde_json::from_str(&r))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = Timestamp::now().into_inner();
        let mut deleted = 0u64;

        let tasks_deleted =
            sqlx::query("DELETE FROM tasks WHERE expires_at IS NOT NULL AND expires_at < ?1")
                .bind(now)
                .execute(&self.pool)
                .await?;
        deleted += tasks_deleted.rows_affected();

        let agents_deleted =
            sqlx::query("DELETE FROM agents WHERE expires_at IS NOT NULL AND expires_at < ?1")
                .bind(now)
                .execute(&self.pool)
                .await?;
        deleted += agents_deleted.rows_affected();

        sqlx::query("DELETE FROM queue_entries WHERE task_id NOT IN (SELECT id FROM tasks)")
            .execute(&self.pool)
            .await?;

        Ok(deleted)
    }

    fn subscribe(&self, channel: Channel) -> broadcast::Receiver<BrokerEvent> {
        match channel {
            Channel::Tasks => self.tasks_tx.subscribe(),
            Channel::Agents => self.agents_tx.subscribe(),
            Channel::Events => self.events_tx.subscribe(),
            Channel::Responses => self.responses_tx.subscribe(),
        }
    }

    fn publish(&self, channel: Channel, event: BrokerEvent) {
        let sender = match channel {
            Channel::Tasks => &self.tasks_tx,
            Channel::Agents => &self.agents_tx,
            Channel::Events => &self.events_tx,
            Channel::Responses => &self.responses_tx,
        };
        let _ = sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTaskRequest, TaskPriority};
    use tempfile::tempdir;

    async fn test_broker() -> (SqliteBroker, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::testing();
        config.store_database_path = dir.path().join("test.db");
        let broker = SqliteBroker::connect(&config).await.unwrap();
        (broker, dir)
    }

    fn sample_task(priority: i32) -> Task {
        Task::try_new(
            TaskId::generate(),
            NewTaskRequest {
                name: "do-thing".to_string(),
                priority: Some(TaskPriority::try_new(priority).unwrap()),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn round_trips_a_submitted_task() {
        let (broker, _dir) = test_broker().await;
        let task = sample_task(5);
        broker.publish_task_request(&task).await.unwrap();

        let fetched = broker.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, task.id);
        assert_eq!(fetched.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn pending_tasks_are_ordered_by_priority_descending() {
        let (broker, _dir) = test_broker().await;
        let low = sample_task(2);
        let high = sample_task(9);
        broker.publish_task_request(&low).await.unwrap();
        broker.publish_task_request(&high).await.unwrap();

        let pending = broker.get_pending_tasks(10).await.unwrap();
        assert_eq!(pending[0].id, high.id);
        assert_eq!(pending[1].id, low.id);
    }

    #[tokio::test]
    async fn assign_moves_task_out_of_pending_queue() {
        let (broker, _dir) = test_broker().await;
        let task = sample_task(5);
        broker.publish_task_request(&task).await.unwrap();

        let agent_id = AgentId::generate();
        let assigned = broker.assign_task_to_agent(task.id, agent_id).await.unwrap();
        assert!(assigned);

        let pending = broker.get_pending_tasks(10).await.unwrap();
        assert!(pending.is_empty());

        let fetched = broker.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::InProgress);
        assert_eq!(fetched.assigned_agent_id, Some(agent_id));
    }

    #[tokio::test]
    async fn assign_to_missing_task_returns_false() {
        let (broker, _dir) = test_broker().await;
        let assigned = broker
            .assign_task_to_agent(TaskId::generate(), AgentId::generate())
            .await
            .unwrap();
        assert!(!assigned);
    }

    #[tokio::test]
    async fn completed_task_moves_to_completed_queue() {
        let (broker, _dir) = test_broker().await;
        let mut task = sample_task(5);
        broker.publish_task_request(&task).await.unwrap();
        task.assign(AgentId::generate()).unwrap();
        task.complete(serde_json::Value::Null).unwrap();
        broker.publish_task_response(&task).await.unwrap();

        let completed = broker
            .get_tasks_by_status(TaskStatus::Completed, 10)
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, task.id);
    }

    #[tokio::test]
    async fn increment_retry_reports_new_count_and_exhaustion() {
        let (broker, _dir) = test_broker().await;
        let task = sample_task(5);
        broker.publish_task_request(&task).await.unwrap();

        let first = broker.increment_task_retry(task.id).await.unwrap();
        assert_eq!(first, 1);
    }

    #[tokio::test]
    async fn agent_snapshot_round_trips() {
        let (broker, _dir) = test_broker().await;
        let agent = Agent::register(
            AgentId::generate(),
            crate::domain::ConnectionId::generate(),
            crate::domain::AgentRegistration {
                name: "worker-1".to_string(),
                version: "1.0.0".to_string(),
                capabilities: std::collections::BTreeSet::new(),
                max_concurrent_tasks: crate::domain::MaxConcurrentTasks::try_new(2).unwrap(),
                description: None,
                tags: vec![],
            },
        )
        .unwrap();

        broker.save_agent_snapshot(&agent).await.unwrap();
        let fetched = broker.get_agent_snapshot(agent.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, agent.id);
    }

    #[tokio::test]
    async fn publish_and_subscribe_deliver_exactly_once_per_subscriber() {
        let (broker, _dir) = test_broker().await;
        let mut rx1 = broker.subscribe(Channel::Events);
        let mut rx2 = broker.subscribe(Channel::Events);

        broker.publish(
            Channel::Events,
            BrokerEvent::new("SystemEvent", None, serde_json::json!({"ok": true})),
        );

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.id, e2.id);
        assert_eq!(e1.event_type, "SystemEvent");
    }

    #[tokio::test]
    async fn key_prefix_isolates_namespaces_sharing_one_database() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("shared.db");

        let mut dev_config = EngineConfig::testing();
        dev_config.store_database_path = db_path.clone();
        dev_config.store_key_prefix = "dev".to_string();
        let dev_broker = SqliteBroker::connect(&dev_config).await.unwrap();

        let mut prod_config = EngineConfig::testing();
        prod_config.store_database_path = db_path;
        prod_config.store_key_prefix = "prod".to_string();
        let prod_broker = SqliteBroker::connect(&prod_config).await.unwrap();

        let task = sample_task(5);
        dev_broker.publish_task_request(&task).await.unwrap();

        assert!(dev_broker.get_task(task.id).await.unwrap().is_some());
        assert!(prod_broker.get_task(task.id).await.unwrap().is_none());
    }
}
