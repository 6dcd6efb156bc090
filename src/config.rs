//! Engine configuration: presets, validation, a fluent builder, and JSON
//! file persistence, mirroring the router configuration pattern used
//! elsewhere in this codebase.

use std::path::PathBuf;

use nutype::nutype;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{MaxRetries, TaskTimeoutMs};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field failed a cross-field or range consistency check.
    #[error("invalid configuration: {field} - {reason}")]
    Validation {
        /// The offending field.
        field: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Reading or writing the config file failed.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// The config file's JSON was malformed or didn't match the schema.
    #[error("serialization error: {source}")]
    Serialization {
        /// The underlying serde error.
        #[from]
        source: serde_json::Error,
    },
}

/// TCP port the WebSocket transport listens on.
#[nutype(
    validate(greater_or_equal = 1),
    derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, TryFrom, Into),
    default = 7400
)]
pub struct WebSocketPort(u16);

/// Application-level liveness ping interval, in milliseconds.
#[nutype(
    validate(greater_or_equal = 1000, less_or_equal = 300_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 15_000
)]
pub struct PingIntervalMs(u64);

/// Upper bound on simultaneously accepted transport connections.
#[nutype(
    validate(greater_or_equal = 1),
    derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, TryFrom, Into),
    default = 10_000
)]
pub struct MaxConnections(u32);

/// Expected interval between agent heartbeats, in milliseconds.
#[nutype(
    validate(greater_or_equal = 1000, less_or_equal = 300_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 30_000
)]
pub struct HeartbeatIntervalMs(u64);

/// Missed heartbeats tolerated before an agent is marked `Offline`.
#[nutype(
    validate(greater_or_equal = 1),
    derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, TryFrom, Into),
    default = 3
)]
pub struct MaxMissedHeartbeats(u32);

/// TTL for an agent snapshot in the store, in milliseconds.
#[nutype(
    validate(greater_or_equal = 1000),
    derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, TryFrom, Into),
    default = 600_000
)]
pub struct AgentTtlMs(u64);

/// TTL for a completed task record in the store, in milliseconds.
#[nutype(
    validate(greater_or_equal = 1000),
    derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, TryFrom, Into),
    default = 86_400_000
)]
pub struct TaskTtlMs(u64);

/// SQLite connection pool size.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, TryFrom, Into),
    default = 10
)]
pub struct StorePoolSize(u32);

/// How often the router polls the pending queue, in milliseconds.
#[nutype(
    validate(greater_or_equal = 10),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 500
)]
pub struct QueuePollIntervalMs(u64);

/// Number of pending tasks fetched per router poll.
#[nutype(
    validate(greater_or_equal = 1),
    derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, TryFrom, Into),
    default = 50
)]
pub struct RouterBatchSize(u32);

/// How often the status tracker samples system health, in milliseconds.
#[nutype(
    validate(greater_or_equal = 1000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 30_000
)]
pub struct MetricsIntervalMs(u64);

/// Consecutive failures before a circuit breaker opens.
#[nutype(
    validate(greater_or_equal = 1),
    derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, TryFrom, Into),
    default = 5
)]
pub struct CircuitBreakerThreshold(u32);

/// How long an open breaker waits before probing `HalfOpen`, in milliseconds.
#[nutype(
    validate(greater_or_equal = 1000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 60_000
)]
pub struct CircuitBreakerTimeoutMs(u64);

/// Log output shape (`text.logFormat` in §6.4/§1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LogFormat {
    /// Human-readable, for local development.
    #[default]
    Text,
    /// Structured JSON, for log aggregation in production.
    Json,
}

/// Complete engine configuration, covering every key in §6.4 plus the
/// ambient knobs named in §1.1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// `websocket.port`
    pub websocket_port: WebSocketPort,
    /// `websocket.path`
    pub websocket_path: String,
    /// `websocket.pingInterval`
    pub websocket_ping_interval_ms: PingIntervalMs,
    /// `websocket.maxConnections`
    pub websocket_max_connections: MaxConnections,

    /// `agents.heartbeatInterval`
    pub agents_heartbeat_interval_ms: HeartbeatIntervalMs,
    /// `agents.maxMissedHeartbeats`
    pub agents_max_missed_heartbeats: MaxMissedHeartbeats,
    /// `agents.ttl`
    pub agents_ttl_ms: AgentTtlMs,

    /// `tasks.defaultTimeout`
    pub tasks_default_timeout_ms: TaskTimeoutMs,
    /// `tasks.defaultRetries`
    pub tasks_default_retries: MaxRetries,
    /// `tasks.ttl`
    pub tasks_ttl_ms: TaskTtlMs,

    /// `store.keyPrefix`
    pub store_key_prefix: String,
    /// `store.databasePath`
    pub store_database_path: PathBuf,
    /// `store.poolSize`
    pub store_pool_size: StorePoolSize,

    /// `router.queuePollInterval`
    pub router_queue_poll_interval_ms: QueuePollIntervalMs,
    /// `router.batchSize`
    pub router_batch_size: RouterBatchSize,

    /// `metrics.collectionInterval`
    pub metrics_collection_interval_ms: MetricsIntervalMs,

    /// `errors.circuitBreakerThreshold`
    pub errors_circuit_breaker_threshold: CircuitBreakerThreshold,
    /// `errors.circuitBreakerTimeout`
    pub errors_circuit_breaker_timeout_ms: CircuitBreakerTimeoutMs,
    /// `errors.retryDelays`
    pub errors_retry_delays_ms: Vec<u64>,

    /// `observability.logFormat`
    pub observability_log_format: LogFormat,
}

impl EngineConfig {
    /// Development preset: small pool, frequent polling, human-readable logs.
    ///
    /// # Panics
    ///
    /// Panics if any hardcoded value is out of range for its domain type.
    #[must_use]
    pub fn development() -> Self {
        Self {
            websocket_port: WebSocketPort::try_new(7400).unwrap(),
            websocket_path: "/ws".to_string(),
            websocket_ping_interval_ms: PingIntervalMs::try_new(15_000).unwrap(),
            websocket_max_connections: MaxConnections::try_new(100).unwrap(),

            agents_heartbeat_interval_ms: HeartbeatIntervalMs::try_new(10_000).unwrap(),
            agents_max_missed_heartbeats: MaxMissedHeartbeats::try_new(3).unwrap(),
            agents_ttl_ms: AgentTtlMs::try_new(300_000).unwrap(),

            tasks_default_timeout_ms: TaskTimeoutMs::try_new(30_000).unwrap(),
            tasks_default_retries: MaxRetries::try_new(3).unwrap(),
            tasks_ttl_ms: TaskTtlMs::try_new(3_600_000).unwrap(),

            store_key_prefix: "dev".to_string(),
            store_database_path: PathBuf::from("./data/dev.db"),
            store_pool_size: StorePoolSize::try_new(2).unwrap(),

            router_queue_poll_interval_ms: QueuePollIntervalMs::try_new(250).unwrap(),
            router_batch_size: RouterBatchSize::try_new(10).unwrap(),

            metrics_collection_interval_ms: MetricsIntervalMs::try_new(10_000).unwrap(),

            errors_circuit_breaker_threshold: CircuitBreakerThreshold::try_new(3).unwrap(),
            errors_circuit_breaker_timeout_ms: CircuitBreakerTimeoutMs::try_new(30_000).unwrap(),
            errors_retry_delays_ms: vec![1_000, 2_000, 5_000, 10_000],

            observability_log_format: LogFormat::Text,
        }
    }

    /// Production preset: larger pool, wider polling interval, JSON logs.
    ///
    /// # Panics
    ///
    /// Panics if any hardcoded value is out of range for its domain type.
    #[must_use]
    pub fn production() -> Self {
        Self {
            websocket_port: WebSocketPort::try_new(7400).unwrap(),
            websocket_path: "/ws".to_string(),
            websocket_ping_interval_ms: PingIntervalMs::try_new(15_000).unwrap(),
            websocket_max_connections: MaxConnections::try_new(10_000).unwrap(),

            agents_heartbeat_interval_ms: HeartbeatIntervalMs::try_new(30_000).unwrap(),
            agents_max_missed_heartbeats: MaxMissedHeartbeats::try_new(3).unwrap(),
            agents_ttl_ms: AgentTtlMs::try_new(600_000).unwrap(),

            tasks_default_timeout_ms: TaskTimeoutMs::try_new(60_000).unwrap(),
            tasks_default_retries: MaxRetries::try_new(3).unwrap(),
            tasks_ttl_ms: TaskTtlMs::try_new(86_400_000).unwrap(),

            store_key_prefix: "prod".to_string(),
            store_database_path: PathBuf::from("./data/delegate-engine.db"),
            store_pool_size: StorePoolSize::try_new(20).unwrap(),

            router_queue_poll_interval_ms: QueuePollIntervalMs::try_new(500).unwrap(),
            router_batch_size: RouterBatchSize::try_new(50).unwrap(),

            metrics_collection_interval_ms: MetricsIntervalMs::try_new(30_000).unwrap(),

            errors_circuit_breaker_threshold: CircuitBreakerThreshold::try_new(5).unwrap(),
            errors_circuit_breaker_timeout_ms: CircuitBreakerTimeoutMs::try_new(60_000).unwrap(),
            errors_retry_delays_ms: vec![1_000, 2_000, 5_000, 10_000],

            observability_log_format: LogFormat::Json,
        }
    }

    /// Testing preset: in-memory-speed settings, minimal intervals, one
    /// connection.
    ///
    /// # Panics
    ///
    /// Panics if any hardcoded value is out of range for its domain type.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            websocket_port: WebSocketPort::try_new(0).unwrap_or_else(|_| {
                WebSocketPort::try_new(1).expect("port 1 is in range")
            }),
            websocket_path: "/ws".to_string(),
            websocket_ping_interval_ms: PingIntervalMs::try_new(1_000).unwrap(),
            websocket_max_connections: MaxConnections::try_new(10).unwrap(),

            agents_heartbeat_interval_ms: HeartbeatIntervalMs::try_new(1_000).unwrap(),
            agents_max_missed_heartbeats: MaxMissedHeartbeats::try_new(2).unwrap(),
            agents_ttl_ms: AgentTtlMs::try_new(60_000).unwrap(),

            tasks_default_timeout_ms: TaskTimeoutMs::try_new(5_000).unwrap(),
            tasks_default_retries: MaxRetries::try_new(1).unwrap(),
            tasks_ttl_ms: TaskTtlMs::try_new(60_000).unwrap(),

            store_key_prefix: "test".to_string(),
            store_database_path: PathBuf::from(":memory:"),
            store_pool_size: StorePoolSize::try_new(1).unwrap(),

            router_queue_poll_interval_ms: QueuePollIntervalMs::try_new(10).unwrap(),
            router_batch_size: RouterBatchSize::try_new(5).unwrap(),

            metrics_collection_interval_ms: MetricsIntervalMs::try_new(1_000).unwrap(),

            errors_circuit_breaker_threshold: CircuitBreakerThreshold::try_new(2).unwrap(),
            errors_circuit_breaker_timeout_ms: CircuitBreakerTimeoutMs::try_new(1_000).unwrap(),
            errors_retry_delays_ms: vec![10, 20, 50, 100],

            observability_log_format: LogFormat::Text,
        }
    }

    /// Starts a fluent builder seeded with development defaults.
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Cross-field consistency checks beyond each field's own bounds.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` if any cross-field constraint fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agents_max_missed_heartbeats.into_inner() as u64
            * self.agents_heartbeat_interval_ms.into_inner()
            >= self.agents_ttl_ms.into_inner()
        {
            return Err(ConfigError::Validation {
                field: "agents_ttl_ms".to_string(),
                reason: "must exceed heartbeatInterval * maxMissedHeartbeats".to_string(),
            });
        }

        if self.errors_circuit_breaker_timeout_ms.into_inner()
            < self.errors_retry_delays_ms.iter().sum::<u64>()
        {
            return Err(ConfigError::Validation {
                field: "errors_circuit_breaker_timeout_ms".to_string(),
                reason: "should be at least the sum of the retry backoff ladder".to_string(),
            });
        }

        if self.store_key_prefix.trim().is_empty() {
            return Err(ConfigError::Validation {
                field: "store_key_prefix".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        if self.router_batch_size.into_inner() > 10_000 {
            return Err(ConfigError::Validation {
                field: "router_batch_size".to_string(),
                reason: "unreasonably large batch size".to_string(),
            });
        }

        Ok(())
    }

    /// Serializes to pretty JSON and writes it to `path`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if serialization or the write fails.
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Reads and validates a configuration previously written by
    /// `save_to_file`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read, parsed, or fails
    /// validation.
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::development()
    }
}

/// Fluent builder over `EngineConfig`, seeded with development defaults.
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Starts from `EngineConfig::development()`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: EngineConfig::development(),
        }
    }

    /// Sets the WebSocket listen port.
    #[must_use]
    pub fn websocket_port(mut self, port: WebSocketPort) -> Self {
        self.config.websocket_port = port;
        self
    }

    /// Sets the SQLite database path.
    #[must_use]
    pub fn store_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.store_database_path = path.into();
        self
    }

    /// Sets the SQLite connection pool size.
    #[must_use]
    pub fn store_pool_size(mut self, size: StorePoolSize) -> Self {
        self.config.store_pool_size = size;
        self
    }

    /// Sets the router queue-poll interval.
    #[must_use]
    pub fn router_queue_poll_interval_ms(mut self, interval: QueuePollIntervalMs) -> Self {
        self.config.router_queue_poll_interval_ms = interval;
        self
    }

    /// Sets the circuit breaker failure threshold.
    #[must_use]
    pub fn errors_circuit_breaker_threshold(mut self, threshold: CircuitBreakerThreshold) -> Self {
        self.config.errors_circuit_breaker_threshold = threshold;
        self
    }

    /// Sets the log output format.
    #[must_use]
    pub fn observability_log_format(mut self, format: LogFormat) -> Self {
        self.config.observability_log_format = format;
        self
    }

    /// Validates and returns the built configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the resulting configuration fails validation.
    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
