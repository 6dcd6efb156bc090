//! Error Handler (C6): error classification, the recovery-strategy ladder,
//! and the per-agent circuit breaker (§4.6).

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::domain::{
    AgentId, CircuitBreakerState, ErrorContext, ErrorContextId, ErrorKind, RecoveryStrategy, TaskId,
    Timestamp,
};
use crate::store::{Broker, BrokerEvent, Channel};

/// Wait between rungs of the fallback ladder once a strategy's own work is
/// exhausted (§4.6: "each advance waits 5 s").
const LADDER_ADVANCE_DELAY_MS: u64 = 5_000;

/// Per-agent circuit breakers, classified error contexts, and the two
/// background sweeps that drive them (C6).
pub struct ErrorHandler {
    breakers: DashMap<AgentId, CircuitBreakerState>,
    contexts: DashMap<ErrorContextId, ErrorContext>,
    broker: Arc<dyn Broker>,
    circuit_breaker_threshold: u32,
    circuit_breaker_timeout_ms: u64,
    default_max_retries: u32,
    ladder_advance_delay_ms: u64,
}

impl ErrorHandler {
    /// Builds an empty error handler bound to `broker`.
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        circuit_breaker_threshold: u32,
        circuit_breaker_timeout_ms: u64,
        default_max_retries: u32,
    ) -> Self {
        Self {
            breakers: DashMap::new(),
            contexts: DashMap::new(),
            broker,
            circuit_breaker_threshold,
            circuit_breaker_timeout_ms,
            default_max_retries,
            ladder_advance_delay_ms: LADDER_ADVANCE_DELAY_MS,
        }
    }

    #[cfg(test)]
    fn with_fast_ladder(mut self) -> Self {
        self.ladder_advance_delay_ms = 1;
        self
    }

    /// Current breaker mode for `agent_id`, `Closed` if none is tracked yet.
    #[must_use]
    pub fn breaker_mode(&self, agent_id: AgentId) -> crate::domain::CircuitBreakerMode {
        self.breakers
            .get(&agent_id)
            .map_or(crate::domain::CircuitBreakerMode::Closed, |b| b.mode)
    }

    /// Whether a recovery attempt against `agent_id` should be skipped
    /// because its breaker is open (§4.6).
    #[must_use]
    pub fn blocks_recovery(&self, agent_id: AgentId) -> bool {
        self.breakers
            .get(&agent_id)
            .is_some_and(|b| b.blocks_recovery())
    }

    /// Records a task success against `agent_id`'s breaker, closing it if it
    /// was `HalfOpen`.
    pub fn record_success(&self, agent_id: AgentId) {
        self.breakers.entry(agent_id).or_default().record_success();
    }

    /// Classifies `message` into a new `ErrorContext`, records a circuit
    /// breaker failure if `agent_id` is set, and drives the context to
    /// resolution via the recovery-strategy ladder.
    ///
    /// # Errors
    ///
    /// Returns `crate::store::StoreError` if a store operation the chosen
    /// strategy depends on fails.
    #[instrument(skip(self, message, details))]
    pub async fn record_error(
        &self,
        task_id: Option<TaskId>,
        agent_id: Option<AgentId>,
        kind: ErrorKind,
        message: impl Into<String> + std::fmt::Debug,
        details: Option<String>,
    ) -> Result<ErrorContextId, crate::store::StoreError> {
        let message = format!("{message:?}").trim_matches('"').to_string();
        let mut ctx = ErrorContext::new(
            ErrorContextId::generate(),
            task_id,
            agent_id,
            kind,
            message,
            details,
            self.default_max_retries,
        );

        if ctx.severity == crate::domain::ErrorSeverity::Critical {
            self.broker.publish(
                Channel::Events,
                BrokerEvent::new(
                    "CriticalError",
                    agent_id,
                    serde_json::json!({ "errorContextId": ctx.id, "message": ctx.message }),
                ),
            );
        }

        if let Some(agent_id) = agent_id
            && matches!(kind, ErrorKind::Communication | ErrorKind::TaskFailure)
        {
            self.breakers
                .entry(agent_id)
                .or_default()
                .record_failure(self.circuit_breaker_threshold, self.circuit_breaker_timeout_ms);
        }

        let id = ctx.id;
        self.drive_to_resolution(&mut ctx).await?;
        self.contexts.insert(id, ctx);
        Ok(id)
    }

    /// Runs `ctx`'s current strategy, advancing down the fallback ladder
    /// `Reassign → Retry → Fallback → Escalate → Abort` each time the
    /// current rung can't make progress, until one rung resolves the
    /// context (§4.6).
    async fn drive_to_resolution(
        &self,
        ctx: &mut ErrorContext,
    ) -> Result<(), crate::store::StoreError> {
        loop {
            match ctx.recovery_strategy {
                RecoveryStrategy::CircuitBreaker => {
                    ctx.recovery_strategy = RecoveryStrategy::Reassign;
                }
                RecoveryStrategy::Reassign => {
                    if let Some(task_id) = ctx.task_id {
                        self.release_task(task_id).await?;
                    }
                    ctx.resolve();
                    return Ok(());
                }
                RecoveryStrategy::Retry => {
                    let agent_blocks = ctx.agent_id.is_some_and(|a| self.blocks_recovery(a));
                    let Some(task_id) = ctx.task_id else {
                        ctx.advance_strategy();
                        self.sleep_ladder_delay().await;
                        continue;
                    };
                    if agent_blocks {
                        ctx.advance_strategy();
                        self.sleep_ladder_delay().await;
                        continue;
                    }
                    match self.broker.increment_task_retry(task_id).await {
                        Ok(count) => {
                            self.release_task(task_id).await?;
                            ctx.retry_count = count;
                            ctx.resolve();
                            return Ok(());
                        }
                        Err(crate::store::StoreError::RetriesExhausted { .. }) => {
                            ctx.advance_strategy();
                            self.sleep_ladder_delay().await;
                        }
                        Err(e) => return Err(e),
                    }
                }
                RecoveryStrategy::Fallback => {
                    // No fallback handler is registered for any task kind
                    // yet; there is nothing to try here, so the ladder
                    // keeps moving.
                    self.broker.publish(
                        Channel::Events,
                        BrokerEvent::new(
                            "FallbackHandling",
                            ctx.agent_id,
                            serde_json::json!({ "errorContextId": ctx.id, "taskId": ctx.task_id }),
                        ),
                    );
                    ctx.advance_strategy();
                    self.sleep_ladder_delay().await;
                }
                RecoveryStrategy::Escalate => {
                    // Notifies operators, but this engine has no synchronous
                    // human-in-the-loop step, so escalation still falls
                    // through to an automatic abort.
                    self.broker.publish(
                        Channel::Events,
                        BrokerEvent::new(
                            "Escalated",
                            ctx.agent_id,
                            serde_json::json!({ "errorContextId": ctx.id, "taskId": ctx.task_id }),
                        ),
                    );
                    ctx.advance_strategy();
                    self.sleep_ladder_delay().await;
                }
                RecoveryStrategy::Abort => {
                    if let Some(task_id) = ctx.task_id {
                        self.abort_task(task_id).await?;
                    }
                    ctx.resolve();
                    return Ok(());
                }
            }
        }
    }

    async fn sleep_ladder_delay(&self) {
        tokio::time::sleep(std::time::Duration::from_millis(self.ladder_advance_delay_ms)).await;
    }

    async fn release_task(&self, task_id: TaskId) -> Result<(), crate::store::StoreError> {
        let Some(mut task) = self.broker.get_task(task_id).await? else {
            return Ok(());
        };
        if task.status.is_terminal() {
            return Ok(());
        }
        let _ = task.release_for_reassignment();
        self.broker.publish_task_response(&task).await
    }

    async fn abort_task(&self, task_id: TaskId) -> Result<(), crate::store::StoreError> {
        let Some(mut task) = self.broker.get_task(task_id).await? else {
            return Ok(());
        };
        if task.status.is_terminal() {
            return Ok(());
        }
        let _ = task.fail("Task aborted");
        self.broker.publish_task_response(&task).await
    }

    /// Looks up a previously recorded context by id, for diagnostics/tests.
    #[must_use]
    pub fn context(&self, id: ErrorContextId) -> Option<ErrorContext> {
        self.contexts.get(&id).map(|e| e.clone())
    }

    /// Moves every `Open` breaker whose timeout has elapsed into `HalfOpen`
    /// (`checkCircuitBreakers`, §4.6, run every 10 s).
    fn check_circuit_breakers(&self) {
        let now = Timestamp::now();
        for mut entry in self.breakers.iter_mut() {
            entry.tick(now);
        }
    }

    /// Spawns the circuit-breaker sweep (every 10 s) and the `Responses`/
    /// `Events` subscriptions that turn terminal task failures and routing
    /// failures into classified error contexts (§4.6, §4.7 `Start`).
    pub fn spawn_sweeps(self: &Arc<Self>, shutdown: CancellationToken) {
        self.spawn_circuit_breaker_sweep(shutdown.clone());
        self.spawn_failure_subscription(shutdown.clone());
        self.spawn_routing_failure_subscription(shutdown);
    }

    fn spawn_circuit_breaker_sweep(self: &Arc<Self>, shutdown: CancellationToken) {
        let handler = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(10));
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => handler.check_circuit_breakers(),
                }
            }
        });
    }

    fn spawn_failure_subscription(self: &Arc<Self>, shutdown: CancellationToken) {
        let handler = self.clone();
        let mut events = self.broker.subscribe(Channel::Responses);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = events.recv() => {
                        match event {
                            Ok(event) if event.event_type == "TaskResponse" => {
                                handler.handle_task_response_event(&event).await;
                            }
                            Ok(_) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "error handler lagged behind responses channel");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });
    }

    async fn handle_task_response_event(&self, event: &BrokerEvent) {
        let Some(status) = event.payload.get("status").and_then(|v| v.as_str()) else {
            return;
        };
        let Some(task_id) = event
            .payload
            .get("taskId")
            .and_then(|v| v.as_str())
            .and_then(|s| uuid::Uuid::parse_str(s).ok())
            .map(TaskId::from)
        else {
            return;
        };

        match status {
            "completed" => {
                if let Some(agent_id) = event.agent_id {
                    self.record_success(agent_id);
                }
            }
            "failed" => {
                if let Err(e) = self
                    .record_error(
                        Some(task_id),
                        event.agent_id,
                        ErrorKind::TaskFailure,
                        "task failed".to_string(),
                        None,
                    )
                    .await
                {
                    warn!(error = %e, "failed to record task-failure error context");
                }
            }
            _ => {}
        }
    }

    fn spawn_routing_failure_subscription(self: &Arc<Self>, shutdown: CancellationToken) {
        let handler = self.clone();
        let mut events = self.broker.subscribe(Channel::Events);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = events.recv() => {
                        match event {
                            Ok(event) if event.event_type == "RoutingFailed" => {
                                let task_id = event
                                    .payload
                                    .get("taskId")
                                    .and_then(|v| v.as_str())
                                    .and_then(|s| uuid::Uuid::parse_str(s).ok())
                                    .map(TaskId::from);
                                if let Err(e) = handler
                                    .record_error(
                                        task_id,
                                        event.agent_id,
                                        ErrorKind::Routing,
                                        "routing failed".to_string(),
                                        None,
                                    )
                                    .await
                                {
                                    warn!(error = %e, "failed to record routing-failure error context");
                                }
                            }
                            Ok(_) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "error handler lagged behind events channel");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });
    }
}
