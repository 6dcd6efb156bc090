//! Transport Server (C2): authenticated, long-lived agent connections over a
//! framed WebSocket stream, liveness pings, and the per-connection state
//! machine (§4.2/§6.2).
//!
//! Split functional core / imperative shell, the pattern this codebase uses
//! throughout: [`handle_envelope`] and the parsing helpers are pure and unit
//! tested directly; [`serve`] and [`handle_socket`] are the thin I/O shell
//! wiring axum's WebSocket extractor to that core.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicU32, Ordering};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::domain::{
    AgentId, AgentRegistration, AgentStatus, Capability, ConnectionId, MaxConcurrentTasks, Task,
    Timestamp,
};
use crate::registry::Registry;
use crate::router::Router as TaskRouter;
use crate::status::StatusTracker;
use crate::store::{Broker, BrokerEvent, Channel, StoreError};

/// Hard ceiling on a single message envelope, per §6.2.
pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Protocol violations tolerated on one connection before it is closed, per
/// the "persistent protocol violation closes the connection" clause (§4.2).
const MAX_PROTOCOL_VIOLATIONS: u32 = 5;

/// Discriminant of the agent wire envelope (§6.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// Worker claims an `AgentId` and advertises its capabilities.
    AgentRegister,
    /// Worker reports liveness and current load.
    AgentHeartbeat,
    /// Server dispatches a task to a worker.
    TaskRequest,
    /// Worker reports progress or a terminal outcome.
    TaskResponse,
    /// Either side reports a non-protocol event.
    SystemEvent,
    /// Either side reports a protocol-level error.
    Error,
}

/// The envelope every agent wire message shares: `{id, type, timestamp,
/// agentId, ...payload}` (§6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique id for this message.
    pub id: String,
    /// Discriminant.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Milliseconds since the epoch, stamped by the sender.
    pub timestamp: i64,
    /// The agent this message concerns. Required on `AgentRegister` and
    /// every subsequent message from a registered connection.
    #[serde(rename = "agentId", default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Type-specific detail.
    #[serde(flatten)]
    pub payload: serde_json::Value,
}

impl MessageEnvelope {
    /// Builds a server-originated envelope, stamping a fresh id and the
    /// current time.
    #[must_use]
    pub fn new(message_type: MessageType, agent_id: Option<AgentId>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            timestamp: Timestamp::now().into_inner(),
            agent_id: agent_id.map(|id| id.to_string()),
            payload,
        }
    }

    fn to_ws_message(&self) -> Result<Message, TransportError> {
        let text = serde_json::to_string(self).map_err(|e| TransportError::MessageProcessingError {
            reason: e.to_string(),
        })?;
        Ok(Message::Text(text.into()))
    }
}

/// Registration payload fields (§6.2).
#[derive(Debug, Clone, Deserialize)]
struct RegisterPayload {
    name: String,
    version: String,
    capabilities: Vec<String>,
    #[serde(rename = "maxConcurrentTasks")]
    max_concurrent_tasks: u32,
    description: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

/// Heartbeat payload fields (§6.2).
#[derive(Debug, Clone, Deserialize)]
struct HeartbeatPayload {
    status: String,
    #[serde(rename = "currentTasks")]
    current_tasks: u32,
}

/// Terminal/progress response payload fields (§6.2).
#[derive(Debug, Clone, Deserialize)]
struct TaskResponsePayload {
    #[serde(rename = "taskId")]
    task_id: String,
    status: String,
    progress: Option<u8>,
    result: Option<serde_json::Value>,
    error: Option<String>,
}

/// Per-connection lifecycle state (§4.2 state machine). `Accepted` is
/// implicit: a connection only exists in the table once it reaches `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Authenticated, not yet registered to an agent.
    Open,
    /// Registered to a claimed `AgentId`.
    Registered(AgentId),
}

/// Errors surfaced as typed error frames or connection closure (§4.2).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The handshake's bearer token was missing or rejected.
    #[error("authentication required")]
    AuthRequired,
    /// The envelope failed to parse or its payload didn't match its type.
    #[error("invalid message: {reason}")]
    InvalidMessage {
        /// Why the message was rejected.
        reason: String,
    },
    /// A message type requiring registration arrived on an unregistered
    /// connection.
    #[error("agent not registered")]
    AgentNotRegistered,
    /// Processing an otherwise well-formed message failed.
    #[error("message processing error: {reason}")]
    MessageProcessingError {
        /// What went wrong.
        reason: String,
    },
    /// No live connection exists for the target agent.
    #[error("agent {agent_id} has no live connection")]
    NoConnection {
        /// The agent that could not be reached.
        agent_id: AgentId,
    },
}

impl TransportError {
    fn as_error_frame(&self) -> MessageEnvelope {
        MessageEnvelope::new(
            MessageType::Error,
            None,
            serde_json::json!({ "code": self.code(), "message": self.to_string() }),
        )
    }

    fn code(&self) -> &'static str {
        match self {
            Self::AuthRequired => "AuthRequired",
            Self::InvalidMessage { .. } => "InvalidMessage",
            Self::AgentNotRegistered => "AgentNotRegistered",
            Self::MessageProcessingError { .. } => "MessageProcessingError",
            Self::NoConnection { .. } => "NoConnection",
        }
    }
}

/// A message type not handled inline (`SystemEvent`, `Error`, or an
/// unexpected `TaskRequest`/`TaskResponse` direction), forwarded to C7
/// verbatim (§4.2).
#[derive(Debug, Clone)]
pub struct ForwardedMessage {
    /// The connection it arrived on.
    pub connection_id: ConnectionId,
    /// The agent it claims to be from, if registered.
    pub agent_id: Option<AgentId>,
    /// The envelope itself.
    pub envelope: MessageEnvelope,
}

/// Validates a bearer token against the external auth service (§6.2). Out of
/// scope for this crate; callers inject their own implementation. The
/// default accepts any non-empty token and is suitable only for local
/// development and tests.
pub trait TokenValidator: Send + Sync {
    /// Returns the authenticated `userId` on success.
    fn validate(&self, token: &str) -> Option<String>;
}

/// Accepts any non-empty token. Stands in for the external auth service this
/// crate deliberately does not implement (§1 Scope).
#[derive(Debug, Default)]
pub struct PermissiveTokenValidator;

impl TokenValidator for PermissiveTokenValidator {
    fn validate(&self, token: &str) -> Option<String> {
        if token.is_empty() {
            None
        } else {
            Some(token.to_string())
        }
    }
}

struct ConnectionHandle {
    out_tx: mpsc::UnboundedSender<Message>,
    state: Mutex<ConnectionState>,
    violations: AtomicU32,
}

/// Shared transport state: the connection table, the agent→connection
/// reverse index, and the collaborators inline handling touches (§3
/// Ownership: `Agent.ConnectionId` is a lookup key here, never
/// lifetime-extending).
pub struct TransportServer {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    agent_connections: DashMap<AgentId, ConnectionId>,
    registry: Arc<Registry>,
    broker: Arc<dyn Broker>,
    token_validator: Arc<dyn TokenValidator>,
    forward_tx: mpsc::UnboundedSender<ForwardedMessage>,
    ping_interval_ms: u64,
    heartbeat_interval_ms: u64,
    max_missed_heartbeats: u32,
    websocket_path: String,
    max_connections: u32,
    /// C4, wired in once the facade has built it (construction order: C2
    /// before C4). Used to close out the assignment for a task that just
    /// reached a terminal status over the wire.
    router: OnceLock<Arc<TaskRouter>>,
    /// C5, wired in once the facade has built it, for the same reason.
    status: OnceLock<Arc<StatusTracker>>,
}

impl TransportServer {
    /// Builds a transport server bound to `registry`/`broker`, returning it
    /// alongside the receiver of forwarded (non-inline) messages.
    #[must_use]
    pub fn new(
        config: &EngineConfig,
        registry: Arc<Registry>,
        broker: Arc<dyn Broker>,
        token_validator: Arc<dyn TokenValidator>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ForwardedMessage>) {
        let (forward_tx, forward_rx) = mpsc::unbounded_channel();
        let server = Arc::new(Self {
            connections: DashMap::new(),
            agent_connections: DashMap::new(),
            registry,
            broker,
            token_validator,
            forward_tx,
            ping_interval_ms: config.websocket_ping_interval_ms.into_inner(),
            heartbeat_interval_ms: config.agents_heartbeat_interval_ms.into_inner(),
            max_missed_heartbeats: config.agents_max_missed_heartbeats.into_inner(),
            websocket_path: config.websocket_path.clone(),
            max_connections: config.websocket_max_connections.into_inner(),
            router: OnceLock::new(),
            status: OnceLock::new(),
        });
        (server, forward_rx)
    }

    /// Wires in C4, once built. Called exactly once during facade
    /// construction, after the router that depends on this transport server
    /// for dispatch has itself been built.
    pub fn set_router(&self, router: Arc<TaskRouter>) {
        let _ = self.router.set(router);
    }

    /// Wires in C5, once built. Called exactly once during facade
    /// construction.
    pub fn set_status(&self, status: Arc<StatusTracker>) {
        let _ = self.status.set(status);
    }

    fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(&self.websocket_path, get(ws_upgrade))
            .with_state(self.clone())
    }

    /// Binds `listener` and serves agent connections until `shutdown` fires,
    /// per the top-down shutdown sequence (§5): this is the first thing
    /// `Engine::stop` cancels.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind or serve.
    #[instrument(skip(self, listener, shutdown))]
    pub async fn serve(
        self: &Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, path = %self.websocket_path, "transport server listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    }

    /// Spawns the independent agent-staleness sweep: for every registered
    /// agent, `now - lastSeen > heartbeatInterval * maxMissedHeartbeats`
    /// marks it `Offline` and emits `AgentStale` (§4.2).
    pub fn spawn_stale_agent_sweep(self: &Arc<Self>, shutdown: CancellationToken) {
        let transport = self.clone();
        tokio::spawn(async move {
            let threshold_ms =
                transport.heartbeat_interval_ms * u64::from(transport.max_missed_heartbeats);
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(
                transport.heartbeat_interval_ms,
            ));
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        transport.sweep_stale_agents(threshold_ms).await;
                    }
                }
            }
        });
    }

    async fn sweep_stale_agents(&self, threshold_ms: u64) {
        let now = Timestamp::now();
        for agent in self.registry.connected() {
            if now.elapsed_ms_since(agent.last_seen) > threshold_ms {
                if let Ok(stale) = self.registry.mark_disconnected(agent.id) {
                    self.agent_connections.remove(&agent.id);
                    let _ = self.broker.save_agent_snapshot(&stale).await;
                    self.broker.publish(
                        Channel::Agents,
                        BrokerEvent::new("AgentStale", Some(agent.id), serde_json::json!({})),
                    );
                }
            }
        }
    }

    /// Sends a `TaskRequest` to `agent_id`'s live connection (§4.4
    /// dispatch). Returns `TransportError::NoConnection` if the agent has
    /// no registered connection, which the router treats as a dispatch
    /// failure (`RoutingFailed`).
    ///
    /// # Errors
    ///
    /// Returns `TransportError::NoConnection` if the agent is not connected,
    /// or `TransportError::MessageProcessingError` if serialization fails.
    pub fn dispatch_task(&self, agent_id: AgentId, task: &Task) -> Result<(), TransportError> {
        let connection_id =
            self.agent_connections
                .get(&agent_id)
                .map(|entry| *entry)
                .ok_or(TransportError::NoConnection { agent_id })?;
        let handle = self
            .connections
            .get(&connection_id)
            .ok_or(TransportError::NoConnection { agent_id })?;

        let envelope = MessageEnvelope::new(
            MessageType::TaskRequest,
            Some(agent_id),
            serde_json::json!({
                "taskId": task.id,
                "name": task.name,
                "description": task.description,
                "parameters": task.parameters,
                "requiredCapabilities": task.required_capabilities,
                "timeoutMs": task.timeout.map(|t| t.into_inner()),
                "maxRetries": task.max_retries,
                "priority": task.priority,
            }),
        );
        let message = envelope.to_ws_message()?;
        handle
            .out_tx
            .send(message)
            .map_err(|_| TransportError::NoConnection { agent_id })
    }

    /// Count of connections currently accepted, open or registered.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn register_connection(&self, connection_id: ConnectionId, out_tx: mpsc::UnboundedSender<Message>) {
        self.connections.insert(
            connection_id,
            Arc::new(ConnectionHandle {
                out_tx,
                state: Mutex::new(ConnectionState::Open),
                violations: AtomicU32::new(0),
            }),
        );
    }

    async fn handle_disconnect(&self, connection_id: ConnectionId) {
        let Some((_, handle)) = self.connections.remove(&connection_id) else {
            return;
        };
        let state = *handle.state.lock().await;
        if let ConnectionState::Registered(agent_id) = state {
            self.agent_connections.remove(&agent_id);
            if let Ok(agent) = self.registry.mark_disconnected(agent_id) {
                let _ = self.broker.save_agent_snapshot(&agent).await;
                self.broker.publish(
                    Channel::Agents,
                    BrokerEvent::new("AgentDisconnected", Some(agent_id), serde_json::json!({})),
                );
            }
        }
    }

    /// Functional core of one inbound frame: parses, authorizes by
    /// connection state, applies the inline effect (register/heartbeat/task
    /// response), and returns an optional reply envelope.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` for any protocol violation; the caller turns
    /// this into an error frame and counts it toward the violation ceiling.
    async fn handle_envelope(
        &self,
        connection_id: ConnectionId,
        state: &Mutex<ConnectionState>,
        envelope: MessageEnvelope,
    ) -> Result<Option<MessageEnvelope>, TransportError> {
        let current_state = *state.lock().await;

        match (current_state, envelope.message_type) {
            (ConnectionState::Open, MessageType::AgentRegister) => {
                let agent_id = self.parse_agent_id(&envelope)?;
                let payload: RegisterPayload = serde_json::from_value(envelope.payload.clone())
                    .map_err(|e| TransportError::InvalidMessage {
                        reason: e.to_string(),
                    })?;
                let registration = self.build_registration(payload)?;
                let agent = self
                    .registry
                    .register(agent_id, connection_id, registration)
                    .map_err(|e| TransportError::InvalidMessage {
                        reason: e.to_string(),
                    })?;
                self.agent_connections.insert(agent_id, connection_id);
                *state.lock().await = ConnectionState::Registered(agent_id);
                self.broker
                    .save_agent_snapshot(&agent)
                    .await
                    .map_err(|e| TransportError::MessageProcessingError {
                        reason: e.to_string(),
                    })?;
                Ok(Some(MessageEnvelope::new(
                    MessageType::SystemEvent,
                    Some(agent_id),
                    serde_json::json!({ "event": "Registered" }),
                )))
            }
            (ConnectionState::Open, _) => Err(TransportError::AgentNotRegistered),
            (ConnectionState::Registered(agent_id), MessageType::AgentHeartbeat) => {
                let payload: HeartbeatPayload = serde_json::from_value(envelope.payload.clone())
                    .map_err(|e| TransportError::InvalidMessage {
                        reason: e.to_string(),
                    })?;
                let status = parse_agent_status(&payload.status).ok_or_else(|| {
                    TransportError::InvalidMessage {
                        reason: format!("unknown agent status {}", payload.status),
                    }
                })?;
                let agent = self
                    .registry
                    .apply_heartbeat(agent_id, status, payload.current_tasks)
                    .map_err(|e| TransportError::MessageProcessingError {
                        reason: e.to_string(),
                    })?;
                self.broker
                    .save_agent_snapshot(&agent)
                    .await
                    .map_err(|e| TransportError::MessageProcessingError {
                        reason: e.to_string(),
                    })?;
                if let Some(tracker) = self.status.get() {
                    let score = agent.health_score(Timestamp::now(), self.heartbeat_interval_ms);
                    tracker.record_health(agent_id, score);
                }
                Ok(None)
            }
            (ConnectionState::Registered(agent_id), MessageType::TaskResponse) => {
                self.handle_task_response(envelope, agent_id).await?;
                Ok(None)
            }
            (ConnectionState::Registered(agent_id), MessageType::AgentRegister) => {
                Err(TransportError::InvalidMessage {
                    reason: format!("agent {agent_id} already registered on this connection"),
                })
            }
            (ConnectionState::Registered(agent_id), _) => {
                let _ = self.forward_tx.send(ForwardedMessage {
                    connection_id,
                    agent_id: Some(agent_id),
                    envelope,
                });
                Ok(None)
            }
        }
    }

    async fn handle_task_response(
        &self,
        envelope: MessageEnvelope,
        agent_id: AgentId,
    ) -> Result<(), TransportError> {
        let payload: TaskResponsePayload = serde_json::from_value(envelope.payload.clone())
            .map_err(|e| TransportError::InvalidMessage {
                reason: e.to_string(),
            })?;
        let task_id_uuid = Uuid::parse_str(&payload.task_id).map_err(|e| TransportError::InvalidMessage {
            reason: e.to_string(),
        })?;
        let task_id = crate::domain::TaskId::from(task_id_uuid);

        let mut task = self
            .broker
            .get_task(task_id)
            .await
            .map_err(store_error_to_transport)?
            .ok_or_else(|| TransportError::InvalidMessage {
                reason: format!("unknown task {task_id}"),
            })?;

        let terminal = matches!(payload.status.as_str(), "completed" | "failed" | "cancelled");
        match payload.status.as_str() {
            "completed" => {
                let _ = task.complete(payload.result.unwrap_or(serde_json::Value::Null));
            }
            "failed" => {
                let _ = task.fail(payload.error.unwrap_or_else(|| "task failed".to_string()));
            }
            "cancelled" => {
                let _ = task.cancel();
            }
            _ => {
                if let Some(progress) = payload.progress {
                    let progress = crate::domain::Progress::try_new(progress).unwrap_or_default();
                    let _ = task.update_progress(progress);
                }
            }
        }

        if let Some(tracker) = self.status.get() {
            tracker.record_progress(task_id, task.progress, task.status);
        }

        if terminal {
            match self
                .registry
                .release_slot(agent_id, payload.status == "completed")
            {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, %agent_id, "no in-flight slot to release on terminal task response"),
                Err(e) => warn!(error = %e, %agent_id, "cannot release capacity slot for unregistered agent"),
            }
            if let Some(router) = self.router.get() {
                if let Some(duration_ms) = router.complete_assignment(task_id) {
                    if let Some(tracker) = self.status.get() {
                        tracker.record_completion_duration(duration_ms);
                    }
                }
            }
        }

        self.broker
            .publish_task_response(&task)
            .await
            .map_err(store_error_to_transport)
    }

    fn build_registration(&self, payload: RegisterPayload) -> Result<AgentRegistration, TransportError> {
        let mut capabilities = std::collections::BTreeSet::new();
        for cap in payload.capabilities {
            let capability = Capability::try_new(cap).map_err(|e| TransportError::InvalidMessage {
                reason: e.to_string(),
            })?;
            capabilities.insert(capability);
        }
        let max_concurrent_tasks = MaxConcurrentTasks::try_new(payload.max_concurrent_tasks)
            .map_err(|e| TransportError::InvalidMessage {
                reason: e.to_string(),
            })?;
        Ok(AgentRegistration {
            name: payload.name,
            version: payload.version,
            capabilities,
            max_concurrent_tasks,
            description: payload.description,
            tags: payload.tags,
        })
    }

    fn parse_agent_id(&self, envelope: &MessageEnvelope) -> Result<AgentId, TransportError> {
        let raw = envelope.agent_id.as_ref().ok_or_else(|| TransportError::InvalidMessage {
            reason: "AgentRegister requires agentId".to_string(),
        })?;
        let uuid = Uuid::parse_str(raw).map_err(|e| TransportError::InvalidMessage {
            reason: e.to_string(),
        })?;
        Ok(AgentId::from(uuid))
    }
}

fn store_error_to_transport(source: StoreError) -> TransportError {
    TransportError::MessageProcessingError {
        reason: source.to_string(),
    }
}

fn parse_agent_status(raw: &str) -> Option<AgentStatus> {
    match raw.to_lowercase().as_str() {
        "available" => Some(AgentStatus::Available),
        "busy" => Some(AgentStatus::Busy),
        "offline" => Some(AgentStatus::Offline),
        "error" => Some(AgentStatus::Error),
        _ => None,
    }
}

/// Extracts the bearer token from the query string or `Authorization`
/// header (§6.2).
fn extract_token(query: &HashMap<String, String>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = query.get("token") {
        return Some(token.clone());
    }
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start_matches("Bearer ").to_string())
}

async fn ws_upgrade(
    State(transport): State<Arc<TransportServer>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let Some(token) = extract_token(&query, &headers) else {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    };
    let Some(_user_id) = transport.token_validator.validate(&token) else {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    };
    if transport.connections.len() >= transport.max_connections as usize {
        return axum::http::StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, transport))
}

#[instrument(skip(socket, transport))]
async fn handle_socket(socket: WebSocket, transport: Arc<TransportServer>) {
    let connection_id = ConnectionId::generate();
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    transport.register_connection(connection_id, out_tx);

    let handle = match transport.connections.get(&connection_id) {
        Some(h) => h.clone(),
        None => return,
    };

    let mut ping_timer =
        tokio::time::interval(std::time::Duration::from_millis(transport.ping_interval_ms));
    ping_timer.tick().await;
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                match outbound {
                    Some(message) => {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ping_timer.tick() => {
                if awaiting_pong {
                    warn!(%connection_id, "missed liveness pong, closing connection");
                    break;
                }
                awaiting_pong = true;
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > MAX_PAYLOAD_BYTES {
                            if sink.send(Message::Close(None)).await.is_err() {}
                            break;
                        }
                        if !process_text_frame(&transport, connection_id, &handle, &mut sink, text.as_str()).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let err = TransportError::InvalidMessage {
                            reason: "binary frames are not supported".to_string(),
                        };
                        if !record_violation(&handle, &mut sink, &err).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                }
            }
        }
    }

    transport.handle_disconnect(connection_id).await;
}

async fn process_text_frame(
    transport: &Arc<TransportServer>,
    connection_id: ConnectionId,
    handle: &Arc<ConnectionHandle>,
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    text: &str,
) -> bool {
    let envelope: MessageEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            let err = TransportError::InvalidMessage {
                reason: e.to_string(),
            };
            return record_violation(handle, sink, &err).await;
        }
    };

    match transport
        .handle_envelope(connection_id, &handle.state, envelope)
        .await
    {
        Ok(Some(reply)) => {
            if let Ok(message) = reply.to_ws_message() {
                let _ = sink.send(message).await;
            }
            true
        }
        Ok(None) => true,
        Err(err) => record_violation(handle, sink, &err).await,
    }
}

/// Sends an error frame for `err` and reports whether the connection should
/// stay open: `false` once `MAX_PROTOCOL_VIOLATIONS` is reached.
async fn record_violation(
    handle: &Arc<ConnectionHandle>,
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    err: &TransportError,
) -> bool {
    let _ = sink.send(err.as_error_frame().to_ws_message().unwrap_or(Message::Close(None))).await;
    let count = handle.violations.fetch_add(1, Ordering::Relaxed) + 1;
    if count >= MAX_PROTOCOL_VIOLATIONS {
        let _ = sink.send(Message::Close(None)).await;
        false
    } else {
        true
    }
}

#[cfg(test)]
impl TransportServer {
    /// Registers a connection for `agent_id` directly, bypassing the
    /// WebSocket handshake, so router/facade tests can exercise
    /// `dispatch_task` without a real socket. The returned receiver must be
    /// kept alive for the duration of the test or sends will fail.
    pub(crate) fn stub_connect(&self, agent_id: AgentId) -> mpsc::UnboundedReceiver<Message> {
        let connection_id = ConnectionId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        self.register_connection(connection_id, tx);
        self.agent_connections.insert(agent_id, connection_id);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewTaskRequest;
    use std::collections::BTreeSet;

    async fn test_transport() -> (
        Arc<TransportServer>,
        mpsc::UnboundedReceiver<ForwardedMessage>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::testing();
        config.store_database_path = dir.path().join("t.db");
        let broker = crate::store::SqliteBroker::connect(&config).await.unwrap();
        let (server, rx) = TransportServer::new(
            &config,
            Arc::new(Registry::new()),
            Arc::new(broker),
            Arc::new(PermissiveTokenValidator),
        );
        (server, rx, dir)
    }

    fn register_envelope(agent_id: AgentId) -> MessageEnvelope {
        MessageEnvelope {
            id: "1".to_string(),
            message_type: MessageType::AgentRegister,
            timestamp: 0,
            agent_id: Some(agent_id.to_string()),
            payload: serde_json::json!({
                "name": "worker-1",
                "version": "1.0.0",
                "capabilities": ["gpu"],
                "maxConcurrentTasks": 2,
            }),
        }
    }

    #[tokio::test]
    async fn register_then_heartbeat_transitions_state() {
        let (transport, _rx, _dir) = test_transport().await;
        let connection_id = ConnectionId::generate();
        let state = Mutex::new(ConnectionState::Open);
        let agent_id = AgentId::generate();

        let reply = transport
            .handle_envelope(connection_id, &state, register_envelope(agent_id))
            .await
            .unwrap();
        assert!(reply.is_some());
        assert_eq!(*state.lock().await, ConnectionState::Registered(agent_id));

        let heartbeat = MessageEnvelope {
            id: "2".to_string(),
            message_type: MessageType::AgentHeartbeat,
            timestamp: 0,
            agent_id: Some(agent_id.to_string()),
            payload: serde_json::json!({ "status": "available", "currentTasks": 1 }),
        };
        let reply = transport.handle_envelope(connection_id, &state, heartbeat).await.unwrap();
        assert!(reply.is_none());

        let agent = transport.registry.get(agent_id).unwrap();
        assert_eq!(agent.current_tasks, 1);
    }

    #[tokio::test]
    async fn unregistered_connection_rejects_non_register_messages() {
        let (transport, _rx, _dir) = test_transport().await;
        let connection_id = ConnectionId::generate();
        let state = Mutex::new(ConnectionState::Open);

        let heartbeat = MessageEnvelope {
            id: "1".to_string(),
            message_type: MessageType::AgentHeartbeat,
            timestamp: 0,
            agent_id: Some(AgentId::generate().to_string()),
            payload: serde_json::json!({ "status": "available", "currentTasks": 0 }),
        };
        let err = transport
            .handle_envelope(connection_id, &state, heartbeat)
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::AgentNotRegistered);
    }

    #[tokio::test]
    async fn dispatch_task_without_connection_fails() {
        let (transport, _rx, _dir) = test_transport().await;
        let task = Task::try_new(
            crate::domain::TaskId::generate(),
            NewTaskRequest {
                name: "t".to_string(),
                required_capabilities: BTreeSet::new(),
                ..Default::default()
            },
        )
        .unwrap();
        let err = transport.dispatch_task(AgentId::generate(), &task).unwrap_err();
        assert!(matches!(err, TransportError::NoConnection { .. }));
    }

    #[tokio::test]
    async fn task_response_marks_task_completed() {
        let (transport, _rx, _dir) = test_transport().await;
        let connection_id = ConnectionId::generate();
        let state = Mutex::new(ConnectionState::Open);
        let agent_id = AgentId::generate();
        transport
            .handle_envelope(connection_id, &state, register_envelope(agent_id))
            .await
            .unwrap();

        let task = Task::try_new(
            crate::domain::TaskId::generate(),
            NewTaskRequest {
                name: "t".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        transport.broker.publish_task_request(&task).await.unwrap();
        transport
            .broker
            .assign_task_to_agent(task.id, agent_id)
            .await
            .unwrap();

        let response = MessageEnvelope {
            id: "r1".to_string(),
            message_type: MessageType::TaskResponse,
            timestamp: 0,
            agent_id: Some(agent_id.to_string()),
            payload: serde_json::json!({ "taskId": task.id, "status": "completed", "result": {"ok": true} }),
        };
        transport.handle_envelope(connection_id, &state, response).await.unwrap();

        let stored = transport.broker.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, crate::domain::TaskStatus::Completed);
    }

    #[tokio::test]
    async fn task_response_without_a_reserved_slot_does_not_panic() {
        // A response can arrive for an agent the registry never reserved a
        // slot for (e.g. the capacity accounting was reset); release_slot's
        // `NoInFlightTasks` error must be swallowed, not propagated.
        let (transport, _rx, _dir) = test_transport().await;
        let connection_id = ConnectionId::generate();
        let state = Mutex::new(ConnectionState::Open);
        let agent_id = AgentId::generate();
        transport
            .handle_envelope(connection_id, &state, register_envelope(agent_id))
            .await
            .unwrap();

        let task = Task::try_new(
            crate::domain::TaskId::generate(),
            NewTaskRequest {
                name: "t".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        transport.broker.publish_task_request(&task).await.unwrap();

        let response = MessageEnvelope {
            id: "r1".to_string(),
            message_type: MessageType::TaskResponse,
            timestamp: 0,
            agent_id: Some(agent_id.to_string()),
            payload: serde_json::json!({ "taskId": task.id, "status": "failed", "error": "boom" }),
        };
        transport
            .handle_envelope(connection_id, &state, response)
            .await
            .unwrap();

        let stored = transport.broker.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, crate::domain::TaskStatus::Failed);
    }

    #[tokio::test]
    async fn completed_task_response_frees_capacity_and_closes_the_assignment() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::testing();
        config.store_database_path = dir.path().join("full.db");
        let broker: Arc<dyn Broker> =
            Arc::new(crate::store::SqliteBroker::connect(&config).await.unwrap());
        let registry = Arc::new(Registry::new());
        let (transport, _rx) = TransportServer::new(
            &config,
            registry.clone(),
            broker.clone(),
            Arc::new(PermissiveTokenValidator),
        );
        let router = Arc::new(TaskRouter::new(
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
        transport.set_router(router.clone());
        transport.set_status(status.clone());

        let connection_id = ConnectionId::generate();
        let state = Mutex::new(ConnectionState::Open);
        let agent_id = AgentId::generate();
        transport
            .handle_envelope(connection_id, &state, register_envelope(agent_id))
            .await
            .unwrap();
        let _rx = transport.stub_connect(agent_id);

        let task = Task::try_new(
            crate::domain::TaskId::generate(),
            NewTaskRequest {
                name: "t".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        broker.publish_task_request(&task).await.unwrap();
        router.route_task(&task).await;
        assert_eq!(router.assignment_count(), 1);
        assert_eq!(registry.get(agent_id).unwrap().current_tasks, 1);

        let response = MessageEnvelope {
            id: "r1".to_string(),
            message_type: MessageType::TaskResponse,
            timestamp: 0,
            agent_id: Some(agent_id.to_string()),
            payload: serde_json::json!({ "taskId": task.id, "status": "completed", "result": {"ok": true} }),
        };
        transport.handle_envelope(connection_id, &state, response).await.unwrap();

        let agent = registry.get(agent_id).unwrap();
        assert_eq!(agent.current_tasks, 0);
        assert!((agent.success_rate() - 100.0).abs() < f64::EPSILON);
        assert_eq!(router.assignment_count(), 0);

        let history = status.task_progress(task.id);
        assert!(!history.is_empty());
        assert_eq!(history.last().unwrap().status, crate::domain::TaskStatus::Completed);
    }
}
