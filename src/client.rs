//! Client builder and outbound call facade.
//!
//! The [`ClientBuilder`] provides a fluent API for configuring the
//! connection, the initial columns and persistence. [`ClientBuilder::start`]
//! returns a running [`GatewayClient`] that:
//! 1. Restores saved transcripts (when a store is configured)
//! 2. Spawns the connection loop (connect, handshake, read, reconnect)
//! 3. Refreshes the model list on every reconnect, and polls sessions when
//!    configured
//!
//! Every call goes through the connection's "can send" guard and fails
//! fast with a connectivity error while disconnected.
//!
//! # Example
//!
//! ```ignore
//! use gateway_client::GatewayClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = GatewayClient::builder()
//!         .url("ws://127.0.0.1:18789")
//!         .token("secret")
//!         .column("main", "main")
//!         .column("research", "main")
//!         .start()
//!         .await?;
//!
//!     client.wait_connected(std::time::Duration::from_secs(10)).await?;
//!     client.send_to_column("research", "Summarize the open issues").await?;
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{DelegationError, GatewayError, Result};
use crate::persistence::{self, MessageStore, PersistenceScheduler, DEFAULT_DEBOUNCE};
use crate::protocol::{column_session_key, is_subagent_key, ChatPayload, GatewayEvent};
use crate::registry::{
    self, upsert, AgentStatus, ChatMessage, GatewaySession, SessionRegistry, SharedRegistry,
};

/// Remote method names.
pub mod methods {
    pub const AGENT: &str = "agent";
    pub const SESSIONS_LIST: &str = "sessions.list";
    pub const MODELS_LIST: &str = "models.list";
    pub const AGENTS_CREATE: &str = "agents.create";
    pub const AGENTS_UPDATE: &str = "agents.update";
    pub const AGENTS_DELETE: &str = "agents.delete";
    pub const CHAT_SEND: &str = "chat.send";
    pub const CHAT_ABORT: &str = "chat.abort";
    pub const CHAT_HISTORY: &str = "chat.history";
}

/// A model offered by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u64>,
}

/// Acknowledgement of a started run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAccepted {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Remote agent definition for `agents.create` / `agents.update`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
}

/// Builder for configuring and starting a gateway client.
pub struct ClientBuilder {
    config: ClientConfig,
    columns: Vec<(String, String)>,
    store: Option<Arc<dyn MessageStore>>,
    persist_debounce: Duration,
}

impl ClientBuilder {
    /// Builder over default settings.
    pub fn new() -> Self {
        Self::from_config(ClientConfig::default())
    }

    /// Builder over existing settings.
    pub fn from_config(config: ClientConfig) -> Self {
        Self {
            config,
            columns: Vec::new(),
            store: None,
            persist_debounce: DEFAULT_DEBOUNCE,
        }
    }

    /// Gateway websocket URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    /// Auth token for the handshake.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = Some(token.into());
        self
    }

    /// Remote agent addressed by column session keys.
    ///
    /// Default: `main`
    pub fn main_agent(mut self, agent: impl Into<String>) -> Self {
        self.config.main_agent = agent.into();
        self
    }

    /// Column receiving events whose key names no column.
    ///
    /// Default: `main`
    pub fn default_column(mut self, column_id: impl Into<String>) -> Self {
        self.config.default_column = column_id.into();
        self
    }

    /// Per-call timeout; `None` waits until a response or a disconnect.
    ///
    /// Default: 30 seconds
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout_ms = timeout.map_or(0, |t| t.as_millis() as u64);
        self
    }

    /// Websocket upgrade and handshake timeout.
    ///
    /// Default: 10 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Maximum inbound silence before reconnecting; `None` disables it.
    ///
    /// Default: 60 seconds
    pub fn liveness_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.liveness_timeout_ms = timeout.map_or(0, |t| t.as_millis() as u64);
        self
    }

    /// Reconnect backoff bounds.
    ///
    /// Default: 500 ms doubling up to 30 seconds
    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.config.backoff_initial_ms = initial.as_millis() as u64;
        self.config.backoff_max_ms = max.as_millis() as u64;
        self
    }

    /// Refresh the session snapshot on this interval while connected.
    pub fn session_poll_interval(mut self, interval: Duration) -> Self {
        self.config.session_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the maximum pending frames for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.writer_max_pending_frames = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 256
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.writer_channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer_backpressure_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Create a column bound to `agent_id` at startup.
    pub fn column(mut self, column_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        self.columns.push((column_id.into(), agent_id.into()));
        self
    }

    /// Restore transcripts from `store` on start and save them after
    /// changes, `debounce` after the last one.
    pub fn persistence(mut self, store: Arc<dyn MessageStore>, debounce: Duration) -> Self {
        self.store = Some(store);
        self.persist_debounce = debounce;
        self
    }

    /// Settings collected so far.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Build and start the client.
    ///
    /// Returns once the connection loop runs; use
    /// [`GatewayClient::wait_connected`] to wait for the handshake.
    pub async fn start(self) -> Result<GatewayClient> {
        self.config.validate()?;

        let mut registry = SessionRegistry::new();
        for (column_id, agent_id) in &self.columns {
            if !registry.add_column(column_id, agent_id) {
                tracing::warn!("Column {} configured twice", column_id);
            }
        }
        let registry = registry.shared();

        let persistence = match self.store {
            Some(store) => {
                if let Err(e) = persistence::restore(&registry, store.as_ref()) {
                    tracing::warn!("Could not restore saved transcripts: {}", e);
                }
                Some(PersistenceScheduler::spawn(
                    registry.clone(),
                    store,
                    self.persist_debounce,
                ))
            }
            None => None,
        };

        let poll_interval = self.config.session_poll_interval();
        let connection = ConnectionManager::new(self.config, registry.clone());

        let client = GatewayClient {
            inner: Arc::new(Inner {
                connection: connection.clone(),
                registry,
                sessions: Mutex::new(Vec::new()),
                models: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
                persistence: Mutex::new(persistence),
            }),
        };

        let connection_task = connection.spawn();
        let observer_task = tokio::spawn(observe(client.clone(), poll_interval));
        lock(&client.inner.tasks).extend([connection_task, observer_task]);

        Ok(client)
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    connection: ConnectionManager,
    registry: SharedRegistry,
    sessions: Mutex<Vec<GatewaySession>>,
    models: Mutex<Vec<ModelInfo>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    persistence: Mutex<Option<PersistenceScheduler>>,
}

/// A running gateway client. Clones share the connection and state.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("connection", &self.inner.connection)
            .finish()
    }
}

impl GatewayClient {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    // ------------------------------------------------------------------
    // State access
    // ------------------------------------------------------------------

    /// Connection manager in use.
    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    /// Session registry fed by the event stream.
    pub fn registry(&self) -> &SharedRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &ClientConfig {
        self.inner.connection.config()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.can_send()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.subscribe_state()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.connection.subscribe_events()
    }

    /// Registry change notifications (the value is the revision).
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        registry::lock(&self.inner.registry).subscribe()
    }

    /// Wait until the handshake completed.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut state = self.subscribe_state();
        let connected = state.wait_for(|s| *s == ConnectionState::Connected);
        let result = match tokio::time::timeout(timeout, connected).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(GatewayError::ConnectionClosed),
            Err(_) => Err(GatewayError::connectivity(format!(
                "not connected after {:?}",
                timeout
            ))),
        };
        result
    }

    /// Last session snapshot from [`list_sessions`](Self::list_sessions).
    pub fn sessions(&self) -> Vec<GatewaySession> {
        lock(&self.inner.sessions).clone()
    }

    /// Last model list from [`list_models`](Self::list_models).
    pub fn models(&self) -> Vec<ModelInfo> {
        lock(&self.inner.models).clone()
    }

    /// Session key addressing a column: `agent:<mainAgent>:<columnId>`.
    pub fn column_session_key(&self, column_id: &str) -> String {
        column_session_key(&self.config().main_agent, column_id)
    }

    // ------------------------------------------------------------------
    // Generic calls
    // ------------------------------------------------------------------

    /// Call `method` and deserialize the response payload.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: impl Serialize,
    ) -> Result<T> {
        let params = serde_json::to_value(params)?;
        let params = (!params.is_null()).then_some(params);
        let payload = self.request_value(method, params).await?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Call `method` and return the raw response payload.
    pub async fn request_value(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.inner.connection.request(method, params).await
    }

    // ------------------------------------------------------------------
    // Remote operations
    // ------------------------------------------------------------------

    /// Start a streamed run. Its output arrives as `agent` events keyed by
    /// `session_key`.
    pub async fn run_agent(
        &self,
        agent: &str,
        text: &str,
        session_key: &str,
        model: Option<&str>,
    ) -> Result<RunAccepted> {
        let mut params = json!({
            "agentId": agent,
            "message": text,
            "sessionKey": session_key,
            "idempotencyKey": uuid::Uuid::new_v4().to_string(),
        });
        if let Some(model) = model {
            params["model"] = json!(model);
        }
        self.request(methods::AGENT, params).await
    }

    /// Fetch gateway sessions and cache the snapshot.
    pub async fn list_sessions(&self, limit: Option<u32>) -> Result<Vec<GatewaySession>> {
        let mut params = Map::new();
        if let Some(limit) = limit {
            params.insert("limit".into(), json!(limit));
        }
        let payload = self
            .request_value(methods::SESSIONS_LIST, Some(Value::Object(params)))
            .await?;
        let sessions: Vec<GatewaySession> = list_field(payload, "sessions")?;
        *lock(&self.inner.sessions) = sessions.clone();
        Ok(sessions)
    }

    /// Fetch available models and cache them.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let payload = self.request_value(methods::MODELS_LIST, None).await?;
        let models: Vec<ModelInfo> = list_field(payload, "models")?;
        *lock(&self.inner.models) = models.clone();
        Ok(models)
    }

    pub async fn create_agent(&self, spec: &AgentSpec) -> Result<Value> {
        self.request(methods::AGENTS_CREATE, spec).await
    }

    pub async fn update_agent(&self, spec: &AgentSpec) -> Result<Value> {
        self.request(methods::AGENTS_UPDATE, spec).await
    }

    pub async fn delete_agent(&self, agent_id: &str) -> Result<Value> {
        self.request(methods::AGENTS_DELETE, json!({ "id": agent_id }))
            .await
    }

    /// Send a user message straight into a session.
    pub async fn send_chat(&self, session_key: &str, text: &str) -> Result<Value> {
        self.request(
            methods::CHAT_SEND,
            json!({
                "sessionKey": session_key,
                "message": text,
                "idempotencyKey": uuid::Uuid::new_v4().to_string(),
            }),
        )
        .await
    }

    /// Abort the running (or the given) run of a session.
    pub async fn abort_run(&self, session_key: &str, run_id: Option<&str>) -> Result<Value> {
        let mut params = json!({ "sessionKey": session_key });
        if let Some(run_id) = run_id {
            params["runId"] = json!(run_id);
        }
        self.request(methods::CHAT_ABORT, params).await
    }

    /// Load a subagent session's history into its message log. Messages
    /// already present (same id) are replaced. Returns the number loaded.
    pub async fn chat_history(&self, session_key: &str, limit: Option<u32>) -> Result<usize> {
        if !is_subagent_key(session_key) {
            return Err(DelegationError::NotSubagent(session_key.to_string()).into());
        }

        let mut params = json!({ "sessionKey": session_key });
        if let Some(limit) = limit {
            params["limit"] = json!(limit);
        }
        let payload = self
            .request_value(methods::CHAT_HISTORY, Some(params))
            .await?;
        let history: Vec<ChatPayload> = list_field(payload, "messages")?;
        let count = history.len();

        registry::lock(&self.inner.registry).update_subagent_log(session_key, |log| {
            for message in &history {
                upsert(log, message.to_chat_message());
            }
        });
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Columns
    // ------------------------------------------------------------------

    /// Send user input to a column.
    ///
    /// A delegated column forwards the text into its subagent session.
    /// Otherwise a run is started on the column's session key; if it cannot
    /// be started the column shows `error` with a system message.
    pub async fn send_to_column(&self, column_id: &str, text: &str) -> Result<()> {
        let (agent_id, delegated) = {
            let registry = registry::lock(&self.inner.registry);
            let column = registry
                .column(column_id)
                .ok_or_else(|| DelegationError::UnknownColumn(column_id.to_string()))?;
            (column.agent_id.clone(), column.assigned_subagent.clone())
        };

        registry::lock(&self.inner.registry).push_message(column_id, ChatMessage::user(text));

        if let Some(key) = delegated {
            if let Err(e) = self.send_chat(&key, text).await {
                self.mark_send_failed(column_id, &e);
                return Err(e);
            }
            return Ok(());
        }

        registry::lock(&self.inner.registry).set_status(column_id, AgentStatus::Thinking);

        let session_key = self.column_session_key(column_id);
        match self.run_agent(&agent_id, text, &session_key, None).await {
            Ok(run) => {
                // The run's events may already have been routed. Only a
                // column still waiting for its first event adopts the id.
                registry::lock(&self.inner.registry).update_column(column_id, |c| {
                    if c.status == AgentStatus::Thinking && c.active_run_id.is_none() {
                        c.active_run_id = Some(run.run_id);
                    }
                });
                Ok(())
            }
            Err(e) => {
                self.mark_send_failed(column_id, &e);
                Err(e)
            }
        }
    }

    fn mark_send_failed(&self, column_id: &str, error: &GatewayError) {
        registry::lock(&self.inner.registry).update_column(column_id, |c| {
            c.status = AgentStatus::Error;
            c.messages
                .push(ChatMessage::system(format!("Send failed: {}", error)));
        });
    }

    /// Add a column. Returns `false` if the id is taken.
    pub fn add_column(&self, column_id: &str, agent_id: &str) -> bool {
        registry::lock(&self.inner.registry).add_column(column_id, agent_id)
    }

    /// Remove a column, releasing its delegation. Returns whether it existed.
    pub fn remove_column(&self, column_id: &str) -> bool {
        registry::lock(&self.inner.registry)
            .remove_column(column_id)
            .is_some()
    }

    /// Make a column watch a subagent session.
    pub fn assign_subagent(&self, column_id: &str, session_key: &str) -> Result<()> {
        registry::lock(&self.inner.registry).assign_subagent(column_id, session_key)?;
        Ok(())
    }

    /// Stop watching. Returns the released key.
    pub fn unassign_subagent(&self, column_id: &str) -> Option<String> {
        registry::lock(&self.inner.registry).unassign_subagent(column_id)
    }

    /// Active, unassigned subagent sessions of the last snapshot.
    pub fn delegation_candidates(&self) -> Vec<GatewaySession> {
        let sessions = lock(&self.inner.sessions);
        let registry = registry::lock(&self.inner.registry);
        let candidates = registry
            .delegation_candidates(&sessions)
            .into_iter()
            .cloned()
            .collect();
        candidates
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop reconnecting, reject pending calls and flush persistence.
    pub async fn shutdown(&self) {
        self.inner.connection.shutdown();

        let tasks: Vec<JoinHandle<()>> = lock(&self.inner.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("Client task failed: {}", e);
            }
        }

        let persistence = lock(&self.inner.persistence).take();
        if let Some(scheduler) = persistence {
            scheduler.shutdown().await;
        }
    }
}

/// Payload given either as a bare array or as `{ <field>: [...] }`.
fn list_field<T: DeserializeOwned>(payload: Value, field: &str) -> Result<Vec<T>> {
    let list = match payload {
        Value::Array(_) => payload,
        Value::Object(mut map) => map.remove(field).unwrap_or(Value::Array(Vec::new())),
        Value::Null => return Ok(Vec::new()),
        other => {
            return Err(GatewayError::Protocol(format!(
                "expected {} list, got {}",
                field, other
            )))
        }
    };
    Ok(serde_json::from_value(list)?)
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Reacts to connectivity: refresh models on every (re)connect, poll
/// sessions while connected.
async fn observe(client: GatewayClient, poll_interval: Option<Duration>) {
    let cancel = client.inner.connection.cancellation_token();
    let mut state = client.subscribe_state();
    let mut ticker = poll_interval.map(|period| {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let connected = *state.borrow_and_update() == ConnectionState::Connected;
                if connected {
                    refresh(&client, poll_interval.is_some()).await;
                }
            }
            _ = next_tick(&mut ticker) => {
                if client.is_connected() {
                    if let Err(e) = client.list_sessions(None).await {
                        tracing::warn!("Session poll failed: {}", e);
                    }
                }
            }
        }
    }
}

async fn refresh(client: &GatewayClient, sessions: bool) {
    match client.list_models().await {
        Ok(models) => tracing::debug!("Gateway offers {} model(s)", models.len()),
        Err(e) => tracing::warn!("Fetching models failed: {}", e),
    }
    if sessions {
        if let Err(e) = client.list_sessions(None).await {
            tracing::warn!("Fetching sessions failed: {}", e);
        }
    }
}
