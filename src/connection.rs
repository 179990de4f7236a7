//! Connection manager - owns the single gateway connection.
//!
//! Lifecycle of one connection attempt:
//! 1. Dial the websocket and split it
//! 2. Spawn the writer task over the sink
//! 3. Send the `connect` handshake while reading frames
//! 4. On `ok = true`: state becomes [`ConnectionState::Connected`]
//! 5. Read frames until the socket closes, errors or goes silent
//! 6. Tear down: mark sessions disconnected, reject pending calls, back off
//!
//! Inbound frames are handled one at a time in arrival order. Responses
//! complete correlation entries; events are parsed, routed into the
//! registry under its lock and then published on the event feed.
//!
//! Outbound calls consult [`ConnectionManager::can_send`] and fail fast
//! with a connectivity error while not connected.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::correlation::CorrelationTable;
use crate::error::{GatewayError, Result};
use crate::protocol::{
    generate_request_id, EventFrame, Frame, FrameCodec, GatewayEvent, RequestFrame,
    PROTOCOL_VERSION,
};
use crate::registry::{self, SharedRegistry};
use crate::router::EventRouter;
use crate::transport::{self, Backoff, WsStream};
use crate::writer::{spawn_writer_task, WriterHandle};

/// Handshake method.
pub const CONNECT_METHOD: &str = "connect";

/// Capacity of the typed event feed.
pub const EVENT_FEED_CAPACITY: usize = 256;

/// Connectivity of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

struct Shared {
    config: ClientConfig,
    correlation: CorrelationTable,
    registry: SharedRegistry,
    router: EventRouter,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<GatewayEvent>,
    writer: Mutex<Option<WriterHandle>>,
    cancel: CancellationToken,
}

/// Handle to the connection manager. Clones share one connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.shared.config.url)
            .field("state", &self.state())
            .field("pending", &self.shared.correlation.len())
            .finish()
    }
}

impl ConnectionManager {
    /// Create a manager routing events into `registry`. Nothing connects
    /// until [`spawn`](Self::spawn).
    pub fn new(config: ClientConfig, registry: SharedRegistry) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_FEED_CAPACITY);
        let router = EventRouter::new(config.default_column.clone());

        Self {
            shared: Arc::new(Shared {
                config,
                correlation: CorrelationTable::new(),
                registry,
                router,
                state,
                events,
                writer: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Registry fed by this connection.
    pub fn registry(&self) -> &SharedRegistry {
        &self.shared.registry
    }

    /// Outstanding calls.
    pub fn correlation(&self) -> &CorrelationTable {
        &self.shared.correlation
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Typed events, published after they were routed.
    pub fn subscribe_events(&self) -> broadcast::Receiver<GatewayEvent> {
        self.shared.events.subscribe()
    }

    /// Whether a call is currently possible.
    pub fn can_send(&self) -> bool {
        self.state() == ConnectionState::Connected && self.current_writer().is_some()
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Token cancelled on shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Start the connect / read / reconnect loop.
    pub fn spawn(&self) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move { manager.run().await })
    }

    /// Stop reconnecting and drop the current connection.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
    }

    /// Send a request and wait for its response payload, using the
    /// configured request timeout.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.send_request(method, params, self.shared.config.request_timeout())
            .await
    }

    /// Send a request with an explicit timeout (`None` waits until the
    /// response or a disconnect).
    ///
    /// # Errors
    ///
    /// - `Connectivity` when not connected, or when the connection drops
    ///   before the response arrives
    /// - `Remote` when the gateway answers `ok = false`
    /// - `Timeout` when `timeout` elapses first
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if self.state() != ConnectionState::Connected {
            return Err(GatewayError::connectivity(format!(
                "cannot call {} while {:?}",
                method,
                self.state()
            )));
        }
        let writer = self
            .current_writer()
            .ok_or_else(|| GatewayError::connectivity(format!("cannot call {}: no transport", method)))?;

        self.call(&writer, method, params, timeout).await
    }

    fn writer_slot(&self) -> MutexGuard<'_, Option<WriterHandle>> {
        self.shared
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn current_writer(&self) -> Option<WriterHandle> {
        self.writer_slot().clone()
    }

    fn is_current_writer(&self, writer: &WriterHandle) -> bool {
        self.writer_slot()
            .as_ref()
            .is_some_and(|current| current.same_channel(writer))
    }

    async fn call(
        &self,
        writer: &WriterHandle,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let id = generate_request_id();
        let pending = self.shared.correlation.register(&id, method)?;

        // Teardown swaps the writer out before rejecting pending calls, so a
        // call registered after that rejection sees a different writer here.
        if !self.is_current_writer(writer) {
            self.shared.correlation.cancel(&id);
            return Err(GatewayError::connectivity(format!(
                "{} not sent: connection lost",
                method
            )));
        }

        let frame = Frame::Request(RequestFrame::with_id(id.clone(), method, params));

        if let Err(e) = writer.send_frame(&frame).await {
            self.shared.correlation.cancel(&id);
            return Err(if e.is_connectivity() {
                GatewayError::connectivity(format!("{} not sent: {}", method, e))
            } else {
                e
            });
        }

        pending.wait_timeout(timeout).await
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.shared.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            tracing::debug!("Connection state: {:?}", next);
        }
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    async fn run(self) {
        let config = &self.shared.config;
        let cancel = self.shared.cancel.clone();
        let mut backoff = Backoff::new(config.backoff_initial(), config.backoff_max());

        loop {
            self.set_state(ConnectionState::Connecting);

            let reason = tokio::select! {
                _ = cancel.cancelled() => "client shut down".to_string(),
                result = self.connect_and_serve(&mut backoff) => match result {
                    Ok(()) => "connection closed by gateway".to_string(),
                    Err(e) => e.to_string(),
                },
            };

            self.teardown(&reason);

            if cancel.is_cancelled() {
                break;
            }

            let delay = backoff.next_delay();
            tracing::info!("Gateway connection lost ({}); retrying in {:?}", reason, delay);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::debug!("Connection loop stopped");
    }

    /// Leave `connected`: no writer, no pending calls, sessions disconnected.
    fn teardown(&self, reason: &str) {
        let was_connected = self.state() == ConnectionState::Connected;
        self.set_state(ConnectionState::Disconnected);
        self.writer_slot().take();
        registry::lock(&self.shared.registry).mark_all_disconnected();
        self.shared.correlation.cancel_all(reason);

        if was_connected {
            tracing::info!("Disconnected from {}: {}", self.shared.config.url, reason);
        }
    }

    async fn connect_and_serve(&self, backoff: &mut Backoff) -> Result<()> {
        let config = &self.shared.config;
        let (sink, stream) = transport::connect(&config.url, config.connect_timeout()).await?;

        let (writer, _writer_task) = spawn_writer_task(sink, config.writer_config());
        *self.writer_slot() = Some(writer.clone());

        let read = self.read_loop(stream);
        tokio::pin!(read);

        tokio::select! {
            result = &mut read => {
                return Err(match result {
                    Ok(()) => GatewayError::connectivity("closed during handshake"),
                    Err(e) => e,
                });
            }
            result = self.handshake(&writer) => {
                if let Err(e) = result {
                    tracing::error!("Gateway handshake failed: {}", e);
                    return Err(e);
                }
            }
        }

        backoff.reset();
        registry::lock(&self.shared.registry).mark_all_connected();
        self.set_state(ConnectionState::Connected);
        tracing::info!("Connected to gateway at {}", config.url);

        read.await
    }

    async fn handshake(&self, writer: &WriterHandle) -> Result<Value> {
        let config = &self.shared.config;
        let mut params = json!({
            "minProtocol": PROTOCOL_VERSION,
            "maxProtocol": PROTOCOL_VERSION,
            "client": {
                "id": config.client_name,
                "displayName": config.client_name,
                "version": env!("CARGO_PKG_VERSION"),
                "platform": std::env::consts::OS,
                "mode": "control",
            },
        });
        if let Some(token) = &config.token {
            params["auth"] = json!({ "token": token });
        }

        self.call(writer, CONNECT_METHOD, Some(params), Some(config.connect_timeout()))
            .await
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    async fn read_loop(&self, mut stream: WsStream) -> Result<()> {
        let liveness = self.shared.config.liveness_timeout();
        let mut last_seq = None;

        loop {
            let next = match liveness {
                Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        tracing::warn!("No frames from gateway for {:?}", limit);
                        return Err(GatewayError::connectivity(format!(
                            "gateway silent for {:?}",
                            limit
                        )));
                    }
                },
                None => stream.next().await,
            };

            match next {
                None => return Ok(()),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => self.handle_text(text.as_str(), &mut last_seq),
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => self.handle_text(text, &mut last_seq),
                    Err(_) => tracing::warn!("Dropping non UTF-8 binary frame ({} bytes)", data.len()),
                },
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!("Gateway closed the socket: {:?}", frame);
                    return Ok(());
                }
                // Ping replies are queued by tungstenite itself.
                Some(Ok(_)) => {}
            }
        }
    }

    fn handle_text(&self, text: &str, last_seq: &mut Option<u64>) {
        match FrameCodec::decode(text) {
            Ok(Some(Frame::Response(response))) => {
                self.shared.correlation.complete(response);
            }
            Ok(Some(Frame::Event(event))) => self.handle_event(event, last_seq),
            Ok(Some(Frame::Request(request))) => {
                tracing::warn!("Ignoring request {} sent by the gateway", request.method);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Dropping frame: {}", e),
        }
    }

    fn handle_event(&self, frame: EventFrame, last_seq: &mut Option<u64>) {
        if let Some(seq) = frame.seq {
            if let Some(expected) = last_seq.and_then(|prev| prev.checked_add(1)) {
                if seq > expected {
                    tracing::warn!(
                        "Event sequence gap: expected {}, got {} ({} missed)",
                        expected,
                        seq,
                        seq - expected
                    );
                }
            }
            *last_seq = Some(seq);
        }

        let event = match GatewayEvent::parse(&frame) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Dropping {} event: {}", frame.event, e);
                return;
            }
        };

        {
            let mut registry = registry::lock(&self.shared.registry);
            self.shared.router.route(&mut registry, &event);
        }

        // No subscribers is fine.
        let _ = self.shared.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResponseFrame;
    use crate::registry::{AgentStatus, SessionRegistry};

    fn manager() -> ConnectionManager {
        let mut registry = SessionRegistry::new();
        registry.add_column("col-a", "main");
        ConnectionManager::new(ClientConfig::default(), registry.shared())
    }

    #[test]
    fn test_initial_state() {
        let manager = manager();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.can_send());
        assert!(!manager.is_shut_down());
    }

    #[tokio::test]
    async fn test_request_while_disconnected_fails_fast() {
        let manager = manager();
        let err = manager.request("models.list", None).await.unwrap_err();
        assert!(err.is_connectivity());
        assert!(manager.correlation().is_empty());
    }

    #[tokio::test]
    async fn test_response_frame_completes_call() {
        let manager = manager();
        let pending = manager.correlation().register("42", "sessions.list").unwrap();

        let text = FrameCodec::encode(&Frame::Response(ResponseFrame::success(
            "42",
            json!({"sessions": []}),
        )))
        .unwrap();
        manager.handle_text(&text, &mut None);

        assert_eq!(pending.wait().await.unwrap(), json!({"sessions": []}));
    }

    #[tokio::test]
    async fn test_event_frame_is_routed_then_published() {
        let manager = manager();
        let mut events = manager.subscribe_events();

        let frame = r#"{"type":"event","event":"agent","seq":1,"payload":{"runId":"r1","stream":"lifecycle","data":{"phase":"start"},"sessionKey":"agent:main:col-a"}}"#;
        manager.handle_text(frame, &mut None);

        let status = registry::lock(manager.registry())
            .column("col-a")
            .unwrap()
            .status;
        assert_eq!(status, AgentStatus::Thinking);
        assert_eq!(events.recv().await.unwrap().name(), "agent");
    }

    #[test]
    fn test_bad_frames_are_dropped() {
        let manager = manager();
        let mut last_seq = None;
        manager.handle_text("not json", &mut last_seq);
        manager.handle_text(r#"{"type":"bogus"}"#, &mut last_seq);
        manager.handle_text(r#"{"type":"event","event":"agent","payload":{"stream":"x"}}"#, &mut last_seq);
        manager.handle_text(r#"{"type":"res","id":"ghost","ok":true}"#, &mut last_seq);
        assert_eq!(
            registry::lock(manager.registry()).column("col-a").unwrap().status,
            AgentStatus::Idle
        );
    }

    #[test]
    fn test_sequence_is_tracked_across_gaps() {
        let manager = manager();
        let mut last_seq = None;
        manager.handle_text(r#"{"type":"event","event":"tick","seq":1}"#, &mut last_seq);
        manager.handle_text(r#"{"type":"event","event":"tick","seq":5}"#, &mut last_seq);
        assert_eq!(last_seq, Some(5));
    }

    #[test]
    fn test_sequence_at_upper_bound() {
        let manager = manager();
        let mut last_seq = Some(u64::MAX);
        manager.handle_text(r#"{"type":"event","event":"tick","seq":3}"#, &mut last_seq);
        assert_eq!(last_seq, Some(3));

        let mut last_seq = Some(u64::MAX - 1);
        manager.handle_text(
            &format!(r#"{{"type":"event","event":"tick","seq":{}}}"#, u64::MAX),
            &mut last_seq,
        );
        assert_eq!(last_seq, Some(u64::MAX));
    }

    #[tokio::test]
    async fn test_call_on_replaced_writer_fails_fast() {
        let manager = manager();
        let (sink, mut sent) = futures::channel::mpsc::unbounded::<Message>();
        let (writer, _task) = spawn_writer_task(sink, crate::writer::WriterConfig::default());
        *manager.writer_slot() = Some(writer.clone());
        manager.set_state(ConnectionState::Connected);
        assert!(manager.can_send());

        // The caller grabbed the writer, then the connection was torn down.
        manager.teardown("socket reset");

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            manager.call(&writer, "agent", None, None),
        )
        .await
        .expect("call should not hang");
        assert!(result.unwrap_err().is_connectivity());
        assert!(manager.correlation().is_empty());

        drop(writer);
        assert!(sent.next().await.is_none());
    }

    #[tokio::test]
    async fn test_teardown_rejects_pending_and_disconnects_sessions() {
        let manager = manager();
        let pending = manager.correlation().register("1", "agent").unwrap();

        manager.teardown("socket reset");

        assert!(pending.wait().await.unwrap_err().is_connectivity());
        let registry = registry::lock(manager.registry());
        let column = registry.column("col-a").unwrap();
        assert_eq!(column.status, AgentStatus::Disconnected);
        assert!(!column.connected);
    }

    #[tokio::test]
    async fn test_shutdown_stops_reconnect_loop() {
        let mut config = ClientConfig::default();
        // Nothing listens here.
        config.url = "ws://127.0.0.1:9".into();
        config.backoff_initial_ms = 10;
        let manager = ConnectionManager::new(config, SessionRegistry::new().shared());

        let task = manager.spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.shutdown();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
