//! Client configuration.
//!
//! [`ClientConfig`] is plain data: deserializable from JSON (camelCase,
//! every field optional) and overridable from the environment. Durations
//! are stored as milliseconds.
//!
//! # Example
//!
//! ```
//! use gateway_client::config::ClientConfig;
//!
//! let config: ClientConfig =
//!     serde_json::from_str(r#"{"url": "ws://10.0.0.2:18789", "requestTimeoutMs": 5000}"#).unwrap();
//! assert_eq!(config.main_agent, "main");
//! assert_eq!(config.request_timeout().unwrap().as_secs(), 5);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::writer::{
    WriterConfig, DEFAULT_BACKPRESSURE_TIMEOUT, DEFAULT_CHANNEL_CAPACITY,
    DEFAULT_MAX_PENDING_FRAMES,
};

/// Default gateway address.
pub const DEFAULT_URL: &str = "ws://127.0.0.1:18789";

/// Default remote agent used for column session keys.
pub const DEFAULT_MAIN_AGENT: &str = "main";

/// Column receiving events whose key names no column.
pub const DEFAULT_COLUMN: &str = "main";

/// Environment variable overriding [`ClientConfig::url`].
pub const ENV_URL: &str = "GATEWAY_URL";
/// Environment variable overriding [`ClientConfig::token`].
pub const ENV_TOKEN: &str = "GATEWAY_TOKEN";
/// Environment variable overriding [`ClientConfig::main_agent`].
pub const ENV_MAIN_AGENT: &str = "GATEWAY_MAIN_AGENT";

/// Connection and behaviour settings of a gateway client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Websocket URL of the gateway.
    pub url: String,
    /// Auth token sent with the `connect` handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Name announced to the gateway.
    pub client_name: String,
    /// Remote agent addressed by column session keys.
    pub main_agent: String,
    /// Column receiving events without a column segment.
    pub default_column: String,
    /// Per-call timeout; `0` disables it.
    pub request_timeout_ms: u64,
    /// Websocket upgrade plus handshake timeout.
    pub connect_timeout_ms: u64,
    /// Maximum silence before the connection is considered dead; `0`
    /// disables the check.
    pub liveness_timeout_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Session snapshot refresh interval; `0` disables polling.
    pub session_poll_interval_ms: u64,
    pub writer_channel_capacity: usize,
    pub writer_max_pending_frames: usize,
    pub writer_backpressure_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            token: None,
            client_name: env!("CARGO_PKG_NAME").to_string(),
            main_agent: DEFAULT_MAIN_AGENT.to_string(),
            default_column: DEFAULT_COLUMN.to_string(),
            request_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            liveness_timeout_ms: 60_000,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
            session_poll_interval_ms: 0,
            writer_channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            writer_max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            writer_backpressure_timeout_ms: DEFAULT_BACKPRESSURE_TIMEOUT.as_millis() as u64,
        }
    }
}

fn optional(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl ClientConfig {
    /// Defaults overridden by `GATEWAY_URL`, `GATEWAY_TOKEN` and
    /// `GATEWAY_MAIN_AGENT` when set and non-empty.
    pub fn from_env() -> Self {
        Self::default().with_env(|name| std::env::var(name).ok())
    }

    /// Apply overrides from a variable lookup.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(url) = get(ENV_URL) {
            self.url = url;
        }
        if let Some(token) = get(ENV_TOKEN) {
            self.token = Some(token);
        }
        if let Some(agent) = get(ENV_MAIN_AGENT) {
            self.main_agent = agent;
        }
        self
    }

    /// Reject settings the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(GatewayError::Config(format!(
                "url must be ws:// or wss://, got {:?}",
                self.url
            )));
        }
        for (field, value) in [
            ("mainAgent", &self.main_agent),
            ("defaultColumn", &self.default_column),
        ] {
            if value.is_empty() || value.contains(':') {
                return Err(GatewayError::Config(format!(
                    "{} must be a non-empty key segment, got {:?}",
                    field, value
                )));
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        optional(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn liveness_timeout(&self) -> Option<Duration> {
        optional(self.liveness_timeout_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn session_poll_interval(&self) -> Option<Duration> {
        optional(self.session_poll_interval_ms)
    }

    /// Settings of the outbound writer task.
    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_pending_frames: self.writer_max_pending_frames.max(1),
            channel_capacity: self.writer_channel_capacity.max(1),
            backpressure_timeout: Duration::from_millis(self.writer_backpressure_timeout_ms),
        }
    }
}
