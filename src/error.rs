//! Error types for gateway-client.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No usable connection: a call was attempted while disconnected, or the
    /// connection dropped while the call was pending.
    #[error("Not connected to gateway: {0}")]
    Connectivity(String),

    /// Malformed frame or payload. Only the offending frame is discarded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The gateway answered with `ok = false`.
    #[error("Gateway error {code}: {message}")]
    Remote {
        /// Error code reported by the gateway.
        code: String,
        /// Human readable message reported by the gateway.
        message: String,
    },

    /// A call did not receive its response in time.
    #[error("Request {method} timed out after {timeout:?}")]
    Timeout {
        /// Method of the timed out request.
        method: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// A request id was registered twice while still pending.
    #[error("Duplicate request id: {0}")]
    DuplicateRequestId(String),

    /// Delegation bookkeeping refused the change.
    #[error(transparent)]
    Delegation(#[from] DelegationError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    /// Outbound sink failed while writing a frame.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Writer task gone (socket closed).
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// Invalid client configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl GatewayError {
    /// Build a connectivity error from any message.
    pub fn connectivity(reason: impl Into<String>) -> Self {
        GatewayError::Connectivity(reason.into())
    }

    /// Whether this failure means the call never reached (or never came back
    /// from) the gateway because the connection was unavailable.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            GatewayError::Connectivity(_) | GatewayError::ConnectionClosed
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        GatewayError::WebSocket(Box::new(err))
    }
}

/// Reasons a column cannot be bound to a subagent session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DelegationError {
    /// The column does not exist (or was removed).
    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    /// Another column already watches this subagent session.
    #[error("Subagent session {key} is already assigned to column {column}")]
    AlreadyAssigned {
        /// Subagent session key.
        key: String,
        /// Column currently watching it.
        column: String,
    },

    /// The key does not denote a subagent session.
    #[error("Not a subagent session key: {0}")]
    NotSubagent(String),
}

/// Result type alias using GatewayError.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_classification() {
        assert!(GatewayError::connectivity("down").is_connectivity());
        assert!(GatewayError::ConnectionClosed.is_connectivity());
        assert!(!GatewayError::Protocol("bad".into()).is_connectivity());
        assert!(!GatewayError::Remote {
            code: "E".into(),
            message: "m".into()
        }
        .is_connectivity());
    }

    #[test]
    fn test_remote_error_display() {
        let err = GatewayError::Remote {
            code: "NOT_FOUND".into(),
            message: "no such agent".into(),
        };
        assert_eq!(err.to_string(), "Gateway error NOT_FOUND: no such agent");
    }

    #[test]
    fn test_delegation_error_converts() {
        let err: GatewayError = DelegationError::UnknownColumn("c".into()).into();
        assert!(matches!(err, GatewayError::Delegation(_)));
    }
}
