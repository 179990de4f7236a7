//! Wire frame types.
//!
//! Three frame kinds share one JSON text stream, discriminated by `type`:
//!
//! ```text
//! request:  { type: "req",   id, method, params? }
//! response: { type: "res",   id, ok, payload?, error?: {code, message} }
//! event:    { type: "event", event, payload, seq?, stateVersion? }
//! ```
//!
//! # Example
//!
//! ```
//! use gateway_client::protocol::{Frame, RequestFrame};
//!
//! let req = RequestFrame::new("models.list", None);
//! assert!(!req.id.is_empty());
//!
//! let frame = Frame::Request(req);
//! assert_eq!(frame.kind(), "req");
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

/// One discrete unit on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Client → gateway call.
    #[serde(rename = "req")]
    Request(RequestFrame),
    /// Gateway → client answer to a request.
    #[serde(rename = "res")]
    Response(ResponseFrame),
    /// Gateway → client push.
    #[serde(rename = "event")]
    Event(EventFrame),
}

impl Frame {
    /// Wire discriminant of this frame.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Request(_) => "req",
            Frame::Response(_) => "res",
            Frame::Event(_) => "event",
        }
    }
}

/// Request frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Unique while the call is outstanding.
    pub id: String,
    /// Gateway method name (e.g. `agent`, `sessions.list`).
    pub method: String,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RequestFrame {
    /// Create a request with a freshly generated id.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::with_id(generate_request_id(), method, params)
    }

    /// Create a request with an explicit id.
    pub fn with_id(id: impl Into<String>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// Generate a request id (UUID v4).
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// Id of the request being answered.
    pub id: String,
    /// Whether the call succeeded.
    pub ok: bool,
    /// Result payload when `ok`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Failure details when not `ok`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    /// Successful response.
    pub fn success(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    /// Failed response.
    pub fn failure(id: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(ErrorShape {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    /// Convert into the outcome a caller sees.
    ///
    /// A successful response without payload yields `Value::Null`. A failed
    /// response without error details still becomes a `Remote` error.
    pub fn into_result(self) -> Result<Value, GatewayError> {
        if self.ok {
            return Ok(self.payload.unwrap_or(Value::Null));
        }
        let error = self.error.unwrap_or_else(|| ErrorShape {
            code: "UNKNOWN".to_string(),
            message: "request failed without error details".to_string(),
        });
        Err(GatewayError::Remote {
            code: error.code,
            message: error.message,
        })
    }
}

/// Error details of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    /// Error code; numeric codes are normalized to strings.
    #[serde(default, deserialize_with = "string_or_number")]
    pub code: String,
    /// Error message.
    #[serde(default)]
    pub message: String,
}

/// Event frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    /// Event name (e.g. `agent`, `presence`, `tick`).
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub payload: Value,
    /// Gateway-side sequence number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Gateway state version.
    #[serde(
        default,
        rename = "stateVersion",
        skip_serializing_if = "Option::is_none"
    )]
    pub state_version: Option<u64>,
}

impl EventFrame {
    /// Create an event frame without sequencing information.
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
            seq: None,
            state_version: None,
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}
