//! JSON text codec for wire frames.
//!
//! Decoding classifies by the `type` discriminant. Unknown discriminants are
//! dropped with a warning; malformed JSON is a [`GatewayError::Protocol`] for
//! that single frame. Neither closes the connection.

use serde_json::Value;

use super::frame::Frame;
use crate::error::{GatewayError, Result};

const KNOWN_KINDS: [&str; 3] = ["req", "res", "event"];

/// Frame codec (marker struct with static methods).
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame to its JSON text form.
    #[inline]
    pub fn encode(frame: &Frame) -> Result<String> {
        Ok(serde_json::to_string(frame)?)
    }

    /// Decode one JSON text message.
    ///
    /// Returns `Ok(None)` when the discriminant is missing or unknown.
    pub fn decode(text: &str) -> Result<Option<Frame>> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| GatewayError::Protocol(format!("invalid frame JSON: {}", e)))?;

        let kind = match value.get("type").and_then(Value::as_str) {
            Some(kind) => kind,
            None => {
                tracing::warn!("Dropping frame without type discriminant");
                return Ok(None);
            }
        };

        if !KNOWN_KINDS.contains(&kind) {
            tracing::warn!("Dropping frame with unknown type {:?}", kind);
            return Ok(None);
        }

        let kind = kind.to_string();
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| GatewayError::Protocol(format!("malformed {} frame: {}", kind, e)))
    }
}
