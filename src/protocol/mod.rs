//! Protocol module - wire frames, codec, typed events and session keys.
//!
//! - JSON frame kinds: request, response, event
//! - Codec that drops unknown discriminants instead of failing the stream
//! - Typed event variants validated once per frame
//! - The session key classifier used by routing

mod codec;
mod events;
mod frame;
mod session_key;

pub use codec::FrameCodec;
pub use events::{
    names as event_names, AgentEvent, AgentStream, ChatEvent, ChatPayload, CompactionEvent,
    GatewayEvent, LifecyclePhase, PresenceEvent, UsageEvent,
};
pub use frame::{generate_request_id, ErrorShape, EventFrame, Frame, RequestFrame, ResponseFrame};
pub use session_key::{
    classify_session_key, column_session_key, is_subagent_key, SessionTarget, AGENT_SEGMENT,
    SUBAGENT_SEGMENT,
};

/// Protocol version range announced in the `connect` handshake.
pub const PROTOCOL_VERSION: u32 = 3;
