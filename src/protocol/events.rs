//! Typed gateway events.
//!
//! An [`EventFrame`] carries an untyped payload. [`GatewayEvent::parse`]
//! validates it once, by event name, so routing code works on structured
//! values only. A payload that does not fit its event name is a protocol
//! error for that frame; unknown event names parse to
//! [`GatewayEvent::Unknown`].

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{json, Value};

use super::frame::EventFrame;
use crate::error::{GatewayError, Result};
use crate::registry::{now_millis, ChatMessage, CompactionInfo, MessageRole, SessionUsage};

/// Event names understood by the router.
pub mod names {
    pub const AGENT: &str = "agent";
    pub const PRESENCE: &str = "presence";
    pub const TICK: &str = "tick";
    pub const COMPACTION: &str = "compaction";
    pub const SESSIONS_USAGE: &str = "sessions.usage";
    pub const CHAT: &str = "chat";
}

/// A decoded, validated gateway event.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Agent(AgentEvent),
    Presence(PresenceEvent),
    /// Keep-alive.
    Tick,
    Compaction(CompactionEvent),
    SessionsUsage(UsageEvent),
    Chat(ChatEvent),
    /// Event name not handled by the router.
    Unknown { name: String, payload: Value },
}

impl GatewayEvent {
    /// Parse an event frame by name.
    pub fn parse(frame: &EventFrame) -> Result<Self> {
        let payload = &frame.payload;
        let event = match frame.event.as_str() {
            names::AGENT => GatewayEvent::Agent(AgentEvent::parse(payload)?),
            names::PRESENCE => GatewayEvent::Presence(PresenceEvent::parse(payload)?),
            names::TICK => GatewayEvent::Tick,
            names::COMPACTION => GatewayEvent::Compaction(from_payload(&frame.event, payload)?),
            names::SESSIONS_USAGE => {
                GatewayEvent::SessionsUsage(from_payload(&frame.event, payload)?)
            }
            names::CHAT => GatewayEvent::Chat(from_payload(&frame.event, payload)?),
            other => GatewayEvent::Unknown {
                name: other.to_string(),
                payload: payload.clone(),
            },
        };
        Ok(event)
    }

    /// Wire name of the event.
    pub fn name(&self) -> &str {
        match self {
            GatewayEvent::Agent(_) => names::AGENT,
            GatewayEvent::Presence(_) => names::PRESENCE,
            GatewayEvent::Tick => names::TICK,
            GatewayEvent::Compaction(_) => names::COMPACTION,
            GatewayEvent::SessionsUsage(_) => names::SESSIONS_USAGE,
            GatewayEvent::Chat(_) => names::CHAT,
            GatewayEvent::Unknown { name, .. } => name,
        }
    }
}

fn from_payload<T: serde::de::DeserializeOwned>(event: &str, payload: &Value) -> Result<T> {
    serde_json::from_value(object_or_empty(payload))
        .map_err(|e| GatewayError::Protocol(format!("invalid {} payload: {}", event, e)))
}

fn object_or_empty(value: &Value) -> Value {
    if value.is_null() {
        json!({})
    } else {
        value.clone()
    }
}

// ----------------------------------------------------------------------
// agent
// ----------------------------------------------------------------------

/// One step of a streamed run.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentEvent {
    pub run_id: String,
    pub session_key: Option<String>,
    pub stream: AgentStream,
}

/// Stream-specific data of an [`AgentEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum AgentStream {
    /// Text output. `delta` is appended; `text` is a full snapshot.
    Assistant {
        delta: Option<String>,
        text: Option<String>,
    },
    Lifecycle {
        phase: LifecyclePhase,
        error: Option<String>,
    },
    ToolUse {
        name: Option<String>,
        phase: Option<String>,
    },
    /// Stream kind this client does not track.
    Other(String),
}

/// Lifecycle phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecyclePhase {
    Start,
    End,
    Error,
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAgentEvent {
    run_id: String,
    stream: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    session_key: Option<String>,
}

#[derive(Deserialize, Default)]
struct AssistantData {
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct LifecycleData {
    phase: LifecyclePhase,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize, Default)]
struct ToolData {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, alias = "status")]
    phase: Option<String>,
}

impl AgentEvent {
    fn parse(payload: &Value) -> Result<Self> {
        let raw: RawAgentEvent = from_payload(names::AGENT, payload)?;
        let data = object_or_empty(&raw.data);

        let stream = match raw.stream.as_str() {
            "assistant" => {
                let d: AssistantData = from_payload(names::AGENT, &data)?;
                AgentStream::Assistant {
                    delta: d.delta,
                    text: d.text,
                }
            }
            "lifecycle" => {
                let d: LifecycleData = from_payload(names::AGENT, &data)?;
                AgentStream::Lifecycle {
                    phase: d.phase,
                    error: d.error.map(error_text),
                }
            }
            "tool_use" | "tool" => {
                let d: ToolData = from_payload(names::AGENT, &data)?;
                AgentStream::ToolUse {
                    name: d.name,
                    phase: d.phase,
                }
            }
            other => AgentStream::Other(other.to_string()),
        };

        Ok(AgentEvent {
            run_id: raw.run_id,
            session_key: raw.session_key,
            stream,
        })
    }
}

fn error_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Object(ref map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

// ----------------------------------------------------------------------
// presence
// ----------------------------------------------------------------------

/// Online state per agent id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PresenceEvent {
    pub agents: BTreeMap<String, bool>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PresenceValue {
    Flag(bool),
    Label(String),
}

impl PresenceValue {
    fn is_online(&self) -> Option<bool> {
        match self {
            PresenceValue::Flag(online) => Some(*online),
            PresenceValue::Label(label) => match label.as_str() {
                "online" => Some(true),
                "offline" => Some(false),
                _ => None,
            },
        }
    }
}

impl PresenceEvent {
    /// Accepts `{ "<agentId>": bool | "online" | "offline" }`, optionally
    /// nested under an `agents` field.
    fn parse(payload: &Value) -> Result<Self> {
        let map = payload.get("agents").unwrap_or(payload);
        let raw: BTreeMap<String, PresenceValue> = from_payload(names::PRESENCE, map)?;

        let mut agents = BTreeMap::new();
        for (agent_id, value) in raw {
            match value.is_online() {
                Some(online) => {
                    agents.insert(agent_id, online);
                }
                None => tracing::debug!("Ignoring unknown presence state for {}", agent_id),
            }
        }
        Ok(PresenceEvent { agents })
    }
}

// ----------------------------------------------------------------------
// compaction / sessions.usage
// ----------------------------------------------------------------------

/// A session's context was compacted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionEvent {
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub before_tokens: u64,
    #[serde(default)]
    pub after_tokens: u64,
    #[serde(default)]
    pub dropped_messages: u64,
}

impl CompactionEvent {
    pub fn info(&self) -> CompactionInfo {
        CompactionInfo {
            before_tokens: self.before_tokens,
            after_tokens: self.after_tokens,
            dropped_messages: self.dropped_messages,
        }
    }
}

/// Fresh usage numbers for a session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    #[serde(default)]
    pub session_key: Option<String>,
    pub usage: SessionUsage,
}

// ----------------------------------------------------------------------
// chat
// ----------------------------------------------------------------------

/// A transcript message published by the gateway.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    #[serde(default)]
    pub session_key: Option<String>,
    pub message: ChatPayload,
}

/// Message body of a [`ChatEvent`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    #[serde(default)]
    pub id: Option<String>,
    pub role: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl ChatPayload {
    /// Role mapped onto the transcript roles. Unknown roles are shown as
    /// system messages.
    pub fn role(&self) -> MessageRole {
        match self.role.as_str() {
            "user" => MessageRole::User,
            "assistant" => MessageRole::Assistant,
            "compaction" => MessageRole::Compaction,
            _ => MessageRole::System,
        }
    }

    /// Message text from `text`, or from `content` given as a string or as
    /// an array of `{type: "text", text}` blocks.
    pub fn text(&self) -> String {
        if let Some(text) = &self.text {
            return text.clone();
        }
        match &self.content {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(blocks)) => blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        }
    }

    /// Convert into a finished transcript message.
    pub fn to_chat_message(&self) -> ChatMessage {
        let mut msg = ChatMessage::new(self.role(), self.text());
        if let Some(id) = &self.id {
            msg.id = id.clone();
        }
        msg.run_id = self.run_id.clone();
        msg.timestamp = self.timestamp.unwrap_or_else(now_millis);
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(name: &str, payload: Value) -> Result<GatewayEvent> {
        GatewayEvent::parse(&EventFrame::new(name, payload))
    }

    #[test]
    fn test_parse_assistant_delta() {
        let event = parse(
            "agent",
            json!({"runId": "r1", "stream": "assistant", "data": {"delta": "Hel"}, "sessionKey": "agent:main:a"}),
        )
        .unwrap();
        assert_eq!(
            event,
            GatewayEvent::Agent(AgentEvent {
                run_id: "r1".into(),
                session_key: Some("agent:main:a".into()),
                stream: AgentStream::Assistant {
                    delta: Some("Hel".into()),
                    text: None
                },
            })
        );
    }

    #[test]
    fn test_parse_lifecycle_phases() {
        for (phase, expected) in [
            ("start", LifecyclePhase::Start),
            ("end", LifecyclePhase::End),
            ("error", LifecyclePhase::Error),
            ("paused", LifecyclePhase::Other),
        ] {
            let event = parse(
                "agent",
                json!({"runId": "r", "stream": "lifecycle", "data": {"phase": phase}}),
            )
            .unwrap();
            match event {
                GatewayEvent::Agent(AgentEvent {
                    stream: AgentStream::Lifecycle { phase, .. },
                    ..
                }) => assert_eq!(phase, expected),
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[test]
    fn test_lifecycle_error_object_message() {
        let event = parse(
            "agent",
            json!({"runId": "r", "stream": "lifecycle", "data": {"phase": "error", "error": {"message": "boom"}}}),
        )
        .unwrap();
        match event {
            GatewayEvent::Agent(AgentEvent {
                stream: AgentStream::Lifecycle { error, .. },
                ..
            }) => assert_eq!(error.as_deref(), Some("boom")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_tool_alias_and_unknown_stream() {
        let tool = parse("agent", json!({"runId": "r", "stream": "tool", "data": {"name": "grep"}})).unwrap();
        assert!(matches!(
            tool,
            GatewayEvent::Agent(AgentEvent { stream: AgentStream::ToolUse { .. }, .. })
        ));

        let other = parse("agent", json!({"runId": "r", "stream": "thinking"})).unwrap();
        assert!(matches!(
            other,
            GatewayEvent::Agent(AgentEvent { stream: AgentStream::Other(_), .. })
        ));
    }

    #[test]
    fn test_agent_without_run_id_is_protocol_error() {
        let result = parse("agent", json!({"stream": "assistant"}));
        assert!(matches!(result, Err(GatewayError::Protocol(_))));
    }

    #[test]
    fn test_parse_presence_shapes() {
        let flat = parse("presence", json!({"main": true, "writer": "offline", "x": "away"})).unwrap();
        let nested = parse("presence", json!({"agents": {"main": true, "writer": false}})).unwrap();
        let expected = GatewayEvent::Presence(PresenceEvent {
            agents: BTreeMap::from([("main".to_string(), true), ("writer".to_string(), false)]),
        });
        assert_eq!(flat, expected);
        assert_eq!(nested, expected);
    }

    #[test]
    fn test_parse_tick_and_unknown() {
        assert_eq!(parse("tick", Value::Null).unwrap(), GatewayEvent::Tick);
        let unknown = parse("health", json!({"ok": true})).unwrap();
        assert_eq!(unknown.name(), "health");
    }

    #[test]
    fn test_parse_usage() {
        let event = parse(
            "sessions.usage",
            json!({"sessionKey": "agent:main:a", "usage": {"inputTokens": 10, "outputTokens": 5, "totalTokens": 15}}),
        )
        .unwrap();
        match event {
            GatewayEvent::SessionsUsage(usage) => assert_eq!(usage.usage.total_tokens, 15),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_chat_text_from_content_blocks() {
        let event = parse(
            "chat",
            json!({
                "sessionKey": "agent:main:subagent:1",
                "message": {
                    "id": "m1",
                    "role": "user",
                    "content": [{"type": "text", "text": "hi "}, {"type": "image"}, {"type": "text", "text": "there"}]
                }
            }),
        )
        .unwrap();
        match event {
            GatewayEvent::Chat(chat) => {
                let msg = chat.message.to_chat_message();
                assert_eq!(msg.id, "m1");
                assert_eq!(msg.role, MessageRole::User);
                assert_eq!(msg.text, "hi there");
                assert!(!msg.streaming);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
