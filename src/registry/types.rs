//! Session state types.

use serde::{Deserialize, Serialize};

/// Status of a column's agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Waiting for input.
    #[default]
    Idle,
    /// Run started, no text yet.
    Thinking,
    /// Text deltas arriving.
    Streaming,
    /// Agent is running a tool.
    ToolUse,
    /// Last run failed.
    Error,
    /// Gateway or agent unreachable.
    Disconnected,
}

/// How a column is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Independent conversation.
    #[default]
    Chat,
    /// Watching a subagent session.
    Delegation,
}

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Compaction,
}

/// Tool invocation attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUse {
    pub name: String,
    pub status: String,
}

/// Context compaction summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionInfo {
    pub before_tokens: u64,
    pub after_tokens: u64,
    pub dropped_messages: u64,
}

/// Token usage of a gateway session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_tokens: Option<u64>,
}

/// One entry of a conversation transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: MessageRole,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use: Option<ToolUse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compaction: Option<CompactionInfo>,
}

impl ChatMessage {
    /// New message with a generated id and the current time.
    pub fn new(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            text: text.into(),
            timestamp: now_millis(),
            streaming: false,
            run_id: None,
            tool_use: None,
            compaction: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(MessageRole::System, text)
    }

    /// Empty assistant message that will accumulate deltas for `run_id`.
    pub fn streaming_placeholder(run_id: &str) -> Self {
        Self {
            streaming: true,
            run_id: Some(run_id.to_string()),
            ..Self::new(MessageRole::Assistant, "")
        }
    }

    /// Synthetic message recording a context compaction.
    pub fn compaction(info: CompactionInfo) -> Self {
        let text = format!(
            "Context compacted: {} → {} tokens ({} messages dropped)",
            info.before_tokens, info.after_tokens, info.dropped_messages
        );
        Self {
            compaction: Some(info),
            ..Self::new(MessageRole::Compaction, text)
        }
    }

    /// Whether this message belongs to `run_id`.
    pub fn is_run(&self, run_id: &str) -> bool {
        self.run_id.as_deref() == Some(run_id)
    }
}

/// State of one user-facing column.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSession {
    pub column_id: String,
    pub agent_id: String,
    pub status: AgentStatus,
    pub messages: Vec<ChatMessage>,
    pub active_run_id: Option<String>,
    pub token_count: u64,
    pub connected: bool,
    pub usage: Option<SessionUsage>,
    pub assigned_subagent: Option<String>,
    pub mode: SessionMode,
    /// Last presence reported for the column's agent. Only presence
    /// events change it; reconnecting the transport does not.
    pub agent_online: bool,
    /// Status held before the last transport loss.
    pub(crate) status_before_disconnect: Option<AgentStatus>,
}

impl AgentSession {
    pub fn new(column_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            column_id: column_id.into(),
            agent_id: agent_id.into(),
            status: AgentStatus::Idle,
            messages: Vec::new(),
            active_run_id: None,
            token_count: 0,
            connected: true,
            usage: None,
            assigned_subagent: None,
            mode: SessionMode::Chat,
            agent_online: true,
            status_before_disconnect: None,
        }
    }
}

/// Snapshot of a gateway-side session, refreshed by polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySession {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<SessionUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session: Option<String>,
    #[serde(default)]
    pub last_activity_at: i64,
    #[serde(default)]
    pub created_at: i64,
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
