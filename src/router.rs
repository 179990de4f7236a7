//! Event router - applies typed gateway events to the session registry.
//!
//! Routing is a pure function of the event, the session key classifier and
//! the delegation mapping at the time of processing:
//!
//! - a subagent key always feeds that key's message log, and additionally
//!   the column watching it (if any)
//! - a column key feeds that column
//! - an unroutable key, or a key naming a removed column, is dropped
//!
//! The router never performs I/O and never fails: events that cannot be
//! applied are logged at debug level and ignored.
//!
//! # Example
//!
//! ```
//! use gateway_client::protocol::{EventFrame, GatewayEvent};
//! use gateway_client::registry::{AgentStatus, SessionRegistry};
//! use gateway_client::router::EventRouter;
//! use serde_json::json;
//!
//! let mut registry = SessionRegistry::new();
//! registry.add_column("col-a", "main");
//!
//! let frame = EventFrame::new(
//!     "agent",
//!     json!({"runId": "r1", "stream": "lifecycle", "data": {"phase": "start"}, "sessionKey": "agent:main:col-a"}),
//! );
//! let event = GatewayEvent::parse(&frame).unwrap();
//!
//! EventRouter::new("main").route(&mut registry, &event);
//! assert_eq!(registry.column("col-a").unwrap().status, AgentStatus::Thinking);
//! ```

use crate::protocol::{
    classify_session_key, AgentEvent, AgentStream, ChatEvent, CompactionEvent, GatewayEvent,
    LifecyclePhase, PresenceEvent, SessionTarget, UsageEvent,
};
use crate::registry::{
    apply_assistant_text, finish_run, has_run, set_tool_use, upsert, AgentSession, AgentStatus,
    ChatMessage, MessageRole, SessionRegistry, TextOutcome, ToolUse,
};

/// Stateless dispatcher from events to registry mutations.
#[derive(Debug, Clone)]
pub struct EventRouter {
    default_column: String,
}

impl EventRouter {
    /// Create a router sending key-less events to `default_column`.
    pub fn new(default_column: impl Into<String>) -> Self {
        Self {
            default_column: default_column.into(),
        }
    }

    /// Column receiving events whose key names no column.
    pub fn default_column(&self) -> &str {
        &self.default_column
    }

    /// Apply one event.
    pub fn route(&self, registry: &mut SessionRegistry, event: &GatewayEvent) {
        match event {
            GatewayEvent::Agent(agent) => self.route_agent(registry, agent),
            GatewayEvent::Presence(presence) => route_presence(registry, presence),
            GatewayEvent::Tick => {}
            GatewayEvent::Compaction(compaction) => self.route_compaction(registry, compaction),
            GatewayEvent::SessionsUsage(usage) => self.route_usage(registry, usage),
            GatewayEvent::Chat(chat) => self.route_chat(registry, chat),
            GatewayEvent::Unknown { name, .. } => {
                tracing::debug!("Ignoring unhandled event {}", name);
            }
        }
    }

    fn classify(&self, key: Option<&str>) -> SessionTarget {
        classify_session_key(key, &self.default_column)
    }

    /// Column affected by a key: the classified column, or the column
    /// watching a subagent key.
    fn target_column(&self, registry: &SessionRegistry, key: Option<&str>) -> Option<String> {
        match self.classify(key) {
            SessionTarget::Column(column_id) => Some(column_id),
            SessionTarget::Subagent { key, .. } => {
                registry.column_for_subagent(&key).map(str::to_string)
            }
            SessionTarget::Unroutable => {
                tracing::debug!("Dropping event for unroutable session key {:?}", key);
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // agent
    // ------------------------------------------------------------------

    fn route_agent(&self, registry: &mut SessionRegistry, event: &AgentEvent) {
        if let AgentStream::Other(stream) = &event.stream {
            tracing::debug!("Ignoring agent stream {} for run {}", stream, event.run_id);
            return;
        }

        let column_id = match self.classify(event.session_key.as_deref()) {
            SessionTarget::Subagent { key, .. } => {
                registry.update_subagent_log(&key, |log| apply_to_log(log, event));
                match registry.column_for_subagent(&key) {
                    Some(column_id) => column_id.to_string(),
                    // Not watched by any column: the log is the only target.
                    None => return,
                }
            }
            SessionTarget::Column(column_id) => column_id,
            SessionTarget::Unroutable => {
                tracing::debug!(
                    "Dropping agent event for run {}: unroutable session key {:?}",
                    event.run_id,
                    event.session_key
                );
                return;
            }
        };

        let applied = registry.update_column(&column_id, |column| apply_to_column(column, event));
        if applied.is_none() {
            tracing::debug!(
                "Dropping agent event for run {}: no column {}",
                event.run_id,
                column_id
            );
        }
    }

    // ------------------------------------------------------------------
    // compaction / sessions.usage
    // ------------------------------------------------------------------

    fn route_compaction(&self, registry: &mut SessionRegistry, event: &CompactionEvent) {
        let Some(column_id) = self.target_column(registry, event.session_key.as_deref()) else {
            return;
        };
        if !registry.push_message(&column_id, ChatMessage::compaction(event.info())) {
            tracing::debug!("Dropping compaction for missing column {}", column_id);
        }
    }

    fn route_usage(&self, registry: &mut SessionRegistry, event: &UsageEvent) {
        let Some(column_id) = self.target_column(registry, event.session_key.as_deref()) else {
            return;
        };
        let updated = registry.update_column(&column_id, |column| {
            column.token_count = event.usage.total_tokens;
            column.usage = Some(event.usage.clone());
        });
        if updated.is_none() {
            tracing::debug!("Dropping usage for missing column {}", column_id);
        }
    }

    // ------------------------------------------------------------------
    // chat
    // ------------------------------------------------------------------

    fn route_chat(&self, registry: &mut SessionRegistry, event: &ChatEvent) {
        let key = match self.classify(event.session_key.as_deref()) {
            SessionTarget::Subagent { key, .. } => key,
            // Column transcripts are driven by the agent stream.
            _ => return,
        };

        let message = event.message.to_chat_message();
        if message.role == MessageRole::Assistant {
            let echoed = registry.subagent_log(&key).is_some_and(|log| {
                log.iter().any(|m| m.streaming)
                    || message
                        .run_id
                        .as_deref()
                        .is_some_and(|run_id| has_run(log, run_id))
            });
            if echoed {
                tracing::debug!("Dropping assistant chat echo for {}", key);
                return;
            }
        }

        registry.update_subagent_log(&key, |log| upsert(log, message));
    }
}

fn route_presence(registry: &mut SessionRegistry, event: &PresenceEvent) {
    let affected: Vec<(String, bool)> = registry
        .columns()
        .iter()
        .filter_map(|c| {
            event
                .agents
                .get(&c.agent_id)
                .map(|online| (c.column_id.clone(), *online))
        })
        .collect();

    for (column_id, online) in affected {
        registry.update_column(&column_id, |column| {
            column.agent_online = online;
            column.connected = online;
            if !online {
                column.status = AgentStatus::Disconnected;
            } else if column.status == AgentStatus::Disconnected {
                column.status = AgentStatus::Idle;
            }
        });
    }
}

/// Subagent log bookkeeping: text accumulation and run finalization.
fn apply_to_log(log: &mut Vec<ChatMessage>, event: &AgentEvent) {
    let run_id = event.run_id.as_str();
    match &event.stream {
        AgentStream::Assistant { delta, text } => {
            if apply_assistant_text(log, run_id, delta.as_deref(), text.as_deref())
                == TextOutcome::Stale
            {
                tracing::debug!("Ignoring stale text for finished run {}", run_id);
            }
        }
        AgentStream::Lifecycle {
            phase: LifecyclePhase::End | LifecyclePhase::Error,
            ..
        } => {
            finish_run(log, run_id);
        }
        AgentStream::ToolUse { name, phase } => {
            set_tool_use(log, run_id, tool_use(name, phase));
        }
        AgentStream::Lifecycle { .. } | AgentStream::Other(_) => {}
    }
}

/// Column state machine for one run event.
fn apply_to_column(column: &mut AgentSession, event: &AgentEvent) {
    let run_id = event.run_id.as_str();
    match &event.stream {
        AgentStream::Assistant { delta, text } => {
            match apply_assistant_text(&mut column.messages, run_id, delta.as_deref(), text.as_deref())
            {
                TextOutcome::Stale => {
                    tracing::debug!("Ignoring stale text for finished run {}", run_id);
                }
                TextOutcome::Created | TextOutcome::Updated => {
                    column.status = AgentStatus::Streaming;
                    column.active_run_id = Some(run_id.to_string());
                }
            }
        }
        AgentStream::Lifecycle { phase, error } => match phase {
            LifecyclePhase::Start => {
                column.status = AgentStatus::Thinking;
                column.active_run_id = Some(run_id.to_string());
            }
            LifecyclePhase::End => {
                finish_run(&mut column.messages, run_id);
                column.active_run_id = None;
                column.status = AgentStatus::Idle;
            }
            LifecyclePhase::Error => {
                finish_run(&mut column.messages, run_id);
                column.active_run_id = None;
                column.status = AgentStatus::Error;
                if let Some(error) = error {
                    let mut msg = ChatMessage::system(format!("Run failed: {}", error));
                    msg.run_id = Some(run_id.to_string());
                    column.messages.push(msg);
                }
            }
            LifecyclePhase::Other => {}
        },
        AgentStream::ToolUse { name, phase } => {
            column.status = AgentStatus::ToolUse;
            set_tool_use(&mut column.messages, run_id, tool_use(name, phase));
        }
        AgentStream::Other(_) => {}
    }
}

fn tool_use(name: &Option<String>, phase: &Option<String>) -> ToolUse {
    ToolUse {
        name: name.clone().unwrap_or_else(|| "tool".to_string()),
        status: phase.clone().unwrap_or_else(|| "running".to_string()),
    }
}
