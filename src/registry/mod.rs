//! Session registry - in-memory table of logical sessions.
//!
//! Holds:
//! - [`AgentSession`]s keyed by column id (insertion order = display order)
//! - subagent message logs keyed by gateway session key
//! - the delegation mapping column ↔ subagent key
//!
//! Mutation is synchronous and total. Mutations naming a column that does
//! not exist are no-ops; columns are only created by [`SessionRegistry::add_column`].
//! Every effective mutation bumps a revision published through a
//! `tokio::sync::watch` channel, which persistence schedulers and views
//! subscribe to.
//!
//! The registry itself is not synchronized. It is shared as
//! [`SharedRegistry`] (one mutex) between the event-processing task and
//! callers.

mod transcript;
mod types;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use crate::error::DelegationError;
use crate::protocol::is_subagent_key;

pub use transcript::{
    any_streaming, apply_assistant_text, finish_run, has_finished_run, has_run, set_tool_use,
    upsert, TextOutcome, UpsertOutcome,
};
pub use types::{
    now_millis, AgentSession, AgentStatus, ChatMessage, CompactionInfo, GatewaySession,
    MessageRole, SessionMode, SessionUsage, ToolUse,
};

/// Registry shared between the connection task and callers.
pub type SharedRegistry = Arc<Mutex<SessionRegistry>>;

/// Lock a shared registry.
///
/// Registry mutations never leave partial state behind, so a poisoned lock
/// is recovered rather than propagated.
pub fn lock(registry: &SharedRegistry) -> MutexGuard<'_, SessionRegistry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory session state.
#[derive(Debug)]
pub struct SessionRegistry {
    columns: Vec<AgentSession>,
    subagent_logs: HashMap<String, Vec<ChatMessage>>,
    revision: watch::Sender<u64>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            columns: Vec::new(),
            subagent_logs: HashMap::new(),
            revision,
        }
    }

    /// Wrap into a [`SharedRegistry`].
    pub fn shared(self) -> SharedRegistry {
        Arc::new(Mutex::new(self))
    }

    /// Subscribe to change notifications (the value is the revision).
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Current revision.
    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    fn touch(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    // ------------------------------------------------------------------
    // Columns
    // ------------------------------------------------------------------

    /// Add a column. Returns `false` (and changes nothing) if it exists.
    pub fn add_column(&mut self, column_id: &str, agent_id: &str) -> bool {
        if self.column(column_id).is_some() {
            return false;
        }
        self.columns.push(AgentSession::new(column_id, agent_id));
        self.touch();
        true
    }

    /// Remove a column, releasing its delegation.
    pub fn remove_column(&mut self, column_id: &str) -> Option<AgentSession> {
        let idx = self.columns.iter().position(|c| c.column_id == column_id)?;
        let removed = self.columns.remove(idx);
        self.touch();
        Some(removed)
    }

    /// Column by id.
    pub fn column(&self, column_id: &str) -> Option<&AgentSession> {
        self.columns.iter().find(|c| c.column_id == column_id)
    }

    /// All columns in display order.
    pub fn columns(&self) -> &[AgentSession] {
        &self.columns
    }

    /// Column ids in display order.
    pub fn column_ids(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.column_id.clone()).collect()
    }

    /// Mutate an existing column. `None` (and no notification) if absent.
    pub fn update_column<R>(
        &mut self,
        column_id: &str,
        f: impl FnOnce(&mut AgentSession) -> R,
    ) -> Option<R> {
        let column = self.columns.iter_mut().find(|c| c.column_id == column_id)?;
        let result = f(column);
        self.touch();
        Some(result)
    }

    /// Append a message to a column.
    pub fn push_message(&mut self, column_id: &str, msg: ChatMessage) -> bool {
        self.update_column(column_id, |c| c.messages.push(msg)).is_some()
    }

    /// Set a column's status.
    pub fn set_status(&mut self, column_id: &str, status: AgentStatus) -> bool {
        self.update_column(column_id, |c| c.status = status).is_some()
    }

    /// Drop a column's transcript.
    pub fn clear_messages(&mut self, column_id: &str) -> bool {
        self.update_column(column_id, |c| {
            c.messages.clear();
            c.active_run_id = None;
        })
        .is_some()
    }

    // ------------------------------------------------------------------
    // Subagent logs
    // ------------------------------------------------------------------

    /// Log of a subagent session.
    pub fn subagent_log(&self, key: &str) -> Option<&[ChatMessage]> {
        self.subagent_logs.get(key).map(Vec::as_slice)
    }

    /// Keys with a log.
    pub fn subagent_keys(&self) -> Vec<String> {
        self.subagent_logs.keys().cloned().collect()
    }

    /// Mutate a subagent log, creating it on first use.
    pub fn update_subagent_log<R>(
        &mut self,
        key: &str,
        f: impl FnOnce(&mut Vec<ChatMessage>) -> R,
    ) -> R {
        let log = self.subagent_logs.entry(key.to_string()).or_default();
        let result = f(log);
        self.touch();
        result
    }

    /// Forget a subagent log.
    pub fn remove_subagent_log(&mut self, key: &str) -> Option<Vec<ChatMessage>> {
        let removed = self.subagent_logs.remove(key)?;
        self.touch();
        Some(removed)
    }

    // ------------------------------------------------------------------
    // Delegation
    // ------------------------------------------------------------------

    /// Column currently watching `key`.
    pub fn column_for_subagent(&self, key: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.assigned_subagent.as_deref() == Some(key))
            .map(|c| c.column_id.as_str())
    }

    /// Subagent key a column watches.
    pub fn assigned_subagent(&self, column_id: &str) -> Option<&str> {
        self.column(column_id)
            .and_then(|c| c.assigned_subagent.as_deref())
    }

    /// Whether no column watches `key`.
    pub fn is_subagent_available(&self, key: &str) -> bool {
        self.column_for_subagent(key).is_none()
    }

    /// Bind a column to a subagent session.
    ///
    /// Re-assigning a column to the key it already watches is accepted.
    /// A column watching another key is moved to the new one.
    pub fn assign_subagent(&mut self, column_id: &str, key: &str) -> Result<(), DelegationError> {
        if !is_subagent_key(key) {
            return Err(DelegationError::NotSubagent(key.to_string()));
        }
        if self.column(column_id).is_none() {
            return Err(DelegationError::UnknownColumn(column_id.to_string()));
        }
        if let Some(owner) = self.column_for_subagent(key) {
            if owner != column_id {
                return Err(DelegationError::AlreadyAssigned {
                    key: key.to_string(),
                    column: owner.to_string(),
                });
            }
        }
        self.update_column(column_id, |c| {
            c.assigned_subagent = Some(key.to_string());
            c.mode = SessionMode::Delegation;
        });
        Ok(())
    }

    /// Release a column's delegation. Returns the key it watched.
    pub fn unassign_subagent(&mut self, column_id: &str) -> Option<String> {
        self.update_column(column_id, |c| {
            c.mode = SessionMode::Chat;
            c.assigned_subagent.take()
        })
        .flatten()
    }

    /// Gateway sessions a column could start watching: active, subagent
    /// keyed and not watched by any column.
    pub fn delegation_candidates<'a>(
        &self,
        sessions: &'a [GatewaySession],
    ) -> Vec<&'a GatewaySession> {
        sessions
            .iter()
            .filter(|s| s.active && is_subagent_key(&s.key) && self.is_subagent_available(&s.key))
            .collect()
    }

    // ------------------------------------------------------------------
    // Connectivity
    // ------------------------------------------------------------------

    /// Transport lost: every column becomes disconnected, remembering its
    /// previous status.
    pub fn mark_all_disconnected(&mut self) {
        let mut changed = false;
        for column in &mut self.columns {
            if column.status != AgentStatus::Disconnected {
                column.status_before_disconnect = Some(column.status);
                column.status = AgentStatus::Disconnected;
                changed = true;
            }
            changed |= column.connected;
            column.connected = false;
        }
        if changed {
            self.touch();
        }
    }

    /// Transport back: columns still showing `disconnected` get their
    /// remembered status back. Columns whose agent presence reported
    /// offline stay disconnected until presence says otherwise.
    pub fn mark_all_connected(&mut self) {
        if self.columns.is_empty() {
            return;
        }
        for column in &mut self.columns {
            let previous = column.status_before_disconnect.take();
            if !column.agent_online {
                continue;
            }
            column.connected = true;
            if column.status == AgentStatus::Disconnected {
                column.status = previous.unwrap_or_default();
            }
        }
        self.touch();
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Column transcripts, for persisting.
    pub fn message_snapshot(&self) -> HashMap<String, Vec<ChatMessage>> {
        self.columns
            .iter()
            .map(|c| (c.column_id.clone(), c.messages.clone()))
            .collect()
    }

    /// Load persisted transcripts into existing columns. Streaming flags are
    /// cleared since no run survives a restart. Returns how many columns
    /// were restored.
    pub fn restore_messages(&mut self, mut saved: HashMap<String, Vec<ChatMessage>>) -> usize {
        let mut restored = 0;
        for column in &mut self.columns {
            if let Some(mut messages) = saved.remove(&column.column_id) {
                for msg in &mut messages {
                    msg.streaming = false;
                }
                column.messages = messages;
                restored += 1;
            }
        }
        for column_id in saved.keys() {
            tracing::debug!("Skipping persisted messages for unknown column {}", column_id);
        }
        if restored > 0 {
            self.touch();
        }
        restored
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUB_A: &str = "agent:main:subagent:a";
    const SUB_B: &str = "agent:main:subagent:b";

    fn registry_with(columns: &[&str]) -> SessionRegistry {
        let mut registry = SessionRegistry::new();
        for id in columns {
            registry.add_column(id, "main");
        }
        registry
    }

    fn gateway_session(key: &str, active: bool) -> GatewaySession {
        GatewaySession {
            key: key.to_string(),
            label: None,
            active,
            status: "running".into(),
            model: None,
            usage: None,
            parent_session: None,
            last_activity_at: 0,
            created_at: 0,
        }
    }

    #[test]
    fn test_add_column_once() {
        let mut registry = SessionRegistry::new();
        assert!(registry.add_column("a", "main"));
        assert!(!registry.add_column("a", "other"));
        assert_eq!(registry.columns().len(), 1);
        assert_eq!(registry.column("a").unwrap().agent_id, "main");
    }

    #[test]
    fn test_insertion_order_is_display_order() {
        let registry = registry_with(&["c", "a", "b"]);
        assert_eq!(registry.column_ids(), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_mutating_missing_column_is_noop() {
        let mut registry = registry_with(&["a"]);
        let rev = registry.revision();
        assert!(!registry.set_status("ghost", AgentStatus::Thinking));
        assert!(!registry.push_message("ghost", ChatMessage::user("hi")));
        assert!(registry.column("ghost").is_none());
        assert_eq!(registry.revision(), rev);
    }

    #[test]
    fn test_mutation_bumps_revision() {
        let mut registry = registry_with(&["a"]);
        let rx = registry.subscribe();
        let before = *rx.borrow();
        registry.set_status("a", AgentStatus::Thinking);
        assert!(*rx.borrow() > before);
    }

    #[test]
    fn test_remove_column() {
        let mut registry = registry_with(&["a", "b"]);
        let removed = registry.remove_column("a").unwrap();
        assert_eq!(removed.column_id, "a");
        assert_eq!(registry.column_ids(), vec!["b"]);
        assert!(registry.remove_column("a").is_none());
    }

    #[test]
    fn test_assign_and_lookup_both_directions() {
        let mut registry = registry_with(&["a"]);
        registry.assign_subagent("a", SUB_A).unwrap();
        assert_eq!(registry.column_for_subagent(SUB_A), Some("a"));
        assert_eq!(registry.assigned_subagent("a"), Some(SUB_A));
        assert_eq!(registry.column("a").unwrap().mode, SessionMode::Delegation);
    }

    #[test]
    fn test_delegation_is_exclusive() {
        let mut registry = registry_with(&["a", "b"]);
        registry.assign_subagent("a", SUB_A).unwrap();

        let err = registry.assign_subagent("b", SUB_A).unwrap_err();
        assert_eq!(
            err,
            DelegationError::AlreadyAssigned {
                key: SUB_A.into(),
                column: "a".into()
            }
        );
        assert_eq!(registry.assigned_subagent("b"), None);

        // Invariant over all columns: each key watched at most once.
        registry.assign_subagent("b", SUB_B).unwrap();
        registry.assign_subagent("a", SUB_A).unwrap();
        for key in [SUB_A, SUB_B] {
            let watchers = registry
                .columns()
                .iter()
                .filter(|c| c.assigned_subagent.as_deref() == Some(key))
                .count();
            assert_eq!(watchers, 1);
        }
    }

    #[test]
    fn test_assign_rejects_unknown_column_and_plain_keys() {
        let mut registry = registry_with(&["a"]);
        assert_eq!(
            registry.assign_subagent("ghost", SUB_A),
            Err(DelegationError::UnknownColumn("ghost".into()))
        );
        assert!(matches!(
            registry.assign_subagent("a", "agent:main:a"),
            Err(DelegationError::NotSubagent(_))
        ));
    }

    #[test]
    fn test_unassign_and_remove_release_key() {
        let mut registry = registry_with(&["a", "b"]);
        registry.assign_subagent("a", SUB_A).unwrap();
        assert_eq!(registry.unassign_subagent("a"), Some(SUB_A.to_string()));
        assert_eq!(registry.column("a").unwrap().mode, SessionMode::Chat);
        assert!(registry.is_subagent_available(SUB_A));

        registry.assign_subagent("b", SUB_A).unwrap();
        registry.remove_column("b");
        assert!(registry.is_subagent_available(SUB_A));
    }

    #[test]
    fn test_delegation_candidates() {
        let mut registry = registry_with(&["a"]);
        registry.assign_subagent("a", SUB_A).unwrap();
        let sessions = vec![
            gateway_session(SUB_A, true),
            gateway_session(SUB_B, true),
            gateway_session("agent:main:subagent:idle", false),
            gateway_session("agent:main:col", true),
        ];
        let keys: Vec<&str> = registry
            .delegation_candidates(&sessions)
            .iter()
            .map(|s| s.key.as_str())
            .collect();
        assert_eq!(keys, vec![SUB_B]);
    }

    #[test]
    fn test_disconnect_then_reconnect_restores_status() {
        let mut registry = registry_with(&["a", "b"]);
        registry.set_status("a", AgentStatus::Error);
        registry.mark_all_disconnected();
        for column in registry.columns() {
            assert_eq!(column.status, AgentStatus::Disconnected);
            assert!(!column.connected);
        }

        // An event overwrote b's status while disconnected.
        registry.set_status("b", AgentStatus::Thinking);
        registry.mark_all_connected();

        assert_eq!(registry.column("a").unwrap().status, AgentStatus::Error);
        assert_eq!(registry.column("b").unwrap().status, AgentStatus::Thinking);
        assert!(registry.columns().iter().all(|c| c.connected));
    }

    #[test]
    fn test_reconnect_keeps_presence_offline_columns_disconnected() {
        let mut registry = registry_with(&["a", "b"]);
        registry.update_column("a", |c| {
            c.agent_online = false;
            c.connected = false;
            c.status = AgentStatus::Disconnected;
        });

        registry.mark_all_disconnected();
        registry.mark_all_connected();

        let a = registry.column("a").unwrap();
        assert!(!a.connected);
        assert_eq!(a.status, AgentStatus::Disconnected);
        let b = registry.column("b").unwrap();
        assert!(b.connected);
        assert_eq!(b.status, AgentStatus::Idle);
    }

    #[test]
    fn test_repeated_disconnect_keeps_first_status() {
        let mut registry = registry_with(&["a"]);
        registry.set_status("a", AgentStatus::Streaming);
        registry.mark_all_disconnected();
        let rev = registry.revision();
        registry.mark_all_disconnected();
        assert_eq!(registry.revision(), rev);
        registry.mark_all_connected();
        assert_eq!(registry.column("a").unwrap().status, AgentStatus::Streaming);
    }

    #[test]
    fn test_restore_messages_only_for_existing_columns() {
        let mut registry = registry_with(&["a"]);
        let mut streaming = ChatMessage::streaming_placeholder("r1");
        streaming.text = "partial".into();

        let mut saved = HashMap::new();
        saved.insert("a".to_string(), vec![ChatMessage::user("hi"), streaming]);
        saved.insert("gone".to_string(), vec![ChatMessage::user("x")]);

        assert_eq!(registry.restore_messages(saved), 1);
        assert!(registry.column("gone").is_none());
        let messages = &registry.column("a").unwrap().messages;
        assert_eq!(messages.len(), 2);
        assert!(!any_streaming(messages));
    }

    #[test]
    fn test_subagent_log_created_on_use() {
        let mut registry = SessionRegistry::new();
        assert!(registry.subagent_log(SUB_A).is_none());
        registry.update_subagent_log(SUB_A, |log| log.push(ChatMessage::user("go")));
        assert_eq!(registry.subagent_log(SUB_A).unwrap().len(), 1);
        assert_eq!(registry.subagent_keys(), vec![SUB_A.to_string()]);
    }

    #[test]
    fn test_shared_lock() {
        let shared = registry_with(&["a"]).shared();
        lock(&shared).set_status("a", AgentStatus::Thinking);
        assert_eq!(
            lock(&shared).column("a").unwrap().status,
            AgentStatus::Thinking
        );
    }
}
