//! Message-sequence operations shared by column transcripts and subagent logs.
//!
//! Invariant: at most one message per run id has `streaming = true`; text
//! deltas only ever land on that message.

use super::types::{ChatMessage, MessageRole, ToolUse};

/// What an assistant text update did to a transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextOutcome {
    /// A streaming placeholder was created for the run.
    Created,
    /// The run's streaming message was updated.
    Updated,
    /// The run already finished; the update was ignored.
    Stale,
}

/// Apply assistant text for `run_id`.
///
/// `delta` is appended; without a delta, `text` replaces the message body
/// (snapshot-style streams).
pub fn apply_assistant_text(
    messages: &mut Vec<ChatMessage>,
    run_id: &str,
    delta: Option<&str>,
    text: Option<&str>,
) -> TextOutcome {
    if let Some(msg) = streaming_message_mut(messages, run_id) {
        write_text(msg, delta, text);
        return TextOutcome::Updated;
    }

    if has_finished_run(messages, run_id) {
        return TextOutcome::Stale;
    }

    let mut msg = ChatMessage::streaming_placeholder(run_id);
    write_text(&mut msg, delta, text);
    messages.push(msg);
    TextOutcome::Created
}

fn write_text(msg: &mut ChatMessage, delta: Option<&str>, text: Option<&str>) {
    match (delta, text) {
        (Some(delta), _) => msg.text.push_str(delta),
        (None, Some(text)) => {
            msg.text.clear();
            msg.text.push_str(text);
        }
        (None, None) => {}
    }
}

/// Mark the run's streaming message finished. Returns whether one existed.
pub fn finish_run(messages: &mut [ChatMessage], run_id: &str) -> bool {
    let mut found = false;
    for msg in messages
        .iter_mut()
        .filter(|m| m.streaming && m.is_run(run_id))
    {
        msg.streaming = false;
        found = true;
    }
    found
}

/// Record a tool invocation on the run's most recent message.
pub fn set_tool_use(messages: &mut [ChatMessage], run_id: &str, tool: ToolUse) -> bool {
    match messages.iter_mut().rev().find(|m| m.is_run(run_id)) {
        Some(msg) => {
            msg.tool_use = Some(tool);
            true
        }
        None => false,
    }
}

/// The streaming message of `run_id`, if any.
pub fn streaming_message_mut<'a>(
    messages: &'a mut [ChatMessage],
    run_id: &str,
) -> Option<&'a mut ChatMessage> {
    messages
        .iter_mut()
        .rev()
        .find(|m| m.streaming && m.is_run(run_id))
}

/// Whether any message belongs to `run_id`.
pub fn has_run(messages: &[ChatMessage], run_id: &str) -> bool {
    messages.iter().any(|m| m.is_run(run_id))
}

/// Whether the run already produced a finished assistant message.
pub fn has_finished_run(messages: &[ChatMessage], run_id: &str) -> bool {
    messages
        .iter()
        .any(|m| m.role == MessageRole::Assistant && !m.streaming && m.is_run(run_id))
}

/// Whether any message is still streaming.
pub fn any_streaming(messages: &[ChatMessage]) -> bool {
    messages.iter().any(|m| m.streaming)
}

/// Outcome of [`upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Replaced,
    Appended,
}

/// Replace the message with the same id in place, or append it.
pub fn upsert(messages: &mut Vec<ChatMessage>, msg: ChatMessage) -> UpsertOutcome {
    match messages.iter_mut().find(|m| m.id == msg.id) {
        Some(existing) => {
            *existing = msg;
            UpsertOutcome::Replaced
        }
        None => {
            messages.push(msg);
            UpsertOutcome::Appended
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deltas_accumulate_on_one_message() {
        let mut log = Vec::new();
        assert_eq!(
            apply_assistant_text(&mut log, "r1", Some("Hel"), None),
            TextOutcome::Created
        );
        assert_eq!(
            apply_assistant_text(&mut log, "r1", Some("lo"), None),
            TextOutcome::Updated
        );
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].text, "Hello");
        assert!(log[0].streaming);
    }

    #[test]
    fn test_other_roles_do_not_finish_a_run() {
        let mut log = Vec::new();
        let mut prompt = ChatMessage::user("do it");
        prompt.run_id = Some("r1".into());
        log.push(prompt);

        assert_eq!(
            apply_assistant_text(&mut log, "r1", Some("Hello"), None),
            TextOutcome::Created
        );
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].role, MessageRole::Assistant);
        assert_eq!(log[1].text, "Hello");

        finish_run(&mut log, "r1");
        assert!(has_finished_run(&log, "r1"));
        assert_eq!(
            apply_assistant_text(&mut log, "r1", Some("late"), None),
            TextOutcome::Stale
        );
    }

    #[test]
    fn test_text_snapshot_replaces() {
        let mut log = Vec::new();
        apply_assistant_text(&mut log, "r1", None, Some("Hi"));
        apply_assistant_text(&mut log, "r1", None, Some("Hi there"));
        assert_eq!(log[0].text, "Hi there");
    }

    #[test]
    fn test_runs_are_kept_apart() {
        let mut log = Vec::new();
        apply_assistant_text(&mut log, "r1", Some("a"), None);
        apply_assistant_text(&mut log, "r2", Some("b"), None);
        apply_assistant_text(&mut log, "r1", Some("c"), None);
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].text, "ac");
        assert_eq!(log[1].text, "b");
    }

    #[test]
    fn test_delta_after_finish_is_stale() {
        let mut log = Vec::new();
        apply_assistant_text(&mut log, "r1", Some("done"), None);
        assert!(finish_run(&mut log, "r1"));
        assert_eq!(
            apply_assistant_text(&mut log, "r1", Some("late"), None),
            TextOutcome::Stale
        );
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].text, "done");
    }

    #[test]
    fn test_finish_unknown_run() {
        let mut log = vec![ChatMessage::user("hi")];
        assert!(!finish_run(&mut log, "nope"));
    }

    #[test]
    fn test_upsert_replaces_by_id() {
        let mut log = Vec::new();
        let mut msg = ChatMessage::user("first");
        msg.id = "m1".into();
        assert_eq!(upsert(&mut log, msg.clone()), UpsertOutcome::Appended);

        msg.text = "edited".into();
        assert_eq!(upsert(&mut log, msg), UpsertOutcome::Replaced);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].text, "edited");
    }

    #[test]
    fn test_tool_use_lands_on_run_message() {
        let mut log = Vec::new();
        apply_assistant_text(&mut log, "r1", Some("x"), None);
        let tool = ToolUse {
            name: "search".into(),
            status: "running".into(),
        };
        assert!(set_tool_use(&mut log, "r1", tool));
        assert_eq!(log[0].tool_use.as_ref().unwrap().name, "search");
        assert_eq!(log[0].role, MessageRole::Assistant);
    }
}
