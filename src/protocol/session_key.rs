//! Session key classification.
//!
//! Session keys are colon-delimited paths. This module is the single place
//! that interprets them; routing code matches on [`SessionTarget`] instead of
//! splitting strings itself.
//!
//! Accepted shapes:
//!
//! | key                              | target                               |
//! |----------------------------------|--------------------------------------|
//! | absent or empty                  | `Column(default)`                    |
//! | contains a `subagent` segment    | `Subagent { key, parent }`           |
//! | `agent:<name>`                   | `Column(default)`                    |
//! | `agent:<name>:<columnId>`        | `Column(columnId)`                   |
//! | anything else                    | `Unroutable`                         |
//!
//! # Example
//!
//! ```
//! use gateway_client::protocol::{classify_session_key, column_session_key, SessionTarget};
//!
//! let key = column_session_key("main", "col-a");
//! assert_eq!(key, "agent:main:col-a");
//! assert_eq!(
//!     classify_session_key(Some(&key), "main"),
//!     SessionTarget::Column("col-a".to_string())
//! );
//! ```

/// Segment marking a subagent session.
pub const SUBAGENT_SEGMENT: &str = "subagent";

/// Leading segment of agent-addressed keys.
pub const AGENT_SEGMENT: &str = "agent";

const DELIMITER: char = ':';

/// Where a session key points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTarget {
    /// A user-facing column.
    Column(String),
    /// A gateway-managed subagent session.
    Subagent {
        /// The full session key.
        key: String,
        /// Key of the spawning session, when the path names one.
        parent: Option<String>,
    },
    /// Key shape not understood; events for it are dropped.
    Unroutable,
}

/// Classify an (optional) session key.
pub fn classify_session_key(key: Option<&str>, default_column: &str) -> SessionTarget {
    let key = match key.map(str::trim) {
        None | Some("") => return SessionTarget::Column(default_column.to_string()),
        Some(key) => key,
    };

    let parts: Vec<&str> = key.split(DELIMITER).collect();

    if let Some(pos) = parts.iter().position(|p| *p == SUBAGENT_SEGMENT) {
        let parent = if pos > 0 {
            Some(parts[..pos].join(":"))
        } else {
            None
        };
        return SessionTarget::Subagent {
            key: key.to_string(),
            parent,
        };
    }

    if parts.iter().any(|p| p.is_empty()) || parts[0] != AGENT_SEGMENT {
        return SessionTarget::Unroutable;
    }

    match parts.len() {
        2 => SessionTarget::Column(default_column.to_string()),
        3 => SessionTarget::Column(parts[2].to_string()),
        _ => SessionTarget::Unroutable,
    }
}

/// Whether `key` denotes a subagent session.
pub fn is_subagent_key(key: &str) -> bool {
    key.split(DELIMITER).any(|p| p == SUBAGENT_SEGMENT)
}

/// Build the session key that addresses a column: `agent:<mainAgent>:<columnId>`.
pub fn column_session_key(main_agent: &str, column_id: &str) -> String {
    format!("{AGENT_SEGMENT}:{main_agent}:{column_id}")
}
