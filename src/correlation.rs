//! Correlation table - maps outstanding request ids to waiting callers.
//!
//! Each call registers its id and receives a [`PendingResponse`]. The read
//! loop completes entries as responses arrive; disconnects reject every
//! entry at once. Resolution is one-shot: an entry is removed by whichever
//! of resolve / reject / cancel / timeout happens first, and later attempts
//! for the same id are no-ops.
//!
//! # Example
//!
//! ```
//! use gateway_client::correlation::CorrelationTable;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let table = CorrelationTable::new();
//! let pending = table.register("req-1", "models.list").unwrap();
//!
//! assert!(table.resolve("req-1", json!({"models": []})));
//! assert_eq!(pending.wait().await.unwrap(), json!({"models": []}));
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{GatewayError, Result};
use crate::protocol::ResponseFrame;

type CallResult = Result<Value>;

/// Book-keeping for one outstanding call.
#[derive(Debug)]
struct PendingCall {
    method: String,
    created_at: Instant,
    tx: oneshot::Sender<CallResult>,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingCall>>>;

fn lock_map(map: &PendingMap) -> MutexGuard<'_, HashMap<String, PendingCall>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Table of in-flight calls.
///
/// Cheaply cloneable; clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct CorrelationTable {
    pending: PendingMap,
}

impl CorrelationTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outstanding call.
    ///
    /// # Errors
    ///
    /// `DuplicateRequestId` if `id` is already pending.
    pub fn register(&self, id: &str, method: &str) -> Result<PendingResponse> {
        let mut pending = lock_map(&self.pending);
        if pending.contains_key(id) {
            return Err(GatewayError::DuplicateRequestId(id.to_string()));
        }

        let (tx, rx) = oneshot::channel();
        pending.insert(
            id.to_string(),
            PendingCall {
                method: method.to_string(),
                created_at: Instant::now(),
                tx,
            },
        );

        Ok(PendingResponse {
            id: id.to_string(),
            method: method.to_string(),
            rx,
            table: self.pending.clone(),
        })
    }

    fn take(&self, id: &str) -> Option<PendingCall> {
        lock_map(&self.pending).remove(id)
    }

    fn deliver(&self, id: &str, outcome: CallResult) -> bool {
        let Some(call) = self.take(id) else {
            tracing::debug!("Response for unknown request {} (late or duplicate)", id);
            return false;
        };

        tracing::trace!(
            "Completing {} ({}) after {:?}",
            id,
            call.method,
            call.created_at.elapsed()
        );

        if call.tx.send(outcome).is_err() {
            tracing::debug!("Caller of {} ({}) went away before completion", id, call.method);
        }
        true
    }

    /// Resolve a call with a payload. Unknown ids are a no-op.
    pub fn resolve(&self, id: &str, payload: Value) -> bool {
        self.deliver(id, Ok(payload))
    }

    /// Reject a call. Unknown ids are a no-op.
    pub fn reject(&self, id: &str, error: GatewayError) -> bool {
        self.deliver(id, Err(error))
    }

    /// Complete a call from a response frame (`ok=false` becomes `Remote`).
    pub fn complete(&self, response: ResponseFrame) -> bool {
        let id = response.id.clone();
        self.deliver(&id, response.into_result())
    }

    /// Drop a pending call without completing it. The caller observes a
    /// connectivity error.
    pub fn cancel(&self, id: &str) -> bool {
        self.take(id).is_some()
    }

    /// Reject every outstanding call with a connectivity error.
    ///
    /// Returns the number of calls rejected.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<(String, PendingCall)> = lock_map(&self.pending).drain().collect();
        let count = drained.len();

        for (id, call) in drained {
            tracing::debug!("Cancelling {} ({}): {}", id, call.method, reason);
            let _ = call.tx.send(Err(GatewayError::connectivity(reason)));
        }

        if count > 0 {
            tracing::info!("Rejected {} pending call(s): {}", count, reason);
        }
        count
    }

    /// Whether `id` is outstanding.
    pub fn is_pending(&self, id: &str) -> bool {
        lock_map(&self.pending).contains_key(id)
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        lock_map(&self.pending).len()
    }

    /// Whether no call is outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Waitable side of a registered call.
#[derive(Debug)]
pub struct PendingResponse {
    id: String,
    method: String,
    rx: oneshot::Receiver<CallResult>,
    table: PendingMap,
}

impl PendingResponse {
    /// Request id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Request method.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Wait for the call to complete.
    pub async fn wait(self) -> Result<Value> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(GatewayError::connectivity(format!(
                "request {} was cancelled",
                self.method
            ))),
        }
    }

    /// Wait with an optional timeout. On timeout the entry is removed from
    /// the table, so a late response is ignored.
    pub async fn wait_timeout(self, timeout: Option<Duration>) -> Result<Value> {
        let Some(limit) = timeout else {
            return self.wait().await;
        };

        let PendingResponse {
            id,
            method,
            rx,
            table,
        } = self;

        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(GatewayError::connectivity(format!(
                "request {} was cancelled",
                method
            ))),
            Err(_) => {
                lock_map(&table).remove(&id);
                Err(GatewayError::Timeout {
                    method,
                    timeout: limit,
                })
            }
        }
    }
}
