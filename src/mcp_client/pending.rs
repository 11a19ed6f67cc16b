//! Request correlation table.
//!
//! Maps an outstanding request id to the channel its caller is waiting on.
//! Shared by every transport that multiplexes replies over one stream (stdio
//! and legacy SSE). Entries leave the table exactly once: on reply, on
//! timeout, or when the channel closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

use super::errors::McpError;
use super::types::JsonRpcResponse;

type Completion = oneshot::Sender<Result<Value, McpError>>;

/// Outstanding requests of one connection.
#[derive(Debug)]
pub struct PendingRequests {
    server_id: String,
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Completion>>,
}

/// Handle held by the caller while a request is in flight.
#[derive(Debug)]
pub struct PendingSlot {
    pub id: u64,
    rx: oneshot::Receiver<Result<Value, McpError>>,
}

impl PendingRequests {
    pub fn new(server_id: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next id and register a completion slot for it.
    pub async fn register(&self) -> PendingSlot {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.entries.lock().await.insert(id, tx);
        PendingSlot { id, rx }
    }

    /// Drop a slot without completing it (write failed, caller gave up).
    pub async fn remove(&self, id: u64) -> bool {
        self.entries.lock().await.remove(&id).is_some()
    }

    /// Route a reply to its waiting caller.
    ///
    /// Returns `false` when no caller is waiting for that id anymore (it timed
    /// out or the id was never ours); the reply is then discarded.
    pub async fn complete(&self, response: JsonRpcResponse) -> bool {
        let Some(tx) = self.entries.lock().await.remove(&response.id) else {
            tracing::debug!(
                server = %self.server_id,
                id = response.id,
                "discarding reply for unknown or expired request"
            );
            return false;
        };
        // The receiver may have been dropped by a cancelled caller.
        let _ = tx.send(response.into_result());
        true
    }

    /// Reject every outstanding request and empty the table.
    pub async fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<(u64, Completion)> = self.entries.lock().await.drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(McpError::connection(&self.server_id, reason)));
        }
        count
    }

    /// Number of requests currently awaiting a reply.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Wait for the reply to `slot`, bounded by `timeout`.
    ///
    /// On expiry the id is removed from the table so a late reply is
    /// discarded, and the caller gets [`McpError::Timeout`]. The channel
    /// itself stays open.
    pub async fn wait(
        &self,
        slot: PendingSlot,
        method: &str,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let PendingSlot { id, rx } = slot;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without an answer: the table was torn down.
            Ok(Err(_)) => Err(McpError::connection(
                &self.server_id,
                "connection closed while awaiting reply",
            )),
            Err(_) => {
                self.remove(id).await;
                Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn reply(id: u64, value: Value) -> JsonRpcResponse {
        JsonRpcResponse {
            id,
            result: Some(value),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_ids_are_increasing() {
        let pending = PendingRequests::new("srv");
        let a = pending.register().await;
        let b = pending.register().await;
        assert!(b.id > a.id);
        assert_eq!(pending.len().await, 2);
    }

    #[tokio::test]
    async fn test_out_of_order_replies_reach_their_callers() {
        let pending = Arc::new(PendingRequests::new("srv"));
        let first = pending.register().await;
        let second = pending.register().await;
        let (first_id, second_id) = (first.id, second.id);

        let p = Arc::clone(&pending);
        let waiter_one =
            tokio::spawn(async move { p.wait(first, "a", Duration::from_secs(5)).await });
        let p = Arc::clone(&pending);
        let waiter_two =
            tokio::spawn(async move { p.wait(second, "b", Duration::from_secs(5)).await });

        assert!(pending.complete(reply(second_id, serde_json::json!("two"))).await);
        assert!(pending.complete(reply(first_id, serde_json::json!("one"))).await);

        assert_eq!(waiter_one.await.unwrap().unwrap(), "one");
        assert_eq!(waiter_two.await.unwrap().unwrap(), "two");
        assert_eq!(pending.len().await, 0);
    }

    #[tokio::test]
    async fn test_timeout_removes_entry_and_late_reply_is_discarded() {
        let pending = PendingRequests::new("srv");
        let slot = pending.register().await;
        let id = slot.id;

        let err = pending
            .wait(slot, "tools/call", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            McpError::Timeout { ref method, timeout_ms: 20 } if method == "tools/call"
        ));
        assert_eq!(err.to_string(), "request 'tools/call' timed out after 20ms");
        assert_eq!(pending.len().await, 0);

        assert!(!pending.complete(reply(id, Value::Null)).await);
    }

    #[tokio::test]
    async fn test_fail_all_rejects_every_caller_with_connection_error() {
        let pending = Arc::new(PendingRequests::new("srv"));
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let slot = pending.register().await;
            let p = Arc::clone(&pending);
            waiters.push(tokio::spawn(async move {
                p.wait(slot, "tools/call", Duration::from_secs(5)).await
            }));
        }

        assert_eq!(pending.fail_all("process exited unexpectedly").await, 3);
        for waiter in waiters {
            let err = waiter.await.unwrap().unwrap_err();
            assert!(matches!(err, McpError::Connection { .. }));
        }
        assert_eq!(pending.len().await, 0);
    }
}
