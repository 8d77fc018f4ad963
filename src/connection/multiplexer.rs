//! Request Multiplexer
//!
//! Single responsibility: Correlate responses with the calls that are waiting for them.
//!
//! Each session owns one `Multiplexer`. A call registers a pending entry under a
//! fresh correlation id, the receive loop settles it when the matching `result`
//! or `error` frame arrives, and the caller's deadline removes it otherwise.
//! An entry is settled by exactly one of those paths.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, trace};

use crate::error::ClientError;

/// What a waiting caller eventually receives.
pub type CallOutcome = Result<Value, ClientError>;

/// Generates correlation ids of the form `<counter>-<unix millis>`.
///
/// The counter makes ids unique within a session; the timestamp keeps ids from
/// different sessions visually distinct in logs.
#[derive(Debug, Default)]
pub struct IdGenerator {
    counter: AtomicU64,
}

impl IdGenerator {
    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}", n, chrono::Utc::now().timestamp_millis())
    }
}

#[derive(Debug, Default)]
pub struct Multiplexer {
    ids: IdGenerator,
    pending: Mutex<HashMap<String, oneshot::Sender<CallOutcome>>>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh correlation id that is not registered.
    pub fn next_id(&self) -> String {
        self.ids.next_id()
    }

    /// Register a pending request and return its id and completion channel.
    pub async fn register(&self) -> (String, oneshot::Receiver<CallOutcome>) {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);
        (id, rx)
    }

    /// Remove a pending request without settling it.
    ///
    /// Returns false if the entry was already gone (settled or rejected).
    pub async fn forget(&self, id: &str) -> bool {
        self.pending.lock().await.remove(id).is_some()
    }

    /// Deliver an outcome to the caller waiting on `id`.
    ///
    /// Returns false when no such request is pending; the outcome is dropped.
    pub async fn settle(&self, id: &str, outcome: CallOutcome) -> bool {
        let sender = self.pending.lock().await.remove(id);
        match sender {
            Some(tx) => {
                // The caller may have given up between removal and send; nothing to do then.
                let _ = tx.send(outcome);
                true
            }
            None => {
                debug!(id = %id, "Dropping response for unknown request");
                false
            }
        }
    }

    /// Reject every pending request. Returns how many were rejected.
    pub async fn reject_all<F>(&self, make_error: F) -> usize
    where
        F: Fn() -> ClientError,
    {
        let mut pending = self.pending.lock().await;
        let count = pending.len();
        for (id, tx) in pending.drain() {
            trace!(id = %id, "Rejecting pending request");
            let _ = tx.send(Err(make_error()));
        }
        count
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn is_pending(&self, id: &str) -> bool {
        self.pending.lock().await.contains_key(id)
    }

    /// Wait for the outcome of a registered request, bounded by `timeout`.
    ///
    /// On expiry the entry is removed and the caller gets `RequestTimeout`,
    /// unless a response settled it first, in which case that response wins.
    pub async fn wait(
        &self,
        id: &str,
        mut rx: oneshot::Receiver<CallOutcome>,
        method: &str,
        timeout: Duration,
    ) -> CallOutcome {
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without a value: the session went away
            Ok(Err(_)) => Err(ClientError::NotConnected),
            Err(_) => {
                if self.forget(id).await {
                    debug!(id = %id, method = %method, "Request timed out");
                    Err(ClientError::RequestTimeout {
                        method: method.to_string(),
                        timeout,
                    })
                } else {
                    // Settled at the deadline; take what was sent
                    rx.await.unwrap_or(Err(ClientError::NotConnected))
                }
            }
        }
    }
}
