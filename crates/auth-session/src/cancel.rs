//! Cancellation of in-flight requests.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Tracks in-flight requests by id so callers can abandon them.
///
/// Cancelling only abandons the client-side wait; a request already on the
/// wire may still reach the server.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    inflight: Mutex<HashMap<Uuid, oneshot::Sender<()>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new request. The returned receiver fires when the request
    /// is cancelled.
    ///
    /// Ids must be unique while in flight. A colliding registration cancels
    /// the earlier request rather than orphaning its wait.
    pub fn register(&self, id: Uuid) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let previous = self
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, tx);
        if let Some(prev) = previous {
            warn!(request_id = %id, "request id re-registered while in flight, cancelling prior");
            let _ = prev.send(());
        }
        rx
    }

    /// Drop tracking for a request that finished normally.
    pub fn complete(&self, id: &Uuid) {
        self.inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id);
    }

    /// Cancel a single request. Returns false if the id is unknown (already
    /// finished or never registered).
    pub fn cancel(&self, id: &Uuid) -> bool {
        let sender = self
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id);
        match sender {
            Some(tx) => {
                debug!(request_id = %id, "cancelling request");
                // Receiver may already be gone if the request just completed
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    /// Cancel everything currently in flight. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<(Uuid, oneshot::Sender<()>)> = self
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain()
            .collect();
        let count = drained.len();
        for (id, tx) in drained {
            debug!(request_id = %id, "cancelling request");
            let _ = tx.send(());
        }
        count
    }

    /// Number of requests currently tracked.
    pub fn len(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
