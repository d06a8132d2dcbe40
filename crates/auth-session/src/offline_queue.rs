//! FIFO queue of requests deferred while offline.
//!
//! Mutating requests issued without connectivity are parked here instead of
//! failing. When the connectivity monitor reports online the queue replays
//! them in arrival order, one at a time, and each caller receives its result
//! through the oneshot it was handed at enqueue time.

use crate::error::{AuthError, AuthResult};
use chrono::{DateTime, Utc};
use connectivity_monitor::NetworkMonitor;
use futures_util::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default cap on deferred requests.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// A deferred request. The closure captures everything needed to replay it,
/// including the responder that delivers the outcome to the original caller.
pub struct QueuedJob {
    pub id: Uuid,
    pub queued_at: DateTime<Utc>,
    job: Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>,
}

impl QueuedJob {
    pub fn new<F>(id: Uuid, job: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        Self {
            id,
            queued_at: Utc::now(),
            job: Box::new(job),
        }
    }
}

impl std::fmt::Debug for QueuedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedJob")
            .field("id", &self.id)
            .field("queued_at", &self.queued_at)
            .finish()
    }
}

/// In-memory FIFO of deferred requests.
pub struct OfflineQueue {
    jobs: Mutex<VecDeque<QueuedJob>>,
    /// Held for the duration of a replay pass so overlapping online events
    /// cannot start a second drain.
    drain_guard: Mutex<()>,
    capacity: usize,
}

impl OfflineQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(VecDeque::new()),
            drain_guard: Mutex::new(()),
            capacity,
        })
    }

    /// Park a request for later replay.
    pub async fn enqueue(&self, job: QueuedJob) -> AuthResult<()> {
        let mut jobs = self.jobs.lock().await;
        if jobs.len() >= self.capacity {
            warn!(capacity = self.capacity, "offline queue full, rejecting request");
            return Err(AuthError::QueueFull);
        }
        debug!(request_id = %job.id, depth = jobs.len() + 1, "request deferred");
        jobs.push_back(job);
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }

    /// Drop all pending jobs without replaying them. Dropping a job drops its
    /// captured responder, so waiting callers observe [`AuthError::QueueClosed`].
    pub async fn clear(&self) -> usize {
        let mut jobs = self.jobs.lock().await;
        let dropped = jobs.len();
        if dropped > 0 {
            info!(dropped, "discarding deferred requests");
        }
        jobs.clear();
        dropped
    }

    /// Replay everything queued, strictly in arrival order. Jobs enqueued
    /// while a drain is running are picked up by the same pass. Returns the
    /// number of jobs replayed; 0 if another drain already holds the guard.
    pub async fn drain(&self) -> usize {
        let Ok(_guard) = self.drain_guard.try_lock() else {
            debug!("drain already in progress");
            return 0;
        };

        let mut replayed = 0;
        loop {
            let next = self.jobs.lock().await.pop_front();
            let Some(queued) = next else { break };

            debug!(request_id = %queued.id, "replaying deferred request");
            (queued.job)().await;
            replayed += 1;
        }

        if replayed > 0 {
            info!(replayed, "offline queue drained");
        }
        replayed
    }

    /// Spawn a worker that drains the queue every time connectivity comes
    /// back. The worker exits when the monitor is dropped.
    pub fn start(self: &Arc<Self>, monitor: &dyn NetworkMonitor) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        let mut rx = monitor.subscribe();

        tokio::spawn(async move {
            loop {
                if *rx.borrow_and_update() {
                    queue.drain().await;
                }
                if rx.changed().await.is_err() {
                    debug!("connectivity monitor dropped, replay worker stopping");
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connectivity_monitor::ConnectivityMonitor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    fn job_recording(id: Uuid, order: Arc<Mutex<Vec<Uuid>>>) -> QueuedJob {
        QueuedJob::new(id, move || {
            Box::pin(async move {
                order.lock().await.push(id);
            })
        })
    }

    #[tokio::test]
    async fn drain_replays_in_fifo_order() {
        let queue = OfflineQueue::new(DEFAULT_QUEUE_CAPACITY);
        let order = Arc::new(Mutex::new(Vec::new()));

        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            queue.enqueue(job_recording(*id, order.clone())).await.unwrap();
        }

        assert_eq!(queue.drain().await, 3);
        assert_eq!(*order.lock().await, ids);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn enqueue_rejects_when_full() {
        let queue = OfflineQueue::new(1);
        queue
            .enqueue(QueuedJob::new(Uuid::new_v4(), || Box::pin(async {})))
            .await
            .unwrap();

        let result = queue
            .enqueue(QueuedJob::new(Uuid::new_v4(), || Box::pin(async {})))
            .await;
        assert!(matches!(result, Err(AuthError::QueueFull)));
    }

    #[tokio::test]
    async fn clear_drops_responders() {
        let queue = OfflineQueue::new(DEFAULT_QUEUE_CAPACITY);
        let (tx, rx) = oneshot::channel::<AuthResult<()>>();

        queue
            .enqueue(QueuedJob::new(Uuid::new_v4(), move || {
                Box::pin(async move {
                    let _ = tx.send(Ok(()));
                })
            }))
            .await
            .unwrap();

        assert_eq!(queue.clear().await, 1);
        // Job never ran, so the sender was dropped
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn online_transition_triggers_drain() {
        let queue = OfflineQueue::new(DEFAULT_QUEUE_CAPACITY);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();

        queue
            .enqueue(QueuedJob::new(Uuid::new_v4(), move || {
                Box::pin(async move {
                    ran2.fetch_add(1, Ordering::SeqCst);
                })
            }))
            .await
            .unwrap();

        let monitor = ConnectivityMonitor::new(false);
        let worker = queue.start(monitor.as_ref());

        monitor.set_online(true);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty().await);
        worker.abort();
    }
}
