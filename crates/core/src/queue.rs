//! Per-user FIFO job queues.
//!
//! [`UserQueueManager`] owns one queue per user. Only the head of a
//! queue is ever processed, and only by the single worker task started
//! when the queue went from empty to non-empty. Different users' queues
//! are independent.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::job::{JobRecord, JobSpec};
use crate::types::{MessageRef, UserId};

/// Result of [`UserQueueManager::enqueue`].
#[derive(Debug)]
pub struct Enqueued {
    /// One record per batch item, in queue order.
    pub records: Vec<Arc<JobRecord>>,
    /// Queue length after the append.
    pub queue_len: usize,
    /// `true` when the queue was empty before this call. The caller must
    /// then start exactly one worker for the user.
    pub start_worker: bool,
}

/// Owns every user's queue. Designed to be wrapped in `Arc` and shared
/// between command handlers and queue workers.
#[derive(Debug, Default)]
pub struct UserQueueManager {
    queues: RwLock<HashMap<UserId, VecDeque<Arc<JobRecord>>>>,
    next_id: AtomicU64,
}

impl UserQueueManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `spec.batch_size` independent records to the user's queue.
    ///
    /// Each record gets its own copy of the spec, so unfixed seeds are
    /// resolved per record at submission time.
    pub async fn enqueue(&self, user_id: UserId, spec: JobSpec, origin: MessageRef) -> Enqueued {
        let spec = JobSpec { user_id, ..spec };
        let count = spec.batch_size.max(1) as usize;
        let records: Vec<Arc<JobRecord>> = (0..count)
            .map(|_| {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                Arc::new(JobRecord::new(id, spec.clone(), origin))
            })
            .collect();

        let mut queues = self.queues.write().await;
        let queue = queues.entry(user_id).or_default();
        let start_worker = queue.is_empty();
        queue.extend(records.iter().cloned());
        let queue_len = queue.len();
        drop(queues);

        tracing::info!(user_id, added = count, queue_len, start_worker, "Jobs enqueued");

        Enqueued {
            records,
            queue_len,
            start_worker,
        }
    }

    /// Mark the head record cancelled. Returns `false` if there is nothing
    /// to cancel.
    pub async fn cancel_current(&self, user_id: UserId) -> bool {
        let queues = self.queues.read().await;
        match queues.get(&user_id).and_then(|q| q.front()) {
            Some(head) => {
                head.cancel();
                tracing::info!(user_id, job_id = head.id(), "Cancelled current generation");
                true
            }
            None => false,
        }
    }

    /// Mark the head cancelled and drop every pending record behind it.
    ///
    /// The head stays in the queue until its worker observes the
    /// cancellation and calls [`advance`](Self::advance).
    pub async fn cancel_all(&self, user_id: UserId) -> bool {
        let mut queues = self.queues.write().await;
        let Some(queue) = queues.get_mut(&user_id) else {
            return false;
        };
        let Some(head) = queue.front() else {
            return false;
        };
        head.cancel();
        let dropped = queue.len() - 1;
        queue.truncate(1);
        tracing::info!(user_id, dropped, "Cancelled all generations");
        true
    }

    /// Snapshot of the user's queue, head first.
    pub async fn status(&self, user_id: UserId) -> Vec<Arc<JobRecord>> {
        self.queues
            .read()
            .await
            .get(&user_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a queue (possibly empty) exists for this user.
    pub async fn has_queue(&self, user_id: UserId) -> bool {
        self.queues.read().await.contains_key(&user_id)
    }

    /// The record the worker should process next.
    pub async fn head(&self, user_id: UserId) -> Option<Arc<JobRecord>> {
        self.queues
            .read()
            .await
            .get(&user_id)
            .and_then(|q| q.front().cloned())
    }

    /// Remove the finished head record and return the new head.
    ///
    /// Removal and the emptiness check happen under one lock, so a
    /// worker that receives `None` may exit knowing the next
    /// [`enqueue`](Self::enqueue) will report `start_worker`.
    pub async fn advance(&self, user_id: UserId) -> Option<Arc<JobRecord>> {
        let mut queues = self.queues.write().await;
        let queue = queues.get_mut(&user_id)?;
        if let Some(done) = queue.pop_front() {
            tracing::debug!(user_id, job_id = done.id(), remaining = queue.len(), "Job removed from queue");
        }
        queue.front().cloned()
    }
}
