//! Work queue decoupling watch notification arrival from handler dispatch.
//!
//! FIFO with dedup-by-key (a duplicate push keeps its queue position and the
//! latest payload wins), delayed re-insertion with per-item exponential
//! backoff, and an explicit forget/done lifecycle so callers can reset or
//! inspect an item's retry count.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::debug;

/// An item that can be queued. The key identifies the logical unit of work:
/// two items with the same key coalesce into one queue slot.
pub trait WorkItem: Clone + Send + 'static {
    type Key: Eq + Hash + Clone + Send + Sync + 'static;

    fn work_key(&self) -> Self::Key;
}

/// Per-item exponential backoff for rate-limited re-insertion.
///
/// Delay for the n-th failure is `base_delay * 2^(n-1)`, capped at
/// `max_delay`. Defaults follow the upstream controller rate limiter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(32);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay)
    }
}

struct Inner<T: WorkItem> {
    order: VecDeque<T::Key>,
    items: FxHashMap<T::Key, T>,
    /// Keys currently held by a worker between `next` and `done`.
    processing: FxHashSet<T::Key>,
    /// Re-adds that arrived while their key was processing; flushed on `done`.
    pending: FxHashMap<T::Key, T>,
    failures: FxHashMap<T::Key, u32>,
    shutting_down: bool,
}

pub struct WorkQueue<T: WorkItem> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    retry: RetryPolicy,
}

impl<T: WorkItem> WorkQueue<T> {
    pub fn new(retry: RetryPolicy) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                order: VecDeque::new(),
                items: FxHashMap::default(),
                processing: FxHashSet::default(),
                pending: FxHashMap::default(),
                failures: FxHashMap::default(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            retry,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push an item. A no-op once the queue is shutting down. If the item's
    /// key is already queued the stored payload is replaced in place; if it
    /// is currently being processed the push is parked and re-queued when the
    /// worker calls `done`.
    pub fn add(&self, item: T) {
        let key = item.work_key();
        {
            let mut inner = self.lock();
            if inner.shutting_down {
                return;
            }

            if inner.processing.contains(&key) {
                inner.pending.insert(key, item);
                return;
            }

            if inner.items.insert(key.clone(), item).is_none() {
                inner.order.push_back(key);
            }
        }
        self.notify.notify_one();
    }

    /// Re-add after the backoff delay computed from this item's failure
    /// count. Increments the failure count immediately.
    pub fn add_rate_limited(self: Arc<Self>, item: T) {
        let delay = {
            let mut inner = self.lock();
            if inner.shutting_down {
                return;
            }
            let failures = inner.failures.entry(item.work_key()).or_insert(0);
            *failures += 1;
            self.retry.delay_for(*failures)
        };

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            self.add(item);
        });
    }

    /// Number of rate-limited re-adds recorded for this key.
    pub fn num_requeues(&self, key: &T::Key) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Drop the retry bookkeeping for a key (does not remove queued items).
    pub fn forget(&self, key: &T::Key) {
        self.lock().failures.remove(key);
    }

    /// Mark a popped item finished, releasing its key. A push that was parked
    /// while the key was processing is queued now.
    pub fn done(&self, key: &T::Key) {
        let parked = {
            let mut inner = self.lock();
            inner.processing.remove(key);
            inner.pending.remove(key)
        };
        if let Some(item) = parked {
            self.add(item);
        }
    }

    /// Pop the next item in FIFO order, waiting while the queue is empty.
    /// Returns `None` once the queue is shutting down and drained.
    pub async fn next(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(key) = inner.order.pop_front() {
                    if let Some(item) = inner.items.remove(&key) {
                        inner.processing.insert(key);
                        return Some(item);
                    }
                    continue;
                }
                if inner.shutting_down {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting pushes. Queued items remain poppable until drained.
    pub fn shut_down(&self) {
        {
            let mut inner = self.lock();
            inner.shutting_down = true;
        }
        debug!("work queue shutting down");
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Job {
        id: &'static str,
        payload: u32,
    }

    impl WorkItem for Job {
        type Key = &'static str;

        fn work_key(&self) -> Self::Key {
            self.id
        }
    }

    fn job(id: &'static str, payload: u32) -> Job {
        Job { id, payload }
    }

    #[tokio::test]
    async fn pops_in_fifo_order() {
        let q = WorkQueue::new(RetryPolicy::default());
        q.add(job("a", 1));
        q.add(job("b", 2));
        q.add(job("c", 3));

        assert_eq!(q.next().await.map(|j| j.id), Some("a"));
        assert_eq!(q.next().await.map(|j| j.id), Some("b"));
        assert_eq!(q.next().await.map(|j| j.id), Some("c"));
    }

    #[tokio::test]
    async fn duplicate_add_keeps_position_and_latest_payload() {
        let q = WorkQueue::new(RetryPolicy::default());
        q.add(job("a", 1));
        q.add(job("b", 2));
        q.add(job("a", 9));

        assert_eq!(q.len(), 2);
        let first = q.next().await.unwrap();
        assert_eq!(first.id, "a");
        assert_eq!(first.payload, 9);
    }

    #[tokio::test]
    async fn add_while_processing_is_parked_until_done() {
        let q = WorkQueue::new(RetryPolicy::default());
        q.add(job("a", 1));
        let held = q.next().await.unwrap();

        q.add(job("a", 2));
        assert_eq!(q.len(), 0, "parked item must not be poppable yet");

        q.done(&held.work_key());
        let readded = q.next().await.unwrap();
        assert_eq!(readded.payload, 2);
    }

    #[tokio::test]
    async fn forget_resets_requeue_count() {
        let q = WorkQueue::new(RetryPolicy::default());
        q.clone().add_rate_limited(job("a", 1));
        q.clone().add_rate_limited(job("a", 1));
        assert_eq!(q.num_requeues(&"a"), 2);

        q.forget(&"a");
        assert_eq!(q.num_requeues(&"a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_add_arrives_after_backoff() {
        let q = WorkQueue::new(RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        });

        q.clone().add_rate_limited(job("a", 1));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(q.len(), 0, "item must not surface before its delay");

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(q.next().await.map(|j| j.id), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_exponentially() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(40));
        assert_eq!(policy.delay_for(20), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn shutdown_drains_then_returns_none() {
        let q = WorkQueue::new(RetryPolicy::default());
        q.add(job("a", 1));
        q.shut_down();

        q.add(job("b", 2));
        assert_eq!(q.len(), 1, "pushes after shutdown are dropped");

        assert_eq!(q.next().await.map(|j| j.id), Some("a"));
        assert!(q.next().await.is_none());
    }
}
