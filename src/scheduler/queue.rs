//! Coalescing work queue feeding the reconcile workers.
//!
//! The queue holds volume keys, never payloads. Any number of triggers for
//! the same key collapse into at most one queued entry plus one follow-up
//! pass if the key is being worked when the trigger lands. Dropping a
//! trigger is therefore always safe: the next pass observes the full live
//! state regardless of which event produced it.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use crate::domain::VolumeKey;
use crate::metrics::Metrics;

// ===== Queue State =====

#[derive(Default)]
struct QueueInner {
    /// Keys waiting for a worker, FIFO.
    ready: VecDeque<VolumeKey>,
    /// Mirror of `ready` for O(1) duplicate checks.
    queued: HashSet<VolumeKey>,
    /// Keys currently held by a worker.
    in_flight: HashSet<VolumeKey>,
    /// In-flight keys that were re-triggered and need one more pass.
    dirty: HashSet<VolumeKey>,
    closed: bool,
}

// ===== Work Queue =====

/// Bounded, deduplicating queue of volume keys.
pub struct WorkQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    metrics: Arc<Metrics>,
}

impl WorkQueue {
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            capacity,
            metrics,
        }
    }

    /// Record a trigger for `key`.
    ///
    /// A key already queued or in flight never gains a second entry; the
    /// trigger is absorbed (and an in-flight key is marked for one
    /// follow-up pass). At capacity the trigger is dropped outright.
    pub fn enqueue(&self, key: VolumeKey) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        if inner.in_flight.contains(&key) {
            inner.dirty.insert(key);
            self.metrics.queue_coalesced.inc();
            return;
        }
        if inner.queued.contains(&key) {
            self.metrics.queue_coalesced.inc();
            return;
        }
        if inner.ready.len() >= self.capacity {
            warn!(%key, capacity = self.capacity, "work queue full, dropping trigger");
            self.metrics.queue_dropped.inc();
            return;
        }
        inner.queued.insert(key.clone());
        inner.ready.push_back(key);
        self.metrics.queue_depth.set(inner.ready.len() as i64);
        drop(inner);
        self.notify.notify_one();
    }

    /// Take the next key, waiting until one is ready. Returns `None` once
    /// the queue has been closed and drained.
    pub async fn next(&self) -> Option<VolumeKey> {
        loop {
            // Register interest before checking state so a concurrent
            // enqueue cannot slip between the check and the await.
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(key) = inner.ready.pop_front() {
                    inner.queued.remove(&key);
                    inner.in_flight.insert(key.clone());
                    self.metrics.queue_depth.set(inner.ready.len() as i64);
                    if !inner.ready.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release a key after its pass finished. A dirty mark turns into an
    /// immediate re-enqueue so no trigger observed mid-pass is lost.
    pub fn done(&self, key: &VolumeKey) {
        let requeue = {
            let mut inner = self.inner.lock();
            inner.in_flight.remove(key);
            inner.dirty.remove(key)
        };
        if requeue {
            self.enqueue(key.clone());
        }
    }

    /// Stop accepting triggers and wake every waiting worker. Keys already
    /// queued are still handed out.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    pub fn depth(&self) -> usize {
        self.inner.lock().ready.len()
    }
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Registry;

    fn queue(capacity: usize) -> WorkQueue {
        let metrics = Arc::new(Metrics::new(&Registry::new()).unwrap());
        WorkQueue::new(capacity, metrics)
    }

    fn key(name: &str) -> VolumeKey {
        VolumeKey::new("openebs", name)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let q = queue(16);
        q.enqueue(key("a"));
        q.enqueue(key("b"));
        q.enqueue(key("c"));

        assert_eq!(q.next().await, Some(key("a")));
        assert_eq!(q.next().await, Some(key("b")));
        assert_eq!(q.next().await, Some(key("c")));
        assert_eq!(q.depth(), 0);
    }

    #[tokio::test]
    async fn test_queued_duplicates_collapse() {
        let q = queue(16);
        q.enqueue(key("vol"));
        q.enqueue(key("vol"));
        q.enqueue(key("vol"));

        assert_eq!(q.depth(), 1);
        assert_eq!(q.metrics.queue_coalesced.get(), 2);

        assert_eq!(q.next().await, Some(key("vol")));
        q.done(&key("vol"));
        // No dirty mark was set, so nothing comes back.
        assert_eq!(q.depth(), 0);
    }

    #[tokio::test]
    async fn test_in_flight_triggers_yield_one_followup() {
        let q = queue(16);
        q.enqueue(key("vol"));
        let k = q.next().await.unwrap();

        // Storms of triggers while the key is being worked.
        q.enqueue(key("vol"));
        q.enqueue(key("vol"));
        q.enqueue(key("vol"));
        assert_eq!(q.depth(), 0);

        q.done(&k);
        assert_eq!(q.depth(), 1);
        assert_eq!(q.next().await, Some(key("vol")));
        q.done(&key("vol"));
        assert_eq!(q.depth(), 0);
    }

    #[tokio::test]
    async fn test_overflow_drops_trigger() {
        let q = queue(2);
        q.enqueue(key("a"));
        q.enqueue(key("b"));
        q.enqueue(key("c"));

        assert_eq!(q.depth(), 2);
        assert_eq!(q.metrics.queue_dropped.get(), 1);
        assert_eq!(q.next().await, Some(key("a")));
        assert_eq!(q.next().await, Some(key("b")));
    }

    #[tokio::test]
    async fn test_close_unblocks_and_drains() {
        let q = Arc::new(queue(16));
        q.enqueue(key("a"));

        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move {
                let first = q.next().await;
                let second = q.next().await;
                (first, second)
            })
        };

        // Give the waiter a chance to consume "a" and block on the second.
        tokio::task::yield_now().await;
        q.close();
        q.enqueue(key("late"));

        let (first, second) = waiter.await.unwrap();
        assert_eq!(first, Some(key("a")));
        assert_eq!(second, None);
    }
}
