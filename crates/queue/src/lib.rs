//! Kubealert work queue: FIFO queue of resource-key events with dedup over
//! pending and in-flight items, per-item exponential requeue back-off and
//! bounded retry bookkeeping.
//!
//! The queue is the single mutable structure shared between the watch
//! callbacks (producers) and the controller workers (consumers); it alone
//! serializes access to per-key in-flight state.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kubealert_core::QueueItem;
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::debug;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

struct Inner {
    queue: VecDeque<QueueItem>,
    /// Items pending or being processed; membership makes `add` a no-op.
    dirty: FxHashSet<QueueItem>,
    processing: FxHashSet<QueueItem>,
    retries: FxHashMap<QueueItem, u32>,
    shut_down: bool,
}

/// Deduplicating, rate-limited work queue.
///
/// An item handed out by [`get`](WorkQueue::get) stays in the dedup set until
/// the matching [`done`](WorkQueue::done), so equal items can never be held by
/// two workers at once.
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::with_backoff(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }

    pub fn with_backoff(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: FxHashSet::default(),
                processing: FxHashSet::default(),
                retries: FxHashMap::default(),
                shut_down: false,
            }),
            notify: Notify::new(),
            base_delay,
            max_delay,
        }
    }

    /// Enqueue `item` unless an equal item is already pending or in flight,
    /// or the queue is shut down. Collapses event bursts for one key into a
    /// single processing pass.
    pub fn add(&self, item: QueueItem) {
        {
            let mut g = self.inner.lock().unwrap();
            if g.shut_down || g.dirty.contains(&item) {
                return;
            }
            g.dirty.insert(item.clone());
            g.queue.push_back(item);
        }
        counter!("queue_adds_total", 1);
        self.notify.notify_one();
    }

    /// Wait for the next item. `None` means the queue was shut down and the
    /// caller must stop pulling. The returned item is in flight until `done`.
    pub async fn get(&self) -> Option<QueueItem> {
        loop {
            let notified = self.notify.notified();
            {
                let mut g = self.inner.lock().unwrap();
                if g.shut_down {
                    return None;
                }
                if let Some(item) = g.queue.pop_front() {
                    g.processing.insert(item.clone());
                    // Leave a wakeup for the next waiter if more work remains.
                    if !g.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Mark `item` no longer in flight, re-enabling `add` for equal items.
    /// Idempotent; must be called exactly once per successful `get`.
    pub fn done(&self, item: &QueueItem) {
        let mut g = self.inner.lock().unwrap();
        if g.processing.remove(item) {
            g.dirty.remove(item);
        }
    }

    /// Reset the retry counter for `item`. Idempotent.
    pub fn forget(&self, item: &QueueItem) {
        let mut g = self.inner.lock().unwrap();
        g.retries.remove(item);
    }

    /// Number of consecutive failed attempts recorded for `item`.
    pub fn num_retries(&self, item: &QueueItem) -> u32 {
        let g = self.inner.lock().unwrap();
        g.retries.get(item).copied().unwrap_or(0)
    }

    /// Increment the retry counter and re-enqueue `item` after an exponential
    /// per-item back-off. The delay runs on a spawned task; the caller is
    /// never blocked. No re-add fires after shutdown.
    pub fn add_rate_limited(self: &Arc<Self>, item: QueueItem) {
        let delay = {
            let mut g = self.inner.lock().unwrap();
            if g.shut_down {
                return;
            }
            let n = g.retries.entry(item.clone()).or_insert(0);
            *n += 1;
            self.backoff(*n)
        };
        counter!("queue_retries_total", 1);
        debug!(key = %item.key, delay_ms = delay.as_millis() as u64, "requeue scheduled");
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Stop accepting work and unblock all pending `get` calls. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut g = self.inner.lock().unwrap();
            if g.shut_down {
                return;
            }
            g.shut_down = true;
        }
        debug!("work queue shut down");
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay)
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubealert_core::EventType;

    fn item(key: &str, et: EventType) -> QueueItem {
        QueueItem {
            key: key.to_string(),
            event_type: et,
            namespace: String::new(),
            resource_type: "Pod".to_string(),
        }
    }

    #[tokio::test]
    async fn dedup_collapses_equal_items() {
        let q = WorkQueue::new();
        q.add(item("ns/a", EventType::Create));
        q.add(item("ns/a", EventType::Create));
        assert_eq!(q.len(), 1);

        let got = q.get().await.unwrap();
        assert_eq!(got.key, "ns/a");
        // Still in flight: an equal add is a no-op until done.
        q.add(item("ns/a", EventType::Create));
        assert_eq!(q.len(), 0);

        q.done(&got);
        q.add(item("ns/a", EventType::Create));
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn distinct_event_types_are_distinct_items() {
        let q = WorkQueue::new();
        q.add(item("ns/a", EventType::Create));
        q.add(item("ns/a", EventType::Delete));
        assert_eq!(q.len(), 2);
    }

    #[tokio::test]
    async fn retry_counter_tracks_and_forgets() {
        let q = Arc::new(WorkQueue::new());
        let it = item("ns/a", EventType::Update);
        assert_eq!(q.num_retries(&it), 0);
        q.add_rate_limited(it.clone());
        q.add_rate_limited(it.clone());
        assert_eq!(q.num_retries(&it), 2);
        q.forget(&it);
        assert_eq!(q.num_retries(&it), 0);
        // Idempotent on an idle item.
        q.forget(&it);
        assert_eq!(q.num_retries(&it), 0);
    }

    #[tokio::test]
    async fn done_is_idempotent() {
        let q = WorkQueue::new();
        let it = item("ns/a", EventType::Create);
        q.add(it.clone());
        let got = q.get().await.unwrap();
        q.done(&got);
        q.done(&got);
        q.add(it);
        assert_eq!(q.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_add_becomes_visible_after_delay() {
        let q = Arc::new(WorkQueue::with_backoff(
            Duration::from_millis(100),
            Duration::from_secs(10),
        ));
        let it = item("ns/a", EventType::Update);
        q.add_rate_limited(it.clone());
        assert_eq!(q.len(), 0);

        // Not yet visible before the back-off elapses.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(q.len(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let got = q.get().await.unwrap();
        assert_eq!(got, it);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_per_item() {
        let q = Arc::new(WorkQueue::with_backoff(
            Duration::from_millis(10),
            Duration::from_secs(10),
        ));
        let it = item("ns/a", EventType::Update);
        // Second failure: delay should be 20ms, not 10ms.
        q.add_rate_limited(it.clone());
        tokio::time::sleep(Duration::from_millis(15)).await;
        let got = q.get().await.unwrap();
        q.done(&got);
        q.add_rate_limited(it.clone());
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(q.len(), 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_unblocks_getters() {
        let q = Arc::new(WorkQueue::new());
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shutdown();
        assert!(waiter.await.unwrap().is_none());
        // Idempotent, and adds after shutdown are dropped.
        q.shutdown();
        q.add(item("ns/a", EventType::Create));
        assert!(q.get().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn no_requeue_after_shutdown() {
        let q = Arc::new(WorkQueue::with_backoff(
            Duration::from_millis(10),
            Duration::from_secs(10),
        ));
        q.shutdown();
        q.add_rate_limited(item("ns/a", EventType::Update));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(q.len(), 0);
    }
}
