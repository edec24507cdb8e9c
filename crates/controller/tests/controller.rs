#![forbid(unsafe_code)]

//! End-to-end controller runs against a scripted cache: alert delivery,
//! transient-failure retries, give-up after the retry budget, and panic
//! containment at the worker boundary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kubealert_controller::{AlertSink, Controller, ControllerConfig, ControllerError};
use kubealert_core::{Alert, AlertReason, AlertStatus, EventType, QueueItem, ResourceKind, WatchedObject};
use kubealert_queue::WorkQueue;
use kubealert_watch::{CacheError, ClusterCache};
use tokio::sync::watch;

const START: i64 = 1_577_836_800; // 2020-01-01T00:00:00Z

struct FakeCache {
    objects: Mutex<HashMap<String, WatchedObject>>,
    fail_next: AtomicU32,
    lookups: AtomicU32,
    synced: bool,
}

impl FakeCache {
    fn new(synced: bool) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            fail_next: AtomicU32::new(0),
            lookups: AtomicU32::new(0),
            synced,
        }
    }

    fn insert(&self, key: &str, name: &str, ns: &str, ts: &str) {
        let raw = serde_json::json!({
            "metadata": { "name": name, "namespace": ns, "creationTimestamp": ts }
        });
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), WatchedObject::from_raw(ResourceKind::Pod, &raw));
    }
}

#[async_trait::async_trait]
impl ClusterCache for FakeCache {
    async fn sync(&self, _stop: watch::Receiver<bool>, _timeout: Duration) -> bool {
        self.synced
    }

    fn has_synced(&self) -> bool {
        self.synced
    }

    fn lookup(&self, key: &str) -> Result<Option<WatchedObject>, CacheError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(CacheError::Backend("injected lookup failure".to_string()));
        }
        Ok(self.objects.lock().unwrap().get(key).cloned())
    }
}

#[derive(Default)]
struct RecordingSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingSink {
    fn count(&self) -> usize {
        self.alerts.lock().unwrap().len()
    }
}

impl AlertSink for RecordingSink {
    fn handle(&self, alert: Alert) {
        self.alerts.lock().unwrap().push(alert);
    }
}

struct PanicOnceSink {
    panicked: AtomicU32,
    inner: Arc<RecordingSink>,
}

impl AlertSink for PanicOnceSink {
    fn handle(&self, alert: Alert) {
        if self.panicked.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("sink exploded");
        }
        self.inner.handle(alert);
    }
}

fn item(key: &str, et: EventType) -> QueueItem {
    QueueItem {
        key: key.to_string(),
        event_type: et,
        namespace: String::new(),
        resource_type: "Pod".to_string(),
    }
}

fn fast_queue() -> Arc<WorkQueue> {
    Arc::new(WorkQueue::with_backoff(Duration::from_millis(1), Duration::from_millis(20)))
}

async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn spawn_controller<S: AlertSink + 'static>(
    cache: Arc<FakeCache>,
    queue: Arc<WorkQueue>,
    sink: Arc<S>,
    cfg: ControllerConfig,
) -> (watch::Sender<bool>, tokio::task::JoinHandle<Result<(), ControllerError>>) {
    let (stop_tx, stop_rx) = watch::channel(false);
    let controller = Arc::new(Controller::new(cache, queue, sink, cfg));
    let handle = tokio::spawn(controller.run(stop_rx));
    (stop_tx, handle)
}

fn cfg() -> ControllerConfig {
    ControllerConfig { max_retries: 5, workers: 2, sync_timeout: Duration::from_secs(1), server_start_ts: START }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_failure_is_fatal() {
    let cache = Arc::new(FakeCache::new(false));
    let queue = fast_queue();
    let sink = Arc::new(RecordingSink::default());
    let (_stop_tx, handle) = spawn_controller(cache, Arc::clone(&queue), sink, cfg());

    let res = handle.await.unwrap();
    assert!(matches!(res, Err(ControllerError::SyncFailed)));
    // Queue was shut down; no worker was started.
    assert!(queue.get().await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_create_and_delete_are_alerted_replay_is_not() {
    let cache = Arc::new(FakeCache::new(true));
    cache.insert("ns/live", "live", "ns", "2020-01-01T01:00:00Z");
    cache.insert("ns/old", "old", "ns", "2019-06-01T00:00:00Z");
    let queue = fast_queue();
    let sink = Arc::new(RecordingSink::default());
    let (stop_tx, handle) =
        spawn_controller(Arc::clone(&cache), Arc::clone(&queue), Arc::clone(&sink), cfg());

    queue.add(item("ns/live", EventType::Create));
    queue.add(item("ns/old", EventType::Create));
    // Deleted object is absent from the cache; still alerted from the key.
    queue.add(item("ns/gone", EventType::Delete));

    wait_for(|| sink.count() == 2, "two alerts").await;
    let alerts = sink.alerts.lock().unwrap().clone();
    let created = alerts.iter().find(|a| a.reason == AlertReason::Created).unwrap();
    assert_eq!(created.name, "live");
    assert_eq!(created.namespace, "ns");
    assert_eq!(created.status, AlertStatus::Normal);
    let deleted = alerts.iter().find(|a| a.reason == AlertReason::Deleted).unwrap();
    assert_eq!(deleted.name, "gone");
    assert_eq!(deleted.status, AlertStatus::Danger);

    stop_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_failures_are_retried_then_succeed() {
    let cache = Arc::new(FakeCache::new(true));
    cache.insert("ns/flaky", "flaky", "ns", "2020-01-01T01:00:00Z");
    cache.fail_next.store(2, Ordering::SeqCst);
    let queue = fast_queue();
    let sink = Arc::new(RecordingSink::default());
    let (stop_tx, handle) =
        spawn_controller(Arc::clone(&cache), Arc::clone(&queue), Arc::clone(&sink), cfg());

    let it = item("ns/flaky", EventType::Create);
    queue.add(it.clone());

    wait_for(|| sink.count() == 1, "alert after retries").await;
    assert_eq!(cache.lookups.load(Ordering::SeqCst), 3);
    // Success resets the retry counter (forget runs right after the sink).
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.num_retries(&it), 0);

    stop_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retry_budget_exhaustion_drops_the_item() {
    let cache = Arc::new(FakeCache::new(true));
    cache.fail_next.store(u32::MAX, Ordering::SeqCst);
    let queue = fast_queue();
    let sink = Arc::new(RecordingSink::default());
    let mut config = cfg();
    config.max_retries = 2;
    let (stop_tx, handle) =
        spawn_controller(Arc::clone(&cache), Arc::clone(&queue), Arc::clone(&sink), config);

    let it = item("ns/doomed", EventType::Update);
    queue.add(it.clone());

    // Initial attempt plus max_retries requeues, then the item is dropped.
    wait_for(|| cache.lookups.load(Ordering::SeqCst) == 3 && queue.is_empty(), "give-up").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cache.lookups.load(Ordering::SeqCst), 3);
    assert_eq!(sink.count(), 0);
    // Counter was forgotten and a manual re-add is accepted again: the
    // workers pick it up and a fresh attempt hits the cache.
    assert_eq!(queue.num_retries(&it), 0);
    queue.add(it);
    wait_for(|| cache.lookups.load(Ordering::SeqCst) > 3, "re-added item processed").await;

    stop_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panic_during_processing_does_not_kill_the_worker() {
    let cache = Arc::new(FakeCache::new(true));
    cache.insert("ns/boom", "boom", "ns", "2020-01-01T01:00:00Z");
    cache.insert("ns/calm", "calm", "ns", "2020-01-01T01:00:00Z");
    let queue = fast_queue();
    let recording = Arc::new(RecordingSink::default());
    let sink = Arc::new(PanicOnceSink { panicked: AtomicU32::new(0), inner: Arc::clone(&recording) });
    let mut config = cfg();
    config.workers = 1;
    let (stop_tx, handle) =
        spawn_controller(Arc::clone(&cache), Arc::clone(&queue), sink, config);

    queue.add(item("ns/boom", EventType::Create));
    wait_for(|| recording.count() == 1, "retried alert after panic").await;

    // The single worker survived and keeps processing new items.
    queue.add(item("ns/calm", EventType::Create));
    wait_for(|| recording.count() == 2, "second alert").await;

    stop_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}
