//! Kubealert watch layer: a watch-synchronized local mirror of cluster
//! objects, keyed by `namespace/name`, plus the kube list/watch producer
//! feeding it. The cache is read-only for consumers; only the ingest loop
//! mutates it.

#![forbid(unsafe_code)]

use std::sync::{Arc, RwLock};
use std::time::Duration;

use kubealert_core::{EventType, QueueItem, ResourceKind, WatchedObject};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

mod source;
pub use source::start_watcher;

/// One observed change, shaped for the cache.
#[derive(Debug, Clone)]
pub struct Observed {
    pub key: String,
    pub resource_type: String,
    pub obj: WatchedObject,
}

/// Change notifications delivered by a watch source. `Restarted` carries the
/// complete relisted state and marks the cache synced.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Applied(Observed),
    Deleted(Observed),
    Restarted(Vec<Observed>),
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Hard backend failure, as opposed to "key not found" which is expected.
    #[error("cache backend: {0}")]
    Backend(String),
}

/// Cache contract consumed by the controller. For `lookup`, `Ok(None)` means
/// the object is gone from the mirror (expected for deletions); `Err` is a
/// hard failure subject to the retry policy.
#[async_trait::async_trait]
pub trait ClusterCache: Send + Sync {
    /// Block until the initial list is reflected, the stop signal fires, or
    /// `timeout` elapses. Returns false on abort or timeout.
    async fn sync(&self, stop: watch::Receiver<bool>, timeout: Duration) -> bool;

    fn has_synced(&self) -> bool;

    fn lookup(&self, key: &str) -> Result<Option<WatchedObject>, CacheError>;
}

/// Watch-synchronized mirror of cluster objects for a single resource kind.
pub struct ResourceCache {
    kind: ResourceKind,
    store: RwLock<FxHashMap<String, WatchedObject>>,
    synced_tx: watch::Sender<bool>,
    synced_rx: watch::Receiver<bool>,
}

impl ResourceCache {
    pub fn new(kind: ResourceKind) -> Self {
        let (synced_tx, synced_rx) = watch::channel(false);
        Self { kind, store: RwLock::new(FxHashMap::default()), synced_tx, synced_rx }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Non-blocking check whether the initial list has been reflected.
    pub fn has_synced(&self) -> bool {
        *self.synced_rx.borrow()
    }

    pub fn len(&self) -> usize {
        self.store.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until the initial list is reflected, the stop signal fires, or
    /// `timeout` elapses. Returns false on abort or timeout.
    pub async fn sync(&self, mut stop: watch::Receiver<bool>, timeout: Duration) -> bool {
        let mut synced = self.synced_rx.clone();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            if *synced.borrow() {
                return true;
            }
            tokio::select! {
                changed = synced.changed() => {
                    if changed.is_err() {
                        return *synced.borrow();
                    }
                }
                res = stop.changed() => {
                    if res.is_err() || *stop.borrow() {
                        return false;
                    }
                }
                _ = &mut deadline => {
                    return false;
                }
            }
        }
    }

    /// Apply one watch event to the mirror and notify `enqueue` with the work
    /// item it implies. Must stay fast and non-blocking: it computes a key and
    /// hands it off, nothing more.
    pub fn apply<H>(&self, ev: WatchEvent, enqueue: &H)
    where
        H: Fn(QueueItem),
    {
        match ev {
            WatchEvent::Applied(o) => {
                let event_type = {
                    let mut store = self.store.write().unwrap();
                    let existed = store.insert(o.key.clone(), o.obj.clone()).is_some();
                    if existed { EventType::Update } else { EventType::Create }
                };
                counter!("cache_applied_total", 1);
                enqueue(self.item_for(o, event_type));
            }
            WatchEvent::Deleted(o) => {
                self.store.write().unwrap().remove(&o.key);
                counter!("cache_deleted_total", 1);
                enqueue(self.item_for(o, EventType::Delete));
            }
            WatchEvent::Restarted(list) => {
                debug!(count = list.len(), kind = %self.kind, "watch (re)list");
                {
                    let mut store = self.store.write().unwrap();
                    store.clear();
                    for o in &list {
                        store.insert(o.key.clone(), o.obj.clone());
                    }
                }
                // Replay as creates; classification suppresses anything older
                // than the server start.
                for o in list {
                    enqueue(self.item_for(o, EventType::Create));
                }
                if !*self.synced_rx.borrow() {
                    info!(kind = %self.kind, "cache synced");
                    let _ = self.synced_tx.send(true);
                }
            }
        }
    }

    fn item_for(&self, o: Observed, event_type: EventType) -> QueueItem {
        let namespace = o.obj.meta().namespace.unwrap_or_default();
        QueueItem { key: o.key, event_type, namespace, resource_type: o.resource_type }
    }
}

#[async_trait::async_trait]
impl ClusterCache for ResourceCache {
    async fn sync(&self, stop: watch::Receiver<bool>, timeout: Duration) -> bool {
        ResourceCache::sync(self, stop, timeout).await
    }

    fn has_synced(&self) -> bool {
        ResourceCache::has_synced(self)
    }

    fn lookup(&self, key: &str) -> Result<Option<WatchedObject>, CacheError> {
        Ok(self.store.read().unwrap().get(key).cloned())
    }
}

/// Run the ingest loop: consume watch events and apply them to the cache,
/// invoking `enqueue` for every implied work item. Stops when the event
/// channel closes.
pub fn spawn_ingest<H>(
    cache: Arc<ResourceCache>,
    mut rx: mpsc::Receiver<WatchEvent>,
    enqueue: H,
) -> tokio::task::JoinHandle<()>
where
    H: Fn(QueueItem) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            cache.apply(ev, &enqueue);
        }
        debug!("watch channel closed; ingest loop stopped");
    })
}

/// Helper to build an [`Observed`] from a raw JSON object.
pub fn observe_raw(kind: ResourceKind, raw: &serde_json::Value) -> Observed {
    let key = kubealert_core::object_key(raw);
    // For v1/Event objects the event reason (e.g. "Backoff", "NodeNotReady")
    // is what classification keys on, not the kind name.
    let resource_type = if kind == ResourceKind::Event {
        raw.get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or(kind.as_str())
            .to_string()
    } else {
        kind.as_str().to_string()
    };
    Observed { key, resource_type, obj: WatchedObject::from_raw(kind, raw) }
}
