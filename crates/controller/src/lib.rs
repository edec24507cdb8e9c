//! Kubealert controller: wires the watch cache into the work queue, runs the
//! worker loop(s) and owns the retry/give-up policy. Classification itself is
//! pure and lives in [`classifier`].

#![forbid(unsafe_code)]

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::FutureExt;
use kubealert_core::{Alert, ObjectMeta, QueueItem};
use kubealert_queue::WorkQueue;
use kubealert_watch::ClusterCache;
use metrics::counter;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub mod classifier;
pub use classifier::{classify, status_for_create};

/// Consumer of classified alerts. Delivery failures are the sink's problem;
/// the controller never retries a handed-off alert.
pub trait AlertSink: Send + Sync {
    fn handle(&self, alert: Alert);
}

/// Default sink: structured log line per alert.
pub struct LogSink;

impl AlertSink for LogSink {
    fn handle(&self, alert: Alert) {
        info!(
            name = %alert.name,
            namespace = %alert.namespace,
            kind = %alert.kind,
            status = ?alert.status,
            reason = ?alert.reason,
            "alert"
        );
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("timed out waiting for cache to sync")]
    SyncFailed,
}

/// Runtime knobs plus the server-start timestamp, captured once at
/// construction and read-only for the controller's life.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub max_retries: u32,
    pub workers: usize,
    pub sync_timeout: Duration,
    pub server_start_ts: i64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            workers: 1,
            sync_timeout: Duration::from_secs(30),
            server_start_ts: chrono::Utc::now().timestamp(),
        }
    }
}

/// Orchestrating loop: pops keys, resolves them against the cache, classifies
/// and emits to the sink, requeueing transient failures with back-off until
/// the retry budget is spent.
pub struct Controller {
    cache: Arc<dyn ClusterCache>,
    queue: Arc<WorkQueue>,
    sink: Arc<dyn AlertSink>,
    cfg: ControllerConfig,
}

impl Controller {
    pub fn new(
        cache: Arc<dyn ClusterCache>,
        queue: Arc<WorkQueue>,
        sink: Arc<dyn AlertSink>,
        cfg: ControllerConfig,
    ) -> Self {
        Self { cache, queue, sink, cfg }
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    /// Block until the cache syncs, then run workers until the stop signal
    /// fires. A sync failure is fatal for the run: the queue is shut down and
    /// no worker is started.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) -> Result<(), ControllerError> {
        if *stop.borrow() {
            self.queue.shutdown();
            return Ok(());
        }
        info!("starting controller");
        if !self.cache.sync(stop.clone(), self.cfg.sync_timeout).await {
            error!("timed out waiting for cache to sync");
            self.queue.shutdown();
            return Err(ControllerError::SyncFailed);
        }
        info!(workers = self.cfg.workers.max(1), "controller synced and ready");

        let mut workers = Vec::new();
        for worker in 0..self.cfg.workers.max(1) {
            workers.push(tokio::spawn(Arc::clone(&self).worker_loop(worker)));
        }

        while !*stop.borrow() {
            if stop.changed().await.is_err() {
                break;
            }
        }
        // In-flight items finish (done still runs); no new retries after this.
        self.queue.shutdown();
        for w in workers {
            let _ = w.await;
        }
        info!("controller stopped");
        Ok(())
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        while let Some(item) = self.queue.get().await {
            // A panicking item must not take the worker down or leak the
            // queue's in-flight tracking.
            let outcome = AssertUnwindSafe(self.process(&item)).catch_unwind().await;
            let outcome = match outcome {
                Ok(res) => res,
                Err(_) => Err(anyhow!("panic while processing {}", item.key)),
            };
            match outcome {
                Ok(()) => self.queue.forget(&item),
                Err(err) => {
                    let retries = self.queue.num_retries(&item);
                    if retries < self.cfg.max_retries {
                        warn!(key = %item.key, attempt = retries + 1, error = %err, "processing failed; will retry");
                        self.queue.add_rate_limited(item.clone());
                    } else {
                        error!(key = %item.key, attempts = retries + 1, error = %err, "processing failed; giving up");
                        counter!("controller_giveups_total", 1);
                        self.queue.forget(&item);
                    }
                }
            }
            self.queue.done(&item);
        }
        debug!(worker, "worker loop stopped");
    }

    async fn process(&self, item: &QueueItem) -> anyhow::Result<()> {
        let meta = match self.cache.lookup(&item.key) {
            Ok(Some(obj)) => obj.meta(),
            // Expected for deletions: the object is gone from the mirror, so
            // classification runs on the key alone.
            Ok(None) => ObjectMeta::default(),
            Err(err) => return Err(anyhow!("fetching {} from cache: {}", item.key, err)),
        };
        if let Some(alert) = classify(item, &meta, self.cfg.server_start_ts) {
            self.sink.handle(alert);
            counter!("alerts_emitted_total", 1);
        }
        Ok(())
    }
}
