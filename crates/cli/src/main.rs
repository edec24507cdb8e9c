use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use kubealert_controller::{Controller, ControllerConfig, LogSink};
use kubealert_core::ResourceKind;
use kubealert_queue::WorkQueue;
use kubealert_watch::{spawn_ingest, start_watcher, ResourceCache};
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "kubealert", version, about = "Watch a cluster resource kind and raise classified alerts")]
struct Cli {
    /// Resource kind to watch, e.g. "pod", "deployment", "node", "event"
    kind: String,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns")]
    namespace: Option<String>,

    /// Number of concurrent worker loops
    #[arg(long = "workers", default_value_t = 1)]
    workers: usize,

    /// Failed attempts before an item is dropped
    #[arg(long = "max-retries", default_value_t = 5)]
    max_retries: u32,
}

fn init_tracing() {
    let env = std::env::var("KUBEALERT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KUBEALERT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KUBEALERT_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let kind = ResourceKind::parse(&cli.kind);
    if kind == ResourceKind::Unknown {
        return Err(anyhow!("unsupported resource kind: {}", cli.kind));
    }

    let cap = std::env::var("KUBEALERT_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(2048);
    let sync_secs = std::env::var("KUBEALERT_SYNC_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(30);

    let (stop_tx, stop_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::channel(cap);
    let cache = Arc::new(ResourceCache::new(kind));
    let queue = Arc::new(WorkQueue::new());

    info!(kind = %kind, ns = ?cli.namespace, workers = cli.workers, "starting kubealert");

    let watcher = tokio::spawn({
        let ns = cli.namespace.clone();
        let stop = stop_rx.clone();
        async move {
            if let Err(e) = start_watcher(kind, ns.as_deref(), event_tx, stop).await {
                error!(error = ?e, "watcher failed");
            }
        }
    });

    let ingest = spawn_ingest(Arc::clone(&cache), event_rx, {
        let queue = Arc::clone(&queue);
        move |item| queue.add(item)
    });

    let cfg = ControllerConfig {
        max_retries: cli.max_retries,
        workers: cli.workers,
        sync_timeout: Duration::from_secs(sync_secs),
        ..ControllerConfig::default()
    };
    let controller = Arc::new(Controller::new(cache, Arc::clone(&queue), Arc::new(LogSink), cfg));
    let mut run = tokio::spawn(controller.run(stop_rx));

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received; shutting down");
            let _ = stop_tx.send(true);
            run.await??;
        }
        res = &mut run => {
            // Controller ended on its own (e.g. fatal sync failure).
            let _ = stop_tx.send(true);
            res??;
        }
    }

    let _ = watcher.await;
    let _ = ingest.await;
    Ok(())
}
