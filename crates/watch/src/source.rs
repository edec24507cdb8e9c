//! kube-backed watch source: resolves the ApiResource for a supported kind
//! via discovery and pumps watcher events into the cache channel. Push-only,
//! no resync interval.

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use kube::{
    api::Api,
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use kubealert_core::ResourceKind;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::{observe_raw, Observed, WatchEvent};

fn gvk_for(kind: ResourceKind) -> Result<GroupVersionKind> {
    let key = kind
        .gvk_key()
        .ok_or_else(|| anyhow!("kind {} is not watchable", kind))?;
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, k] => Ok(GroupVersionKind {
            group: String::new(),
            version: (*version).to_string(),
            kind: (*k).to_string(),
        }),
        [group, version, k] => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*k).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {}", key)),
    }
}

async fn find_api_resource(
    client: Client,
    gvk: &GroupVersionKind,
) -> Result<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn observed(kind: ResourceKind, obj: &DynamicObject) -> Result<Observed> {
    let raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    Ok(observe_raw(kind, &raw))
}

/// Start list+watch for a supported kind and send change events into the
/// cache channel until the stream ends or the stop signal fires.
pub async fn start_watcher(
    kind: ResourceKind,
    namespace: Option<&str>,
    tx: mpsc::Sender<WatchEvent>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    let client = Client::try_default().await?;
    let gvk = gvk_for(kind)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;

    let api: Api<DynamicObject> = if namespaced {
        match namespace {
            Some(ns) => Api::namespaced_with(client.clone(), ns, &ar),
            None => Api::all_with(client.clone(), &ar),
        }
    } else {
        Api::all_with(client.clone(), &ar)
    };

    let cfg = watcher::Config::default();
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    info!(kind = %kind, ns = ?namespace, "watcher started");
    loop {
        tokio::select! {
            res = stop.changed() => {
                if res.is_err() || *stop.borrow() {
                    info!(kind = %kind, "stop signal; watcher exiting");
                    return Ok(());
                }
            }
            ev = stream.try_next() => {
                let out = match ev? {
                    Some(Event::Applied(o)) => WatchEvent::Applied(observed(kind, &o)?),
                    Some(Event::Deleted(o)) => WatchEvent::Deleted(observed(kind, &o)?),
                    Some(Event::Restarted(list)) => {
                        let entries = list
                            .iter()
                            .map(|o| observed(kind, o))
                            .collect::<Result<Vec<_>>>()?;
                        WatchEvent::Restarted(entries)
                    }
                    None => {
                        warn!(kind = %kind, "watcher stream ended");
                        return Ok(());
                    }
                };
                if tx.send(out).await.is_err() {
                    // Cache side gone; nothing left to feed.
                    return Ok(());
                }
            }
        }
    }
}
