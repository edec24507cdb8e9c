//! Kubealert core types: lifecycle events, alerts, resource keys and
//! the metadata projection shared by every supported resource kind.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Lifecycle event kind observed from the watch stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    Create,
    Update,
    Delete,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Create => "create",
            EventType::Update => "update",
            EventType::Delete => "delete",
        }
    }
}

/// Severity attached to an emitted alert.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AlertStatus {
    Normal,
    Warning,
    Danger,
}

/// What happened to the resource the alert is about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AlertReason {
    Created,
    Updated,
    Deleted,
}

/// Classified alert record handed to the sink. Built once per processed
/// event and immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Alert {
    pub name: String,
    pub namespace: String,
    pub kind: String,
    pub status: AlertStatus,
    pub reason: AlertReason,
}

/// Unit of work queued for processing. The queue dedups by full equality,
/// not just key, so a Create and a Delete for the same key are distinct items.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct QueueItem {
    /// Canonical `namespace/name` key (name only for cluster-scoped kinds).
    pub key: String,
    pub event_type: EventType,
    /// Explicit namespace override; empty means "derive from the key".
    pub namespace: String,
    pub resource_type: String,
}

/// Minimal metadata projection every supported resource variant exposes.
/// `creation_ts` is seconds since epoch; 0 means unknown.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: Option<String>,
    pub creation_ts: i64,
}

/// Closed set of resource kinds the controller knows how to watch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Deployment,
    ReplicationController,
    ReplicaSet,
    DaemonSet,
    Service,
    Pod,
    Job,
    PersistentVolume,
    Namespace,
    Secret,
    Ingress,
    Node,
    ClusterRole,
    ServiceAccount,
    Event,
    Unknown,
}

impl ResourceKind {
    /// All watchable kinds (excludes `Unknown`).
    pub const ALL: [ResourceKind; 15] = [
        ResourceKind::Deployment,
        ResourceKind::ReplicationController,
        ResourceKind::ReplicaSet,
        ResourceKind::DaemonSet,
        ResourceKind::Service,
        ResourceKind::Pod,
        ResourceKind::Job,
        ResourceKind::PersistentVolume,
        ResourceKind::Namespace,
        ResourceKind::Secret,
        ResourceKind::Ingress,
        ResourceKind::Node,
        ResourceKind::ClusterRole,
        ResourceKind::ServiceAccount,
        ResourceKind::Event,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Deployment => "Deployment",
            ResourceKind::ReplicationController => "ReplicationController",
            ResourceKind::ReplicaSet => "ReplicaSet",
            ResourceKind::DaemonSet => "DaemonSet",
            ResourceKind::Service => "Service",
            ResourceKind::Pod => "Pod",
            ResourceKind::Job => "Job",
            ResourceKind::PersistentVolume => "PersistentVolume",
            ResourceKind::Namespace => "Namespace",
            ResourceKind::Secret => "Secret",
            ResourceKind::Ingress => "Ingress",
            ResourceKind::Node => "Node",
            ResourceKind::ClusterRole => "ClusterRole",
            ResourceKind::ServiceAccount => "ServiceAccount",
            ResourceKind::Event => "Event",
            ResourceKind::Unknown => "Unknown",
        }
    }

    /// Parse a kind name, case- and dash-insensitively ("replica-set",
    /// "ReplicaSet" and "replicaset" all match). Unrecognized names map to
    /// `Unknown` rather than failing.
    pub fn parse(s: &str) -> ResourceKind {
        let norm: String = s.chars().filter(|c| *c != '-' && *c != '_').collect::<String>().to_ascii_lowercase();
        for k in ResourceKind::ALL {
            if k.as_str().to_ascii_lowercase() == norm {
                return k;
            }
        }
        ResourceKind::Unknown
    }

    /// Group/version/kind key used to address the watch API,
    /// e.g. "apps/v1/Deployment" or "v1/Pod".
    pub fn gvk_key(&self) -> Option<&'static str> {
        match self {
            ResourceKind::Deployment => Some("apps/v1/Deployment"),
            ResourceKind::ReplicationController => Some("v1/ReplicationController"),
            ResourceKind::ReplicaSet => Some("apps/v1/ReplicaSet"),
            ResourceKind::DaemonSet => Some("apps/v1/DaemonSet"),
            ResourceKind::Service => Some("v1/Service"),
            ResourceKind::Pod => Some("v1/Pod"),
            ResourceKind::Job => Some("batch/v1/Job"),
            ResourceKind::PersistentVolume => Some("v1/PersistentVolume"),
            ResourceKind::Namespace => Some("v1/Namespace"),
            ResourceKind::Secret => Some("v1/Secret"),
            ResourceKind::Ingress => Some("networking.k8s.io/v1/Ingress"),
            ResourceKind::Node => Some("v1/Node"),
            ResourceKind::ClusterRole => Some("rbac.authorization.k8s.io/v1/ClusterRole"),
            ResourceKind::ServiceAccount => Some("v1/ServiceAccount"),
            ResourceKind::Event => Some("v1/Event"),
            ResourceKind::Unknown => None,
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A watched cluster object, tagged by kind. One variant per supported kind,
/// each carrying the common metadata projection; anything else is `Unknown`
/// and yields zero-value metadata so an unrecognized kind can never fail the
/// processing path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WatchedObject {
    Deployment(ObjectMeta),
    ReplicationController(ObjectMeta),
    ReplicaSet(ObjectMeta),
    DaemonSet(ObjectMeta),
    Service(ObjectMeta),
    Pod(ObjectMeta),
    Job(ObjectMeta),
    PersistentVolume(ObjectMeta),
    Namespace(ObjectMeta),
    Secret(ObjectMeta),
    Ingress(ObjectMeta),
    Node(ObjectMeta),
    ClusterRole(ObjectMeta),
    ServiceAccount(ObjectMeta),
    Event(ObjectMeta),
    Unknown,
}

impl WatchedObject {
    /// Build from a raw JSON object as delivered by the watch stream.
    pub fn from_raw(kind: ResourceKind, raw: &serde_json::Value) -> WatchedObject {
        let meta = parse_meta(raw);
        match kind {
            ResourceKind::Deployment => WatchedObject::Deployment(meta),
            ResourceKind::ReplicationController => WatchedObject::ReplicationController(meta),
            ResourceKind::ReplicaSet => WatchedObject::ReplicaSet(meta),
            ResourceKind::DaemonSet => WatchedObject::DaemonSet(meta),
            ResourceKind::Service => WatchedObject::Service(meta),
            ResourceKind::Pod => WatchedObject::Pod(meta),
            ResourceKind::Job => WatchedObject::Job(meta),
            ResourceKind::PersistentVolume => WatchedObject::PersistentVolume(meta),
            ResourceKind::Namespace => WatchedObject::Namespace(meta),
            ResourceKind::Secret => WatchedObject::Secret(meta),
            ResourceKind::Ingress => WatchedObject::Ingress(meta),
            ResourceKind::Node => WatchedObject::Node(meta),
            ResourceKind::ClusterRole => WatchedObject::ClusterRole(meta),
            ResourceKind::ServiceAccount => WatchedObject::ServiceAccount(meta),
            ResourceKind::Event => WatchedObject::Event(meta),
            ResourceKind::Unknown => WatchedObject::Unknown,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            WatchedObject::Deployment(_) => ResourceKind::Deployment,
            WatchedObject::ReplicationController(_) => ResourceKind::ReplicationController,
            WatchedObject::ReplicaSet(_) => ResourceKind::ReplicaSet,
            WatchedObject::DaemonSet(_) => ResourceKind::DaemonSet,
            WatchedObject::Service(_) => ResourceKind::Service,
            WatchedObject::Pod(_) => ResourceKind::Pod,
            WatchedObject::Job(_) => ResourceKind::Job,
            WatchedObject::PersistentVolume(_) => ResourceKind::PersistentVolume,
            WatchedObject::Namespace(_) => ResourceKind::Namespace,
            WatchedObject::Secret(_) => ResourceKind::Secret,
            WatchedObject::Ingress(_) => ResourceKind::Ingress,
            WatchedObject::Node(_) => ResourceKind::Node,
            WatchedObject::ClusterRole(_) => ResourceKind::ClusterRole,
            WatchedObject::ServiceAccount(_) => ResourceKind::ServiceAccount,
            WatchedObject::Event(_) => ResourceKind::Event,
            WatchedObject::Unknown => ResourceKind::Unknown,
        }
    }

    /// Metadata projection. Total: `Unknown` yields the zero value, which
    /// downstream classification treats as "not newer than server start".
    pub fn meta(&self) -> ObjectMeta {
        match self {
            WatchedObject::Deployment(m)
            | WatchedObject::ReplicationController(m)
            | WatchedObject::ReplicaSet(m)
            | WatchedObject::DaemonSet(m)
            | WatchedObject::Service(m)
            | WatchedObject::Pod(m)
            | WatchedObject::Job(m)
            | WatchedObject::PersistentVolume(m)
            | WatchedObject::Namespace(m)
            | WatchedObject::Secret(m)
            | WatchedObject::Ingress(m)
            | WatchedObject::Node(m)
            | WatchedObject::ClusterRole(m)
            | WatchedObject::ServiceAccount(m)
            | WatchedObject::Event(m) => m.clone(),
            WatchedObject::Unknown => ObjectMeta::default(),
        }
    }
}

fn parse_meta(raw: &serde_json::Value) -> ObjectMeta {
    match raw.get("metadata") {
        Some(meta) => {
            let name = meta.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
            let namespace = meta.get("namespace").and_then(|v| v.as_str()).map(|s| s.to_string());
            let creation_ts = meta
                .get("creationTimestamp")
                .and_then(|v| v.as_str())
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.timestamp())
                .unwrap_or(0);
            ObjectMeta { name, namespace, creation_ts }
        }
        None => ObjectMeta::default(),
    }
}

/// Canonical cache key for a raw object: `ns/name`, or bare `name` for
/// cluster-scoped objects.
pub fn object_key(raw: &serde_json::Value) -> String {
    let meta = raw.get("metadata");
    let name = meta.and_then(|m| m.get("name")).and_then(|v| v.as_str()).unwrap_or("");
    if let Some(ns) = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()) {
        format!("{}/{}", ns, name)
    } else {
        name.to_string()
    }
}

/// Resolve `(namespace, name)` from a key plus an optional explicit
/// namespace. When no namespace is given and the key is the compound
/// `namespace/name` form, split it; otherwise the key is the name.
pub fn split_key<'a>(key: &'a str, namespace: &'a str) -> (&'a str, &'a str) {
    if namespace.is_empty() {
        if let Some((ns, name)) = key.split_once('/') {
            return (ns, name);
        }
    }
    (namespace, key)
}
