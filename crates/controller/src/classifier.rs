//! Pure classification of queued events into alerts.

use kubealert_core::{split_key, Alert, AlertReason, AlertStatus, EventType, ObjectMeta, QueueItem};

/// Severity table for Create events. This is the static configuration
/// surface for which resource types map to which status; embedders override
/// by wrapping `classify`.
pub fn status_for_create(resource_type: &str) -> AlertStatus {
    match resource_type {
        "NodeNotReady" => AlertStatus::Danger,
        "NodeReady" => AlertStatus::Normal,
        "NodeRebooted" => AlertStatus::Danger,
        "Backoff" => AlertStatus::Danger,
        _ => AlertStatus::Normal,
    }
}

/// Map one observed event to an alert, or `None` when it should be
/// suppressed.
///
/// Create events whose creation timestamp is not strictly newer than the
/// server start are replay of pre-existing state and produce nothing.
/// Update alerts report that a change occurred, not what changed; old vs.
/// new state is deliberately not diffed.
pub fn classify(item: &QueueItem, meta: &ObjectMeta, server_start_ts: i64) -> Option<Alert> {
    let (namespace, name) = split_key(&item.key, &item.namespace);
    match item.event_type {
        EventType::Create => {
            if meta.creation_ts <= server_start_ts {
                return None;
            }
            let name = if meta.name.is_empty() { name } else { meta.name.as_str() };
            Some(Alert {
                name: name.to_string(),
                namespace: namespace.to_string(),
                kind: item.resource_type.clone(),
                status: status_for_create(&item.resource_type),
                reason: AlertReason::Created,
            })
        }
        EventType::Update => Some(Alert {
            name: name.to_string(),
            namespace: namespace.to_string(),
            kind: item.resource_type.clone(),
            status: if item.resource_type == "Backoff" {
                AlertStatus::Danger
            } else {
                AlertStatus::Warning
            },
            reason: AlertReason::Updated,
        }),
        EventType::Delete => Some(Alert {
            name: name.to_string(),
            namespace: namespace.to_string(),
            kind: item.resource_type.clone(),
            status: AlertStatus::Danger,
            reason: AlertReason::Deleted,
        }),
    }
}
