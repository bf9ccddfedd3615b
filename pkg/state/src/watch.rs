use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use pkg_constants::state::{EVENT_BROADCAST_CAPACITY, REGISTRY_PREFIX};
use pkg_types::meta::{ObjectKey, ObjectMeta, ResourceKind};

/// Type of event in the watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Put,
    Delete,
}

/// A single watch event representing a state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    pub seq: u64,
    pub event_type: EventType,
    pub key: String,
    /// New value for puts, last stored value for deletes
    #[serde(default)]
    pub value: Option<Vec<u8>>,
}

impl WatchEvent {
    /// Kind and namespaced name of the registry object this event is about.
    pub fn object(&self) -> Option<(ResourceKind, ObjectKey)> {
        parse_registry_key(&self.key)
    }

    /// Metadata of the object carried by the event, if the value holds one.
    pub fn metadata(&self) -> Option<ObjectMeta> {
        let value: serde_json::Value = serde_json::from_slice(self.value.as_deref()?).ok()?;
        serde_json::from_value(value.get("metadata")?.clone()).ok()
    }
}

/// `/registry/<plural>/<namespace>/<name>`
pub fn registry_key(kind: ResourceKind, namespace: &str, name: &str) -> String {
    format!("{}{}/{}/{}", REGISTRY_PREFIX, kind.plural(), namespace, name)
}

/// `/registry/<plural>/` or `/registry/<plural>/<namespace>/`
pub fn registry_prefix(kind: ResourceKind, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) => format!("{}{}/{}/", REGISTRY_PREFIX, kind.plural(), ns),
        None => format!("{}{}/", REGISTRY_PREFIX, kind.plural()),
    }
}

pub fn parse_registry_key(key: &str) -> Option<(ResourceKind, ObjectKey)> {
    let rest = key.strip_prefix(REGISTRY_PREFIX)?;
    let mut parts = rest.splitn(3, '/');
    let kind = ResourceKind::from_plural(parts.next()?)?;
    let namespace = parts.next()?;
    let name = parts.next()?;
    if namespace.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some((kind, ObjectKey::new(namespace, name)))
}

/// Broadcasts every state mutation to watchers, stamped with a monotonic
/// sequence number.
#[derive(Clone)]
pub struct EventLog {
    seq: Arc<AtomicU64>,
    sender: broadcast::Sender<WatchEvent>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        Self {
            seq: Arc::new(AtomicU64::new(0)),
            sender,
        }
    }

    /// Record a new event. Called by StateStore on put/delete.
    pub fn emit(&self, event_type: EventType, key: String, value: Option<Vec<u8>>) {
        let event = WatchEvent {
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            event_type,
            key,
            value,
        };
        // no receivers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive new events as they are emitted.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_keys_parse_back() {
        let key = registry_key(ResourceKind::Policy, "team-a", "reader");
        assert_eq!(key, "/registry/policies/team-a/reader");
        assert_eq!(
            parse_registry_key(&key),
            Some((ResourceKind::Policy, ObjectKey::new("team-a", "reader")))
        );
        assert_eq!(parse_registry_key("/registry/pods/ns/x"), None);
        assert_eq!(parse_registry_key("/registry/roles/ns"), None);
        assert_eq!(parse_registry_key("/other/roles/ns/x"), None);
    }

    #[test]
    fn subscribers_see_events_in_order() {
        let log = EventLog::new();
        let mut rx = log.subscribe();
        for i in 0..3 {
            log.emit(EventType::Put, format!("k{}", i), None);
        }
        let seqs: Vec<_> = (0..3).map(|_| rx.try_recv().unwrap().seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn metadata_is_extracted_from_value() {
        let event = WatchEvent {
            seq: 1,
            event_type: EventType::Delete,
            key: registry_key(ResourceKind::Role, "ns", "r"),
            value: Some(br#"{"metadata":{"name":"r","namespace":"ns","uid":"u1"},"spec":{}}"#.to_vec()),
        };
        let meta = event.metadata().unwrap();
        assert_eq!(meta.uid, "u1");
        assert_eq!(event.object().unwrap().0, ResourceKind::Role);
    }
}
