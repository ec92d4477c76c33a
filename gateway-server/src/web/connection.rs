//! Per-WebSocket-connection state: outbound queue and the connection's own
//! subscription view.
//!
//! Grounded on the outbound-forwarding-task pattern used by the teacher's
//! own websocket handler (`handlers/handle_websocket.rs`): the socket is
//! split, and everything that wants to push a frame at the client does so
//! through an `mpsc` channel rather than touching the sink directly.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A single subscribed connection.
pub struct ConnectionHandle {
    pub id: Uuid,
    outbound: mpsc::UnboundedSender<Value>,
    subscription: Mutex<HashMap<String, Option<Vec<String>>>>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    fn new(outbound: mpsc::UnboundedSender<Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            outbound,
            subscription: Mutex::new(HashMap::new()),
        }
    }

    /// Sends a JSON frame to this connection. Silently drops it if the
    /// connection's forwarding task has already exited.
    pub fn send(&self, frame: Value) {
        let _ = self.outbound.send(frame);
    }

    pub fn subscription_snapshot(&self) -> HashMap<String, Option<Vec<String>>> {
        self.subscription.lock().clone()
    }

    pub fn set_subscription(&self, wanted: HashMap<String, Option<Vec<String>>>) {
        *self.subscription.lock() = wanted;
    }

    /// True if this connection currently cares about `object`, and if so
    /// the subset of fields it wants (`None` means "all fields").
    pub fn wants(&self, object: &str) -> Option<Option<Vec<String>>> {
        self.subscription.lock().get(object).cloned()
    }
}

/// Tracks every live WebSocket connection so notifications can be fanned out
/// to the subset that subscribed to a given object.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<Uuid, std::sync::Arc<ConnectionHandle>>,
    next_anon_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, outbound: mpsc::UnboundedSender<Value>) -> std::sync::Arc<ConnectionHandle> {
        self.next_anon_id.fetch_add(1, Ordering::Relaxed);
        let handle = std::sync::Arc::new(ConnectionHandle::new(outbound));
        self.connections.insert(handle.id, handle.clone());
        handle
    }

    pub fn unregister(&self, id: Uuid) {
        self.connections.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Pushes `frame` to every connected client unconditionally — used for
    /// non-object-keyed notifications (`notify_klippy_ready`, `notify_gcode_response`, ...).
    pub fn broadcast_all(&self, frame: Value) {
        for entry in self.connections.iter() {
            entry.value().send(frame.clone());
        }
    }

    /// Pushes `frame` to every connection for which `filter` returns a
    /// (possibly narrowed) copy of the value to send.
    pub fn broadcast_filtered(&self, object: &str, value: &Value, shape: impl Fn(&Value, &Option<Vec<String>>) -> Value) {
        for entry in self.connections.iter() {
            if let Some(fields) = entry.value().wants(object) {
                entry.value().send(shape(value, &fields));
            }
        }
    }

    /// Distributes a combined printer-host status update, pruning each
    /// object down to the fields each connection actually subscribed to.
    /// Mirrors `moonraker.py::Server._process_status_update`.
    pub fn push_status_update(&self, status: &serde_json::Map<String, Value>, eventtime: Value) {
        for entry in self.connections.iter() {
            let conn = entry.value();
            let subscription = conn.subscription_snapshot();
            if subscription.is_empty() {
                continue;
            }
            let mut pruned = serde_json::Map::new();
            for (object, fields) in status {
                if let Some(wanted) = subscription.get(object) {
                    pruned.insert(object.clone(), prune_fields(fields, wanted));
                }
            }
            if !pruned.is_empty() {
                conn.send(serde_json::json!({
                    "jsonrpc": "2.0",
                    "method": "notify_status_update",
                    "params": [Value::Object(pruned), eventtime.clone()],
                }));
            }
        }
    }
}

fn prune_fields(value: &Value, wanted: &Option<Vec<String>>) -> Value {
    match (value, wanted) {
        (Value::Object(map), Some(fields)) => {
            Value::Object(map.iter().filter(|(k, _)| fields.contains(k)).map(|(k, v)| (k.clone(), v.clone())).collect())
        }
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_connection_receives_frames() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = registry.register(tx);
        handle.send(Value::String("hi".into()));
        assert_eq!(rx.try_recv().unwrap(), Value::String("hi".into()));
        registry.unregister(handle.id);
        assert!(registry.is_empty());
    }

    #[test]
    fn subscription_narrows_broadcast_targets() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = registry.register(tx);
        handle.set_subscription(HashMap::from([("webhooks".to_string(), None)]));
        registry.broadcast_filtered("print_stats", &Value::Null, |v, _| v.clone());
        assert!(rx.try_recv().is_err());
        registry.broadcast_filtered("webhooks", &Value::String("state".into()), |v, _| v.clone());
        assert_eq!(rx.try_recv().unwrap(), Value::String("state".into()));
    }

    #[test]
    fn status_push_prunes_fields_not_subscribed() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = registry.register(tx);
        handle.set_subscription(HashMap::from([("print_stats".to_string(), Some(vec!["state".to_string()]))]));

        let mut status = serde_json::Map::new();
        status.insert(
            "print_stats".to_string(),
            serde_json::json!({"state": "printing", "filename": "x.gcode"}),
        );
        status.insert("webhooks".to_string(), serde_json::json!({"state": "ready"}));

        registry.push_status_update(&status, Value::from(1.0));
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame["method"], "notify_status_update");
        assert_eq!(frame["params"][0]["print_stats"]["state"], "printing");
        assert!(frame["params"][0]["print_stats"].get("filename").is_none());
        assert!(frame["params"][0].get("webhooks").is_none());
    }
}
