//! In-process typed pub/sub bus (spec §4.1).
//!
//! Handlers for a single `emit` run concurrently as independent tasks;
//! emit itself never awaits a handler. A panicking or erroring handler is
//! caught and logged, never allowed to take down the emitter or its
//! siblings — ported from `moonraker.py`'s `Server.send_event`, which
//! schedules each registered callback via `ioloop.spawn_callback` and
//! relies on the ioloop to isolate failures per callback.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;

/// A handler receives the positional argument list passed to `emit`.
pub type Handler = Arc<dyn Fn(Vec<Value>) -> BoxFuture + Send + Sync>;
pub type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// One outbound JSON-RPC notification produced by a named-notification
/// emit: `{"method": "notify_<name>", "params": [...]}`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Notification {
    pub method: String,
    pub params: Vec<Value>,
}

#[derive(Default)]
struct Inner {
    handlers: HashMap<String, Vec<Handler>>,
    notifications: HashMap<String, String>,
}

/// The event bus. Cheap to clone; all clones share the same registries.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<RwLock<Inner>>,
    notify_tx: mpsc::UnboundedSender<Notification>,
}

impl EventBus {
    /// `notify_tx` is the channel fed to every subscribed WebSocket
    /// connection; the gateway fans it out (§4.6).
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: Arc::new(RwLock::new(Inner::default())),
                notify_tx,
            },
            notify_rx,
        )
    }

    /// Registers a handler for `event_name`. Duplicates are allowed and
    /// both run on every emit.
    pub fn register_handler(&self, event_name: impl Into<String>, handler: Handler) {
        self.inner
            .write()
            .handlers
            .entry(event_name.into())
            .or_default()
            .push(handler);
    }

    /// Declares that emits of `event_name` are also serialized to clients
    /// as `notify_<method_name>`. Defaults `method_name` to `event_name`.
    pub fn register_notification(&self, event_name: impl Into<String>, method_name: Option<String>) {
        let event_name = event_name.into();
        let method_name = method_name.unwrap_or_else(|| event_name.clone());
        self.inner.write().notifications.insert(event_name, method_name);
    }

    /// Schedules every handler registered for `event_name` as an
    /// independent task and returns immediately. If the event has a
    /// named-notification mapping, also pushes a notification frame.
    pub fn emit(&self, event_name: &str, args: Vec<Value>) {
        let handlers = {
            let guard = self.inner.read();
            guard.handlers.get(event_name).cloned().unwrap_or_default()
        };
        for handler in handlers {
            let args = args.clone();
            let fut = handler(args);
            tokio::spawn(async move {
                fut.await;
            });
        }

        let method = self.inner.read().notifications.get(event_name).cloned();
        if let Some(method_name) = method {
            let notification = Notification {
                method: format!("notify_{method_name}"),
                params: args,
            };
            // A closed receiver (no connections subscribed yet) is not an error.
            let _ = self.notify_tx.send(notification);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.inner.read();
        f.debug_struct("EventBus")
            .field("events", &guard.handlers.keys().collect::<Vec<_>>())
            .field("notifications", &guard.notifications)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn handlers_run_for_every_emit() {
        let (bus, _rx) = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        bus.register_handler(
            "server:klippy_ready",
            Arc::new(move |_args| {
                let counter2 = counter2.clone();
                Box::pin(async move {
                    counter2.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );
        bus.emit("server:klippy_ready", vec![]);
        bus.emit("server:klippy_ready", vec![]);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn notification_mapping_produces_notify_frame() {
        let (bus, mut rx) = EventBus::new();
        bus.register_notification("file_manager:metadata_update", None);
        bus.emit(
            "file_manager:metadata_update",
            vec![serde_json::json!({"filename": "a.gcode"})],
        );
        let n = rx.recv().await.expect("notification");
        assert_eq!(n.method, "notify_file_manager:metadata_update");
    }

    #[tokio::test]
    async fn unmapped_event_produces_no_notification() {
        let (bus, mut rx) = EventBus::new();
        bus.emit("server:klippy_disconnect", vec![]);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(rx.try_recv().is_err());
    }
}
