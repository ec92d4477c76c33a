//! Ties the transport, the RPC multiplexer, and the session state
//! machine together into the single `HostConnection` actor, grounded on
//! `moonraker.py::Server` + `KlippyConnection` taken as a unit.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;

use super::rpc::{PendingTable, RemoteMethodHandler, RemoteMethodRegistry, RpcResult, PENDING_LOG_INTERVAL};
use super::session::{
    missing_required_objects, HostState, HostStateCell, InitList, InitStep,
    LOG_ATTEMPT_INTERVAL, MAX_LOG_ATTEMPTS,
};
use super::transport::{connect_once, HostWriter, ReadOutcome, RECONNECT_DELAY};
use crate::error::GatewayError;
use crate::event::EventBus;

/// Union-merges a wanted per-connection subscription into an existing
/// superset entry: `None` ("all fields") on either side subsumes any
/// specific list, otherwise the field lists union element-wise. This is
/// the exact algorithm in `klippy_apis.py::subscribe_objects`.
fn union_fields(existing: Option<&Option<Vec<String>>>, wanted: &Option<Vec<String>>) -> Option<Vec<String>> {
    match existing {
        None => wanted.clone(),
        Some(prev) => match (prev, wanted) {
            (None, _) | (_, None) => None,
            (Some(prev), Some(items)) => {
                let mut set: std::collections::BTreeSet<String> = prev.iter().cloned().collect();
                set.extend(items.iter().cloned());
                Some(set.into_iter().collect())
            }
        },
    }
}

struct Inner {
    socket_path: PathBuf,
    state: HostStateCell,
    pending: PendingTable,
    methods: RemoteMethodRegistry,
    events: EventBus,
    init_list: InitList,
    writer: AsyncMutex<Option<HostWriter>>,
    subscriptions: parking_lot::RwLock<HashMap<String, Option<Vec<String>>>>,
    shutting_down: AtomicBool,
    client_identity: (&'static str, &'static str),
}

/// Handle to the running host connection. Cheap to clone; every clone
/// shares the same underlying actor state.
#[derive(Clone)]
pub struct HostConnection(Arc<Inner>);

impl HostConnection {
    pub fn new(socket_path: PathBuf, events: EventBus) -> Self {
        Self(Arc::new(Inner {
            socket_path,
            state: HostStateCell::new(),
            pending: PendingTable::new(),
            methods: RemoteMethodRegistry::new(),
            events,
            init_list: InitList::new(),
            writer: AsyncMutex::new(None),
            subscriptions: parking_lot::RwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            client_identity: ("gateway", env!("CARGO_PKG_VERSION")),
        }))
    }

    pub fn state(&self) -> HostState {
        self.0.state.get()
    }

    pub fn register_remote_method(&self, name: impl Into<String>, need_host_registration: bool, handler: RemoteMethodHandler) {
        self.0.methods.register(name, need_host_registration, handler);
    }

    /// Spawns the connect/reconnect loop. Returns immediately; the loop
    /// runs until `shutdown()` is called.
    pub fn spawn(&self) {
        let this = self.clone();
        tokio::spawn(async move { this.run().await });
    }

    async fn run(&self) {
        loop {
            if self.0.shutting_down.load(Ordering::Acquire) {
                return;
            }
            self.0.state.set(HostState::Connecting);
            match connect_once(&self.0.socket_path).await {
                Ok((mut reader, writer)) => {
                    *self.0.writer.lock().await = Some(writer);
                    self.0.state.set(HostState::Connected);
                    tracing::info!(path = %self.0.socket_path.display(), "connected to printer host");

                    let init_task = {
                        let this = self.clone();
                        tokio::spawn(async move { this.initialize_loop().await })
                    };

                    loop {
                        match reader.read_frame().await {
                            Ok(Some(ReadOutcome::Value(frame))) => self.handle_inbound(frame),
                            Ok(Some(ReadOutcome::Malformed(raw))) => {
                                tracing::warn!(%raw, "malformed frame from printer host, skipping");
                            }
                            Ok(None) => break,
                            Err(err) => {
                                tracing::warn!(%err, "printer host read error");
                                break;
                            }
                        }
                    }

                    init_task.abort();
                    self.on_disconnect().await;
                }
                Err(err) => {
                    tracing::debug!(%err, "printer host connect failed, retrying");
                }
            }

            if self.0.shutting_down.load(Ordering::Acquire) {
                return;
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn on_disconnect(&self) {
        *self.0.writer.lock().await = None;
        self.0.pending.fail_all_disconnected();
        self.0.subscriptions.write().clear();
        self.0.init_list.clear();
        self.0.state.set(HostState::Disconnected);
        self.0.events.emit("server:klippy_disconnect", vec![]);
    }

    fn handle_inbound(&self, frame: Value) {
        if let Some(method) = frame.get("method").and_then(Value::as_str) {
            let params = frame.get("params").cloned().unwrap_or(json!({}));
            self.0.methods.dispatch(method, params);
            return;
        }
        let Some(id) = frame.get("id").and_then(Value::as_u64) else {
            tracing::warn!(?frame, "inbound frame has neither method nor id, dropping");
            return;
        };
        if let Some(err) = frame.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("host error")
                .to_string();
            self.0.pending.complete(id, Err(GatewayError::bad_request(message)));
        } else {
            let result = frame.get("result").cloned().unwrap_or(Value::Null);
            let result = if matches!(result, Value::Null) {
                json!("ok")
            } else {
                result
            };
            self.0.pending.complete(id, Ok(result));
        }
    }

    /// Writes a request frame and awaits its response, logging a
    /// "still pending" warning every 60s (spec §4.3).
    pub async fn make_request(&self, method: &str, params: Value) -> RpcResult {
        if !self.0.state.get().accepts_requests() {
            return Err(GatewayError::host_unavailable("Klippy Disconnected"));
        }
        let (id, rx) = self.0.pending.register(method);
        {
            let mut guard = self.0.writer.lock().await;
            let Some(writer) = guard.as_mut() else {
                self.0.pending.complete(id, Err(GatewayError::host_unavailable("Klippy Disconnected")));
                return rx.await.unwrap_or_else(|_| Err(GatewayError::host_unavailable("Klippy Disconnected")));
            };
            let frame = json!({"id": id, "method": method, "params": params});
            if let Err(err) = writer.write_frame(&frame).await {
                self.0.pending.complete(id, Err(GatewayError::host_unavailable(err.to_string())));
            }
        }

        let mut rx = rx;
        loop {
            tokio::select! {
                result = &mut rx => {
                    return result.unwrap_or_else(|_| Err(GatewayError::host_unavailable("Klippy Disconnected")));
                }
                _ = tokio::time::sleep(PENDING_LOG_INTERVAL) => {
                    if let Some((m, elapsed)) = self.0.pending.elapsed(id) {
                        tracing::warn!(method = %m, elapsed = ?elapsed, "pending");
                    }
                }
            }
        }
    }

    async fn initialize_loop(&self) {
        let mut attempts: u32 = 0;
        loop {
            if self.0.state.get() != HostState::Connected && self.0.state.get() != HostState::Identified {
                return;
            }
            attempts += 1;
            let send_id = !self.0.init_list.contains(InitStep::Identified);
            let params = if send_id {
                json!({"client_info": {"program": self.0.client_identity.0, "version": self.0.client_identity.1}})
            } else {
                json!({})
            };

            match self.make_request("info", params).await {
                Ok(info) if info.get("state").and_then(Value::as_str) == Some("ready") => {
                    self.0.init_list.mark(InitStep::Identified);
                    self.0.state.set(HostState::Identified);
                    self.finish_initialization(info).await;
                    return;
                }
                Ok(_) | Err(_) => {
                    if attempts <= MAX_LOG_ATTEMPTS && attempts % LOG_ATTEMPT_INTERVAL == 0 {
                        tracing::info!(attempts, "still waiting for printer host to report ready");
                    }
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            }
        }
    }

    async fn finish_initialization(&self, _info: Value) {
        if let Ok(objects) = self.make_request("objects/list", json!({})).await {
            let objects: Vec<String> = objects
                .get("objects")
                .and_then(Value::as_array)
                .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            let missing = missing_required_objects(&objects);
            if !missing.is_empty() {
                tracing::warn!(?missing, "printer host is missing objects this gateway expects");
            }
        }

        if !self.0.init_list.contains(InitStep::Webhooks) {
            let mut wanted = HashMap::new();
            wanted.insert("webhooks".to_string(), None);
            let _ = self.reconcile_and_subscribe(wanted).await;
            self.0.init_list.mark(InitStep::Webhooks);
        }

        if !self.0.init_list.contains(InitStep::GcodeOutput) {
            let template = json!({"response_template": {"method": "process_gcode_response"}});
            let _ = self.make_request("gcode/subscribe_output", template).await;
            self.0.init_list.mark(InitStep::GcodeOutput);
        }

        for name in self.0.methods.flagged_for_host_registration() {
            let params = json!({
                "response_template": {"method": name},
                "remote_method": name,
            });
            let _ = self.make_request("register_remote_method", params).await;
        }

        if !self.0.init_list.contains(InitStep::Endpoints) {
            let _ = self.make_request("list_endpoints", json!({})).await;
            self.0.init_list.mark(InitStep::Endpoints);
        }

        self.0.init_list.mark(InitStep::KlippyReady);
        self.0.state.set(HostState::Ready);
        self.0.events.emit("server:klippy_ready", vec![]);
    }

    /// Merges `wanted` into the host subscription superset and sends the
    /// resulting `objects/subscribe` request, returning the host's full
    /// status response (the caller is responsible for pruning the result
    /// down to its own per-connection field list per spec §4.4's
    /// superset-reconciliation contract).
    pub async fn reconcile_and_subscribe(&self, wanted: HashMap<String, Option<Vec<String>>>) -> RpcResult {
        {
            let mut superset = self.0.subscriptions.write();
            for (object, fields) in &wanted {
                let merged = union_fields(superset.get(object), fields);
                superset.insert(object.clone(), merged);
            }
        }
        let superset = self.0.subscriptions.read().clone();
        self.make_request(
            "objects/subscribe",
            json!({
                "objects": superset,
                "response_template": {"method": "process_status_update"},
            }),
        )
        .await
    }

    pub fn subscription_superset(&self) -> HashMap<String, Option<Vec<String>>> {
        self.0.subscriptions.read().clone()
    }

    /// Graceful shutdown: stops the reconnect loop and waits up to 2s for
    /// the in-flight disconnect path to complete (spec §4.2).
    pub async fn shutdown(&self) {
        self.0.shutting_down.store(true, Ordering::Release);
        self.0.init_list.clear();
        let mut guard = self.0.writer.lock().await;
        *guard = None;
        drop(guard);
        self.0.pending.fail_all_disconnected();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_fields_all_subsumes_specific_list() {
        let existing = Some(Some(vec!["position".to_string()]));
        let merged = union_fields(existing.as_ref(), &None);
        assert_eq!(merged, None);
    }

    #[test]
    fn union_fields_unions_two_specific_lists() {
        let existing = Some(Some(vec!["position".to_string()]));
        let wanted = Some(vec!["homed_axes".to_string()]);
        let merged = union_fields(existing.as_ref(), &wanted);
        let mut merged = merged.unwrap();
        merged.sort();
        assert_eq!(merged, vec!["homed_axes".to_string(), "position".to_string()]);
    }

    #[tokio::test]
    async fn make_request_fails_fast_when_not_connected() {
        let (events, _rx) = EventBus::new();
        let conn = HostConnection::new(PathBuf::from("/tmp/does-not-exist.sock"), events);
        let result = conn.make_request("info", json!({})).await;
        assert!(result.is_err());
    }
}
