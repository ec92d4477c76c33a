//! Server-wide shared state, and the bootstrap sequence that wires every
//! `gateway-core` service together.
//!
//! The struct shape — many `Arc<T>` service handles plus a manual
//! `finish_non_exhaustive()` `Debug` impl — is grounded on
//! `ferrex-server/src/infra/app_state.rs`'s `AppState`.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use gateway_core::auth::Authorization;
use gateway_core::database::{Database, METADATA_NAMESPACE};
use gateway_core::event::EventBus;
use gateway_core::files::{ChangeWatcher, ExternalExtractor, FileRootsManager, MetadataCache, PrintStatusProvider, WatchGuard};
use gateway_core::host::HostConnection;
use gateway_core::registry::ComponentRegistry;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::components::{DatabaseComponent, FileManagerComponent};
use crate::config::Config;
use crate::web::{ConnectionRegistry, EndpointRegistry};

/// Resolves whether the printer host currently has a file loaded, used by
/// the file-roots manager's in-use guard before destructive operations.
struct HostPrintStatus {
    host: HostConnection,
    roots: Arc<FileRootsManager>,
}

#[async_trait]
impl PrintStatusProvider for HostPrintStatus {
    async fn current_print(&self) -> Option<(PathBuf, bool)> {
        let response = self
            .host
            .make_request("objects/query", json!({"objects": {"print_stats": ["filename", "state"]}}))
            .await
            .ok()?;
        let filename = response.pointer("/status/print_stats/filename")?.as_str()?.to_string();
        if filename.is_empty() {
            return None;
        }
        let state = response.pointer("/status/print_stats/state").and_then(Value::as_str).unwrap_or("standby");
        let active = matches!(state, "printing" | "paused");
        let gcodes = self.roots.root("gcodes")?;
        Some((gcodes.path.join(filename), active))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub database: Database,
    pub auth: Authorization,
    pub events: EventBus,
    pub host: HostConnection,
    pub roots: Arc<FileRootsManager>,
    pub metadata: MetadataCache,
    pub watcher: ChangeWatcher,
    pub print_status: Arc<dyn PrintStatusProvider>,
    pub connections: Arc<ConnectionRegistry>,
    pub endpoints: Arc<EndpointRegistry>,
    pub components: Arc<Mutex<ComponentRegistry>>,
    // Kept alive only so the underlying inotify watches aren't torn down.
    watch_guards: Arc<Mutex<Vec<WatchGuard>>>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    /// Assembles every gateway-core service from `config`, registers the
    /// core components, arms the file watches, and starts the
    /// printer-host connection loop. Returns once startup succeeds — the
    /// host connection itself keeps retrying in the background.
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        let database = Database::open(&config.misc.database_path)?;
        let auth = Authorization::load(&config.authorization.api_key_path).await?;
        auth.configure(
            config.authorization.enabled,
            config.authorization.trusted_ips.clone(),
            config.authorization.trusted_ranges.clone(),
        )
        .await;
        auth.spawn_pruner();

        let (events, notify_rx) = EventBus::new();
        events.register_notification("server:klippy_ready", Some("klippy_ready".to_string()));
        events.register_notification("server:klippy_disconnect", Some("klippy_disconnected".to_string()));
        events.register_notification("server:gcode_response", Some("gcode_response".to_string()));
        for action in ["create_file", "modify_file", "delete_file", "move_file", "create_dir", "delete_dir", "move_dir"] {
            events.register_notification(format!("file_manager:{action}"), Some("filelist_changed".to_string()));
        }
        events.register_notification("file_manager:metadata_update", Some("metadata_update".to_string()));

        let host = HostConnection::new(config.host_connection.resolved_socket_path(), events.clone());

        let roots = Arc::new(FileRootsManager::new());
        if let Some(config_path) = &config.file_manager.config_path {
            roots.register_directory("config", config_path).await?;
        }
        if let Some(gcodes_path) = &config.file_manager.gcodes_path {
            roots.register_directory("gcodes", gcodes_path).await?;
        }
        for (name, path) in &config.file_manager.extra_roots {
            roots.register_directory(name, path).await?;
        }

        let metadata_namespace = database.register_local_namespace(METADATA_NAMESPACE)?;
        let extractor = Arc::new(ExternalExtractor {
            script_path: config
                .file_manager
                .metadata_extractor_script
                .clone()
                .unwrap_or_else(|| PathBuf::from("/usr/share/gateway/scripts/extract_metadata.py")),
        });
        let gcodes_root = config.file_manager.gcodes_path.clone().unwrap_or_else(|| PathBuf::from("/tmp"));
        let metadata = MetadataCache::new(metadata_namespace, gcodes_root, extractor, events.clone());
        if let Err(err) = metadata.check_version() {
            tracing::warn!(%err, "metadata cache version mismatch, cache cleared");
        }

        let watcher = ChangeWatcher::new(roots.clone(), metadata.clone(), events.clone());
        let watch_guards = Arc::new(Mutex::new(Vec::new()));
        for name in roots.registered_names() {
            if let Some(root) = roots.root(&name) {
                match watcher.watch_root(&root) {
                    Ok(guard) => watch_guards.lock().await.push(guard),
                    Err(err) => tracing::warn!(root = %name, %err, "failed to arm filesystem watch"),
                }
            }
        }

        let connections = Arc::new(ConnectionRegistry::new());
        register_push_handlers(&host, &events);
        spawn_status_fanout(&host, connections.clone());
        spawn_notification_fanout(notify_rx, connections.clone());
        host.spawn();

        let mut components = ComponentRegistry::new();
        components.register(Arc::new(DatabaseComponent { database: database.clone() }));
        components.register(Arc::new(FileManagerComponent { roots: roots.clone() }));

        let section_names: Vec<String> = config.extra.keys().cloned().collect();
        for name in gateway_core::registry::discover_optional_components(&section_names) {
            // No built-in component backs any config section beyond `database`/
            // `file_manager` in this build; isolate each as a load failure the
            // same way `_load_plugins` isolates an unimportable plugin module,
            // rather than silently dropping the section.
            components.record_load_failure(name.as_str(), "no component registered for this config section in this build");
        }

        components.init_all().await;

        let print_status: Arc<dyn PrintStatusProvider> = Arc::new(HostPrintStatus { host: host.clone(), roots: roots.clone() });

        let endpoints = Arc::new(crate::routes::build_registry());

        let state = Self {
            config,
            database,
            auth,
            events,
            host,
            roots,
            metadata,
            watcher,
            print_status,
            connections,
            endpoints,
            components: Arc::new(Mutex::new(components)),
            watch_guards,
        };

        wire_gcodes_auto_registration(&state);
        Ok(state)
    }

    pub async fn shutdown(&self) {
        self.host.shutdown().await;
        self.components.lock().await.close_all().await;
    }
}

/// Registers the two printer-host-initiated remote methods this gateway
/// needs: gcode console output (`process_gcode_response`) and the
/// subscription push channel (`process_status_update`). Must run before
/// `host.spawn()` so the handlers exist by the time Klippy's
/// initialization handshake asks the host to use them.
fn register_push_handlers(host: &HostConnection, events: &EventBus) {
    let events_for_gcode = events.clone();
    host.register_remote_method(
        "process_gcode_response",
        false,
        Arc::new(move |params| {
            let events = events_for_gcode.clone();
            Box::pin(async move {
                events.emit("server:gcode_response", vec![params]);
            })
        }),
    );
}

/// Drains the printer host's status-update push notifications and fans
/// them out per-connection, pruned to each client's own subscription.
fn spawn_status_fanout(host: &HostConnection, connections: Arc<ConnectionRegistry>) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Value>();
    host.register_remote_method(
        "process_status_update",
        false,
        Arc::new(move |params| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(params);
            })
        }),
    );
    tokio::spawn(async move {
        while let Some(params) = rx.recv().await {
            let eventtime = params.get("eventtime").cloned().unwrap_or(Value::Null);
            if let Some(status) = params.get("status").and_then(Value::as_object) {
                connections.push_status_update(status, eventtime);
            }
        }
    });
}

/// Drains the event bus's mapped notifications and broadcasts them to
/// every connected WebSocket client unconditionally (no per-connection
/// pruning — these aren't object-keyed status updates).
fn spawn_notification_fanout(
    mut notify_rx: tokio::sync::mpsc::UnboundedReceiver<gateway_core::event::Notification>,
    connections: Arc<ConnectionRegistry>,
) {
    tokio::spawn(async move {
        while let Some(notification) = notify_rx.recv().await {
            connections.broadcast_all(json!({
                "jsonrpc": "2.0",
                "method": notification.method,
                "params": notification.params,
            }));
        }
    });
}

/// Implements spec §4.4's supplemental behavior: once the printer host
/// reports ready, read its `virtual_sdcard` config path and register it as
/// the `gcodes` root if one wasn't already configured. Grounded on
/// `moonraker.py::Server._verify_klippy_requirements`.
fn wire_gcodes_auto_registration(state: &AppState) {
    let host = state.host.clone();
    let roots = state.roots.clone();
    let watcher = state.watcher.clone();
    let watch_guards = state.watch_guards.clone();
    state.events.register_handler(
        "server:klippy_ready",
        Arc::new(move |_args| {
            let host = host.clone();
            let roots = roots.clone();
            let watcher = watcher.clone();
            let watch_guards = watch_guards.clone();
            Box::pin(async move {
                if roots.root("gcodes").is_some() {
                    return;
                }
                let Ok(result) = host.make_request("objects/query", json!({"objects": {"configfile": null}})).await else {
                    return;
                };
                let Some(path) = result.pointer("/status/configfile/config/virtual_sdcard/path").and_then(Value::as_str) else {
                    tracing::info!("configuration for [virtual_sdcard] not found, unable to set gcodes path");
                    return;
                };
                match roots.register_directory("gcodes", path).await {
                    Ok(_) => {
                        if let Some(root) = roots.root("gcodes") {
                            match watcher.watch_root(&root) {
                                Ok(guard) => watch_guards.lock().await.push(guard),
                                Err(err) => tracing::warn!(%err, "failed to arm gcodes filesystem watch"),
                            }
                        }
                    }
                    Err(err) => tracing::warn!(%err, "failed to register gcodes root from virtual_sdcard path"),
                }
            })
        }),
    );
}
