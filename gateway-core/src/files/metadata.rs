//! Gcode metadata extraction pipeline: freshness cache, LIFO single-worker
//! queue, external extractor invocation (spec §4.13).
//!
//! The extractor itself is an external collaborator — spec'd only by its
//! CLI and JSON output contract (`metadata.py`'s `extract_metadata`/
//! `main`, invoked as a subprocess). This module owns the queue, the
//! cache, and the retry/fallback policy around that contract; it never
//! re-implements slicer parsing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{oneshot, Mutex};

use crate::database::Namespace;
use crate::error::GatewayError;
use crate::event::EventBus;
use crate::shell::ShellCommand;

/// Per-attempt timeout for the external extractor.
pub const EXTRACTION_TIMEOUT: Duration = Duration::from_secs(10);
/// Number of attempts before falling back to a minimal record.
pub const MAX_RETRIES: u32 = 3;
/// Bump when the record shape changes; mismatched caches are dropped
/// wholesale on load rather than migrated.
pub const CACHE_VERSION: i64 = 3;
const CACHE_VERSION_KEY: &str = "_cache_version";

/// A stored or freshly-extracted metadata record. `fields` holds
/// whatever the extractor's slicer identification produced — the field
/// set varies by slicer and is opaque to this module.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetadataRecord {
    pub size: u64,
    pub modified: f64,
    #[serde(default, flatten)]
    pub fields: Map<String, Value>,
}

impl MetadataRecord {
    fn minimal(size: u64, modified: f64) -> Self {
        let mut fields = Map::new();
        fields.insert("print_start_time".to_string(), Value::Null);
        fields.insert("job_id".to_string(), Value::Null);
        Self { size, modified, fields }
    }

    fn matches(&self, size: u64, modified: f64) -> bool {
        self.size == size && (self.modified - modified).abs() < f64::EPSILON
    }

    fn as_map(&self) -> BTreeMap<String, Value> {
        let mut map: BTreeMap<String, Value> = BTreeMap::new();
        map.insert("size".to_string(), Value::from(self.size));
        map.insert("modified".to_string(), Value::from(self.modified));
        for (k, v) in &self.fields {
            map.insert(k.clone(), v.clone());
        }
        map
    }
}

/// Invokes the external gcode metadata extractor. Implemented by
/// `ExternalExtractor` in production; swappable in tests.
#[async_trait]
pub trait GcodeExtractor: Send + Sync {
    async fn extract(&self, abs_path: &Path) -> Result<Value, GatewayError>;
}

/// Runs the extractor script as a subprocess and parses its single-line
/// stdout JSON object (spec §4.13: `{"file": <name>, "metadata": {...}}`).
pub struct ExternalExtractor {
    pub script_path: PathBuf,
}

#[async_trait]
impl GcodeExtractor for ExternalExtractor {
    async fn extract(&self, abs_path: &Path) -> Result<Value, GatewayError> {
        let argv = vec![
            self.script_path.to_string_lossy().into_owned(),
            "--filename".to_string(),
            abs_path.to_string_lossy().into_owned(),
        ];
        let cmd = shell_words::join(argv);
        let command = ShellCommand::new(cmd, None)?;
        let output = command.run_with_response(EXTRACTION_TIMEOUT).await?;
        let parsed: Value = serde_json::from_str(output.trim())?;
        parsed
            .get("metadata")
            .cloned()
            .ok_or_else(|| GatewayError::internal("extractor produced no metadata field"))
    }
}

struct PendingEntry {
    size: u64,
    modified: f64,
    waiters: Vec<oneshot::Sender<()>>,
}

struct Inner {
    pending: HashMap<String, PendingEntry>,
    /// LIFO work stack; the most recently queued path is processed next.
    queue: Vec<String>,
    worker_active: bool,
}

/// Cache + extraction queue for one gcodes root. Cheap to clone (shares
/// the namespace handle and queue state).
#[derive(Clone)]
pub struct MetadataCache {
    namespace: Namespace,
    gcodes_root: PathBuf,
    extractor: Arc<dyn GcodeExtractor>,
    events: EventBus,
    inner: Arc<Mutex<Inner>>,
}

impl MetadataCache {
    pub fn new(namespace: Namespace, gcodes_root: PathBuf, extractor: Arc<dyn GcodeExtractor>, events: EventBus) -> Self {
        Self {
            namespace,
            gcodes_root,
            extractor,
            events,
            inner: Arc::new(Mutex::new(Inner { pending: HashMap::new(), queue: Vec::new(), worker_active: false })),
        }
    }

    /// Drops the whole cache and rewrites `_cache_version` if the stored
    /// version doesn't match `CACHE_VERSION` (spec §4.13 supplement).
    pub fn check_version(&self) -> Result<(), GatewayError> {
        let stored: i64 = self.namespace.get_item(CACHE_VERSION_KEY, 0);
        if stored != CACHE_VERSION {
            tracing::info!(stored, current = CACHE_VERSION, "metadata cache version changed, clearing");
            self.namespace.clear()?;
            self.namespace.insert_item(CACHE_VERSION_KEY, &CACHE_VERSION)?;
        }
        Ok(())
    }

    /// Drops cache entries whose relative path isn't in `valid_paths`,
    /// run once at startup after the gcodes root is scanned.
    pub fn prune_stale(&self, valid_paths: &HashSet<String>) -> Result<(), GatewayError> {
        for key in self.namespace.ns_keys() {
            if key == CACHE_VERSION_KEY || valid_paths.contains(&key) {
                continue;
            }
            let _: Option<MetadataRecord> = self.namespace.pop(&key)?;
        }
        Ok(())
    }

    /// Reads a cached record for use in directory listings. Synchronous
    /// and infallible by design — a missing/corrupt entry simply yields
    /// no extended fields (spec §4.10's listing merge never blocks on
    /// extraction).
    pub fn get(&self, rel_path: &str) -> Option<BTreeMap<String, Value>> {
        let record: MetadataRecord = match self.namespace.get_raw(rel_path) {
            Ok(Some(raw)) => serde_json::from_value(raw).ok()?,
            _ => return None,
        };
        Some(record.as_map())
    }

    pub fn remove(&self, rel_path: &str) -> Result<(), GatewayError> {
        let _: Option<MetadataRecord> = self.namespace.pop(rel_path)?;
        Ok(())
    }

    /// Clears every cached entry whose key starts with `rel_dir/`,
    /// called when a directory is deleted or moved away (spec §4.12).
    pub fn remove_under(&self, rel_dir: &str) -> Result<(), GatewayError> {
        let prefix = format!("{rel_dir}/");
        for key in self.namespace.ns_keys() {
            if key.starts_with(&prefix) {
                let _: Option<MetadataRecord> = self.namespace.pop(&key)?;
            }
        }
        Ok(())
    }

    /// Requests extraction for `rel_path` (relative to the gcodes root),
    /// returning a receiver that completes once a fresh-enough record is
    /// available — immediately if the cache already matches `(size,
    /// modified)`, otherwise once the queue processes it (spec §4.13).
    pub async fn parse_metadata(&self, rel_path: &str, size: u64, modified: f64, notify: bool) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();

        if let Some(record) = self.read_record(rel_path) {
            if record.matches(size, modified) {
                let _ = tx.send(());
                return rx;
            }
        }

        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.pending.get_mut(rel_path) {
            entry.waiters.push(tx);
            return rx;
        }

        inner.pending.insert(rel_path.to_string(), PendingEntry { size, modified, waiters: vec![tx] });
        inner.queue.push(rel_path.to_string());
        let should_spawn = !inner.worker_active;
        if should_spawn {
            inner.worker_active = true;
        }
        drop(inner);

        if should_spawn {
            self.clone().spawn_worker(notify);
        }
        rx
    }

    fn read_record(&self, rel_path: &str) -> Option<MetadataRecord> {
        match self.namespace.get_raw(rel_path) {
            Ok(Some(raw)) => serde_json::from_value(raw).ok(),
            _ => None,
        }
    }

    fn spawn_worker(self, notify: bool) {
        tokio::spawn(async move {
            loop {
                let next = {
                    let mut inner = self.inner.lock().await;
                    match inner.queue.pop() {
                        Some(path) => path,
                        None => {
                            inner.worker_active = false;
                            break;
                        }
                    }
                };
                self.process_one(&next, notify).await;
            }
        });
    }

    async fn process_one(&self, rel_path: &str, notify: bool) {
        let entry = {
            let mut inner = self.inner.lock().await;
            inner.pending.remove(rel_path)
        };
        let Some(entry) = entry else { return };

        if let Some(cached) = self.read_record(rel_path) {
            if cached.matches(entry.size, entry.modified) {
                for waiter in entry.waiters {
                    let _ = waiter.send(());
                }
                return;
            }
        }

        let abs_path = self.gcodes_root.join(rel_path);
        let record = self.extract_with_retries(&abs_path, entry.size, entry.modified).await;

        if let Err(err) = self.namespace.insert_item(rel_path, &record) {
            tracing::error!(rel_path, %err, "failed to persist metadata record");
        }

        if notify {
            let filename = rel_path.to_string();
            let mut params = record.as_map();
            params.insert("filename".to_string(), Value::from(filename));
            self.events
                .emit("file_manager:metadata_update", vec![Value::Object(params.into_iter().collect())]);
        }

        for waiter in entry.waiters {
            let _ = waiter.send(());
        }
    }

    async fn extract_with_retries(&self, abs_path: &Path, size: u64, modified: f64) -> MetadataRecord {
        for attempt in 1..=MAX_RETRIES {
            match self.extractor.extract(abs_path).await {
                Ok(value) => match build_record(value, size, modified) {
                    Ok(record) => return record,
                    Err(err) => {
                        tracing::warn!(?abs_path, attempt, %err, "metadata extractor returned unusable output");
                    }
                },
                Err(err) => {
                    tracing::warn!(?abs_path, attempt, %err, "metadata extraction attempt failed");
                }
            }
        }
        tracing::error!(?abs_path, "metadata extraction failed after all retries, storing minimal record");
        MetadataRecord::minimal(size, modified)
    }
}

fn build_record(mut value: Value, size: u64, modified: f64) -> Result<MetadataRecord, GatewayError> {
    if let Some(obj) = value.as_object_mut() {
        obj.insert("size".to_string(), Value::from(size));
        obj.insert("modified".to_string(), Value::from(modified));
    }
    serde_json::from_value(value).map_err(GatewayError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    struct StubExtractor {
        response: Value,
    }

    #[async_trait]
    impl GcodeExtractor for StubExtractor {
        async fn extract(&self, _abs_path: &Path) -> Result<Value, GatewayError> {
            Ok(self.response.clone())
        }
    }

    struct FailingExtractor;

    #[async_trait]
    impl GcodeExtractor for FailingExtractor {
        async fn extract(&self, _abs_path: &Path) -> Result<Value, GatewayError> {
            Err(GatewayError::internal("boom"))
        }
    }

    fn make_cache(extractor: Arc<dyn GcodeExtractor>) -> MetadataCache {
        let db = Database::open_temporary().unwrap();
        let ns = db.register_local_namespace("gcode_metadata").unwrap();
        let (events, _rx) = EventBus::new();
        MetadataCache::new(ns, PathBuf::from("/gcodes"), extractor, events)
    }

    #[tokio::test]
    async fn extraction_populates_cache_and_completes_waiter() {
        let cache = make_cache(Arc::new(StubExtractor { response: serde_json::json!({"layer_height": 0.2}) }));
        let rx = cache.parse_metadata("a.gcode", 100, 10.0, false).await;
        rx.await.unwrap();
        let record = cache.get("a.gcode").unwrap();
        assert_eq!(record.get("layer_height"), Some(&Value::from(0.2)));
        assert_eq!(record.get("size"), Some(&Value::from(100u64)));
    }

    #[tokio::test]
    async fn matching_cache_entry_precompletes_without_extraction() {
        let cache = make_cache(Arc::new(StubExtractor { response: serde_json::json!({"layer_height": 0.2}) }));
        cache.parse_metadata("a.gcode", 100, 10.0, false).await.await.unwrap();

        let cache2 = make_cache(Arc::new(FailingExtractor));
        cache2.namespace.insert_item("a.gcode", &MetadataRecord { size: 100, modified: 10.0, fields: Map::new() }).unwrap();
        let rx = cache2.parse_metadata("a.gcode", 100, 10.0, false).await;
        tokio::time::timeout(Duration::from_millis(100), rx).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn repeated_failure_falls_back_to_minimal_record() {
        let cache = make_cache(Arc::new(FailingExtractor));
        let rx = cache.parse_metadata("bad.gcode", 10, 1.0, false).await;
        rx.await.unwrap();
        let record = cache.get("bad.gcode").unwrap();
        assert_eq!(record.get("job_id"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn cache_version_mismatch_clears_namespace() {
        let db = Database::open_temporary().unwrap();
        let ns = db.register_local_namespace("gcode_metadata").unwrap();
        ns.insert_item("a.gcode", &serde_json::json!({"size": 1})).unwrap();
        ns.insert_item(CACHE_VERSION_KEY, &1i64).unwrap();
        let (events, _rx) = EventBus::new();
        let cache = MetadataCache::new(ns.clone(), PathBuf::from("/gcodes"), Arc::new(FailingExtractor), events);
        cache.check_version().unwrap();
        assert!(ns.get_raw("a.gcode").unwrap().is_none());
        let version: i64 = ns.get_item(CACHE_VERSION_KEY, -1);
        assert_eq!(version, CACHE_VERSION);
    }
}
