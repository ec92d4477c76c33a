//! Database facade: namespaced key/value contract (spec §4.9).
//!
//! The spec treats the engine as an external collaborator, specified only
//! by its namespace/key/value contract. This revision backs that contract
//! with `sled`, an embedded single-process KV store, so the crate runs
//! end to end without a separate database process.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::GatewayError;

/// Well-known namespace for server preferences, auto-increment counters,
/// and path bookkeeping (spec §6).
pub const MOONRAKER_NAMESPACE: &str = "moonraker";
/// Well-known namespace for the gcode metadata cache (spec §4.13).
pub const METADATA_NAMESPACE: &str = "gcode_metadata";

/// Namespaced key/value facade over an embedded `sled::Db`. Each
/// namespace is a `sled::Tree`; cheap to clone.
#[derive(Clone)]
pub struct Database {
    db: sled::Db,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Ephemeral in-memory database, used by tests and components that
    /// don't need durability.
    #[cfg(test)]
    pub fn open_temporary() -> Result<Self, GatewayError> {
        let config = sled::Config::new().temporary(true);
        Ok(Self { db: config.open()? })
    }

    /// Declares a namespace exists. A no-op beyond opening the
    /// underlying tree lazily; namespaces need no separate registration
    /// step in the `sled` backend.
    pub fn register_local_namespace(&self, name: &str) -> Result<Namespace, GatewayError> {
        let tree = self.db.open_tree(name)?;
        Ok(Namespace { tree, name: name.to_string() })
    }

    pub fn namespace(&self, name: &str) -> Result<Namespace, GatewayError> {
        self.register_local_namespace(name)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("namespaces", &self.db.tree_names().len()).finish()
    }
}

/// A single namespace: a mapping from string key to JSON-representable
/// value.
#[derive(Clone)]
pub struct Namespace {
    tree: sled::Tree,
    name: String,
}

impl Namespace {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `default` (logged, not erroring) if the key is absent or
    /// fails to deserialize, consistent with the spec's never-raw-error
    /// propagation policy for cache-style reads.
    pub fn get_item<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.tree.get(key) {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                tracing::warn!(namespace = %self.name, key, %err, "failed to deserialize stored value, using default");
                default
            }),
            Ok(None) => default,
            Err(err) => {
                tracing::warn!(namespace = %self.name, key, %err, "database read error, using default");
                default
            }
        }
    }

    pub fn get_raw(&self, key: &str) -> Result<Option<Value>, GatewayError> {
        match self.tree.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn insert_item<T: Serialize>(&self, key: &str, value: &T) -> Result<(), GatewayError> {
        let bytes = serde_json::to_vec(value)?;
        self.tree.insert(key, bytes)?;
        Ok(())
    }

    /// Same as `insert_item`; kept distinct to mirror the source's
    /// separate `insert_item`/`update_item` surface (both write-through
    /// in this backend — there is no separate "update existing" path
    /// sled needs to express).
    pub fn update_item<T: Serialize>(&self, key: &str, value: &T) -> Result<(), GatewayError> {
        self.insert_item(key, value)
    }

    pub fn pop<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, GatewayError> {
        match self.tree.remove(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn ns_keys(&self) -> Vec<String> {
        self.tree
            .iter()
            .keys()
            .filter_map(|k| k.ok())
            .map(|k| String::from_utf8_lossy(&k).into_owned())
            .collect()
    }

    /// Clears every entry in the namespace, atomically from the caller's
    /// point of view. Used on metadata cache-version bumps (spec §4.13).
    pub fn clear(&self) -> Result<(), GatewayError> {
        self.tree.clear()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Dotted-path addressing (`a.b.c` → nested map access) over a JSON
    /// value stored at the first path segment, matching the source's
    /// "namespace wrapper".
    pub fn get_path(&self, dotted_key: &str, default: Value) -> Value {
        let mut parts = dotted_key.split('.');
        let Some(root_key) = parts.next() else { return default };
        let Some(mut current) = self.get_raw(root_key).ok().flatten() else { return default };
        for part in parts {
            match current.get(part) {
                Some(next) => current = next.clone(),
                None => return default,
            }
        }
        current
    }

    /// Writes `value` at a dotted path, creating intermediate objects as
    /// needed.
    pub fn set_path(&self, dotted_key: &str, value: Value) -> Result<(), GatewayError> {
        let mut parts = dotted_key.splitn(2, '.');
        let root_key = parts.next().unwrap_or(dotted_key).to_string();
        match parts.next() {
            None => self.insert_item(&root_key, &value),
            Some(rest) => {
                let mut root = self.get_raw(&root_key)?.unwrap_or_else(|| Value::Object(Default::default()));
                set_nested(&mut root, rest, value);
                self.insert_item(&root_key, &root)
            }
        }
    }
}

fn set_nested(target: &mut Value, dotted_key: &str, value: Value) {
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    let mut parts = dotted_key.splitn(2, '.');
    let head = parts.next().unwrap_or(dotted_key);
    let map = target.as_object_mut().expect("coerced to object above");
    match parts.next() {
        None => {
            map.insert(head.to_string(), value);
        }
        Some(rest) => {
            let entry = map.entry(head.to_string()).or_insert_with(|| Value::Object(Default::default()));
            set_nested(entry, rest, value);
        }
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace").field("name", &self.name).field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_values() {
        let db = Database::open_temporary().unwrap();
        let ns = db.register_local_namespace("moonraker").unwrap();
        ns.insert_item("key", &42i64).unwrap();
        let value: i64 = ns.get_item("key", 0);
        assert_eq!(value, 42);
    }

    #[test]
    fn missing_key_returns_default() {
        let db = Database::open_temporary().unwrap();
        let ns = db.register_local_namespace("moonraker").unwrap();
        let value: String = ns.get_item("absent", "fallback".to_string());
        assert_eq!(value, "fallback");
    }

    #[test]
    fn pop_removes_and_returns() {
        let db = Database::open_temporary().unwrap();
        let ns = db.register_local_namespace("moonraker").unwrap();
        ns.insert_item("key", &"value").unwrap();
        let popped: Option<String> = ns.pop("key").unwrap();
        assert_eq!(popped, Some("value".to_string()));
        assert_eq!(ns.ns_keys().len(), 0);
    }

    #[test]
    fn clear_empties_namespace() {
        let db = Database::open_temporary().unwrap();
        let ns = db.register_local_namespace("gcode_metadata").unwrap();
        ns.insert_item("a.gcode", &serde_json::json!({"size": 1})).unwrap();
        ns.clear().unwrap();
        assert!(ns.is_empty());
    }

    #[test]
    fn dotted_path_reads_and_writes_nested_values() {
        let db = Database::open_temporary().unwrap();
        let ns = db.register_local_namespace("moonraker").unwrap();
        ns.set_path("file_manager.gcode_path", serde_json::json!("/home/pi/gcodes")).unwrap();
        let value = ns.get_path("file_manager.gcode_path", Value::Null);
        assert_eq!(value, serde_json::json!("/home/pi/gcodes"));
    }
}
