//! Component registry: discovery, load order, failure tolerance,
//! graceful shutdown (spec §4.8).
//!
//! Ported from `moonraker.py::Server.load_plugin/_load_plugins/
//! _stop_server`. The fixed "core" load order and the failed-component
//! list are reproduced verbatim; the spec's §9 design note on cyclic
//! component references (look up by name, return an `Option`) shapes
//! `ComponentRegistry::get`.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

/// Core components load in this fixed order before any optional
/// component, matching `CORE_PLUGINS` in the source.
pub const CORE_COMPONENTS: &[&str] = &[
    "database",
    "file_manager",
    "klippy_apis",
    "machine",
    "data_store",
    "shell_command",
];

/// A loadable, optionally-closeable unit with a stable name. Components
/// are stored as `Arc<dyn Any + Send + Sync>` in the registry and
/// downcast by callers that know the concrete type; `Component` itself
/// only needs to support graceful shutdown uniformly.
#[async_trait]
pub trait Component: Any + Send + Sync {
    fn name(&self) -> &str;

    /// Invoked once after every core and optional component has loaded.
    /// Failure here is isolated like a load failure but also surfaces
    /// through `/server/info` (spec §4.8).
    async fn component_init(&self) -> Result<(), String> {
        Ok(())
    }

    /// Invoked on shutdown. Errors are logged and swallowed — shutdown
    /// must always progress (spec §7).
    async fn close(&self) {}

    /// Widens `Arc<Self>` into `Arc<dyn Any + Send + Sync>` so
    /// `ComponentRegistry::get` can downcast back to a concrete type.
    /// Every implementor's body is just `self`; the coercion is what
    /// does the work.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

struct Entry {
    component: Arc<dyn Component>,
}

/// Holds every successfully-loaded component plus the names of any that
/// failed, keyed by name. Load order is preserved for ordered shutdown.
#[derive(Default)]
pub struct ComponentRegistry {
    loaded: HashMap<String, Entry>,
    load_order: Vec<String>,
    failed_components: Vec<FailedComponent>,
    last_core_index: Option<usize>,
}

/// A component that failed to load or failed its post-load init. Kept
/// distinct from a hard error so start-up can continue (spec §4.8).
#[derive(Debug, Clone)]
pub struct FailedComponent {
    pub name: String,
    pub reason: String,
    pub stage: FailureStage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Load,
    Init,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a successfully-constructed component. A component that
    /// fails to construct should never be passed here — call
    /// `record_load_failure` instead so it's isolated but visible.
    ///
    /// Panics in debug builds if a name from `CORE_COMPONENTS` is
    /// registered out of that list's fixed order — catching an
    /// accidental reorder at the call site rather than leaving the
    /// documented load order unenforced.
    pub fn register(&mut self, component: Arc<dyn Component>) {
        let name = component.name().to_string();
        if let Some(index) = CORE_COMPONENTS.iter().position(|core_name| *core_name == name) {
            debug_assert!(
                self.last_core_index.is_none_or(|last| last <= index),
                "core component '{name}' registered out of CORE_COMPONENTS order"
            );
            self.last_core_index = Some(index);
        }
        self.load_order.push(name.clone());
        self.loaded.insert(name, Entry { component });
    }

    pub fn record_load_failure(&mut self, name: impl Into<String>, reason: impl Into<String>) {
        let name = name.into();
        let reason = reason.into();
        tracing::error!(component = %name, %reason, "component failed to load, continuing without it");
        self.failed_components.push(FailedComponent { name, reason, stage: FailureStage::Load });
    }

    pub fn record_init_failure(&mut self, name: impl Into<String>, reason: impl Into<String>) {
        let name = name.into();
        let reason = reason.into();
        tracing::error!(component = %name, %reason, "component failed post-load init");
        self.failed_components.push(FailedComponent { name, reason, stage: FailureStage::Init });
    }

    /// Runs `component_init` on every loaded component, isolating
    /// failures exactly like load failures.
    pub async fn init_all(&mut self) {
        let names: Vec<String> = self.load_order.clone();
        for name in names {
            let Some(entry) = self.loaded.get(&name) else { continue };
            if let Err(reason) = entry.component.component_init().await {
                self.record_init_failure(name, reason);
            }
        }
    }

    /// Looks up a loaded component by name and concrete type. A missing
    /// or wrongly-typed collaborator returns `None` rather than
    /// panicking, per the spec's cyclic-reference design note.
    pub fn get<T: 'static + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let entry = self.loaded.get(name)?;
        entry.component.clone().as_any_arc().downcast::<T>().ok()
    }

    pub fn failed_components(&self) -> &[FailedComponent] {
        &self.failed_components
    }

    pub fn registered_names(&self) -> Vec<String> {
        self.load_order.clone()
    }

    /// Closes every component in load order, logging and swallowing
    /// errors so shutdown always progresses (spec §4.8, §7).
    pub async fn close_all(&self) {
        for name in self.load_order.iter().rev() {
            if let Some(entry) = self.loaded.get(name) {
                entry.component.close().await;
            }
        }
    }
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("loaded", &self.load_order)
            .field("failed", &self.failed_components)
            .finish()
    }
}

/// Optional component names considered for discovery: every config-file
/// section name minus the reserved set, per SPEC_FULL.md's §4.8
/// supplement grounded on `_load_plugins`. Called from
/// `gateway_server::state::AppState::build` against the config file's
/// catch-all `extra` section map; most of these names are already
/// excluded by `Config`'s named fields rather than this list, but the
/// list stays as the explicit guard against non-component sections (e.g.
/// CLI-only overrides) a future config field might otherwise flatten in.
pub const RESERVED_CONFIG_SECTIONS: &[&str] = &["server", "authorization", "system_args"];

pub fn discover_optional_components(config_sections: &[String]) -> Vec<String> {
    config_sections
        .iter()
        .filter(|s| !RESERVED_CONFIG_SECTIONS.contains(&s.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy {
        name: &'static str,
    }

    #[async_trait]
    impl Component for Dummy {
        fn name(&self) -> &str {
            self.name
        }
        fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[tokio::test]
    async fn registered_component_is_retrievable_by_type() {
        let mut registry = ComponentRegistry::new();
        registry.register(Arc::new(Dummy { name: "database" }));
        let found: Option<Arc<Dummy>> = registry.get("database");
        assert!(found.is_some());
        assert_eq!(found.unwrap().name, "database");
    }

    #[tokio::test]
    async fn missing_component_is_none_not_panic() {
        let registry = ComponentRegistry::new();
        let found: Option<Arc<Dummy>> = registry.get("does_not_exist");
        assert!(found.is_none());
    }

    #[test]
    fn load_failure_does_not_abort_registry() {
        let mut registry = ComponentRegistry::new();
        registry.record_load_failure("power", "no gpio device");
        registry.register(Arc::new(Dummy { name: "database" }));
        assert_eq!(registry.failed_components().len(), 1);
        assert_eq!(registry.registered_names(), vec!["database".to_string()]);
    }

    #[test]
    #[should_panic(expected = "out of CORE_COMPONENTS order")]
    fn core_components_registered_out_of_order_panics_in_debug() {
        let mut registry = ComponentRegistry::new();
        registry.register(Arc::new(Dummy { name: "file_manager" }));
        registry.register(Arc::new(Dummy { name: "database" }));
    }

    #[test]
    fn discover_optional_excludes_reserved_sections() {
        let sections = vec!["server".to_string(), "authorization".to_string(), "history".to_string()];
        let optional = discover_optional_components(&sections);
        assert_eq!(optional, vec!["history".to_string()]);
    }
}
