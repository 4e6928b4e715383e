//! In-process shared handle registry
//!
//! Embedders park opaque objects here before `run()` starts (a third-party
//! device client, a metrics handle) and plugins fetch them by key during
//! their hooks. The registry lives on the controller instance, is written
//! only before the loop starts, and is read-only to plugins. Not persisted.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// A shared, type-erased handle
pub type RegistryItem = Arc<dyn Any + Send + Sync>;

/// String-keyed map of shared handles.
#[derive(Default)]
pub struct Registry {
    items: HashMap<String, RegistryItem>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a handle under the given key, replacing any previous one
    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.items.insert(key.into(), Arc::new(value));
    }

    /// Store an already-shared handle under the given key
    pub fn set_arc(&mut self, key: impl Into<String>, value: RegistryItem) {
        self.items.insert(key.into(), value);
    }

    /// Fetch the type-erased handle stored under `key`
    pub fn get(&self, key: &str) -> Option<RegistryItem> {
        self.items.get(key).cloned()
    }

    /// Fetch and downcast the handle stored under `key`.
    ///
    /// Returns `None` when the key is absent or holds a different type.
    pub fn get_as<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.items.get(key).cloned()?.downcast::<T>().ok()
    }

    /// Whether a handle is stored under `key`
    pub fn contains(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    /// Number of stored handles
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("keys", &self.items.keys().collect::<Vec<_>>())
            .finish()
    }
}
