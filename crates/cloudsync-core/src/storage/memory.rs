//! In-memory store registry

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde_json::Value;

use super::error::StorageResult;
use super::{is_plugin_storage, StorageChangeNotifier, StorageRegistry, ALL_PLUGIN_STORAGES};
use crate::events::{Listener, Listeners, SubscriptionId};

/// Registry holding every store in memory
///
/// Local writes go through `set`/`remove` and notify subscribers; remote
/// applies go through `apply_remote_snapshot` and stay silent.
#[derive(Default)]
pub struct MemoryRegistry {
    stores: RwLock<BTreeMap<String, Value>>,
    listeners: Listeners<str>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a store locally
    pub fn set(&self, name: &str, value: Value) {
        self.stores.write().insert(name.to_string(), value);
        self.listeners.emit(name);
    }

    /// Remove a store locally
    ///
    /// Removing a plugin store emits `ALL_PLUGIN_STORAGES` so the engine
    /// re-diffs plugin stores and pushes a tombstone.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.stores.write().remove(name).is_some();
        if removed {
            if is_plugin_storage(name) {
                self.listeners.emit(ALL_PLUGIN_STORAGES);
            } else {
                self.listeners.emit(name);
            }
        }
        removed
    }

    /// Current value without going through the registry trait
    pub fn value(&self, name: &str) -> Option<Value> {
        self.stores.read().get(name).cloned()
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }
}

impl StorageRegistry for MemoryRegistry {
    fn names(&self) -> Vec<String> {
        self.stores.read().keys().cloned().collect()
    }

    fn get(&self, name: &str) -> StorageResult<Option<Value>> {
        Ok(self.stores.read().get(name).cloned())
    }

    fn apply_remote_snapshot(&self, name: &str, value: Value) -> StorageResult<()> {
        self.stores.write().insert(name.to_string(), value);
        Ok(())
    }

    fn has_store(&self, name: &str) -> bool {
        self.stores.read().contains_key(name)
    }
}

impl StorageChangeNotifier for MemoryRegistry {
    fn subscribe(&self, listener: Listener<str>) -> SubscriptionId {
        self.listeners.add(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.remove(id);
    }
}
