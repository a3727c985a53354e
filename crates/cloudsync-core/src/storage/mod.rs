//! Local named stores
//!
//! The sync engine does not own application data. It reads and writes
//! named JSON stores through `StorageRegistry` and learns about local
//! mutations through `StorageChangeNotifier`.
//!
//! ## Naming
//!
//! - App stores use plain qualified names (`"settings"`, `"shortcuts"`)
//! - Plugin stores are prefixed: `"plugin:<plugin-id>:<store>"`
//! - `ALL_PLUGIN_STORAGES` is a marker meaning "every plugin store"; a
//!   registry emits it when a plugin store disappears

mod directory;
pub mod error;
mod memory;
mod persistence;

pub use directory::DirectoryRegistry;
pub use error::{StorageError, StorageResult};
pub use memory::MemoryRegistry;
pub use persistence::atomic_write;

use serde_json::Value;

use crate::events::{Listener, SubscriptionId};

/// Prefix of plugin-scoped store names
pub const PLUGIN_STORAGE_PREFIX: &str = "plugin:";

/// Marker standing for the full set of plugin stores
pub const ALL_PLUGIN_STORAGES: &str = "plugin:*";

/// Whether a name refers to a single plugin-scoped store
pub fn is_plugin_storage(name: &str) -> bool {
    name.starts_with(PLUGIN_STORAGE_PREFIX) && name != ALL_PLUGIN_STORAGES
}

/// Registry of named local stores
pub trait StorageRegistry: Send + Sync {
    /// All store names currently present
    fn names(&self) -> Vec<String>;

    /// Full current value of a store; `None` if it has nothing readable
    fn get(&self, name: &str) -> StorageResult<Option<Value>>;

    /// Replace a store's value with remote state
    ///
    /// Must be idempotent: applying the same value twice leaves the store
    /// in the same observable state. Must not emit a change notification.
    fn apply_remote_snapshot(&self, name: &str, value: Value) -> StorageResult<()>;

    fn has_store(&self, name: &str) -> bool {
        self.names().iter().any(|n| n == name)
    }

    /// Whether a pulled snapshot for `name` may be applied here
    ///
    /// By default only stores that already exist locally receive remote
    /// state.
    fn accepts_remote(&self, name: &str) -> bool {
        self.has_store(name)
    }
}

/// Notifies subscribers with the name of a store after a local mutation
pub trait StorageChangeNotifier: Send + Sync {
    fn subscribe(&self, listener: Listener<str>) -> SubscriptionId;
    fn unsubscribe(&self, id: SubscriptionId);
}
