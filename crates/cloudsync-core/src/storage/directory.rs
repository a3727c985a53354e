//! File-backed store registry
//!
//! Each store lives in its own JSON file under a single directory. The
//! `:` separator of plugin store names is mapped to `~` on disk so names
//! stay valid file names on every platform.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use super::error::{StorageError, StorageResult};
use super::persistence::atomic_write;
use super::{is_plugin_storage, StorageChangeNotifier, StorageRegistry, ALL_PLUGIN_STORAGES};
use crate::events::{Listener, Listeners, SubscriptionId};

const STORE_EXTENSION: &str = "json";

pub struct DirectoryRegistry {
    root: PathBuf,
    listeners: Listeners<str>,
}

impl DirectoryRegistry {
    /// Open (and create if missing) a store directory
    pub fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StorageError::from_io(e, root.clone()))?;
        Ok(Self {
            root,
            listeners: Listeners::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write a store locally and notify subscribers
    pub fn write(&self, name: &str, value: &Value) -> StorageResult<()> {
        self.write_file(name, value)?;
        self.listeners.emit(name);
        Ok(())
    }

    /// Remove a store locally; returns false if it did not exist
    pub fn remove(&self, name: &str) -> StorageResult<bool> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(StorageError::from_io(e, path)),
        }

        if is_plugin_storage(name) {
            self.listeners.emit(ALL_PLUGIN_STORAGES);
        } else {
            self.listeners.emit(name);
        }
        Ok(true)
    }

    fn write_file(&self, name: &str, value: &Value) -> StorageResult<()> {
        let path = self.path_for(name)?;
        let data = serde_json::to_vec_pretty(value).map_err(|e| StorageError::InvalidFormat {
            path: path.clone(),
            details: e.to_string(),
        })?;
        atomic_write(&path, &data)
    }

    fn path_for(&self, name: &str) -> StorageResult<PathBuf> {
        validate_name(name)?;
        let file_stem = name.replace(':', "~");
        Ok(self.root.join(format!("{}.{}", file_stem, STORE_EXTENSION)))
    }
}

fn validate_name(name: &str) -> StorageResult<()> {
    let reason = if name.is_empty() {
        Some("name is empty")
    } else if name.contains(['/', '\\']) {
        Some("name contains a path separator")
    } else if name.contains('~') {
        Some("name contains '~'")
    } else if name == ALL_PLUGIN_STORAGES {
        Some("name is reserved")
    } else if name.starts_with('.') {
        Some("name starts with '.'")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(StorageError::InvalidName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

fn name_from_file(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some(STORE_EXTENSION) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    Some(stem.replace('~', ":"))
}

impl StorageRegistry for DirectoryRegistry {
    fn names(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %self.root.display(), error = %e, "Cannot list store directory");
                return Vec::new();
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| name_from_file(&entry.path()))
            .collect();
        names.sort();
        names
    }

    fn get(&self, name: &str) -> StorageResult<Option<Value>> {
        let path = self.path_for(name)?;
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::from_read(e, path)),
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StorageError::InvalidFormat {
                path,
                details: e.to_string(),
            })
    }

    fn apply_remote_snapshot(&self, name: &str, value: Value) -> StorageResult<()> {
        self.write_file(name, &value)
    }

    fn has_store(&self, name: &str) -> bool {
        self.path_for(name).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Any valid name can be materialized as a new file
    fn accepts_remote(&self, name: &str) -> bool {
        validate_name(name).is_ok()
    }
}

impl StorageChangeNotifier for DirectoryRegistry {
    fn subscribe(&self, listener: Listener<str>) -> SubscriptionId {
        self.listeners.add(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.remove(id);
    }
}
