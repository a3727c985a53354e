//! Local store handlers
//!
//! These edit the store directory directly. The changes reach the server
//! on the next `cloudsync sync` or when `cloudsync run` starts.

use anyhow::{bail, Result};
use serde_json::Value;

use cloudsync_core::{Config, StorageError, StorageRegistry};

use crate::engine::open_registry;
use crate::output::Output;

pub fn list(config: &Config, output: &Output) -> Result<()> {
    let registry = open_registry(config)?;
    output.print_store_names(&registry.names());
    Ok(())
}

pub fn get(config: &Config, name: &str, output: &Output) -> Result<()> {
    let registry = open_registry(config)?;
    match registry
        .get(name)
        .map_err(|e| storage_error(e, format!("Failed to read store '{}'", name)))?
    {
        Some(value) => output.print_value(&value),
        None => bail!("Store '{}' not found", name),
    }
    Ok(())
}

/// Write a store; `value` is parsed as JSON, falling back to a string
pub fn set(config: &Config, name: &str, value: &str, output: &Output) -> Result<()> {
    let registry = open_registry(config)?;
    let value = parse_value(value);
    registry
        .write(name, &value)
        .map_err(|e| storage_error(e, format!("Failed to write store '{}'", name)))?;
    output.success(&format!("Wrote store {}", name));
    Ok(())
}

pub fn remove(config: &Config, name: &str, output: &Output) -> Result<()> {
    let registry = open_registry(config)?;
    let removed = registry
        .remove(name)
        .map_err(|e| storage_error(e, format!("Failed to remove store '{}'", name)))?;
    if !removed {
        bail!("Store '{}' not found", name);
    }
    output.success(&format!("Removed store {}", name));
    Ok(())
}

/// Attach the storage error's recovery hint, when it has one
fn storage_error(error: StorageError, action: String) -> anyhow::Error {
    let message = match error.recovery_suggestion() {
        Some(hint) => format!("{}. {}", action, hint),
        None => action,
    };
    anyhow::Error::new(error).context(message)
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
