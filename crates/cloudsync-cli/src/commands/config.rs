//! Config command handlers

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::Value;

use cloudsync_core::{Config, SyncSettings};

use crate::output::{Output, OutputFormat};

const SYNC_KEY_PREFIX: &str = "sync.";

/// Show current configuration
pub fn show(config_path: &Path, output: &Output) -> Result<()> {
    let config = Config::load_from_path(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "api_base_url": config.api_base_url,
                    "device_id": config.device_id,
                    "log_file": config.log_file,
                    "sync": config.sync,
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            println!("Configuration:");
            println!("  data_dir:     {}", config.data_dir.display());
            println!(
                "  api_base_url: {}",
                config.api_base_url.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  device_id:    {}",
                config.device_id.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  log_file:     {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Sync settings:");
            if let Value::Object(fields) = sync_settings_value(&config.sync)? {
                for (key, value) in fields {
                    println!("  {}{:<30} {}", SYNC_KEY_PREFIX, key, value);
                }
            }
            println!();
            println!("Config file: {}", config_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: String, value: String, config_path: &Path, output: &Output) -> Result<()> {
    let mut config = Config::load_from_path(config_path).context("Failed to load configuration")?;

    apply_setting(&mut config, &key, &value)?;

    config
        .save_to_path(config_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

/// Apply one `key = value` assignment to the config
///
/// Top-level keys take plain strings (`none` or an empty value clears an
/// optional one). `sync.<name>` keys take a JSON value, e.g.
/// `sync.backoff_secs "[5, 60]"`.
pub fn apply_setting(config: &mut Config, key: &str, value: &str) -> Result<()> {
    let optional = |value: &str| {
        if value.is_empty() || value == "none" {
            None
        } else {
            Some(value.to_string())
        }
    };

    match key {
        "data_dir" => {
            config.data_dir = value.into();
        }
        "api_base_url" => {
            config.api_base_url = optional(value);
        }
        "device_id" => {
            config.device_id = optional(value);
        }
        "log_file" => {
            config.log_file = optional(value).map(Into::into);
        }
        _ if key.starts_with(SYNC_KEY_PREFIX) => {
            let field = &key[SYNC_KEY_PREFIX.len()..];
            config.sync = with_sync_field(&config.sync, field, value)?;
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\n\
                 Valid keys: data_dir, api_base_url, device_id, log_file, sync.<setting>",
                key
            );
        }
    }
    Ok(())
}

fn sync_settings_value(settings: &SyncSettings) -> Result<Value> {
    serde_json::to_value(settings).context("Failed to serialize sync settings")
}

fn with_sync_field(settings: &SyncSettings, field: &str, value: &str) -> Result<SyncSettings> {
    let mut fields = match sync_settings_value(settings)? {
        Value::Object(fields) => fields,
        _ => bail!("Sync settings are not a table"),
    };

    if !fields.contains_key(field) {
        let known: Vec<&str> = fields.keys().map(String::as_str).collect();
        bail!(
            "Unknown sync setting: '{}'\nValid settings: {}",
            field,
            known.join(", ")
        );
    }

    let parsed: Value = serde_json::from_str(value)
        .with_context(|| format!("Invalid value for sync.{}: {}", field, value))?;
    fields.insert(field.to_string(), parsed);

    serde_json::from_value(Value::Object(fields))
        .with_context(|| format!("Invalid value for sync.{}: {}", field, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::load_from_str("").unwrap()
    }

    #[test]
    fn test_set_top_level_keys() {
        let mut config = config();
        apply_setting(&mut config, "api_base_url", "https://sync.example.com").unwrap();
        apply_setting(&mut config, "device_id", "laptop").unwrap();
        assert_eq!(
            config.api_base_url.as_deref(),
            Some("https://sync.example.com")
        );
        assert_eq!(config.device_id.as_deref(), Some("laptop"));

        apply_setting(&mut config, "api_base_url", "none").unwrap();
        assert!(config.api_base_url.is_none());
    }

    #[test]
    fn test_set_sync_settings() {
        let mut config = config();
        apply_setting(&mut config, "sync.push_debounce_secs", "3").unwrap();
        apply_setting(&mut config, "sync.backoff_secs", "[1, 2]").unwrap();
        assert_eq!(config.sync.push_debounce_secs, 3);
        assert_eq!(config.sync.backoff_secs, vec![1, 2]);
        assert_eq!(config.sync.pull_interval_secs, 600);
    }

    #[test]
    fn test_rejects_unknown_or_invalid_keys() {
        let mut config = config();
        assert!(apply_setting(&mut config, "sync_url", "x").is_err());
        assert!(apply_setting(&mut config, "sync.nope", "1").is_err());
        assert!(apply_setting(&mut config, "sync.push_debounce_secs", "soon").is_err());
        assert!(apply_setting(&mut config, "sync.push_debounce_secs", "-1").is_err());
        assert_eq!(config.sync, SyncSettings::default());
    }
}
