//! First-time setup

use std::path::Path;

use anyhow::{Context, Result};

use cloudsync_core::{Config, EnvCredentials};

use crate::engine::{open_registry, open_status};
use crate::output::Output;

/// Create the data directory, stores directory and device id
pub fn init(config_path: &Path, output: &Output) -> Result<()> {
    let mut config = Config::load_from_path(config_path).context("Failed to load configuration")?;

    let (device_id, created) = config.ensure_device_id();
    if created || !config_path.exists() {
        config
            .save_to_path(config_path)
            .context("Failed to save configuration")?;
    }

    let registry = open_registry(&config)?;
    let status = open_status(&config)?;

    if output.is_json() {
        println!(
            "{}",
            serde_json::json!({
                "device_id": device_id,
                "new_device": created,
                "data_dir": config.data_dir,
                "stores_dir": registry.root(),
                "status_file": status.path(),
                "config_file": config_path,
            })
        );
        return Ok(());
    }

    if output.is_quiet() {
        println!("{}", device_id);
        return Ok(());
    }

    println!();
    if created {
        println!("Initialized cloudsync.");
    } else {
        println!("Already initialized.");
    }
    println!();
    println!("Device ID:   {}", device_id);
    println!("Stores:      {}", registry.root().display());
    println!("Config file: {}", config_path.display());
    println!();
    if config.api_base_url.is_none() {
        println!("Sync server not configured. Set one with:");
        println!("  cloudsync config set api_base_url https://sync.example.com");
    }
    println!(
        "Export {} with your account token, then run:",
        EnvCredentials::TOKEN_VAR
    );
    println!("  cloudsync enable");
    println!("  cloudsync run");

    Ok(())
}
