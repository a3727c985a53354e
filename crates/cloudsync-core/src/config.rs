//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/cloudsync/config.toml)
//! 3. Environment variables (CLOUDSYNC_* prefix)
//!
//! Environment variables take precedence over config file values. The auth
//! token is never part of the file; see `auth::EnvCredentials`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix
const ENV_PREFIX: &str = "CLOUDSYNC";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the store files and persisted sync status
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Base URL of the sync API (e.g. https://sync.example.com)
    #[serde(default)]
    pub api_base_url: Option<String>,

    /// Stable identifier of this device, sent as `x-device-id`
    #[serde(default)]
    pub device_id: Option<String>,

    /// Write logs here instead of stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Engine tunables
    #[serde(default)]
    pub sync: SyncSettings,
}

/// Timings and limits used by the sync engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub push_debounce_secs: u64,
    pub pull_interval_secs: u64,
    pub blob_batch_window_secs: u64,
    pub large_payload_threshold_bytes: usize,
    pub pull_page_limit: u32,
    pub pull_max_pages: u32,
    pub failure_notify_threshold: u32,
    pub startup_pull_timeout_secs: u64,
    pub sync_timeout_secs: u64,
    pub shutdown_flush_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub backoff_secs: Vec<u64>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            push_debounce_secs: 10,
            pull_interval_secs: 600,
            blob_batch_window_secs: 60,
            large_payload_threshold_bytes: 64 * 1024,
            pull_page_limit: 200,
            pull_max_pages: 5,
            failure_notify_threshold: 3,
            startup_pull_timeout_secs: 8,
            sync_timeout_secs: 20,
            shutdown_flush_timeout_secs: 3,
            request_timeout_secs: 30,
            backoff_secs: vec![5, 30, 120, 300, 600],
        }
    }
}

impl SyncSettings {
    pub fn push_debounce(&self) -> Duration {
        Duration::from_secs(self.push_debounce_secs)
    }

    pub fn pull_interval(&self) -> Duration {
        Duration::from_secs(self.pull_interval_secs)
    }

    pub fn blob_batch_window(&self) -> Duration {
        Duration::from_secs(self.blob_batch_window_secs)
    }

    pub fn startup_pull_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_pull_timeout_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn shutdown_flush_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_flush_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn backoff(&self) -> Vec<Duration> {
        self.backoff_secs
            .iter()
            .map(|secs| Duration::from_secs(*secs))
            .collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            api_base_url: None,
            device_id: None,
            log_file: None,
            sync: SyncSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (CLOUDSYNC_DATA_DIR, CLOUDSYNC_API_URL, ...)
    /// 2. Config file (~/.config/cloudsync/config.toml or CLOUDSYNC_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // Empty string clears the optional values
        if let Ok(val) = std::env::var(format!("{}_API_URL", ENV_PREFIX)) {
            self.api_base_url = non_empty(val);
        }

        if let Ok(val) = std::env::var(format!("{}_DEVICE_ID", ENV_PREFIX)) {
            self.device_id = non_empty(val);
        }

        if let Ok(val) = std::env::var(format!("{}_LOG_FILE", ENV_PREFIX)) {
            self.log_file = non_empty(val).map(PathBuf::from);
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to the default config file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with CLOUDSYNC_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cloudsync")
            .join("config.toml")
    }

    /// Directory of JSON store files
    pub fn stores_dir(&self) -> PathBuf {
        self.data_dir.join("stores")
    }

    /// Persisted sync status state
    pub fn status_path(&self) -> PathBuf {
        self.data_dir.join("sync_status.json")
    }

    /// Return the device id, generating one if none is configured
    ///
    /// Returns true as the second element when a new id was generated and
    /// the config should be saved.
    pub fn ensure_device_id(&mut self) -> (String, bool) {
        match &self.device_id {
            Some(id) => (id.clone(), false),
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                self.device_id = Some(id.clone());
                (id, true)
            }
        }
    }
}

fn non_empty(val: String) -> Option<String> {
    if val.is_empty() {
        None
    } else {
        Some(val)
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cloudsync")
}
