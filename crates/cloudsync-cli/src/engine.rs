//! Wires the sync engine against the local data directory and the HTTP API

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use cloudsync_core::sync::ReqwestTransport;
use cloudsync_core::{
    Config, CredentialProvider, DirectoryRegistry, EnvCredentials, JsonStatusStore, LogNotifier,
    ManualHostEvents, SessionClient, SyncDependencies, SyncOrchestrator, SystemClock,
    TokioScheduler,
};

/// Everything a running sync session needs
///
/// The CLI has no network-availability source, so host events come from a
/// `ManualHostEvents` that never fires; shutdown is flushed explicitly.
pub struct Engine {
    pub status: Arc<JsonStatusStore>,
    pub orchestrator: SyncOrchestrator,
}

impl Engine {
    /// Build the orchestrator for this config
    ///
    /// Must be called from inside the tokio runtime.
    pub fn open(config: &Config) -> Result<Self> {
        let registry = Arc::new(open_registry(config)?);
        let status = Arc::new(open_status(config)?);
        let credentials = credentials(config);
        let session = session_client(config, Arc::clone(&credentials))?;

        let deps = SyncDependencies {
            session,
            registry: registry.clone(),
            changes: registry.clone(),
            host_events: Arc::new(ManualHostEvents::new()),
            status: status.clone(),
            credentials,
            scheduler: Arc::new(TokioScheduler::current()),
            clock: Arc::new(SystemClock),
            notifier: Arc::new(LogNotifier),
        };

        Ok(Self {
            orchestrator: SyncOrchestrator::new(deps, config.sync.clone()),
            status,
        })
    }
}

pub fn open_registry(config: &Config) -> Result<DirectoryRegistry> {
    let dir = config.stores_dir();
    DirectoryRegistry::open(&dir)
        .with_context(|| format!("Failed to open store directory: {:?}", dir))
}

pub fn open_status(config: &Config) -> Result<JsonStatusStore> {
    let path = config.status_path();
    JsonStatusStore::open(&path).with_context(|| format!("Failed to open sync status: {:?}", path))
}

pub fn credentials(config: &Config) -> Arc<dyn CredentialProvider> {
    Arc::new(EnvCredentials::new(config.device_id.clone()))
}

/// Session client talking to the configured API
pub fn session_client(
    config: &Config,
    credentials: Arc<dyn CredentialProvider>,
) -> Result<SessionClient> {
    let Some(ref url) = config.api_base_url else {
        bail!(
            "Sync API URL not configured. Set it with:\n  \
             cloudsync config set api_base_url https://sync.example.com"
        );
    };

    let transport = ReqwestTransport::new(url.as_str(), config.sync.request_timeout())
        .context("Failed to create HTTP client")?;
    Ok(SessionClient::new(
        Arc::new(transport),
        credentials,
        Arc::new(SystemClock),
    ))
}
