//! cloudsync core library
//!
//! Client-side cloud sync engine: reconciles any number of independently
//! owned local JSON stores with a remote append-only operation log.
//!
//! # Architecture
//!
//! - **Session client**: handshake and sync-token lifecycle, authenticated
//!   HTTP envelope
//! - **Snapshot mapper**: store values to wire items (encoding, hashing,
//!   blob threshold) and pulled items back into stores
//! - **Sync orchestrator**: dirty tracking, debounced pushes, periodic
//!   pulls, single-flight execution, retry/backoff, conflict re-pull
//!
//! The engine owns no application data. Stores, credentials, host events,
//! the persisted status and time itself are injected, so the same engine
//! runs inside a desktop host, the `cloudsync` CLI or a test harness.
//!
//! # Quick Start
//!
//! ```text
//! let registry = Arc::new(DirectoryRegistry::open(config.stores_dir())?);
//! let orchestrator = SyncOrchestrator::new(deps, config.sync.clone());
//! orchestrator.start_auto_sync().await?;
//!
//! registry.write("settings", &json!({"theme": "dark"}))?; // pushed after the debounce
//! ```
//!
//! # Modules
//!
//! - `sync`: session client, snapshot mapper, orchestrator, wire types
//! - `storage`: named-store registry traits and implementations
//! - `status`: persisted sync status state
//! - `config`: application configuration

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod notify;
pub mod schedule;
pub mod status;
pub mod storage;
pub mod sync;

pub use auth::{CredentialProvider, EnvCredentials, StaticCredentials};
pub use config::{Config, SyncSettings};
pub use error::{BlockedReason, SyncError, SyncResult};
pub use events::{HostEvent, HostEvents, ManualHostEvents};
pub use notify::{LogNotifier, SyncNotice, SyncNotifier};
pub use schedule::{Clock, Scheduler, SystemClock, TokioScheduler};
pub use status::{JsonStatusStore, MemoryStatusStore, StatusStore, SyncStatus, SyncStatusState};
pub use storage::{
    DirectoryRegistry, MemoryRegistry, StorageChangeNotifier, StorageError, StorageRegistry,
};
pub use sync::{SessionClient, SyncDependencies, SyncOrchestrator};
