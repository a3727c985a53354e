//! Client-side sync against the cloud oplog
//!
//! Three layers, leaves first:
//!
//! - `session`: handshake, sync-token cache and the authenticated request
//!   envelope (push, pull, blobs, quotas, keys)
//! - `snapshot`: store values to wire items and back
//! - `orchestrator`: dirty tracking, debounced pushes, periodic pulls,
//!   retry/backoff and conflict recovery
//!
//! ## Usage
//!
//! ```ignore
//! let session = SessionClient::new(transport, credentials.clone(), clock.clone());
//! let orchestrator = SyncOrchestrator::new(deps, config.sync.clone());
//! orchestrator.start_auto_sync().await?;
//! ```

mod backoff;
mod flight;
mod orchestrator;
mod session;
mod snapshot;
mod transport;
pub mod wire;

pub use backoff::BackoffLadder;
pub use flight::{Flight, SingleFlight};
pub use orchestrator::{
    ManualSyncOutcome, PullOutcome, PushOutcome, StartOutcome, StopReason, SyncDependencies,
    SyncOrchestrator, SyncReason,
};
pub use session::{
    Session, SessionClient, BLOB_PATH_PREFIX, BLOB_UPLOAD_PATH, HANDSHAKE_PATH,
    HEADER_AUTHORIZATION, HEADER_DEVICE_ID, HEADER_SYNC_TOKEN, KEYS_REGISTER_PATH,
    KEYS_ROTATE_PATH, PULL_PATH, PUSH_PATH, QUOTAS_PATH, QUOTAS_VALIDATE_PATH,
};
pub use snapshot::{
    apply_pulled_storage_items, build_blob_sync_item, build_deleted_sync_item,
    build_sync_item_from_snapshot, collect_storage_snapshots, decode_payload, encode_payload,
    is_large_snapshot, sha256_hex, Snapshot, ENCODING_PREFIX,
};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method, RequestBody, ReqwestTransport};
