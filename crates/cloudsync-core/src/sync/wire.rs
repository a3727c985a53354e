//! Wire format of the sync API
//!
//! All bodies are JSON with snake_case keys. Optional fields are always
//! present on outbound items (as `null`) so the server sees a stable shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Item category used for named-store snapshots
pub const ITEM_TYPE_STORAGE: &str = "storage";

/// Schema version of storage snapshot payloads
pub const STORAGE_SCHEMA_VERSION: u32 = 1;

/// Prefix of item ids derived from store names
pub const STORAGE_ITEM_PREFIX: &str = "storage:";

/// Prefix of `payload_ref` values pointing at an uploaded blob
pub const BLOB_REF_PREFIX: &str = "blob:";

/// Metadata key holding the qualified store name
pub const META_QUALIFIED_NAME: &str = "qualified_name";

/// Metadata key holding the hash of the unencoded content
pub const META_CONTENT_HASH: &str = "content_hash";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Upsert,
    Delete,
}

/// The unit of exchange between client and server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncItem {
    pub item_id: String,
    #[serde(rename = "type")]
    pub item_type: String,
    pub schema_version: u32,
    #[serde(default)]
    pub payload_enc: Option<String>,
    #[serde(default)]
    pub payload_ref: Option<String>,
    #[serde(default)]
    pub meta_plain: Map<String, Value>,
    #[serde(default)]
    pub payload_size: usize,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub op_seq: u64,
    pub op_hash: String,
    pub op_type: OpType,
}

impl SyncItem {
    pub fn is_tombstone(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Blob id referenced by `payload_ref`, without the `blob:` prefix
    pub fn blob_id(&self) -> Option<&str> {
        self.payload_ref
            .as_deref()
            .map(|r| r.strip_prefix(BLOB_REF_PREFIX).unwrap_or(r))
    }

    /// Qualified store name: explicit metadata first, then the item id
    pub fn qualified_name(&self) -> Option<String> {
        if let Some(Value::String(name)) = self.meta_plain.get(META_QUALIFIED_NAME) {
            if !name.is_empty() {
                return Some(name.clone());
            }
        }
        self.item_id
            .strip_prefix(STORAGE_ITEM_PREFIX)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    }
}

/// Item id for a qualified store name
pub fn storage_item_id(qualified_name: &str) -> String {
    format!("{}{}", STORAGE_ITEM_PREFIX, qualified_name)
}

/// Server-assigned oplog record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub cursor: u64,
    pub item_id: String,
    pub op_seq: u64,
    pub op_hash: String,
    pub op_type: OpType,
    pub updated_at: DateTime<Utc>,
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub sync_token: String,
    pub sync_token_expires_at: DateTime<Utc>,
    #[serde(default)]
    pub server_cursor: u64,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub quotas: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub items: Vec<SyncItem>,
}

/// A server-reported conflict for one pushed item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub item_id: String,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    pub ack_cursor: u64,
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    #[serde(default)]
    pub items: Vec<SyncItem>,
    #[serde(default)]
    pub oplog: Vec<OplogEntry>,
    pub next_cursor: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobUploadResponse {
    pub blob_id: String,
    #[serde(default)]
    pub object_key: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
}

/// Body of `POST /api/v1/quotas/validate`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDelta {
    pub storage_bytes_delta: i64,
    pub objects_delta: i64,
}
