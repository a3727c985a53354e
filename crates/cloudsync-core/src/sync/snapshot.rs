//! Snapshot mapper
//!
//! Translates between local store values and wire items. Outbound, each
//! store is serialized to canonical JSON, hashed, base64-encoded and
//! wrapped in an upsert item (inline or blob-referencing). Inbound, pulled
//! items are decoded and handed to the registry's remote-apply primitive.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::session::SessionClient;
use super::wire::{
    storage_item_id, OpType, SyncItem, BLOB_REF_PREFIX, ITEM_TYPE_STORAGE, META_CONTENT_HASH,
    META_QUALIFIED_NAME, STORAGE_SCHEMA_VERSION,
};
use crate::error::{SyncError, SyncResult};
use crate::storage::{StorageRegistry, ALL_PLUGIN_STORAGES};

/// Prefix marking base64-encoded payload text
pub const ENCODING_PREFIX: &str = "b64:";

/// One store's content, prepared for a push
///
/// Built fresh right before each push; the hash is never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub qualified_name: String,
    pub item_id: String,
    pub payload_enc: String,
    pub payload_size: usize,
    pub content_hash: String,
    pub raw_text: String,
}

impl Snapshot {
    /// Build a snapshot from a store value
    pub fn from_value(qualified_name: &str, value: &Value) -> SyncResult<Self> {
        let raw_text = serde_json::to_string(value).map_err(|e| SyncError::Codec(e.to_string()))?;
        let payload_enc = encode_payload(&raw_text);
        Ok(Self {
            qualified_name: qualified_name.to_string(),
            item_id: storage_item_id(qualified_name),
            payload_size: payload_enc.len(),
            content_hash: sha256_hex(raw_text.as_bytes()),
            payload_enc,
            raw_text,
        })
    }
}

/// Read and encode each named store
///
/// Stores that are missing or unreadable are skipped with a warning.
pub fn collect_storage_snapshots(registry: &dyn StorageRegistry, names: &[String]) -> Vec<Snapshot> {
    let mut snapshots = Vec::with_capacity(names.len());

    for name in names {
        if name == ALL_PLUGIN_STORAGES {
            continue;
        }

        let value = match registry.get(name) {
            Ok(Some(value)) => value,
            Ok(None) => {
                tracing::debug!(store = %name, "Store has no value, skipping");
                continue;
            }
            Err(e) => {
                tracing::warn!(store = %name, error = %e, "Cannot read store for sync");
                continue;
            }
        };

        match Snapshot::from_value(name, &value) {
            Ok(snapshot) => snapshots.push(snapshot),
            Err(e) => tracing::warn!(store = %name, error = %e, "Cannot encode store"),
        }
    }

    snapshots
}

pub fn encode_payload(text: &str) -> String {
    format!("{}{}", ENCODING_PREFIX, STANDARD.encode(text.as_bytes()))
}

pub fn decode_payload(encoded: &str) -> SyncResult<String> {
    let body = encoded
        .strip_prefix(ENCODING_PREFIX)
        .ok_or_else(|| SyncError::Codec("payload is missing the b64: prefix".into()))?;
    let bytes = STANDARD
        .decode(body.trim())
        .map_err(|e| SyncError::Codec(format!("invalid base64 payload: {e}")))?;
    String::from_utf8(bytes).map_err(|e| SyncError::Codec(format!("payload is not UTF-8: {e}")))
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

pub fn is_large_snapshot(snapshot: &Snapshot, threshold_bytes: usize) -> bool {
    snapshot.payload_size > threshold_bytes
}

fn snapshot_meta(snapshot: &Snapshot) -> Map<String, Value> {
    let mut meta = Map::new();
    meta.insert(
        META_QUALIFIED_NAME.into(),
        Value::String(snapshot.qualified_name.clone()),
    );
    meta.insert(
        META_CONTENT_HASH.into(),
        Value::String(snapshot.content_hash.clone()),
    );
    meta
}

/// Inline upsert item
pub fn build_sync_item_from_snapshot(
    snapshot: &Snapshot,
    op_seq: u64,
    now: DateTime<Utc>,
) -> SyncItem {
    SyncItem {
        item_id: snapshot.item_id.clone(),
        item_type: ITEM_TYPE_STORAGE.to_string(),
        schema_version: STORAGE_SCHEMA_VERSION,
        payload_enc: Some(snapshot.payload_enc.clone()),
        payload_ref: None,
        meta_plain: snapshot_meta(snapshot),
        payload_size: snapshot.payload_size,
        updated_at: now,
        deleted_at: None,
        op_seq,
        op_hash: snapshot.content_hash.clone(),
        op_type: OpType::Upsert,
    }
}

/// Upsert item pointing at an uploaded blob
pub fn build_blob_sync_item(
    snapshot: &Snapshot,
    blob_id: &str,
    op_seq: u64,
    now: DateTime<Utc>,
) -> SyncItem {
    SyncItem {
        payload_enc: None,
        payload_ref: Some(format!("{}{}", BLOB_REF_PREFIX, blob_id)),
        ..build_sync_item_from_snapshot(snapshot, op_seq, now)
    }
}

/// Tombstone for a store that disappeared locally
///
/// There is no content to hash, so the op hash is derived from the item
/// id and deletion time.
pub fn build_deleted_sync_item(qualified_name: &str, op_seq: u64, now: DateTime<Utc>) -> SyncItem {
    let item_id = storage_item_id(qualified_name);
    let stamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    let op_hash = sha256_hex(format!("{}:{}", item_id, stamp).as_bytes());

    let mut meta = Map::new();
    meta.insert(
        META_QUALIFIED_NAME.into(),
        Value::String(qualified_name.to_string()),
    );

    SyncItem {
        item_id,
        item_type: ITEM_TYPE_STORAGE.to_string(),
        schema_version: STORAGE_SCHEMA_VERSION,
        payload_enc: None,
        payload_ref: None,
        meta_plain: meta,
        payload_size: 0,
        updated_at: now,
        deleted_at: Some(now),
        op_seq,
        op_hash,
        op_type: OpType::Delete,
    }
}

/// Apply pulled items to local stores; returns how many were applied
///
/// Tombstones, foreign item types and stores this registry does not hold
/// are skipped. A payload that fails to decode or parse is logged and
/// skipped. Blob downloads and store writes propagate their errors so the
/// page is retried and the cursor stays put.
pub async fn apply_pulled_storage_items(
    registry: &dyn StorageRegistry,
    items: &[SyncItem],
    session: &SessionClient,
) -> SyncResult<usize> {
    let mut applied = 0;

    for item in items {
        if item.item_type != ITEM_TYPE_STORAGE {
            continue;
        }

        let Some(name) = item.qualified_name() else {
            tracing::warn!(item_id = %item.item_id, "Pulled item has no store name");
            continue;
        };

        if item.is_tombstone() {
            tracing::debug!(store = %name, "Skipping pulled tombstone");
            continue;
        }

        if !registry.accepts_remote(&name) {
            tracing::debug!(store = %name, "No local store for pulled item");
            continue;
        }

        let encoded = match (item.blob_id(), item.payload_enc.as_deref()) {
            (Some(blob_id), _) => {
                let bytes = session.download_blob(blob_id).await?;
                match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(store = %name, blob_id, error = %e, "Blob is not UTF-8");
                        continue;
                    }
                }
            }
            (None, Some(inline)) => inline.to_string(),
            (None, None) => {
                tracing::warn!(store = %name, "Pulled item has no payload");
                continue;
            }
        };

        let value = match decode_payload(&encoded)
            .and_then(|text| serde_json::from_str::<Value>(&text).map_err(|e| SyncError::Codec(e.to_string())))
        {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(store = %name, error = %e, "Cannot decode pulled item");
                continue;
            }
        };

        registry
            .apply_remote_snapshot(&name, value)
            .map_err(|e| SyncError::storage(&name, e))?;
        applied += 1;
    }

    Ok(applied)
}
