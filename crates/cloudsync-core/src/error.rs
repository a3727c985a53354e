//! Sync error handling
//!
//! Every failure the engine can observe is a `SyncError`. Errors are
//! `Clone` so a single in-flight handshake, pull or push can hand the same
//! result to every caller waiting on it.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StorageError;

/// Error codes returned by the sync API in the `errorCode` body field
pub mod codes {
    pub const SYNC_INVALID_PAYLOAD: &str = "SYNC_INVALID_PAYLOAD";
    pub const SYNC_TOKEN_INVALID: &str = "SYNC_TOKEN_INVALID";
    pub const SYNC_TOKEN_EXPIRED: &str = "SYNC_TOKEN_EXPIRED";

    pub const QUOTA_PREFIX: &str = "QUOTA_";
    pub const QUOTA_STORAGE_EXCEEDED: &str = "QUOTA_STORAGE_EXCEEDED";
    pub const QUOTA_OBJECTS_EXCEEDED: &str = "QUOTA_OBJECTS_EXCEEDED";
    pub const QUOTA_ITEMS_EXCEEDED: &str = "QUOTA_ITEMS_EXCEEDED";
    pub const QUOTA_DEVICES_EXCEEDED: &str = "QUOTA_DEVICES_EXCEEDED";

    pub const DEVICE_NOT_AUTHORIZED: &str = "DEVICE_NOT_AUTHORIZED";
    pub const DEVICE_REVOKED: &str = "DEVICE_REVOKED";

    pub const AUTH_MISSING: &str = "AUTH_MISSING";
    pub const AUTH_INVALID_TOKEN: &str = "AUTH_INVALID_TOKEN";
    pub const AUTH_TOKEN_EXPIRED: &str = "AUTH_TOKEN_EXPIRED";
}

/// Why sync is blocked waiting on the user
///
/// Serialized as `""`, `"quota"`, `"device"` or `"auth"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockedReason {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "quota")]
    Quota,
    #[serde(rename = "device")]
    Device,
    #[serde(rename = "auth")]
    Auth,
}

impl BlockedReason {
    pub fn is_blocked(&self) -> bool {
        !matches!(self, BlockedReason::None)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockedReason::None => "",
            BlockedReason::Quota => "quota",
            BlockedReason::Device => "device",
            BlockedReason::Auth => "auth",
        }
    }
}

/// Errors raised by the sync engine
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// Non-success HTTP response, or a transport failure with no response at all
    #[error("{message}")]
    Api {
        status: Option<u16>,
        error_code: Option<String>,
        message: String,
        raw: Option<serde_json::Value>,
    },

    /// A caller stopped waiting; the underlying operation may still finish
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Auth token or device id could not be resolved
    #[error("Sync precondition not met: {0}")]
    Precondition(String),

    /// Local store could not be read or written
    #[error("Storage error for '{name}': {message}")]
    Storage { name: String, message: String },

    /// Payload could not be encoded, decoded or parsed
    #[error("Codec error: {0}")]
    Codec(String),

    /// Persisted status state could not be read or written
    #[error("Status store error: {0}")]
    StatusStore(String),

    #[error("Internal sync error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Build an error from a non-success HTTP response
    pub fn api(status: u16, error_code: Option<String>, raw: Option<serde_json::Value>) -> Self {
        let message = match &error_code {
            Some(code) => format!("Sync API request failed with status {status} ({code})"),
            None => format!("Sync API request failed with status {status}"),
        };
        SyncError::Api {
            status: Some(status),
            error_code,
            message,
            raw,
        }
    }

    /// Build an error for a request that never got a response
    pub fn transport(message: impl Into<String>) -> Self {
        SyncError::Api {
            status: None,
            error_code: None,
            message: format!("Sync transport failure: {}", message.into()),
            raw: None,
        }
    }

    pub fn storage(name: impl Into<String>, error: StorageError) -> Self {
        SyncError::Storage {
            name: name.into(),
            message: error.to_string(),
        }
    }

    /// HTTP status, if the server answered
    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::Api { status, .. } => *status,
            _ => None,
        }
    }

    /// Structured `errorCode` from the response body
    pub fn error_code(&self) -> Option<&str> {
        match self {
            SyncError::Api { error_code, .. } => error_code.as_deref(),
            _ => None,
        }
    }

    /// Raw response body, if it was JSON
    pub fn raw_data(&self) -> Option<&serde_json::Value> {
        match self {
            SyncError::Api { raw, .. } => raw.as_ref(),
            _ => None,
        }
    }

    pub fn is_invalid_payload(&self) -> bool {
        self.error_code() == Some(codes::SYNC_INVALID_PAYLOAD)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SyncError::Timeout { .. })
    }

    /// Classify the failure for status reporting
    ///
    /// Blocked failures need user action (cleanup, device approval,
    /// re-login); everything else is transient and retried on backoff.
    pub fn blocked_reason(&self) -> BlockedReason {
        match self {
            SyncError::Precondition(_) => BlockedReason::Auth,
            SyncError::Api {
                status, error_code, ..
            } => match error_code.as_deref() {
                Some(code) if code.starts_with(codes::QUOTA_PREFIX) => BlockedReason::Quota,
                Some(codes::DEVICE_NOT_AUTHORIZED) | Some(codes::DEVICE_REVOKED) => {
                    BlockedReason::Device
                }
                Some(codes::AUTH_MISSING)
                | Some(codes::AUTH_INVALID_TOKEN)
                | Some(codes::AUTH_TOKEN_EXPIRED)
                | Some(codes::SYNC_TOKEN_INVALID)
                | Some(codes::SYNC_TOKEN_EXPIRED) => BlockedReason::Auth,
                None if *status == Some(401) => BlockedReason::Auth,
                _ => BlockedReason::None,
            },
            _ => BlockedReason::None,
        }
    }
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_exposes_code() {
        let raw = serde_json::json!({ "errorCode": "SYNC_INVALID_PAYLOAD" });
        let err = SyncError::api(400, Some(codes::SYNC_INVALID_PAYLOAD.into()), Some(raw));

        assert_eq!(err.status(), Some(400));
        assert_eq!(err.error_code(), Some("SYNC_INVALID_PAYLOAD"));
        assert!(err.is_invalid_payload());
        assert!(err.raw_data().is_some());
        assert!(err.to_string().contains("400"));
    }

    #[test]
    fn test_transport_error_has_no_code() {
        let err = SyncError::transport("connection refused");
        assert_eq!(err.status(), None);
        assert_eq!(err.error_code(), None);
        assert_eq!(err.blocked_reason(), BlockedReason::None);
    }

    #[test]
    fn test_quota_classification() {
        for code in [
            codes::QUOTA_STORAGE_EXCEEDED,
            codes::QUOTA_OBJECTS_EXCEEDED,
            codes::QUOTA_ITEMS_EXCEEDED,
            codes::QUOTA_DEVICES_EXCEEDED,
        ] {
            let err = SyncError::api(403, Some(code.into()), None);
            assert_eq!(err.blocked_reason(), BlockedReason::Quota, "{code}");
        }
    }

    #[test]
    fn test_device_and_auth_classification() {
        let device = SyncError::api(403, Some(codes::DEVICE_NOT_AUTHORIZED.into()), None);
        assert_eq!(device.blocked_reason(), BlockedReason::Device);

        let expired = SyncError::api(401, Some(codes::AUTH_TOKEN_EXPIRED.into()), None);
        assert_eq!(expired.blocked_reason(), BlockedReason::Auth);

        let bare_401 = SyncError::api(401, None, None);
        assert_eq!(bare_401.blocked_reason(), BlockedReason::Auth);

        let missing = SyncError::Precondition("no auth token".into());
        assert_eq!(missing.blocked_reason(), BlockedReason::Auth);
    }

    #[test]
    fn test_server_errors_are_transient() {
        let err = SyncError::api(500, Some("INTERNAL".into()), None);
        assert_eq!(err.blocked_reason(), BlockedReason::None);

        let timeout = SyncError::Timeout {
            operation: "pull",
            after: Duration::from_secs(20),
        };
        assert!(timeout.is_timeout());
        assert_eq!(timeout.blocked_reason(), BlockedReason::None);
    }

    #[test]
    fn test_blocked_reason_serialization() {
        assert_eq!(serde_json::to_string(&BlockedReason::None).unwrap(), "\"\"");
        assert_eq!(serde_json::to_string(&BlockedReason::Quota).unwrap(), "\"quota\"");
        let parsed: BlockedReason = serde_json::from_str("\"device\"").unwrap();
        assert_eq!(parsed, BlockedReason::Device);
    }
}
