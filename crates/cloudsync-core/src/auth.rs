//! Credential accessors
//!
//! The engine never stores the user's auth token. It asks a
//! `CredentialProvider` every time it needs one, so a token refreshed by the
//! host is picked up on the next request.

use crate::error::{SyncError, SyncResult};

/// Supplies the bearer token and device id for sync requests
///
/// Either accessor may fail; the orchestrator treats that as a blocking
/// precondition rather than a retryable fault.
pub trait CredentialProvider: Send + Sync {
    fn auth_token(&self) -> SyncResult<String>;
    fn device_id(&self) -> SyncResult<String>;
}

/// Fixed credentials, mostly for tests and embedding
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    auth_token: Option<String>,
    device_id: Option<String>,
}

impl StaticCredentials {
    pub fn new(auth_token: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            auth_token: Some(auth_token.into()),
            device_id: Some(device_id.into()),
        }
    }

    /// Credentials with nothing configured
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_device_only(device_id: impl Into<String>) -> Self {
        Self {
            auth_token: None,
            device_id: Some(device_id.into()),
        }
    }
}

impl CredentialProvider for StaticCredentials {
    fn auth_token(&self) -> SyncResult<String> {
        self.auth_token
            .clone()
            .ok_or_else(|| SyncError::Precondition("no auth token available".into()))
    }

    fn device_id(&self) -> SyncResult<String> {
        self.device_id
            .clone()
            .ok_or_else(|| SyncError::Precondition("no device id available".into()))
    }
}

/// Reads the auth token from an environment variable on every call
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    token_var: String,
    device_id: Option<String>,
}

impl EnvCredentials {
    /// Default variable holding the bearer token
    pub const TOKEN_VAR: &'static str = "CLOUDSYNC_AUTH_TOKEN";

    pub fn new(device_id: Option<String>) -> Self {
        Self {
            token_var: Self::TOKEN_VAR.to_string(),
            device_id,
        }
    }

    pub fn with_token_var(mut self, var: impl Into<String>) -> Self {
        self.token_var = var.into();
        self
    }
}

impl CredentialProvider for EnvCredentials {
    fn auth_token(&self) -> SyncResult<String> {
        match std::env::var(&self.token_var) {
            Ok(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
            _ => Err(SyncError::Precondition(format!(
                "auth token not set (export {})",
                self.token_var
            ))),
        }
    }

    fn device_id(&self) -> SyncResult<String> {
        self.device_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                SyncError::Precondition("device id not configured (run `cloudsync init`)".into())
            })
    }
}
