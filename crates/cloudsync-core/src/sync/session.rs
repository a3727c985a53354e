//! Session client
//!
//! Owns the handshake and sync-token lifecycle and builds the
//! authenticated envelope for every sync API call.
//!
//! ## Session lifecycle
//!
//! 1. `handshake()` exchanges the bearer token and device id for a short
//!    lived sync token. Concurrent callers share one handshake.
//! 2. `ensure_session()` reuses the cached token until its expiry (by the
//!    injected clock) and re-handshakes after that.
//! 3. A request that fails with `SYNC_INVALID_PAYLOAD` while using a
//!    previously cached token is retried exactly once after a fresh
//!    handshake. A failure on a freshly obtained token is surfaced as is.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::flight::SingleFlight;
use super::transport::{HttpRequest, HttpResponse, HttpTransport, RequestBody};
use super::wire::{
    BlobUploadResponse, HandshakeResponse, PullResponse, PushRequest, PushResponse, QuotaDelta,
    SyncItem,
};
use crate::auth::CredentialProvider;
use crate::error::{SyncError, SyncResult};
use crate::schedule::Clock;

pub const HANDSHAKE_PATH: &str = "/api/v1/sync/handshake";
pub const PUSH_PATH: &str = "/api/v1/sync/push";
pub const PULL_PATH: &str = "/api/v1/sync/pull";
pub const BLOB_UPLOAD_PATH: &str = "/api/v1/sync/blobs/upload";
pub const BLOB_PATH_PREFIX: &str = "/api/v1/sync/blobs/";
pub const QUOTAS_PATH: &str = "/api/v1/quotas";
pub const QUOTAS_VALIDATE_PATH: &str = "/api/v1/quotas/validate";
pub const KEYS_REGISTER_PATH: &str = "/api/v1/keys/register";
pub const KEYS_ROTATE_PATH: &str = "/api/v1/keys/rotate";

pub const HEADER_AUTHORIZATION: &str = "authorization";
pub const HEADER_DEVICE_ID: &str = "x-device-id";
pub const HEADER_SYNC_TOKEN: &str = "x-sync-token";

/// A cached sync token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Authenticated client for the sync API
///
/// Cheap to clone; clones share the session cache.
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    transport: Arc<dyn HttpTransport>,
    credentials: Arc<dyn CredentialProvider>,
    clock: Arc<dyn Clock>,
    session: Mutex<Option<Session>>,
    handshake: SingleFlight<HandshakeResponse>,
}

impl SessionClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        credentials: Arc<dyn CredentialProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                transport,
                credentials,
                clock,
                session: Mutex::new(None),
                handshake: SingleFlight::new(),
            }),
        }
    }

    /// Exchange credentials for a sync token
    ///
    /// Concurrent callers await the same in-flight handshake.
    pub async fn handshake(&self) -> SyncResult<HandshakeResponse> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .handshake
            .run(move || async move { inner.perform_handshake().await })
            .await
    }

    /// Cached token if still valid, otherwise a fresh handshake
    pub async fn ensure_session(&self) -> SyncResult<String> {
        self.session_token().await.map(|(token, _)| token)
    }

    /// Returns the token and whether it came from the cache
    async fn session_token(&self) -> SyncResult<(String, bool)> {
        if let Some(session) = self.cached_session() {
            if self.inner.clock.now() < session.expires_at {
                return Ok((session.token, true));
            }
            tracing::debug!(expires_at = %session.expires_at, "Sync token expired, re-handshaking");
        }
        let response = self.handshake().await?;
        Ok((response.sync_token, false))
    }

    pub fn cached_session(&self) -> Option<Session> {
        self.inner.session.lock().clone()
    }

    /// Forget the cached sync token
    pub fn clear_session(&self) {
        self.inner.session.lock().take();
    }

    pub async fn push(&self, items: &[SyncItem]) -> SyncResult<PushResponse> {
        let body = serde_json::to_value(PushRequest {
            items: items.to_vec(),
        })
        .map_err(|e| SyncError::Codec(e.to_string()))?;

        let response = self
            .send_with_session("push", || {
                HttpRequest::post(PUSH_PATH, RequestBody::Json(body.clone()))
            })
            .await?;
        parse_json(&response)
    }

    pub async fn pull(&self, cursor: u64, limit: u32) -> SyncResult<PullResponse> {
        let response = self
            .send_with_session("pull", || {
                HttpRequest::get(PULL_PATH)
                    .query_param("cursor", cursor)
                    .query_param("limit", limit)
            })
            .await?;
        parse_json(&response)
    }

    /// Upload an out-of-band payload as multipart field `file`
    pub async fn upload_blob(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> SyncResult<BlobUploadResponse> {
        let response = self
            .send_with_session("blob-upload", || {
                HttpRequest::post(
                    BLOB_UPLOAD_PATH,
                    RequestBody::Multipart {
                        field: "file".to_string(),
                        file_name: file_name.to_string(),
                        bytes: bytes.clone(),
                    },
                )
            })
            .await?;
        parse_json(&response)
    }

    pub async fn download_blob(&self, blob_id: &str) -> SyncResult<Vec<u8>> {
        let path = format!("{}{}", BLOB_PATH_PREFIX, blob_id);
        let response = self
            .send_with_session("blob-download", || HttpRequest::get(path.clone()))
            .await?;
        Ok(response.body)
    }

    pub async fn get_quotas(&self) -> SyncResult<Value> {
        let request = self.inner.with_auth(HttpRequest::get(QUOTAS_PATH))?;
        let response = self.inner.execute(request).await?;
        parse_json(&response)
    }

    pub async fn validate_quotas(&self, delta: QuotaDelta) -> SyncResult<Value> {
        let body = serde_json::to_value(delta).map_err(|e| SyncError::Codec(e.to_string()))?;
        let request = self
            .inner
            .with_auth(HttpRequest::post(QUOTAS_VALIDATE_PATH, RequestBody::Json(body)))?;
        let response = self.inner.execute(request).await?;
        parse_json(&response)
    }

    pub async fn register_key(&self, body: Value) -> SyncResult<Value> {
        let request = self
            .inner
            .with_auth(HttpRequest::post(KEYS_REGISTER_PATH, RequestBody::Json(body)))?;
        let response = self.inner.execute(request).await?;
        parse_json(&response)
    }

    pub async fn rotate_key(&self, body: Value) -> SyncResult<Value> {
        let request = self
            .inner
            .with_auth(HttpRequest::post(KEYS_ROTATE_PATH, RequestBody::Json(body)))?;
        let response = self.inner.execute(request).await?;
        parse_json(&response)
    }

    /// Send a request that needs `x-sync-token`, retrying once on a stale token
    async fn send_with_session<F>(
        &self,
        operation: &'static str,
        build: F,
    ) -> SyncResult<HttpResponse>
    where
        F: Fn() -> HttpRequest,
    {
        let (token, from_cache) = self.session_token().await?;
        let request = self
            .inner
            .with_auth(build())?
            .header(HEADER_SYNC_TOKEN, token);

        match self.inner.execute(request).await {
            Err(err) if err.is_invalid_payload() && from_cache => {
                tracing::info!(operation, "Sync token rejected, re-handshaking once");
                self.clear_session();
                let fresh = self.handshake().await?;
                let retry = self
                    .inner
                    .with_auth(build())?
                    .header(HEADER_SYNC_TOKEN, fresh.sync_token);
                self.inner.execute(retry).await
            }
            other => other,
        }
    }
}

impl SessionInner {
    async fn perform_handshake(&self) -> SyncResult<HandshakeResponse> {
        let device_id = self.credentials.device_id()?;
        let request = self.with_auth(HttpRequest::post(
            HANDSHAKE_PATH,
            RequestBody::Json(json!({ "device_id": device_id })),
        ))?;

        let response = self.execute(request).await?;
        let handshake: HandshakeResponse = parse_json(&response)?;

        tracing::info!(
            server_cursor = handshake.server_cursor,
            expires_at = %handshake.sync_token_expires_at,
            "Sync handshake complete"
        );

        *self.session.lock() = Some(Session {
            token: handshake.sync_token.clone(),
            expires_at: handshake.sync_token_expires_at,
        });
        Ok(handshake)
    }

    /// Attach bearer token and device id
    fn with_auth(&self, request: HttpRequest) -> SyncResult<HttpRequest> {
        let token = self.credentials.auth_token()?;
        let device_id = self.credentials.device_id()?;
        Ok(request
            .header(HEADER_AUTHORIZATION, format!("Bearer {}", token))
            .header(HEADER_DEVICE_ID, device_id))
    }

    /// Send and map non-success responses to typed errors
    async fn execute(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        let path = request.path.clone();
        let response = self.transport.send(request).await?;
        if response.is_success() {
            return Ok(response);
        }

        let raw: Option<Value> = serde_json::from_slice(&response.body).ok();
        let error_code = raw.as_ref().and_then(extract_error_code);
        tracing::debug!(
            path = %path,
            status = response.status,
            error_code = error_code.as_deref().unwrap_or(""),
            "Sync API request failed"
        );
        Err(SyncError::api(response.status, error_code, raw))
    }
}

fn extract_error_code(body: &Value) -> Option<String> {
    ["errorCode", "error_code"]
        .iter()
        .find_map(|key| body.get(*key))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn parse_json<T: DeserializeOwned>(response: &HttpResponse) -> SyncResult<T> {
    serde_json::from_slice(&response.body)
        .map_err(|e| SyncError::Codec(format!("invalid response body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticCredentials;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::collections::VecDeque;

    struct FixedClock(Mutex<DateTime<Utc>>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock()
        }
    }

    /// Replays scripted responses and records requests
    #[derive(Default)]
    struct ScriptedTransport {
        responses: Mutex<VecDeque<HttpResponse>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        fn push(&self, status: u16, body: Value) {
            self.responses
                .lock()
                .push_back(HttpResponse::json(status, &body));
        }

        fn paths(&self) -> Vec<String> {
            self.requests.lock().iter().map(|r| r.path.clone()).collect()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
            self.requests.lock().push(request);
            self.responses
                .lock()
                .pop_front()
                .ok_or_else(|| SyncError::transport("no scripted response"))
        }
    }

    fn handshake_body(token: &str, expires_at: DateTime<Utc>) -> Value {
        json!({
            "sync_token": token,
            "sync_token_expires_at": expires_at,
            "server_cursor": 0,
            "device_id": "device-1",
            "quotas": {}
        })
    }

    fn client(transport: Arc<ScriptedTransport>, now: DateTime<Utc>) -> (SessionClient, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock(Mutex::new(now)));
        let client = SessionClient::new(
            transport,
            Arc::new(StaticCredentials::new("auth-1", "device-1")),
            clock.clone(),
        );
        (client, clock)
    }

    #[tokio::test]
    async fn test_push_carries_sync_token() {
        let now = Utc::now();
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(200, handshake_body("sync-1", now + ChronoDuration::hours(1)));
        transport.push(200, json!({"ack_cursor": 1, "conflicts": []}));

        let (client, _clock) = client(Arc::clone(&transport), now);
        let response = client.push(&[]).await.unwrap();
        assert_eq!(response.ack_cursor, 1);

        let requests = transport.requests.lock();
        assert_eq!(requests[0].path, HANDSHAKE_PATH);
        assert_eq!(requests[0].header_value(HEADER_SYNC_TOKEN), None);
        assert_eq!(
            requests[0].header_value(HEADER_AUTHORIZATION),
            Some("Bearer auth-1")
        );
        assert_eq!(requests[1].header_value(HEADER_SYNC_TOKEN), Some("sync-1"));
        assert_eq!(requests[1].header_value(HEADER_DEVICE_ID), Some("device-1"));
    }

    #[tokio::test]
    async fn test_session_reused_until_expiry() {
        let now = Utc::now();
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(200, handshake_body("sync-1", now + ChronoDuration::minutes(5)));
        transport.push(200, json!({"items": [], "oplog": [], "next_cursor": 0}));
        transport.push(200, json!({"items": [], "oplog": [], "next_cursor": 0}));
        transport.push(200, handshake_body("sync-2", now + ChronoDuration::hours(1)));
        transport.push(200, json!({"items": [], "oplog": [], "next_cursor": 0}));

        let (client, clock) = client(Arc::clone(&transport), now);
        client.pull(0, 200).await.unwrap();
        client.pull(0, 200).await.unwrap();

        *clock.0.lock() = now + ChronoDuration::minutes(6);
        client.pull(0, 200).await.unwrap();

        assert_eq!(
            transport.paths(),
            vec![HANDSHAKE_PATH, PULL_PATH, PULL_PATH, HANDSHAKE_PATH, PULL_PATH]
        );
        assert_eq!(client.cached_session().unwrap().token, "sync-2");
    }

    #[tokio::test]
    async fn test_invalid_payload_on_fresh_token_is_not_retried() {
        let now = Utc::now();
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(200, handshake_body("sync-1", now + ChronoDuration::hours(1)));
        transport.push(400, json!({"errorCode": "SYNC_INVALID_PAYLOAD"}));

        let (client, _clock) = client(Arc::clone(&transport), now);
        let err = client.push(&[]).await.unwrap_err();

        assert_eq!(err.error_code(), Some("SYNC_INVALID_PAYLOAD"));
        assert_eq!(err.status(), Some(400));
        assert_eq!(transport.paths(), vec![HANDSHAKE_PATH, PUSH_PATH]);
    }

    #[tokio::test]
    async fn test_invalid_payload_on_cached_token_retries_once() {
        let now = Utc::now();
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(200, handshake_body("sync-1", now + ChronoDuration::hours(1)));
        transport.push(200, json!({"ack_cursor": 1}));
        transport.push(400, json!({"errorCode": "SYNC_INVALID_PAYLOAD"}));
        transport.push(200, handshake_body("sync-2", now + ChronoDuration::hours(1)));
        transport.push(400, json!({"errorCode": "SYNC_INVALID_PAYLOAD"}));

        let (client, _clock) = client(Arc::clone(&transport), now);
        client.push(&[]).await.unwrap();
        let err = client.push(&[]).await.unwrap_err();

        assert!(err.is_invalid_payload());
        assert_eq!(
            transport.paths(),
            vec![HANDSHAKE_PATH, PUSH_PATH, PUSH_PATH, HANDSHAKE_PATH, PUSH_PATH]
        );
        let requests = transport.requests.lock();
        assert_eq!(requests[4].header_value(HEADER_SYNC_TOKEN), Some("sync-2"));
    }

    #[tokio::test]
    async fn test_transport_failure_has_no_code() {
        let transport = Arc::new(ScriptedTransport::default());
        let (client, _clock) = client(Arc::clone(&transport), Utc::now());

        let err = client.get_quotas().await.unwrap_err();
        assert_eq!(err.status(), None);
        assert_eq!(err.error_code(), None);
    }

    #[tokio::test]
    async fn test_quota_call_skips_sync_token() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(200, json!({"storage_bytes_limit": 100}));
        let (client, _clock) = client(Arc::clone(&transport), Utc::now());

        let quotas = client.get_quotas().await.unwrap();
        assert_eq!(quotas["storage_bytes_limit"], 100);
        let requests = transport.requests.lock();
        assert_eq!(requests[0].path, QUOTAS_PATH);
        assert_eq!(requests[0].header_value(HEADER_SYNC_TOKEN), None);
    }

    #[tokio::test]
    async fn test_missing_credentials_are_precondition_errors() {
        let transport = Arc::new(ScriptedTransport::default());
        let client = SessionClient::new(
            transport.clone(),
            Arc::new(StaticCredentials::with_device_only("device-1")),
            Arc::new(crate::schedule::SystemClock),
        );

        let err = client.handshake().await.unwrap_err();
        assert!(matches!(err, SyncError::Precondition(_)));
        assert!(transport.paths().is_empty());
    }

    #[tokio::test]
    async fn test_error_code_snake_case_fallback() {
        let body = json!({"error_code": "QUOTA_STORAGE_EXCEEDED"});
        assert_eq!(
            extract_error_code(&body).as_deref(),
            Some("QUOTA_STORAGE_EXCEEDED")
        );
        assert_eq!(extract_error_code(&json!({"message": "x"})), None);
    }
}
