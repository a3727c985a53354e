//! Shared test fixtures: an in-process sync server and an orchestrator harness

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};

use cloudsync_core::config::SyncSettings;
use cloudsync_core::events::ManualHostEvents;
use cloudsync_core::notify::{SyncNotice, SyncNotifier};
use cloudsync_core::schedule::{SystemClock, TokioScheduler};
use cloudsync_core::status::{MemoryStatusStore, StatusStore};
use cloudsync_core::storage::MemoryRegistry;
use cloudsync_core::sync::wire::{
    BlobUploadResponse, OplogEntry, PullResponse, PushRequest, PushResponse, SyncItem,
};
use cloudsync_core::sync::{
    HttpRequest, HttpResponse, HttpTransport, Method, RequestBody, SessionClient,
    SyncDependencies, SyncOrchestrator, BLOB_PATH_PREFIX, BLOB_UPLOAD_PATH, HANDSHAKE_PATH,
    HEADER_AUTHORIZATION, HEADER_DEVICE_ID, HEADER_SYNC_TOKEN, PULL_PATH, PUSH_PATH, QUOTAS_PATH,
};
use cloudsync_core::{CredentialProvider, StaticCredentials, SyncResult};

struct ScriptedFailure {
    path: String,
    status: u16,
    code: Option<String>,
}

struct LogRecord {
    cursor: u64,
    device_id: String,
    item: SyncItem,
}

#[derive(Default)]
struct ServerState {
    next_token: u64,
    valid_tokens: BTreeSet<String>,
    cursor: u64,
    log: Vec<LogRecord>,
    next_blob: u64,
    blobs: BTreeMap<String, Vec<u8>>,
    failures: VecDeque<ScriptedFailure>,
    conflicts: VecDeque<Vec<String>>,
    delays: BTreeMap<String, Duration>,
    requests: Vec<HttpRequest>,
}

/// In-process sync server speaking the HTTP API over `HttpTransport`
#[derive(Default)]
pub struct FakeServer {
    state: Mutex<ServerState>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next request to `path` with the given status and code
    pub fn fail_next(&self, path: &str, status: u16, code: Option<&str>) {
        self.state.lock().failures.push_back(ScriptedFailure {
            path: path.to_string(),
            status,
            code: code.map(str::to_string),
        });
    }

    /// Report conflicts for these item ids on the next push
    pub fn conflict_next_push(&self, item_ids: &[&str]) {
        self.state
            .lock()
            .conflicts
            .push_back(item_ids.iter().map(|id| id.to_string()).collect());
    }

    /// Hold responses for `path` for this long (virtual time)
    pub fn set_delay(&self, path: &str, delay: Duration) {
        self.state.lock().delays.insert(path.to_string(), delay);
    }

    pub fn clear_delay(&self, path: &str) {
        self.state.lock().delays.remove(path);
    }

    /// Forget every issued sync token
    pub fn invalidate_tokens(&self) {
        self.state.lock().valid_tokens.clear();
    }

    pub fn count(&self, path: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.path == path)
            .count()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.state.lock().requests.clone()
    }

    pub fn cursor(&self) -> u64 {
        self.state.lock().cursor
    }

    /// Every item accepted by push, in log order
    pub fn pushed_items(&self) -> Vec<SyncItem> {
        self.state
            .lock()
            .log
            .iter()
            .map(|record| record.item.clone())
            .collect()
    }

    /// Latest accepted item for an id
    pub fn latest(&self, item_id: &str) -> Option<SyncItem> {
        self.state
            .lock()
            .log
            .iter()
            .rev()
            .find(|record| record.item.item_id == item_id)
            .map(|record| record.item.clone())
    }

    pub fn blob_count(&self) -> usize {
        self.state.lock().blobs.len()
    }

    fn error(status: u16, code: &str) -> HttpResponse {
        HttpResponse::json(status, &json!({ "errorCode": code, "message": code }))
    }

    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        let mut state = self.state.lock();

        if let Some(index) = state
            .failures
            .iter()
            .position(|failure| failure.path == request.path)
        {
            if let Some(failure) = state.failures.remove(index) {
                let body = match failure.code {
                    Some(code) => json!({ "errorCode": code }),
                    None => json!({ "message": "scripted failure" }),
                };
                return HttpResponse::json(failure.status, &body);
            }
        }

        let authorized = request
            .header_value(HEADER_AUTHORIZATION)
            .map(|value| value.starts_with("Bearer ") && value.len() > 7)
            .unwrap_or(false);
        let device_id = request.header_value(HEADER_DEVICE_ID).unwrap_or_default().to_string();
        if !authorized {
            return Self::error(401, "AUTH_MISSING");
        }
        if device_id.is_empty() {
            return Self::error(403, "DEVICE_NOT_AUTHORIZED");
        }

        if request.path == HANDSHAKE_PATH {
            state.next_token += 1;
            let token = format!("sync-{}", state.next_token);
            state.valid_tokens.insert(token.clone());
            return HttpResponse::json(
                200,
                &json!({
                    "sync_token": token,
                    "sync_token_expires_at": Utc::now() + chrono::Duration::hours(1),
                    "server_cursor": state.cursor,
                    "device_id": device_id,
                    "quotas": { "storage_bytes_limit": 10_000_000 }
                }),
            );
        }

        if request.path == QUOTAS_PATH {
            return HttpResponse::json(200, &json!({ "storage_bytes_limit": 10_000_000 }));
        }

        let token_ok = request
            .header_value(HEADER_SYNC_TOKEN)
            .map(|token| state.valid_tokens.contains(token))
            .unwrap_or(false);
        if !token_ok {
            return Self::error(400, "SYNC_INVALID_PAYLOAD");
        }

        match (request.method, request.path.as_str()) {
            (Method::Post, PUSH_PATH) => Self::push(&mut state, &device_id, &request.body),
            (Method::Get, PULL_PATH) => Self::pull(&state, request),
            (Method::Post, BLOB_UPLOAD_PATH) => match &request.body {
                RequestBody::Multipart { field, bytes, .. } if field == "file" => {
                    state.next_blob += 1;
                    let blob_id = format!("blob-{}", state.next_blob);
                    state.blobs.insert(blob_id.clone(), bytes.clone());
                    let response = BlobUploadResponse {
                        blob_id: blob_id.clone(),
                        object_key: Some(format!("objects/{}", blob_id)),
                        sha256: None,
                        size_bytes: bytes.len() as u64,
                    };
                    HttpResponse::json(200, &serde_json::to_value(response).unwrap())
                }
                _ => Self::error(400, "SYNC_INVALID_PAYLOAD"),
            },
            (Method::Get, path) if path.starts_with(BLOB_PATH_PREFIX) => {
                let blob_id = &path[BLOB_PATH_PREFIX.len()..];
                match state.blobs.get(blob_id) {
                    Some(bytes) => HttpResponse {
                        status: 200,
                        body: bytes.clone(),
                    },
                    None => Self::error(404, "BLOB_NOT_FOUND"),
                }
            }
            _ => Self::error(404, "NOT_FOUND"),
        }
    }

    fn push(state: &mut ServerState, device_id: &str, body: &RequestBody) -> HttpResponse {
        let RequestBody::Json(value) = body else {
            return Self::error(400, "SYNC_INVALID_PAYLOAD");
        };
        let Ok(request) = serde_json::from_value::<PushRequest>(value.clone()) else {
            return Self::error(400, "SYNC_INVALID_PAYLOAD");
        };

        for item in &request.items {
            let has_inline = item.payload_enc.is_some();
            let has_ref = item.payload_ref.is_some();
            if item.deleted_at.is_none() && has_inline == has_ref {
                return Self::error(400, "SYNC_INVALID_PAYLOAD");
            }
        }

        for item in request.items {
            state.cursor += 1;
            let cursor = state.cursor;
            state.log.push(LogRecord {
                cursor,
                device_id: device_id.to_string(),
                item,
            });
        }

        let conflicts: Vec<Value> = state
            .conflicts
            .pop_front()
            .unwrap_or_default()
            .into_iter()
            .map(|item_id| json!({ "item_id": item_id, "reason": "stale_op_seq" }))
            .collect();
        let response = PushResponse {
            ack_cursor: state.cursor,
            conflicts: serde_json::from_value(Value::Array(conflicts)).unwrap(),
        };
        HttpResponse::json(200, &serde_json::to_value(response).unwrap())
    }

    fn pull(state: &ServerState, request: &HttpRequest) -> HttpResponse {
        let cursor: u64 = request
            .query_value("cursor")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let limit: usize = request
            .query_value("limit")
            .and_then(|v| v.parse().ok())
            .unwrap_or(200);

        let page: Vec<&LogRecord> = state
            .log
            .iter()
            .filter(|record| record.cursor > cursor)
            .take(limit)
            .collect();

        let response = PullResponse {
            items: page.iter().map(|record| record.item.clone()).collect(),
            oplog: page
                .iter()
                .map(|record| OplogEntry {
                    cursor: record.cursor,
                    item_id: record.item.item_id.clone(),
                    op_seq: record.item.op_seq,
                    op_hash: record.item.op_hash.clone(),
                    op_type: record.item.op_type,
                    updated_at: record.item.updated_at,
                    device_id: record.device_id.clone(),
                })
                .collect(),
            next_cursor: page.last().map(|record| record.cursor).unwrap_or(cursor),
        };
        HttpResponse::json(200, &serde_json::to_value(response).unwrap())
    }
}

#[async_trait]
impl HttpTransport for FakeServer {
    async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        let delay = {
            let mut state = self.state.lock();
            state.requests.push(request.clone());
            state.delays.get(&request.path).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.handle(&request))
    }
}

/// Notifier that keeps every notice
#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<SyncNotice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<SyncNotice> {
        self.notices.lock().clone()
    }
}

impl SyncNotifier for RecordingNotifier {
    fn notify(&self, notice: SyncNotice) {
        self.notices.lock().push(notice);
    }
}

/// One device: an orchestrator wired to in-memory collaborators
pub struct Harness {
    pub orchestrator: SyncOrchestrator,
    pub registry: Arc<MemoryRegistry>,
    pub status: Arc<dyn StatusStore>,
    pub host: Arc<ManualHostEvents>,
    pub notices: Arc<RecordingNotifier>,
    pub server: Arc<FakeServer>,
}

pub struct HarnessBuilder {
    server: Arc<FakeServer>,
    settings: SyncSettings,
    status: Arc<dyn StatusStore>,
    credentials: Arc<dyn CredentialProvider>,
    registry: Arc<MemoryRegistry>,
}

impl HarnessBuilder {
    pub fn settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn status(mut self, status: Arc<dyn StatusStore>) -> Self {
        self.status = status;
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn device(mut self, device_id: &str) -> Self {
        self.credentials = Arc::new(StaticCredentials::new("auth-token", device_id));
        self
    }

    pub fn build(self) -> Harness {
        let clock = Arc::new(SystemClock);
        let host = Arc::new(ManualHostEvents::new());
        let notices = Arc::new(RecordingNotifier::default());
        let session = SessionClient::new(
            self.server.clone(),
            Arc::clone(&self.credentials),
            clock.clone(),
        );

        let deps = SyncDependencies {
            session,
            registry: self.registry.clone(),
            changes: self.registry.clone(),
            host_events: host.clone(),
            status: Arc::clone(&self.status),
            credentials: self.credentials,
            scheduler: Arc::new(TokioScheduler::current()),
            clock,
            notifier: notices.clone(),
        };

        Harness {
            orchestrator: SyncOrchestrator::new(deps, self.settings),
            registry: self.registry,
            status: self.status,
            host,
            notices,
            server: self.server,
        }
    }
}

impl Harness {
    pub fn builder(server: &Arc<FakeServer>) -> HarnessBuilder {
        HarnessBuilder {
            server: Arc::clone(server),
            settings: SyncSettings::default(),
            status: Arc::new(MemoryStatusStore::enabled()),
            credentials: Arc::new(StaticCredentials::new("auth-token", "device-a")),
            registry: Arc::new(MemoryRegistry::new()),
        }
    }

    pub fn new(server: &Arc<FakeServer>) -> Harness {
        Self::builder(server).build()
    }
}

/// Let virtual time pass and every woken task run
pub async fn advance(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
    settle().await;
}

/// Run ready tasks without moving the clock much
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
