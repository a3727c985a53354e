//! Two devices syncing through the same in-process server

mod common;

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use cloudsync_core::events::ManualHostEvents;
use cloudsync_core::notify::LogNotifier;
use cloudsync_core::schedule::{SystemClock, TokioScheduler};
use cloudsync_core::status::{JsonStatusStore, MemoryStatusStore, StatusStore};
use cloudsync_core::storage::{DirectoryRegistry, StorageRegistry};
use cloudsync_core::sync::{SyncReason, PULL_PATH};
use cloudsync_core::{
    SessionClient, StaticCredentials, SyncDependencies, SyncOrchestrator, SyncSettings,
};

use common::{FakeServer, Harness};

#[tokio::test(start_paused = true)]
async fn test_large_store_travels_as_blob() {
    let server = FakeServer::new();
    let settings = SyncSettings {
        large_payload_threshold_bytes: 256,
        ..SyncSettings::default()
    };
    let history = json!((0..200).map(|i| format!("entry-{i}")).collect::<Vec<_>>());

    let a = Harness::builder(&server)
        .device("device-a")
        .settings(settings.clone())
        .build();
    a.registry.set("history", history.clone());
    let pushed = a
        .orchestrator
        .perform_push(SyncReason::Manual, true)
        .await
        .unwrap();
    assert_eq!(pushed.blobs_uploaded, 1);

    let b = Harness::builder(&server)
        .device("device-b")
        .settings(settings)
        .build();
    b.registry.set("history", json!([]));
    let pulled = b.orchestrator.perform_pull(SyncReason::Manual).await.unwrap();

    assert_eq!(pulled.applied, 1);
    assert_eq!(b.registry.value("history"), Some(history));
}

#[tokio::test(start_paused = true)]
async fn test_repeated_pull_is_idempotent() {
    let server = FakeServer::new();
    let a = Harness::builder(&server).device("device-a").build();
    a.registry.set("settings", json!({"theme": "dark"}));
    a.registry.set("shortcuts", json!({"copy": "ctrl+c"}));
    a.orchestrator
        .perform_push(SyncReason::Manual, true)
        .await
        .unwrap();

    let b = Harness::builder(&server).device("device-b").build();
    b.registry.set("settings", json!({}));
    b.registry.set("shortcuts", json!({}));

    let first = b.orchestrator.perform_pull(SyncReason::Manual).await.unwrap();
    assert_eq!(first.applied, 2);
    assert_eq!(first.cursor, 2);
    let settings = b.registry.value("settings");
    let shortcuts = b.registry.value("shortcuts");

    b.status.update(&mut |s| s.cursor = 0).unwrap();
    let second = b.orchestrator.perform_pull(SyncReason::Manual).await.unwrap();
    assert_eq!(second.applied, 2);
    assert_eq!(b.registry.value("settings"), settings);
    assert_eq!(b.registry.value("shortcuts"), shortcuts);
    assert_eq!(settings, Some(json!({"theme": "dark"})));
}

#[tokio::test(start_paused = true)]
async fn test_cursor_never_moves_backwards() {
    let server = FakeServer::new();
    let a = Harness::builder(&server).device("device-a").build();
    a.registry.set("settings", json!({"v": 1}));
    a.orchestrator
        .perform_push(SyncReason::Manual, true)
        .await
        .unwrap();

    let b = Harness::builder(&server).device("device-b").build();
    let mut previous = 0;
    for _ in 0..3 {
        let outcome = b.orchestrator.perform_pull(SyncReason::Manual).await.unwrap();
        assert!(outcome.cursor >= previous);
        previous = outcome.cursor;
    }
    assert_eq!(b.status.load().unwrap().cursor, 1);
    assert_eq!(server.count(PULL_PATH), 3);
}

#[tokio::test(start_paused = true)]
async fn test_op_seq_survives_restart() {
    let server = FakeServer::new();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sync_status.json");

    let status = Arc::new(JsonStatusStore::open(&path).unwrap());
    status.update(&mut |s| s.enabled = true).unwrap();
    let first = Harness::builder(&server).status(status).build();
    first.registry.set("one", json!(1));
    first.registry.set("two", json!(2));
    first
        .orchestrator
        .perform_push(SyncReason::Manual, true)
        .await
        .unwrap();
    drop(first);

    let status = Arc::new(JsonStatusStore::open(&path).unwrap());
    let second = Harness::builder(&server).status(status).build();
    second.registry.set("three", json!(3));
    second
        .orchestrator
        .perform_push(SyncReason::Manual, true)
        .await
        .unwrap();

    let seqs: Vec<u64> = server.pushed_items().iter().map(|i| i.op_seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert_eq!(second.status.load().unwrap().op_seq, 3);
}

#[tokio::test(start_paused = true)]
async fn test_directory_registry_receives_new_stores() {
    let server = FakeServer::new();
    let a = Harness::builder(&server).device("device-a").build();
    a.registry.set("plugin:clip:pins", json!(["pinned"]));
    a.orchestrator
        .perform_push(SyncReason::Manual, true)
        .await
        .unwrap();

    let dir = TempDir::new().unwrap();
    let registry = Arc::new(DirectoryRegistry::open(dir.path().join("stores")).unwrap());
    let credentials = Arc::new(StaticCredentials::new("auth-token", "device-b"));
    let clock = Arc::new(SystemClock);
    let deps = SyncDependencies {
        session: SessionClient::new(server.clone(), credentials.clone(), clock.clone()),
        registry: registry.clone(),
        changes: registry.clone(),
        host_events: Arc::new(ManualHostEvents::new()),
        status: Arc::new(MemoryStatusStore::enabled()),
        credentials,
        scheduler: Arc::new(TokioScheduler::current()),
        clock,
        notifier: Arc::new(LogNotifier),
    };
    let b = SyncOrchestrator::new(deps, SyncSettings::default());

    let outcome = b.perform_pull(SyncReason::Manual).await.unwrap();
    assert_eq!(outcome.applied, 1);
    assert_eq!(
        registry.get("plugin:clip:pins").unwrap(),
        Some(json!(["pinned"]))
    );
    assert!(dir.path().join("stores").join("plugin~clip~pins.json").exists());
}
