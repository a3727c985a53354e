//! Sync orchestrator
//!
//! Decides when to push and pull and keeps the persisted status in step.
//!
//! ## Lifecycle
//!
//! ```text
//! start_auto_sync ──> subscribe (store changes, host events)
//!                 ──> periodic pull timer
//!                 ──> startup pull ──ok──> forced full push
//!
//! store change ──> dirty set ──(debounce)──> incremental push
//!                                             │
//!                      conflicts ──> one follow-up pull
//!                      large payloads ──> pending blobs ──(window)──> blob batch push
//!
//! failure ──> consecutive_failures += 1 ──> retry timer (backoff ladder)
//!         ──> paused if blocked (quota/device/auth), error otherwise
//!
//! stop_auto_sync ──> unsubscribe, cancel timers, clear in-memory sets
//! ```
//!
//! Pull and push are each single-flight. Shared state is only touched
//! under a mutex that is never held across an await.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::backoff::BackoffLadder;
use super::flight::{Flight, SingleFlight};
use super::session::SessionClient;
use super::snapshot::{
    apply_pulled_storage_items, build_blob_sync_item, build_deleted_sync_item,
    build_sync_item_from_snapshot, collect_storage_snapshots, is_large_snapshot,
};
use super::wire::{SyncItem, ITEM_TYPE_STORAGE};
use crate::auth::CredentialProvider;
use crate::config::SyncSettings;
use crate::error::{BlockedReason, SyncError, SyncResult};
use crate::events::{HostEvent, HostEvents, SubscriptionId};
use crate::notify::{SyncNotice, SyncNotifier};
use crate::schedule::{with_timeout, Clock, ScheduledTask, Scheduler};
use crate::status::{StatusStore, SyncStatus, SyncStatusState};
use crate::storage::{
    is_plugin_storage, StorageChangeNotifier, StorageRegistry, ALL_PLUGIN_STORAGES,
};

/// Collaborators the orchestrator is built from
pub struct SyncDependencies {
    pub session: SessionClient,
    pub registry: Arc<dyn StorageRegistry>,
    pub changes: Arc<dyn StorageChangeNotifier>,
    pub host_events: Arc<dyn HostEvents>,
    pub status: Arc<dyn StatusStore>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub scheduler: Arc<dyn Scheduler>,
    pub clock: Arc<dyn Clock>,
    pub notifier: Arc<dyn SyncNotifier>,
}

/// Why a pull or push was started, for logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncReason {
    Startup,
    Debounce,
    Periodic,
    Manual,
    AfterConflict,
    Online,
    Retry,
    BlobFlush,
    Shutdown,
}

impl SyncReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncReason::Startup => "startup",
            SyncReason::Debounce => "debounce",
            SyncReason::Periodic => "periodic",
            SyncReason::Manual => "manual",
            SyncReason::AfterConflict => "after-conflict",
            SyncReason::Online => "online",
            SyncReason::Retry => "retry",
            SyncReason::BlobFlush => "blob-flush",
            SyncReason::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for SyncReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    /// Sync is switched off in the status state
    Disabled,
    /// Auth token or device id could not be resolved
    MissingCredentials,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    Logout,
    UserDisabled,
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushKind {
    /// Dirty stores only; large payloads are deferred
    Incremental,
    /// Every store, pending blobs and the plugin delete diff
    Forced,
    /// Deferred large payloads only
    BlobBatch,
}

impl PushKind {
    /// Whether a finished push of this kind also did the work `wanted` asks for
    fn covers(self, wanted: PushKind) -> bool {
        self == wanted
            || (self == PushKind::Forced
                && matches!(wanted, PushKind::Incremental | PushKind::BlobBatch))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullOutcome {
    pub pages: u32,
    pub applied: usize,
    pub cursor: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOutcome {
    pub upserts: usize,
    pub deletes: usize,
    pub blobs_uploaded: usize,
    pub deferred: usize,
    pub ack_cursor: Option<u64>,
    pub conflicts: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualSyncOutcome {
    pub pull: PullOutcome,
    pub push: PushOutcome,
}

#[derive(Debug, Clone, Copy)]
enum TimerSlot {
    PushDebounce,
    PeriodicPull,
    PullRetry,
    PushRetry,
    BlobFlush,
    ConflictPull,
}

#[derive(Debug, Clone, Copy)]
enum TimerAction {
    Pull(SyncReason),
    Push(PushKind, SyncReason),
}

#[derive(Default)]
struct Timers {
    push_debounce: Option<ScheduledTask>,
    periodic_pull: Option<ScheduledTask>,
    pull_retry: Option<ScheduledTask>,
    push_retry: Option<ScheduledTask>,
    blob_flush: Option<ScheduledTask>,
    conflict_pull: Option<ScheduledTask>,
}

impl Timers {
    fn slot_mut(&mut self, slot: TimerSlot) -> &mut Option<ScheduledTask> {
        match slot {
            TimerSlot::PushDebounce => &mut self.push_debounce,
            TimerSlot::PeriodicPull => &mut self.periodic_pull,
            TimerSlot::PullRetry => &mut self.pull_retry,
            TimerSlot::PushRetry => &mut self.push_retry,
            TimerSlot::BlobFlush => &mut self.blob_flush,
            TimerSlot::ConflictPull => &mut self.conflict_pull,
        }
    }

    fn is_pending(&mut self, slot: TimerSlot) -> bool {
        self.slot_mut(slot)
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    fn cancel_all(&mut self) {
        for slot in [
            TimerSlot::PushDebounce,
            TimerSlot::PeriodicPull,
            TimerSlot::PullRetry,
            TimerSlot::PushRetry,
            TimerSlot::BlobFlush,
            TimerSlot::ConflictPull,
        ] {
            if let Some(task) = self.slot_mut(slot).take() {
                task.cancel();
            }
        }
    }
}

#[derive(Default)]
struct EngineState {
    running: bool,
    /// Dirty store name -> generation of its latest mark
    dirty: BTreeMap<String, u64>,
    generation: u64,
    /// Large snapshots waiting for a blob batch push
    pending_blobs: BTreeSet<String>,
    /// Plugin stores known to exist remotely, for delete diffing
    known_plugin_names: BTreeSet<String>,
    change_subscription: Option<SubscriptionId>,
    host_subscription: Option<SubscriptionId>,
    timers: Timers,
}

impl EngineState {
    fn queue_depth(&self) -> usize {
        let deferred_only = self
            .pending_blobs
            .iter()
            .filter(|name| !self.dirty.contains_key(*name))
            .count();
        self.dirty.len() + deferred_only
    }

    fn mark(&mut self, name: &str) {
        self.generation += 1;
        self.dirty.insert(name.to_string(), self.generation);
    }
}

/// Names a push covers, with the dirty generations seen when it started
struct PushScope {
    names: Vec<String>,
    captured: BTreeMap<String, u64>,
    diff_plugins: bool,
}

/// What happened while building and sending one push batch
#[derive(Default)]
struct PushReport {
    outcome: PushOutcome,
    /// Stores whose current content reached the server
    sent: BTreeSet<String>,
    deferred: BTreeSet<String>,
    failed_blobs: BTreeSet<String>,
    first_blob_error: Option<SyncError>,
    present_plugins: Option<BTreeSet<String>>,
}

/// Schedules and runs pushes and pulls for one sync session
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    session: SessionClient,
    registry: Arc<dyn StorageRegistry>,
    changes: Arc<dyn StorageChangeNotifier>,
    host_events: Arc<dyn HostEvents>,
    status: Arc<dyn StatusStore>,
    credentials: Arc<dyn CredentialProvider>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn SyncNotifier>,
    settings: SyncSettings,
    backoff: BackoffLadder,
    state: Mutex<EngineState>,
    pull_flight: SingleFlight<PullOutcome>,
    push_flight: SingleFlight<(PushKind, PushOutcome)>,
}

impl SyncOrchestrator {
    pub fn new(deps: SyncDependencies, settings: SyncSettings) -> Self {
        let backoff = BackoffLadder::new(settings.backoff());
        Self {
            inner: Arc::new(Inner {
                session: deps.session,
                registry: deps.registry,
                changes: deps.changes,
                host_events: deps.host_events,
                status: deps.status,
                credentials: deps.credentials,
                scheduler: deps.scheduler,
                clock: deps.clock,
                notifier: deps.notifier,
                settings,
                backoff,
                state: Mutex::new(EngineState::default()),
                pull_flight: SingleFlight::new(),
                push_flight: SingleFlight::new(),
            }),
        }
    }

    pub fn session(&self) -> &SessionClient {
        &self.inner.session
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    pub fn status(&self) -> SyncResult<SyncStatusState> {
        self.inner.status.load()
    }

    /// Dirty store names, in order
    pub fn dirty_names(&self) -> Vec<String> {
        self.inner.state.lock().dirty.keys().cloned().collect()
    }

    pub fn pending_blob_names(&self) -> Vec<String> {
        self.inner.state.lock().pending_blobs.iter().cloned().collect()
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.state.lock().queue_depth()
    }

    /// Begin automatic sync
    ///
    /// Idempotent. A disabled subscription or unresolvable credentials
    /// leave the status `paused` and return without subscribing. On start
    /// the startup pull runs (bounded by the startup timeout) and, only if
    /// it succeeds, a forced full push follows.
    pub async fn start_auto_sync(&self) -> SyncResult<StartOutcome> {
        let inner = &self.inner;
        if inner.state.lock().running {
            return Ok(StartOutcome::AlreadyRunning);
        }

        let status = inner.status.load()?;
        if !status.enabled {
            tracing::info!("Cloud sync is disabled, not starting");
            inner.status.update(&mut |s| s.status = SyncStatus::Paused)?;
            return Ok(StartOutcome::Disabled);
        }

        if let Err(err) = inner
            .credentials
            .auth_token()
            .and_then(|_| inner.credentials.device_id())
        {
            tracing::warn!(error = %err, "Cloud sync credentials unavailable, not starting");
            let message = err.to_string();
            inner.status.update(&mut |s| {
                s.status = SyncStatus::Paused;
                s.blocked_reason = BlockedReason::Auth;
                s.last_error = Some(message.clone());
            })?;
            return Ok(StartOutcome::MissingCredentials);
        }

        {
            let mut state = inner.state.lock();
            if state.running {
                return Ok(StartOutcome::AlreadyRunning);
            }
            state.running = true;
        }

        let weak = Arc::downgrade(inner);
        let change_id = inner.changes.subscribe(Arc::new(move |name: &str| {
            if let Some(inner) = weak.upgrade() {
                inner.mark_dirty(name);
            }
        }));
        let weak = Arc::downgrade(inner);
        let host_id = inner.host_events.subscribe(Arc::new(move |event: &HostEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.on_host_event(*event);
            }
        }));

        {
            let mut state = inner.state.lock();
            state.change_subscription = Some(change_id);
            state.host_subscription = Some(host_id);
            inner.schedule_periodic_pull(&mut state);
        }
        tracing::info!("Cloud sync started");

        let startup_pull = with_timeout(
            inner.settings.startup_pull_timeout(),
            "startup pull",
            inner.pull(SyncReason::Startup),
        )
        .await;

        match startup_pull {
            Ok(outcome) => {
                tracing::debug!(applied = outcome.applied, "Startup pull complete");
                let push = with_timeout(
                    inner.settings.sync_timeout(),
                    "startup push",
                    inner.push(PushKind::Forced, SyncReason::Startup),
                )
                .await;
                if let Err(err) = push {
                    tracing::debug!(error = %err, "Startup push did not complete");
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "Startup pull failed, skipping startup push");
            }
        }

        Ok(StartOutcome::Started)
    }

    /// Record a local change and (re)arm the debounced push
    pub fn mark_storage_dirty(&self, name: &str) {
        self.inner.mark_dirty(name);
    }

    /// Pull remote changes; joins a pull already in flight
    pub async fn perform_pull(&self, reason: SyncReason) -> SyncResult<PullOutcome> {
        self.inner.pull(reason).await
    }

    /// Push local changes; joins a push already in flight
    ///
    /// `force_all` pushes every store instead of the dirty set and does not
    /// defer large payloads.
    pub async fn perform_push(&self, reason: SyncReason, force_all: bool) -> SyncResult<PushOutcome> {
        let kind = if force_all {
            PushKind::Forced
        } else {
            PushKind::Incremental
        };
        self.inner.push(kind, reason).await
    }

    /// Pull then force-push right away, each bounded by the sync timeout
    pub async fn trigger_manual_sync(&self) -> SyncResult<ManualSyncOutcome> {
        let inner = &self.inner;
        if !inner.status.load()?.enabled {
            return Err(SyncError::Precondition("cloud sync is disabled".into()));
        }

        let timeout = inner.settings.sync_timeout();
        let pull = with_timeout(timeout, "manual pull", inner.pull(SyncReason::Manual)).await?;
        let push = with_timeout(
            timeout,
            "manual push",
            inner.push(PushKind::Forced, SyncReason::Manual),
        )
        .await?;
        Ok(ManualSyncOutcome { pull, push })
    }

    /// Force-push everything before the host exits
    ///
    /// Bounded by the shutdown flush timeout; a timed-out push keeps
    /// running in the background for as long as the runtime lives.
    pub async fn flush_before_shutdown(&self) -> SyncResult<PushOutcome> {
        self.inner.flush().await
    }

    /// Stop automatic sync
    ///
    /// Logout and user-disable also pause the status and clear the next
    /// pull time; logout drops the cached session.
    pub fn stop_auto_sync(&self, reason: StopReason) {
        let inner = &self.inner;
        let (change_id, host_id) = {
            let mut state = inner.state.lock();
            state.running = false;
            state.dirty.clear();
            state.pending_blobs.clear();
            state.known_plugin_names.clear();
            state.timers.cancel_all();
            (
                state.change_subscription.take(),
                state.host_subscription.take(),
            )
        };

        if let Some(id) = change_id {
            inner.changes.unsubscribe(id);
        }
        if let Some(id) = host_id {
            inner.host_events.unsubscribe(id);
        }

        let pause = matches!(reason, StopReason::Logout | StopReason::UserDisabled);
        inner.update_status(|s| {
            s.queue_depth = 0;
            if pause {
                s.status = SyncStatus::Paused;
                s.next_pull_at = None;
            }
        });

        if reason == StopReason::Logout {
            inner.session.clear_session();
        }
        tracing::info!(?reason, "Cloud sync stopped");
    }
}

impl Inner {
    fn pull(self: &Arc<Self>, reason: SyncReason) -> Flight<PullOutcome> {
        let inner = Arc::clone(self);
        self.pull_flight
            .run(move || async move { inner.run_pull(reason).await })
    }

    /// Push, joining a running push when there is one
    ///
    /// A joined push of another kind may have skipped what this caller
    /// asked for (deferred blobs, the full store list), so that case
    /// pushes once more after it.
    async fn push(self: &Arc<Self>, kind: PushKind, reason: SyncReason) -> SyncResult<PushOutcome> {
        let (ran, outcome) = self.join_push(kind, reason).await?;
        if ran.covers(kind) {
            return Ok(outcome);
        }
        tracing::debug!(?kind, ?ran, %reason, "Joined push did not cover request, pushing again");
        self.join_push(kind, reason).await.map(|(_, outcome)| outcome)
    }

    fn join_push(
        self: &Arc<Self>,
        kind: PushKind,
        reason: SyncReason,
    ) -> Flight<(PushKind, PushOutcome)> {
        let inner = Arc::clone(self);
        self.push_flight.run(move || async move {
            inner
                .run_push(kind, reason)
                .await
                .map(|outcome| (kind, outcome))
        })
    }

    async fn flush(self: &Arc<Self>) -> SyncResult<PushOutcome> {
        with_timeout(
            self.settings.shutdown_flush_timeout(),
            "shutdown flush",
            self.push(PushKind::Forced, SyncReason::Shutdown),
        )
        .await
    }

    fn mark_dirty(self: &Arc<Self>, name: &str) {
        let depth = {
            let mut state = self.state.lock();
            state.mark(name);
            if state.running {
                let delay = self.settings.push_debounce();
                self.schedule_timer(
                    &mut state,
                    TimerSlot::PushDebounce,
                    delay,
                    TimerAction::Push(PushKind::Incremental, SyncReason::Debounce),
                );
            }
            state.queue_depth()
        };
        tracing::debug!(store = %name, queue_depth = depth, "Store marked dirty");
        self.update_status(|s| s.queue_depth = depth);
    }

    fn on_host_event(self: &Arc<Self>, event: HostEvent) {
        if !self.state.lock().running {
            return;
        }

        let inner = Arc::clone(self);
        let work: futures_util::future::BoxFuture<'static, ()> = match event {
            HostEvent::NetworkOnline => Box::pin(async move {
                tracing::info!("Network back online, resuming sync");
                if inner.pull(SyncReason::Online).await.is_err() {
                    return;
                }
                let queued = {
                    let state = inner.state.lock();
                    state.running && !state.dirty.is_empty()
                };
                if queued {
                    if let Err(err) = inner.push(PushKind::Incremental, SyncReason::Online).await {
                        tracing::debug!(error = %err, "Online resume push failed");
                    }
                }
            }),
            HostEvent::BeforeShutdown => Box::pin(async move {
                if let Err(err) = inner.flush().await {
                    tracing::warn!(error = %err, "Shutdown flush did not complete");
                }
            }),
        };
        self.scheduler.schedule(Duration::ZERO, work);
    }

    fn schedule_timer(
        self: &Arc<Self>,
        state: &mut EngineState,
        slot: TimerSlot,
        delay: Duration,
        action: TimerAction,
    ) {
        let weak: Weak<Inner> = Arc::downgrade(self);
        let task = self.scheduler.schedule(
            delay,
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatch(action);
                }
            }),
        );
        if let Some(previous) = state.timers.slot_mut(slot).replace(task) {
            previous.cancel();
        }
    }

    /// Start timer work detached from the timer task
    ///
    /// Timer tasks get cancelled when their slot is re-armed, which may
    /// happen from inside the very pull or push they started.
    fn dispatch(self: &Arc<Self>, action: TimerAction) {
        let inner = Arc::clone(self);
        self.scheduler.schedule(
            Duration::ZERO,
            Box::pin(async move {
                if !inner.state.lock().running {
                    return;
                }
                let result = match action {
                    TimerAction::Pull(reason) => inner.pull(reason).await.map(|_| ()),
                    TimerAction::Push(kind, reason) => inner.push(kind, reason).await.map(|_| ()),
                };
                if let Err(err) = result {
                    tracing::debug!(?action, error = %err, "Scheduled sync failed");
                }
            }),
        );
    }

    fn schedule_periodic_pull(self: &Arc<Self>, state: &mut EngineState) {
        if !state.running {
            return;
        }
        let interval = self.settings.pull_interval();
        self.schedule_timer(
            state,
            TimerSlot::PeriodicPull,
            interval,
            TimerAction::Pull(SyncReason::Periodic),
        );
    }

    async fn run_pull(self: Arc<Self>, reason: SyncReason) -> SyncResult<PullOutcome> {
        tracing::debug!(%reason, "Starting pull");
        self.update_status(|s| s.status = SyncStatus::Syncing);

        let result = self.pull_pages().await;
        let next_pull_at = self.after(self.settings.pull_interval());

        match result {
            Ok(outcome) => {
                let now = self.clock.now();
                self.status.advance_cursor(outcome.cursor)?;
                self.status.update(&mut |s| {
                    s.status = SyncStatus::Idle;
                    s.blocked_reason = BlockedReason::None;
                    s.consecutive_failures = 0;
                    s.last_error = None;
                    s.last_pull_at = Some(now);
                    s.next_pull_at = Some(next_pull_at);
                })?;
                self.schedule_periodic_pull(&mut self.state.lock());
                tracing::info!(
                    %reason,
                    pages = outcome.pages,
                    applied = outcome.applied,
                    cursor = outcome.cursor,
                    "Pull complete"
                );
                Ok(outcome)
            }
            Err(err) => {
                self.schedule_periodic_pull(&mut self.state.lock());
                self.update_status(|s| s.next_pull_at = Some(next_pull_at));
                self.handle_failure(&err, TimerAction::Pull(SyncReason::Retry));
                Err(err)
            }
        }
    }

    /// Fetch and apply pages until a short page or the page cap
    ///
    /// The cursor advances in memory only; it is persisted by the caller
    /// once every page succeeded.
    async fn pull_pages(&self) -> SyncResult<PullOutcome> {
        let limit = self.settings.pull_page_limit;
        let mut cursor = self.status.load()?.cursor;
        let mut outcome = PullOutcome {
            cursor,
            ..PullOutcome::default()
        };
        let mut seen_plugins = BTreeSet::new();

        for _ in 0..self.settings.pull_max_pages.max(1) {
            let page = self.session.pull(cursor, limit).await?;
            let applied =
                apply_pulled_storage_items(self.registry.as_ref(), &page.items, &self.session)
                    .await?;

            seen_plugins.extend(
                page.items
                    .iter()
                    .filter(|item| item.item_type == ITEM_TYPE_STORAGE && !item.is_tombstone())
                    .filter_map(SyncItem::qualified_name)
                    .filter(|name| is_plugin_storage(name)),
            );

            tracing::debug!(
                cursor,
                next_cursor = page.next_cursor,
                items = page.items.len(),
                applied,
                "Pulled page"
            );

            cursor = cursor.max(page.next_cursor);
            outcome.pages += 1;
            outcome.applied += applied;
            outcome.cursor = cursor;

            if page.items.len() < limit as usize {
                break;
            }
        }

        let registry = &self.registry;
        self.state.lock().known_plugin_names.extend(
            seen_plugins
                .into_iter()
                .filter(|name| registry.has_store(name)),
        );
        Ok(outcome)
    }

    fn push_scope(&self, kind: PushKind) -> PushScope {
        let state = self.state.lock();
        let mut names = BTreeSet::new();
        let mut diff_plugins = false;
        let captured = match kind {
            PushKind::Incremental => {
                for name in state.dirty.keys() {
                    if name == ALL_PLUGIN_STORAGES {
                        diff_plugins = true;
                    } else {
                        names.insert(name.clone());
                    }
                }
                state.dirty.clone()
            }
            PushKind::Forced => {
                names.extend(self.registry.names());
                names.extend(state.pending_blobs.iter().cloned());
                diff_plugins = true;
                state.dirty.clone()
            }
            PushKind::BlobBatch => {
                names.extend(state.pending_blobs.iter().cloned());
                BTreeMap::new()
            }
        };

        if diff_plugins {
            names.extend(
                self.registry
                    .names()
                    .into_iter()
                    .filter(|name| is_plugin_storage(name)),
            );
        }

        PushScope {
            names: names.into_iter().collect(),
            captured,
            diff_plugins,
        }
    }

    async fn run_push(self: Arc<Self>, kind: PushKind, reason: SyncReason) -> SyncResult<PushOutcome> {
        let scope = self.push_scope(kind);
        if scope.names.is_empty() && scope.captured.is_empty() && !scope.diff_plugins {
            tracing::debug!(%reason, ?kind, "Nothing to push");
            return Ok(PushOutcome::default());
        }

        tracing::debug!(%reason, ?kind, stores = scope.names.len(), "Starting push");
        self.update_status(|s| s.status = SyncStatus::Syncing);

        match self.send_push(&scope, kind).await {
            Ok(report) => Ok(self.finish_push(&scope, kind, reason, report)),
            Err(err) => {
                if kind == PushKind::Forced {
                    let mut state = self.state.lock();
                    for name in &scope.names {
                        state.mark(name);
                    }
                    if scope.diff_plugins {
                        state.mark(ALL_PLUGIN_STORAGES);
                    }
                }
                let retry_kind = match kind {
                    PushKind::BlobBatch => PushKind::BlobBatch,
                    _ => PushKind::Incremental,
                };
                self.handle_failure(&err, TimerAction::Push(retry_kind, SyncReason::Retry));
                Err(err)
            }
        }
    }

    /// Build the item batch and send it
    ///
    /// A failed blob upload only drops that store from this batch; it is
    /// put back into the pending set and reported after the push.
    async fn send_push(&self, scope: &PushScope, kind: PushKind) -> SyncResult<PushReport> {
        let threshold = self.settings.large_payload_threshold_bytes;
        let now = self.clock.now();
        let mut report = PushReport::default();
        let mut items = Vec::new();

        for snapshot in collect_storage_snapshots(self.registry.as_ref(), &scope.names) {
            let large = is_large_snapshot(&snapshot, threshold);
            if large && kind == PushKind::Incremental {
                tracing::debug!(
                    store = %snapshot.qualified_name,
                    size = snapshot.payload_size,
                    "Deferring large snapshot to blob batch"
                );
                report.deferred.insert(snapshot.qualified_name.clone());
                continue;
            }

            if large {
                let file_name = format!("{}.b64", snapshot.content_hash);
                let upload = self
                    .session
                    .upload_blob(&file_name, snapshot.payload_enc.clone().into_bytes())
                    .await;
                match upload {
                    Ok(blob) => {
                        let op_seq = self.status.next_op_seq()?;
                        items.push(build_blob_sync_item(&snapshot, &blob.blob_id, op_seq, now));
                        report.outcome.blobs_uploaded += 1;
                    }
                    Err(err) => {
                        tracing::warn!(
                            store = %snapshot.qualified_name,
                            error = %err,
                            "Blob upload failed, keeping snapshot queued"
                        );
                        report.failed_blobs.insert(snapshot.qualified_name.clone());
                        report.first_blob_error.get_or_insert(err);
                        continue;
                    }
                }
            } else {
                let op_seq = self.status.next_op_seq()?;
                items.push(build_sync_item_from_snapshot(&snapshot, op_seq, now));
            }
            report.outcome.upserts += 1;
            report.sent.insert(snapshot.qualified_name.clone());
        }

        if scope.diff_plugins {
            let present: BTreeSet<String> = self
                .registry
                .names()
                .into_iter()
                .filter(|name| is_plugin_storage(name))
                .collect();
            let removed: Vec<String> = {
                let state = self.state.lock();
                state
                    .known_plugin_names
                    .difference(&present)
                    .cloned()
                    .collect()
            };
            for name in removed {
                let op_seq = self.status.next_op_seq()?;
                tracing::debug!(store = %name, "Plugin store removed, pushing tombstone");
                items.push(build_deleted_sync_item(&name, op_seq, now));
                report.outcome.deletes += 1;
            }
            report.present_plugins = Some(present);
        }

        report.outcome.deferred = report.deferred.len();
        if items.is_empty() {
            return Ok(report);
        }

        let response = self.session.push(&items).await?;
        report.outcome.ack_cursor = Some(response.ack_cursor);
        report.outcome.conflicts = response.conflicts.len();
        Ok(report)
    }

    fn finish_push(
        self: &Arc<Self>,
        scope: &PushScope,
        kind: PushKind,
        reason: SyncReason,
        report: PushReport,
    ) -> PushOutcome {
        let now = self.clock.now();
        let outcome = report.outcome.clone();
        // A failed blob upload keeps the failure streak going, and its
        // retry timer takes the place of the batch window
        let blob_failed = report.first_blob_error.is_some();

        let depth = {
            let mut state = self.state.lock();
            for (name, generation) in &scope.captured {
                if state.dirty.get(name) == Some(generation) {
                    state.dirty.remove(name);
                }
            }
            for name in &report.sent {
                state.pending_blobs.remove(name);
            }
            state.pending_blobs.extend(report.deferred.iter().cloned());
            state.pending_blobs.extend(report.failed_blobs.iter().cloned());

            match &report.present_plugins {
                Some(present) => state.known_plugin_names = present.clone(),
                None => state.known_plugin_names.extend(
                    report
                        .sent
                        .iter()
                        .filter(|name| is_plugin_storage(name))
                        .cloned(),
                ),
            }

            if outcome.conflicts > 0 {
                self.schedule_timer(
                    &mut state,
                    TimerSlot::ConflictPull,
                    Duration::ZERO,
                    TimerAction::Pull(SyncReason::AfterConflict),
                );
            }

            if state.running
                && !blob_failed
                && !state.pending_blobs.is_empty()
                && !state.timers.is_pending(TimerSlot::BlobFlush)
            {
                let window = self.settings.blob_batch_window();
                self.schedule_timer(
                    &mut state,
                    TimerSlot::BlobFlush,
                    window,
                    TimerAction::Push(PushKind::BlobBatch, SyncReason::BlobFlush),
                );
            }
            state.queue_depth()
        };

        if let Some(ack) = outcome.ack_cursor {
            if let Err(err) = self.status.advance_cursor(ack) {
                tracing::warn!(error = %err, ack, "Cannot persist acknowledged cursor");
            }
        }

        self.update_status(|s| {
            if outcome.ack_cursor.is_some() {
                s.last_push_at = Some(now);
            }
            if !blob_failed {
                s.status = SyncStatus::Idle;
                s.blocked_reason = BlockedReason::None;
                s.consecutive_failures = 0;
                s.last_error = None;
            }
            s.queue_depth = depth;
            if outcome.conflicts > 0 {
                s.last_conflict_at = Some(now);
                s.last_conflict_count = outcome.conflicts;
            }
        });

        if outcome.conflicts > 0 {
            tracing::info!(conflicts = outcome.conflicts, "Push reported conflicts, pulling");
        }
        tracing::info!(
            %reason,
            ?kind,
            upserts = outcome.upserts,
            deletes = outcome.deletes,
            blobs = outcome.blobs_uploaded,
            deferred = outcome.deferred,
            queue_depth = depth,
            "Push complete"
        );

        if let Some(err) = report.first_blob_error {
            self.handle_failure(
                &err,
                TimerAction::Push(PushKind::BlobBatch, SyncReason::Retry),
            );
        }
        outcome
    }

    /// Record a failed pull or push and arm the retry timer
    fn handle_failure(self: &Arc<Self>, err: &SyncError, retry: TimerAction) {
        let blocked = err.blocked_reason();
        let previous = self
            .status
            .load()
            .map(|s| s.blocked_reason)
            .unwrap_or_default();
        let message = err.to_string();

        let failures = self
            .update_status(|s| {
                s.consecutive_failures += 1;
                s.blocked_reason = blocked;
                s.status = if blocked.is_blocked() {
                    SyncStatus::Paused
                } else {
                    SyncStatus::Error
                };
                s.last_error = Some(message.clone());
            })
            .map(|s| s.consecutive_failures)
            .unwrap_or(1);

        let delay = self.backoff.delay_for(failures);
        tracing::warn!(
            error = %err,
            failures,
            blocked = blocked.as_str(),
            retry_in = ?delay,
            "Cloud sync failed"
        );

        {
            let mut state = self.state.lock();
            if state.running {
                let slot = match retry {
                    TimerAction::Pull(_) => TimerSlot::PullRetry,
                    TimerAction::Push(..) => TimerSlot::PushRetry,
                };
                self.schedule_timer(&mut state, slot, delay, retry);
            }
        }

        if blocked.is_blocked() && blocked != previous {
            if let Some(notice) = SyncNotice::for_blocked(blocked, message.clone()) {
                self.notifier.notify(notice);
            }
        }
        if failures == self.settings.failure_notify_threshold {
            self.notifier.notify(SyncNotice::RepeatedFailures {
                count: failures,
                message,
            });
        }
    }

    /// Apply a status change, logging instead of failing
    fn update_status<F>(&self, mut apply: F) -> Option<SyncStatusState>
    where
        F: FnMut(&mut SyncStatusState),
    {
        match self.status.update(&mut apply) {
            Ok(state) => Some(state),
            Err(err) => {
                tracing::warn!(error = %err, "Cannot persist sync status");
                None
            }
        }
    }

    fn after(&self, delay: Duration) -> DateTime<Utc> {
        let delta = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.clock.now() + delta
    }
}
