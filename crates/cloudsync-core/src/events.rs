//! Subscription plumbing for host and storage events
//!
//! The engine never reaches for ambient process events. Hosts hand it a
//! `HostEvents` source (network came back, app is about to quit) and the
//! storage registry hands it a change notifier; both use `Listeners`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Handle returned by `subscribe`, used to unsubscribe
pub type SubscriptionId = u64;

/// A registered callback
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Set of callbacks keyed by subscription id
pub struct Listeners<T: ?Sized> {
    next_id: AtomicU64,
    entries: RwLock<BTreeMap<SubscriptionId, Listener<T>>>,
}

impl<T: ?Sized> Listeners<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn add(&self, listener: Listener<T>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries.write().insert(id, listener);
        id
    }

    /// Returns false if the id was not subscribed
    pub fn remove(&self, id: SubscriptionId) -> bool {
        self.entries.write().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every listener
    ///
    /// The lock is released before callbacks run, so a listener may
    /// subscribe or unsubscribe without deadlocking.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Listener<T>> = self.entries.read().values().cloned().collect();
        for listener in snapshot {
            listener(value);
        }
    }
}

impl<T: ?Sized> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-level events the orchestrator reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// Network connectivity was restored
    NetworkOnline,
    /// The host is about to shut down; flush what we can
    BeforeShutdown,
}

/// Source of network-availability and pre-shutdown events
pub trait HostEvents: Send + Sync {
    fn subscribe(&self, listener: Listener<HostEvent>) -> SubscriptionId;
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Host event source driven by explicit `emit` calls
///
/// Used by hosts with no event source of their own, and by tests.
#[derive(Default)]
pub struct ManualHostEvents {
    listeners: Listeners<HostEvent>,
}

impl ManualHostEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: HostEvent) {
        self.listeners.emit(&event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }
}

impl HostEvents for ManualHostEvents {
    fn subscribe(&self, listener: Listener<HostEvent>) -> SubscriptionId {
        self.listeners.add(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.remove(id);
    }
}
