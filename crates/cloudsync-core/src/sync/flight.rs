//! Shared in-flight execution
//!
//! `SingleFlight::run` starts the operation only if none is in progress;
//! otherwise the caller joins the running one and gets the same result.
//! The body runs as its own tokio task, so a caller that stops waiting
//! (timeout, dropped future) does not cancel it.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::error::{SyncError, SyncResult};

/// Future handed to every caller of one flight
pub type Flight<T> = Shared<BoxFuture<'static, SyncResult<T>>>;

type Slot<T> = Arc<Mutex<Option<(u64, Flight<T>)>>>;

pub struct SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    slot: Slot<T>,
    generation: AtomicU64,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        }
    }

    /// Join the running flight or start a new one from `start`
    ///
    /// `start` is only called when a new flight begins. Must be called
    /// from inside a tokio runtime.
    pub fn run<F, Fut>(&self, start: F) -> Flight<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<T>> + Send + 'static,
    {
        let mut slot = self.slot.lock();
        if let Some((_, flight)) = slot.as_ref() {
            return flight.clone();
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let body = start();
        let release = Arc::clone(&self.slot);

        let handle = tokio::spawn(async move {
            let result = body.await;
            let mut slot = release.lock();
            if matches!(slot.as_ref(), Some((current, _)) if *current == generation) {
                *slot = None;
            }
            result
        });

        let flight: Flight<T> = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(SyncError::Internal(format!("sync task failed: {e}"))),
            }
        }
        .boxed()
        .shared();

        *slot = Some((generation, flight.clone()));
        flight
    }

    pub fn is_running(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
