//! Time and delayed work
//!
//! Timers are owned by a `Scheduler` strategy rather than spawned ad hoc,
//! and "now" comes from a `Clock`. Under `tokio::time::pause` the default
//! `TokioScheduler` runs on virtual time, which is how the orchestrator's
//! debounce and backoff are tested.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::{SyncError, SyncResult};

/// Source of wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Handle to delayed work
///
/// Dropping the handle does not cancel the task; call `cancel`.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn from_handle(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Runs a future after a delay
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> ScheduledTask;
}

/// Scheduler backed by `tokio::time::sleep`
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Capture the current runtime
    ///
    /// Must be called from inside a tokio runtime.
    pub fn current() -> Self {
        Self {
            handle: Handle::current(),
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> ScheduledTask {
        let handle = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        ScheduledTask::from_handle(handle)
    }
}

/// Race an operation against a deadline
///
/// On timeout only the caller's wait ends. Operations that were spawned
/// (single-flight pulls and pushes) keep running and may still update
/// state afterwards.
pub async fn with_timeout<T, F>(after: Duration, operation: &'static str, fut: F) -> SyncResult<T>
where
    F: Future<Output = SyncResult<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation, ?after, "Sync operation timed out");
            Err(SyncError::Timeout { operation, after })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_task_runs_after_delay() {
        let scheduler = TokioScheduler::current();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let _task = scheduler.schedule(
            Duration::from_secs(10),
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_task_never_runs() {
        let scheduler = TokioScheduler::current();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let task = scheduler.schedule(
            Duration::from_secs(5),
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        task.cancel();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout() {
        let ok = with_timeout(Duration::from_secs(1), "quick", async { Ok::<_, SyncError>(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let slow = with_timeout(Duration::from_secs(1), "slow", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, SyncError>(())
        })
        .await;
        let err = slow.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("slow"));
    }
}
