//! Persisted sync status
//!
//! The orchestrator does not own its durable state. It reads and mutates a
//! `SyncStatusState` through a `StatusStore`, which the host persists for
//! the lifetime of the user's sync subscription.
//!
//! Two invariants are enforced by the accessors rather than by callers:
//! - `cursor` never decreases (`advance_cursor` keeps the maximum)
//! - `op_seq` is handed out exactly once per local mutation and the
//!   counter is persisted before the value is returned

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{BlockedReason, SyncError, SyncResult};
use crate::storage::atomic_write;

/// Externally visible sync status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Paused,
    Error,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Paused => "paused",
            SyncStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Durable state of the user's sync subscription
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncStatusState {
    pub enabled: bool,
    pub cursor: u64,
    pub op_seq: u64,
    pub status: SyncStatus,
    pub queue_depth: usize,
    pub blocked_reason: BlockedReason,
    pub consecutive_failures: u32,
    pub next_pull_at: Option<DateTime<Utc>>,
    pub last_conflict_at: Option<DateTime<Utc>>,
    pub last_conflict_count: usize,
    pub last_error: Option<String>,
    pub last_pull_at: Option<DateTime<Utc>>,
    pub last_push_at: Option<DateTime<Utc>>,
}

/// Typed access to the persisted status state
pub trait StatusStore: Send + Sync {
    fn load(&self) -> SyncResult<SyncStatusState>;

    /// Apply a mutation and persist it; returns the state after the change
    fn update(&self, apply: &mut dyn FnMut(&mut SyncStatusState)) -> SyncResult<SyncStatusState>;

    /// Move the cursor forward, never backward; returns the stored cursor
    fn advance_cursor(&self, cursor: u64) -> SyncResult<u64> {
        let state = self.update(&mut |s| s.cursor = s.cursor.max(cursor))?;
        Ok(state.cursor)
    }

    /// Allocate the next operation sequence number
    fn next_op_seq(&self) -> SyncResult<u64> {
        let state = self.update(&mut |s| s.op_seq += 1)?;
        Ok(state.op_seq)
    }
}

/// Status store kept only in memory
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    state: Mutex<SyncStatusState>,
}

impl MemoryStatusStore {
    pub fn new(state: SyncStatusState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// A store with sync already switched on
    pub fn enabled() -> Self {
        Self::new(SyncStatusState {
            enabled: true,
            ..SyncStatusState::default()
        })
    }
}

impl StatusStore for MemoryStatusStore {
    fn load(&self) -> SyncResult<SyncStatusState> {
        Ok(self.state.lock().clone())
    }

    fn update(&self, apply: &mut dyn FnMut(&mut SyncStatusState)) -> SyncResult<SyncStatusState> {
        let mut state = self.state.lock();
        apply(&mut state);
        Ok(state.clone())
    }
}

/// Status store persisted as a JSON file
///
/// The state is cached in memory and written through atomically on every
/// update.
#[derive(Debug)]
pub struct JsonStatusStore {
    path: PathBuf,
    state: Mutex<SyncStatusState>,
}

impl JsonStatusStore {
    /// Open the status file, creating default state if it does not exist
    ///
    /// A file that cannot be parsed is moved aside to `<path>.corrupt` and
    /// replaced with defaults.
    pub fn open(path: impl Into<PathBuf>) -> SyncResult<Self> {
        let path = path.into();
        let state = if path.exists() {
            Self::read(&path)?
        } else {
            SyncStatusState::default()
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(path: &Path) -> SyncResult<SyncStatusState> {
        let content = fs::read_to_string(path)
            .map_err(|e| SyncError::StatusStore(format!("{}: {}", path.display(), e)))?;

        match serde_json::from_str(&content) {
            Ok(state) => Ok(state),
            Err(e) => {
                let backup = path.with_extension("json.corrupt");
                tracing::warn!(
                    path = %path.display(),
                    backup = %backup.display(),
                    error = %e,
                    "Sync status file is corrupt, starting from defaults"
                );
                fs::rename(path, &backup)
                    .map_err(|e| SyncError::StatusStore(format!("{}: {}", path.display(), e)))?;
                Ok(SyncStatusState::default())
            }
        }
    }

    fn write(&self, state: &SyncStatusState) -> SyncResult<()> {
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| SyncError::StatusStore(e.to_string()))?;
        atomic_write(&self.path, &json).map_err(|e| SyncError::StatusStore(e.to_string()))
    }
}

impl StatusStore for JsonStatusStore {
    fn load(&self) -> SyncResult<SyncStatusState> {
        Ok(self.state.lock().clone())
    }

    fn update(&self, apply: &mut dyn FnMut(&mut SyncStatusState)) -> SyncResult<SyncStatusState> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        apply(&mut next);
        self.write(&next)?;
        *state = next;
        Ok(state.clone())
    }
}
