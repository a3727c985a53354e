//! User-facing sync notices

use crate::error::BlockedReason;

/// Something the user should be told about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotice {
    /// Consecutive failures reached the notify threshold
    RepeatedFailures { count: u32, message: String },
    /// Server refused the write because an account limit was hit
    QuotaExceeded { message: String },
    /// This device is not (or no longer) allowed to sync
    DeviceNotAuthorized { message: String },
    /// The user needs to sign in again
    AuthRequired { message: String },
}

impl SyncNotice {
    /// Notice for entering a blocked state, if the reason is a block
    pub fn for_blocked(reason: BlockedReason, message: impl Into<String>) -> Option<Self> {
        let message = message.into();
        match reason {
            BlockedReason::None => None,
            BlockedReason::Quota => Some(SyncNotice::QuotaExceeded { message }),
            BlockedReason::Device => Some(SyncNotice::DeviceNotAuthorized { message }),
            BlockedReason::Auth => Some(SyncNotice::AuthRequired { message }),
        }
    }

    /// Short actionable text for a toast or log line
    pub fn summary(&self) -> String {
        match self {
            SyncNotice::RepeatedFailures { count, message } => {
                format!("Cloud sync failed {count} times in a row: {message}")
            }
            SyncNotice::QuotaExceeded { .. } => {
                "Cloud storage is full. Remove synced data or upgrade your plan.".to_string()
            }
            SyncNotice::DeviceNotAuthorized { .. } => {
                "This device is not authorized for sync. Approve it from device settings."
                    .to_string()
            }
            SyncNotice::AuthRequired { .. } => {
                "Sign in again to resume cloud sync.".to_string()
            }
        }
    }
}

/// Receives notices raised by the orchestrator
pub trait SyncNotifier: Send + Sync {
    fn notify(&self, notice: SyncNotice);
}

/// Notifier that writes notices to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl SyncNotifier for LogNotifier {
    fn notify(&self, notice: SyncNotice) {
        tracing::warn!(?notice, "{}", notice.summary());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_notices() {
        assert!(SyncNotice::for_blocked(BlockedReason::None, "x").is_none());
        assert!(matches!(
            SyncNotice::for_blocked(BlockedReason::Quota, "full"),
            Some(SyncNotice::QuotaExceeded { .. })
        ));
        assert!(matches!(
            SyncNotice::for_blocked(BlockedReason::Device, "no"),
            Some(SyncNotice::DeviceNotAuthorized { .. })
        ));
    }

    #[test]
    fn test_repeated_failure_summary() {
        let notice = SyncNotice::RepeatedFailures {
            count: 3,
            message: "status 502".into(),
        };
        assert!(notice.summary().contains("3 times"));
    }
}
