//! User-feedback port
//!
//! Typed notifications emitted by the engine at a configured verbosity.
//! Handler failure must never propagate into the core, so the contract is
//! infallible; adapters log-and-swallow their own errors.

use serde::{Deserialize, Serialize};

use crate::config::FeedbackLevel;

/// Events surfaced to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    NetworkConnected,
    NetworkDisconnected,
    SyncStarted,
    SyncCompleted,
    SyncFailed { message: String },
    ConflictDetected { name: String },
    UploadFailed { name: String, message: String },
    OfflineLogFull { pending: usize },
}

impl Notification {
    /// Minimum verbosity at which this notification is delivered.
    #[must_use]
    pub fn min_level(&self) -> FeedbackLevel {
        match self {
            Notification::NetworkConnected | Notification::NetworkDisconnected => {
                FeedbackLevel::Basic
            }
            Notification::SyncStarted | Notification::SyncCompleted => FeedbackLevel::Detailed,
            Notification::SyncFailed { .. } => FeedbackLevel::Basic,
            Notification::ConflictDetected { .. } => FeedbackLevel::Basic,
            Notification::UploadFailed { .. } => FeedbackLevel::Basic,
            Notification::OfflineLogFull { .. } => FeedbackLevel::Basic,
        }
    }
}

/// Sink for user-visible notifications.
pub trait FeedbackHandler: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Handler that writes notifications to the tracing log. The default sink
/// when no desktop integration is attached.
#[derive(Debug, Default)]
pub struct LogFeedbackHandler;

impl FeedbackHandler for LogFeedbackHandler {
    fn notify(&self, notification: &Notification) {
        tracing::info!(notification = ?notification, "user notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_ordered() {
        assert!(FeedbackLevel::None < FeedbackLevel::Basic);
        assert!(FeedbackLevel::Basic < FeedbackLevel::Detailed);
    }

    #[test]
    fn test_sync_progress_is_detailed_only() {
        assert_eq!(Notification::SyncStarted.min_level(), FeedbackLevel::Detailed);
        assert_eq!(
            Notification::SyncFailed {
                message: "x".into()
            }
            .min_level(),
            FeedbackLevel::Basic
        );
    }
}
