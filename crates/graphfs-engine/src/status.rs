//! Status and feedback
//!
//! The feedback manager filters typed notifications by the configured
//! verbosity before handing them to the feedback port; a failing handler
//! can never propagate back into the engine. The stats snapshot is the
//! JSON document behind `--stats`.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use graphfs_core::config::FeedbackLevel;
use graphfs_core::ports::{FeedbackHandler, Notification};
use graphfs_core::CoreError;
use graphfs_store::{ContentCache, MetadataStore};

use crate::notifier::NotifierHealth;

/// Verbosity-filtering front of the feedback port.
pub struct FeedbackManager {
    handler: Arc<dyn FeedbackHandler>,
    level: FeedbackLevel,
}

impl FeedbackManager {
    pub fn new(handler: Arc<dyn FeedbackHandler>, level: FeedbackLevel) -> Self {
        Self { handler, level }
    }

    /// Deliver a notification if the configured verbosity admits it.
    pub fn notify(&self, notification: Notification) {
        if self.level >= notification.min_level() && self.level > FeedbackLevel::None {
            self.handler.notify(&notification);
        }
    }

    pub fn level(&self) -> FeedbackLevel {
        self.level
    }
}

// ============================================================================
// Stats snapshot
// ============================================================================

/// Point-in-time view of the engine, serialized for `--stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub offline: bool,
    pub items: ItemStats,
    pub cache: CacheStats,
    pub queues: QueueStats,
    pub notifier: NotifierHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemStats {
    pub total: u64,
    pub by_state: Vec<StateCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateCount {
    pub state: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub bytes: u64,
    pub max_bytes: u64,
    pub entries: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending_offline_changes: usize,
    pub persisted_uploads: usize,
    pub persisted_downloads: usize,
    pub active_hydrations: usize,
    pub active_uploads: usize,
}

/// Collects stats snapshots. Collection is bounded by the configured
/// content-stats timeout; a slow store yields `Backpressure` rather than a
/// hung status call.
pub struct StatsCollector {
    store: MetadataStore,
    cache: Arc<ContentCache>,
    started_at: Instant,
}

impl StatsCollector {
    pub fn new(store: MetadataStore, cache: Arc<ContentCache>) -> Self {
        Self {
            store,
            cache,
            started_at: Instant::now(),
        }
    }

    pub async fn collect(
        &self,
        offline: bool,
        notifier: NotifierHealth,
        active_hydrations: usize,
        active_uploads: usize,
        timeout: std::time::Duration,
    ) -> Result<StatsSnapshot, CoreError> {
        let gather = async {
            let by_state = self
                .store
                .count_by_state()
                .await?
                .into_iter()
                .map(|(state, count)| StateCount { state, count })
                .collect::<Vec<_>>();
            let total = self.store.count_entries().await?;
            let pending_offline = self.store.count_offline_changes().await?;
            let uploads = self.store.list_upload_sessions().await?.len();
            let downloads = self.store.list_download_sessions().await?.len();
            Ok::<_, CoreError>((by_state, total, pending_offline, uploads, downloads))
        };

        let (by_state, total, pending_offline, uploads, downloads) =
            tokio::time::timeout(timeout, gather)
                .await
                .map_err(|_| CoreError::Backpressure("stats collection timed out".into()))??;

        Ok(StatsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            offline,
            items: ItemStats { total, by_state },
            cache: CacheStats {
                bytes: self.cache.total_size(),
                max_bytes: self.cache.max_size(),
                entries: self.cache.entry_count(),
            },
            queues: QueueStats {
                pending_offline_changes: pending_offline,
                persisted_uploads: uploads,
                persisted_downloads: downloads,
                active_hydrations,
                active_uploads,
            },
            notifier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingHandler {
        seen: Mutex<Vec<Notification>>,
    }

    impl FeedbackHandler for RecordingHandler {
        fn notify(&self, notification: &Notification) {
            self.seen.lock().unwrap().push(notification.clone());
        }
    }

    #[test]
    fn test_level_none_suppresses_everything() {
        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
        });
        let manager = FeedbackManager::new(handler.clone(), FeedbackLevel::None);
        manager.notify(Notification::NetworkDisconnected);
        manager.notify(Notification::SyncStarted);
        assert!(handler.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_basic_filters_detailed_events() {
        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
        });
        let manager = FeedbackManager::new(handler.clone(), FeedbackLevel::Basic);
        manager.notify(Notification::SyncStarted); // detailed only
        manager.notify(Notification::NetworkDisconnected); // basic

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], Notification::NetworkDisconnected);
    }

    #[test]
    fn test_detailed_passes_everything() {
        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
        });
        let manager = FeedbackManager::new(handler.clone(), FeedbackLevel::Detailed);
        manager.notify(Notification::SyncStarted);
        manager.notify(Notification::SyncCompleted);
        assert_eq!(handler.seen.lock().unwrap().len(), 2);
    }
}
