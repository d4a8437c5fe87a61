//! Offline operation
//!
//! Connectivity is tracked two ways: passively, by classifying errors from
//! the remote client against the known transport-failure patterns, and
//! actively, by a periodic `ping` probe. HTTP response errors are never
//! offline signals.
//!
//! While offline, local mutations are appended to the durable offline
//! change log *before* they touch local metadata. On reconnect the log
//! drains in recorded order, converting each entry into the appropriate
//! remote operation through the mutation queue or the upload manager.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use graphfs_core::domain::{ChangeKind, MutationJob, OfflineChange};
use graphfs_core::ports::{Notification, RemoteClient};
use graphfs_core::{is_offline_error, CoreError};
use graphfs_store::{ContentCache, StateManager};

use crate::mutation::MutationQueue;
use crate::status::FeedbackManager;
use crate::upload::UploadManager;

/// Shared connectivity state plus the guarded offline change log.
pub struct OfflineTracker {
    offline: AtomicBool,
    /// `--offline-mode`: never probe, never drain.
    operational_offline: bool,
    state: StateManager,
    cache: Arc<ContentCache>,
    max_pending: usize,
    feedback: Arc<FeedbackManager>,
    online_tx: watch::Sender<bool>,
}

impl OfflineTracker {
    pub fn new(
        state: StateManager,
        cache: Arc<ContentCache>,
        max_pending: usize,
        operational_offline: bool,
        feedback: Arc<FeedbackManager>,
    ) -> Arc<Self> {
        let (online_tx, _) = watch::channel(!operational_offline);
        Arc::new(Self {
            offline: AtomicBool::new(operational_offline),
            operational_offline,
            state,
            cache,
            max_pending,
            feedback,
            online_tx,
        })
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    pub fn is_operational_offline(&self) -> bool {
        self.operational_offline
    }

    /// Watch channel carrying the current online state.
    pub fn subscribe_online(&self) -> watch::Receiver<bool> {
        self.online_tx.subscribe()
    }

    /// Flip the connectivity state, notifying on transitions.
    pub fn set_offline(&self, offline: bool) {
        if self.operational_offline && !offline {
            return; // operational offline never comes back online
        }
        let was = self.offline.swap(offline, Ordering::SeqCst);
        if was == offline {
            return;
        }
        if offline {
            tracing::warn!("remote store unreachable, entering offline operation");
            self.feedback.notify(Notification::NetworkDisconnected);
        } else {
            tracing::info!("remote store reachable again");
            self.feedback.notify(Notification::NetworkConnected);
        }
        let _ = self.online_tx.send(!offline);
    }

    /// Passive classification of an error from the remote client.
    pub fn report_network_error(&self, err: &CoreError) {
        if is_offline_error(err) {
            self.set_offline(true);
        }
    }

    /// Append a change to the durable log, enforcing the pending cap.
    ///
    /// A `Delete` of a never-uploaded `local-*` item annihilates its
    /// pending creates/modifies instead of being recorded: the remote
    /// never saw the item, so nothing remains to express.
    pub async fn record(&self, change: OfflineChange) -> Result<(), CoreError> {
        if change.kind == ChangeKind::Delete && change.item_id.is_local() {
            let purged = self
                .state
                .store()
                .purge_offline_changes_for(&change.item_id)
                .await?;
            if purged > 0 {
                tracing::debug!(
                    item = %change.item_id,
                    purged,
                    "compacted offline log for deleted local item"
                );
                // Complete the deletion locally; there is no remote side.
                if let Some(entry) = self.state.store().get(&change.item_id).await? {
                    if entry.state() != graphfs_core::domain::ItemState::Deleted {
                        self.state.mark_deleted(&change.item_id).await?;
                    }
                    self.state.remove(&change.item_id).await?;
                }
                self.cache.delete(&change.item_id)?;
                return Ok(());
            }
        }

        let pending = self.state.store().count_offline_changes().await?;
        if pending >= self.max_pending {
            self.feedback
                .notify(Notification::OfflineLogFull { pending });
            return Err(CoreError::Backpressure(format!(
                "offline change log is full ({pending} pending)"
            )));
        }
        self.state.store().append_offline_change(&change).await
    }

    pub async fn pending_count(&self) -> Result<usize, CoreError> {
        self.state.store().count_offline_changes().await
    }
}

// ============================================================================
// Active probe
// ============================================================================

/// Periodic reachability probe against the remote store.
pub fn spawn_connectivity_monitor(
    remote: Arc<dyn RemoteClient>,
    offline: Arc<OfflineTracker>,
    probe_interval: Duration,
    probe_timeout: Duration,
    shutdown: CancellationToken,
    tasks: &TaskTracker,
) {
    tasks.spawn(async move {
        if offline.is_operational_offline() {
            tracing::info!("operational offline mode, connectivity probe disabled");
            return;
        }
        let mut ticker = tokio::time::interval(probe_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match tokio::time::timeout(probe_timeout, remote.ping()).await {
                Ok(Ok(())) => offline.set_offline(false),
                Ok(Err(e)) => {
                    // Only transport-level failures indicate offline; an
                    // HTTP error means the network is fine.
                    if is_offline_error(&e) {
                        offline.set_offline(true);
                    } else {
                        offline.set_offline(false);
                    }
                }
                Err(_) => offline.set_offline(true),
            }
        }
    });
}

// ============================================================================
// Drain
// ============================================================================

/// Drains the offline change log when connectivity returns.
pub struct OfflineDrainer {
    tracker: Arc<OfflineTracker>,
    mutations: Arc<MutationQueue>,
    uploads: Arc<UploadManager>,
}

impl OfflineDrainer {
    pub fn new(
        tracker: Arc<OfflineTracker>,
        mutations: Arc<MutationQueue>,
        uploads: Arc<UploadManager>,
    ) -> Self {
        Self {
            tracker,
            mutations,
            uploads,
        }
    }

    /// Watch the connectivity state and drain on every offline→online
    /// transition (and once at startup if entries were left behind).
    pub fn spawn(self, shutdown: CancellationToken, tasks: &TaskTracker) {
        let mut online_rx = self.tracker.subscribe_online();
        tasks.spawn(async move {
            if *online_rx.borrow() {
                if let Err(e) = self.drain().await {
                    tracing::warn!(error = %e, "startup offline-log drain failed");
                }
            }
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = online_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                if *online_rx.borrow() {
                    if let Err(e) = self.drain().await {
                        tracing::warn!(error = %e, "offline-log drain failed");
                    }
                }
            }
        });
    }

    /// Convert each logged change to its remote operation, in recorded
    /// order. Entries are removed from the log once handed off.
    pub async fn drain(&self) -> Result<usize, CoreError> {
        let changes = self.tracker.state.store().list_offline_changes().await?;
        if changes.is_empty() {
            return Ok(0);
        }
        tracing::info!(pending = changes.len(), "draining offline change log");
        self.tracker.feedback.notify(Notification::SyncStarted);

        let mut drained = 0;
        for change in changes {
            if self.tracker.is_offline() {
                break; // connectivity flapped; resume on the next transition
            }
            match self.dispatch(&change).await {
                Ok(()) => {
                    self.tracker
                        .state
                        .store()
                        .remove_offline_change(&change)
                        .await?;
                    drained += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        change = %change.change_id,
                        kind = ?change.kind,
                        error = %e,
                        "failed to dispatch offline change, keeping it queued"
                    );
                    if is_offline_error(&e) {
                        self.tracker.set_offline(true);
                        break;
                    }
                }
            }
        }

        self.tracker.feedback.notify(Notification::SyncCompleted);
        Ok(drained)
    }

    async fn dispatch(&self, change: &OfflineChange) -> Result<(), CoreError> {
        let parent = change
            .payload
            .parent_id
            .clone()
            .or_else(|| change.payload.new_parent_id.clone());

        match change.kind {
            ChangeKind::Create if change.payload.is_directory => {
                let parent =
                    parent.ok_or_else(|| CoreError::Validation("create without parent".into()))?;
                let name = change
                    .payload
                    .name
                    .clone()
                    .ok_or_else(|| CoreError::Validation("create without name".into()))?;
                self.mutations
                    .enqueue(MutationJob::create_dir(change.item_id.clone(), parent, name))
                    .await
            }
            ChangeKind::Create | ChangeKind::Modify => {
                // File content changes drain through the upload pipeline,
                // which also owns conflict detection against the base etag.
                match self.uploads.enqueue(&change.item_id).await {
                    Ok(_rx) => Ok(()),
                    // The entry may have been deleted or already synced.
                    Err(CoreError::NotFound(_)) => Ok(()),
                    Err(CoreError::InvalidTransition { .. }) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            ChangeKind::Delete => {
                let parent = parent.unwrap_or_else(|| change.item_id.clone());
                self.mutations
                    .enqueue(MutationJob::delete(change.item_id.clone(), parent))
                    .await
            }
            ChangeKind::Rename => {
                let new_name = change
                    .payload
                    .new_name
                    .clone()
                    .ok_or_else(|| CoreError::Validation("rename without name".into()))?;
                let new_parent = change
                    .payload
                    .new_parent_id
                    .clone()
                    .or_else(|| change.payload.parent_id.clone())
                    .ok_or_else(|| CoreError::Validation("rename without parent".into()))?;
                let lane_parent = new_parent.clone();
                self.mutations
                    .enqueue(MutationJob::rename(
                        change.item_id.clone(),
                        lane_parent,
                        new_name,
                        new_parent,
                    ))
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_patterns_match_spec_list() {
        for msg in [
            "no such host",
            "network is unreachable",
            "connection refused",
            "connection timed out",
            "dial tcp 10.0.0.1:443",
            "context deadline exceeded",
            "no route to host",
            "network is down",
            "temporary failure in name resolution",
            "operation timed out",
        ] {
            assert!(
                is_offline_error(&CoreError::Network(msg.to_string())),
                "{msg} should classify as offline"
            );
        }
    }

    #[test]
    fn test_http_statuses_are_not_offline() {
        for err in [
            CoreError::Auth("401 unauthorized".into()),
            CoreError::Permission("403 forbidden".into()),
            CoreError::NotFound("404".into()),
            CoreError::Network("500 internal server error".into()),
        ] {
            assert!(!is_offline_error(&err));
        }
    }
}
