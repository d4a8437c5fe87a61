//! Mutation queue
//!
//! Serializes remote-side create/rename/delete so concurrent foreground
//! mutations never race and FUSE calls never wait on the network. Jobs are
//! processed FIFO per parent id (one lane task per active parent) and in
//! arbitrary order across parents; `enqueue` is non-blocking, and a full
//! lane records the job to the offline change log instead.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use graphfs_core::domain::{
    ChangeKind, ChangePayload, ItemId, ItemState, MetadataEntry, MutationJob, MutationOp,
    OfflineChange,
};
use graphfs_core::ports::{ItemPatch, RemoteClient};
use graphfs_core::CoreError;
use graphfs_store::{ContentCache, StateManager};

/// Per-job retry budget for transient failures.
const JOB_RETRIES: u32 = 5;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
/// Bound of each per-parent lane.
const LANE_CAPACITY: usize = 64;

/// Serialized background remote mutations.
pub struct MutationQueue {
    state: StateManager,
    cache: Arc<ContentCache>,
    remote: Arc<dyn RemoteClient>,
    lanes: DashMap<ItemId, mpsc::Sender<MutationJob>>,
    offline: Arc<crate::offline::OfflineTracker>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl MutationQueue {
    pub fn new(
        state: StateManager,
        cache: Arc<ContentCache>,
        remote: Arc<dyn RemoteClient>,
        offline: Arc<crate::offline::OfflineTracker>,
        shutdown: CancellationToken,
        tracker: TaskTracker,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            cache,
            remote,
            lanes: DashMap::new(),
            offline,
            shutdown,
            tracker,
        })
    }

    /// Enqueue a job without blocking.
    ///
    /// While offline, or when the parent's lane is full, the job is
    /// recorded in the offline change log instead and drained later.
    pub async fn enqueue(self: &Arc<Self>, job: MutationJob) -> Result<(), CoreError> {
        if self.offline.is_offline() {
            return self.record_offline(&job).await;
        }

        let parent = job.parent_id.clone();
        let tx = self.lane_sender(&parent);
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(job))
            | Err(mpsc::error::TrySendError::Closed(job)) => {
                tracing::warn!(parent = %parent, "mutation lane unavailable, spilling to offline log");
                self.record_offline(&job).await
            }
        }
    }

    /// Get or create the lane task for a parent.
    fn lane_sender(self: &Arc<Self>, parent: &ItemId) -> mpsc::Sender<MutationJob> {
        if let Some(tx) = self.lanes.get(parent) {
            return tx.clone();
        }
        let (tx, mut rx) = mpsc::channel::<MutationJob>(LANE_CAPACITY);
        self.lanes.insert(parent.clone(), tx.clone());

        let queue = Arc::clone(self);
        let lane_parent = parent.clone();
        self.tracker.spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = queue.shutdown.cancelled() => break,
                    job = rx.recv() => job,
                };
                let Some(job) = job else { break };
                queue.process(job).await;
            }
            queue.lanes.remove(&lane_parent);
        });
        tx
    }

    async fn record_offline(&self, job: &MutationJob) -> Result<(), CoreError> {
        let (kind, payload) = match job.op {
            MutationOp::CreateDir => (
                ChangeKind::Create,
                ChangePayload {
                    name: job.args.name.clone(),
                    parent_id: Some(job.parent_id.clone()),
                    is_directory: true,
                    ..ChangePayload::default()
                },
            ),
            MutationOp::Rename => (
                ChangeKind::Rename,
                ChangePayload {
                    new_name: job.args.new_name.clone(),
                    new_parent_id: job.args.new_parent_id.clone(),
                    parent_id: Some(job.parent_id.clone()),
                    ..ChangePayload::default()
                },
            ),
            MutationOp::Delete => (
                ChangeKind::Delete,
                ChangePayload {
                    parent_id: Some(job.parent_id.clone()),
                    ..ChangePayload::default()
                },
            ),
        };
        self.offline
            .record(OfflineChange::new(kind, job.item_id.clone(), payload))
            .await
    }

    // ========================================================================
    // Job execution
    // ========================================================================

    async fn process(&self, mut job: MutationJob) {
        loop {
            match self.execute(&job).await {
                Ok(()) => return,
                Err(e) if graphfs_core::is_offline_error(&e) => {
                    tracing::info!(op = ?job.op, item = %job.item_id, "went offline mid-mutation, spilling to log");
                    self.offline.report_network_error(&e);
                    if let Err(log_err) = self.record_offline(&job).await {
                        tracing::error!(error = %log_err, "failed to record mutation offline");
                    }
                    return;
                }
                Err(e) if e.is_transient() && job.retries < JOB_RETRIES => {
                    job.retries += 1;
                    let delay = RETRY_BASE_DELAY * 2u32.saturating_pow(job.retries - 1);
                    tracing::debug!(
                        op = ?job.op,
                        item = %job.item_id,
                        retries = job.retries,
                        error = %e,
                        "mutation failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => return,
                    }
                }
                Err(e) => {
                    tracing::warn!(op = ?job.op, item = %job.item_id, error = %e, "mutation permanently failed");
                    if let Err(mark_err) = self.state.mark_error(&job.item_id, &e).await {
                        tracing::debug!(
                            item = %job.item_id,
                            error = %mark_err,
                            "could not record mutation error on entry"
                        );
                    }
                    return;
                }
            }
        }
    }

    async fn execute(&self, job: &MutationJob) -> Result<(), CoreError> {
        match job.op {
            MutationOp::CreateDir => self.execute_create_dir(job).await,
            MutationOp::Rename => self.execute_rename(job).await,
            MutationOp::Delete => self.execute_delete(job).await,
        }
    }

    async fn execute_create_dir(&self, job: &MutationJob) -> Result<(), CoreError> {
        let Some(entry) = self.state.store().get(&job.item_id).await? else {
            // A delta upsert reconciled the directory first, or it was
            // deleted again before the job ran. Either way there is
            // nothing left to create.
            tracing::debug!(item = %job.item_id, "create-dir job is moot, skipping");
            return Ok(());
        };
        if entry.state() == ItemState::Deleted {
            return Ok(());
        }

        let parent_remote = self.require_parent_remote(&entry).await?;
        let name = job
            .args
            .name
            .clone()
            .unwrap_or_else(|| entry.name().to_string());

        let created = self.remote.create_dir(&parent_remote, &name).await?;
        let new_id = self.state.finish_create(&job.item_id, &created).await?;
        tracing::info!(item = %new_id, name = %name, "remote directory created");
        Ok(())
    }

    async fn execute_rename(&self, job: &MutationJob) -> Result<(), CoreError> {
        let Some(entry) = self.state.store().get(&job.item_id).await? else {
            tracing::debug!(item = %job.item_id, "rename job target gone, skipping");
            return Ok(());
        };
        let Some(remote_id) = entry.item().remote_id.clone() else {
            // Still local-only; the rename is already reflected in local
            // metadata and the eventual create will carry the new name.
            self.state.set_pending_remote(&job.item_id, false).await?;
            return Ok(());
        };

        let new_parent_remote = match &job.args.new_parent_id {
            Some(parent) => {
                let parent_entry = self.state.store().get(parent).await?.ok_or_else(|| {
                    CoreError::NotFound(format!("rename target parent {parent} missing"))
                })?;
                parent_entry.item().remote_id.clone()
            }
            None => None,
        };

        let patched = self
            .remote
            .patch_item(
                &remote_id,
                ItemPatch {
                    name: job.args.new_name.clone(),
                    parent_id: new_parent_remote,
                },
            )
            .await?;

        self.state.mark_clean(&job.item_id, patched.etag).await?;
        tracing::info!(item = %job.item_id, "remote rename applied");
        Ok(())
    }

    async fn execute_delete(&self, job: &MutationJob) -> Result<(), CoreError> {
        let Some(entry) = self.state.store().get(&job.item_id).await? else {
            return Ok(());
        };

        if let Some(remote_id) = entry.item().remote_id.clone() {
            match self.remote.delete_item(&remote_id).await {
                Ok(()) => {}
                // Already gone remotely counts as confirmed.
                Err(CoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        // Remote confirmed: drop the tombstone and the deferred content.
        self.state.remove(&job.item_id).await?;
        self.cache.delete(&job.item_id)?;
        tracing::info!(item = %job.item_id, "remote delete confirmed");
        Ok(())
    }

    async fn require_parent_remote(
        &self,
        entry: &MetadataEntry,
    ) -> Result<graphfs_core::domain::RemoteId, CoreError> {
        let parent_id = entry
            .parent_id()
            .ok_or_else(|| CoreError::Validation("root has no parent".into()))?;
        let parent = self
            .state
            .store()
            .get(parent_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("missing parent {parent_id}")))?;
        parent.item().remote_id.clone().ok_or_else(|| {
            // Parent creation still queued; transient so the job retries
            // after the parent's lane makes progress.
            CoreError::Network(format!("parent {parent_id} not yet created remotely"))
        })
    }
}
