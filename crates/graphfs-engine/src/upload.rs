//! Upload manager
//!
//! Moves entries from `DirtyLocal` to `Hydrated` by pushing content to the
//! remote store through resumable chunked sessions. Sessions persist their
//! `{offset, session_url}` in the `uploads` bucket after every accepted
//! chunk, so an interrupted run resumes where it stopped; a resumed session
//! with the same offset produces the same final item as a one-shot upload.
//!
//! Conflicts (the remote etag moved past the etag captured at dirty time)
//! transition the entry to `Conflict` and run the configured policy:
//! `keep_both` (default) clones the local bytes into a sibling and
//! re-hydrates the original from the remote; `last_writer_wins` compares
//! timestamps; `user_choice` leaves the entry for the UI; `merge` falls
//! back to keep-both for non-mergeable content.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use graphfs_core::config::UploadConfig;
use graphfs_core::domain::{
    ContentRef, Item, ItemId, ItemState, MetadataEntry, SessionState, UploadSession,
};
use graphfs_core::ports::{
    ByteRange, ChunkResult, ConflictBehavior, Notification, RemoteClient, RemoteItem,
};
use graphfs_core::domain::ConflictPolicy;
use graphfs_core::CoreError;
use graphfs_store::{ContentCache, StateManager};

use crate::status::FeedbackManager;

/// Per-chunk retry budget (network-layer); session-level retries are
/// configured separately.
const CHUNK_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

type Outcome = Option<Result<ItemId, CoreError>>;

struct ActiveUpload {
    outcome_tx: watch::Sender<Outcome>,
    cancel: CancellationToken,
}

/// Manages the upload worker pool, session persistence, and conflict
/// resolution.
pub struct UploadManager {
    state: StateManager,
    cache: Arc<ContentCache>,
    remote: Arc<dyn RemoteClient>,
    config: UploadConfig,
    policy: ConflictPolicy,
    feedback: Arc<FeedbackManager>,
    active: Arc<DashMap<ItemId, Arc<ActiveUpload>>>,
    queue_tx: mpsc::Sender<ItemId>,
    inflight: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl UploadManager {
    /// Create the manager and spawn its workers on `tracker`.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        state: StateManager,
        cache: Arc<ContentCache>,
        remote: Arc<dyn RemoteClient>,
        config: UploadConfig,
        policy: ConflictPolicy,
        feedback: Arc<FeedbackManager>,
        shutdown: CancellationToken,
        tracker: &TaskTracker,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(config.workers.max(1) * 32);

        let manager = Arc::new(Self {
            state,
            cache,
            remote,
            config,
            policy,
            feedback,
            active: Arc::new(DashMap::new()),
            queue_tx,
            inflight: Arc::new(AtomicUsize::new(0)),
            shutdown,
        });

        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        for worker_id in 0..manager.config.workers.max(1) {
            let manager = Arc::clone(&manager);
            let queue_rx = Arc::clone(&queue_rx);
            tracker.spawn(async move {
                manager.worker_loop(worker_id, queue_rx).await;
            });
        }

        manager
    }

    /// Queue an upload for a dirty entry. Callers for an id that is already
    /// uploading share the in-flight session's outcome.
    pub async fn enqueue(&self, id: &ItemId) -> Result<watch::Receiver<Outcome>, CoreError> {
        if let Some(active) = self.active.get(id) {
            return Ok(active.outcome_tx.subscribe());
        }

        let entry = self.load(id).await?;
        if entry.is_virtual() {
            return Err(CoreError::Validation(format!("{id} is virtual")));
        }
        if !matches!(entry.state(), ItemState::DirtyLocal | ItemState::Error) {
            return Err(CoreError::InvalidTransition {
                from: entry.state().name(),
                to: "Uploading",
            });
        }

        // Reuse a persisted session (restart resume) or open a fresh one.
        let session = match self.state.store().get_upload_session(id).await? {
            Some(existing) if !existing.state.is_terminal() => existing,
            _ => {
                let session = UploadSession::new(
                    id.clone(),
                    ContentRef::Path(self.cache.path_for(id)),
                    self.config.chunk_size,
                );
                self.state.store().put_upload_session(&session).await?;
                session
            }
        };
        debug_assert_eq!(&session.target_item_id, id);

        let (outcome_tx, outcome_rx) = watch::channel(None);
        let active = Arc::new(ActiveUpload {
            outcome_tx,
            cancel: CancellationToken::new(),
        });
        self.active.insert(id.clone(), active);

        self.state.set_pending_remote(id, true).await?;

        if self.queue_tx.try_send(id.clone()).is_err() {
            self.active.remove(id);
            return Err(CoreError::Backpressure(format!(
                "upload queue full, retry {id} later"
            )));
        }

        Ok(outcome_rx)
    }

    /// Cancel an in-flight upload (deletion path). The entry falls back to
    /// `DirtyLocal` so the tombstone transition can proceed.
    pub async fn cancel(&self, id: &ItemId) -> Result<(), CoreError> {
        if let Some((_, active)) = self.active.remove(id) {
            active.cancel.cancel();
        }
        // Persisted session is dropped either way; the delete path must not
        // resurrect it on restart.
        self.state.store().delete_upload_session(id).await?;
        let entry = self.load(id).await?;
        if entry.state() == ItemState::Uploading {
            self.state.upload_interrupted(id).await?;
        }
        Ok(())
    }

    /// Re-enqueue sessions persisted by a previous run.
    pub async fn restore_persisted(&self) -> Result<usize, CoreError> {
        let sessions = self.state.store().list_upload_sessions().await?;
        let mut restored = 0;
        for session in sessions {
            if session.state.is_terminal() {
                self.state
                    .store()
                    .delete_upload_session(&session.target_item_id)
                    .await?;
                continue;
            }
            let id = session.target_item_id.clone();
            let Some(entry) = self.state.store().get(&id).await? else {
                self.state.store().delete_upload_session(&id).await?;
                continue;
            };
            // An entry persisted mid-upload resumes from DirtyLocal.
            if entry.state() == ItemState::Uploading {
                self.state.upload_interrupted(&id).await?;
            }
            if self.enqueue(&id).await.is_ok() {
                restored += 1;
            }
        }
        if restored > 0 {
            tracing::info!(restored, "re-enqueued persisted upload sessions");
        }
        Ok(restored)
    }

    pub fn active_count(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    pub fn is_uploading(&self, id: &ItemId) -> bool {
        self.active.contains_key(id)
    }

    async fn load(&self, id: &ItemId) -> Result<MetadataEntry, CoreError> {
        self.state
            .store()
            .get(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("no metadata entry for {id}")))
    }

    // ========================================================================
    // Workers
    // ========================================================================

    async fn worker_loop(
        &self,
        worker_id: usize,
        queue_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ItemId>>>,
    ) {
        tracing::debug!(worker_id, "upload worker started");
        loop {
            let id = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                id = async { queue_rx.lock().await.recv().await } => id,
            };
            let Some(id) = id else { break };

            self.inflight.fetch_add(1, Ordering::SeqCst);
            self.process(&id).await;
            // Exactly one decrement per session termination.
            self.inflight.fetch_sub(1, Ordering::SeqCst);
        }
        tracing::debug!(worker_id, "upload worker stopped");
    }

    async fn process(&self, id: &ItemId) {
        let Some(active) = self.active.get(id).map(|a| Arc::clone(a.value())) else {
            return; // cancelled before a worker picked it up
        };

        let result = self.run_session(id, &active).await;

        // The session is terminal; drop the dedup entry first so conflict
        // resolution can queue follow-up work under the same id.
        self.active.remove(id);

        let outcome = match result {
            Ok(new_id) => {
                tracing::info!(id = %id, new_id = %new_id, "upload complete");
                let _ = self.state.store().delete_upload_session(id).await;
                Ok(new_id)
            }
            Err(CoreError::Cancelled) => {
                tracing::debug!(id = %id, "upload cancelled");
                Err(CoreError::Cancelled)
            }
            Err(CoreError::Conflict(msg)) => {
                tracing::warn!(id = %id, "upload conflict: {msg}");
                let resolved = self.handle_conflict(id).await;
                let _ = self.state.store().delete_upload_session(id).await;
                match resolved {
                    Ok(()) => Err(CoreError::Conflict(msg)),
                    Err(e) => {
                        tracing::error!(id = %id, error = %e, "conflict resolution failed");
                        Err(e)
                    }
                }
            }
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "upload failed");
                let name = self
                    .load(id)
                    .await
                    .map(|entry| entry.name().to_string())
                    .unwrap_or_else(|_| id.to_string());
                if let Err(mark_err) = self.state.mark_error(id, &e).await {
                    tracing::error!(id = %id, error = %mark_err, "failed to record upload error");
                }
                let _ = self.state.store().delete_upload_session(id).await;
                self.feedback.notify(Notification::UploadFailed {
                    name,
                    message: e.to_string(),
                });
                Err(e)
            }
        };

        let _ = active.outcome_tx.send(Some(outcome));
    }

    /// Run the session with the session-level retry budget. Chunk-level
    /// retries happen inside one attempt.
    async fn run_session(
        &self,
        id: &ItemId,
        active: &Arc<ActiveUpload>,
    ) -> Result<ItemId, CoreError> {
        let mut last_err = CoreError::Network("no attempt made".into());
        for attempt in 0..=self.config.max_retries {
            if active.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            match self.attempt_upload(id, active).await {
                Ok(new_id) => return Ok(new_id),
                Err(CoreError::Cancelled) => return Err(CoreError::Cancelled),
                Err(e @ CoreError::Conflict(_)) => return Err(e),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    // Fall back to DirtyLocal between session attempts so a
                    // shutdown mid-backoff leaves a resumable state.
                    if let Err(t) = self.state.upload_interrupted(id).await {
                        tracing::warn!(id = %id, error = %t, "failed to park interrupted upload");
                    }
                    let delay = RETRY_BASE_DELAY * 2u32.saturating_pow(attempt);
                    tracing::debug!(id = %id, attempt, error = %e, "upload attempt failed, backing off");
                    last_err = e;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = active.cancel.cancelled() => return Err(CoreError::Cancelled),
                        _ = self.shutdown.cancelled() => return Err(CoreError::Cancelled),
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    async fn attempt_upload(
        &self,
        id: &ItemId,
        active: &Arc<ActiveUpload>,
    ) -> Result<ItemId, CoreError> {
        let entry = self.load(id).await?;
        match entry.state() {
            ItemState::Uploading => {} // resumed session
            _ => self.state.begin_upload(id).await?,
        }

        let mut session = self
            .state
            .store()
            .get_upload_session(id)
            .await?
            .unwrap_or_else(|| {
                UploadSession::new(
                    id.clone(),
                    ContentRef::Path(self.cache.path_for(id)),
                    self.config.chunk_size,
                )
            });

        let total_size = self
            .cache
            .size_of(id)
            .ok_or_else(|| CoreError::Storage(format!("no cached content for {id}")))?;

        // Below the chunking threshold the whole file goes in one piece;
        // at or above it, the configured chunk size applies.
        let chunk_size = if self.config.chunked_threshold > 0
            && total_size < self.config.chunked_threshold
        {
            total_size.max(1)
        } else {
            session.chunk_size.max(1)
        };

        // Create (or keep) the resumable remote session.
        if session.session_url.is_none() {
            let parent_remote = self.parent_remote_id(&entry).await?;
            let url = self
                .remote
                .create_upload_session(
                    &parent_remote,
                    entry.name(),
                    ConflictBehavior::Fail,
                    entry.dirty_base_etag(),
                )
                .await?;
            session.session_url = Some(url);
            session.offset = 0;
        }
        session.state = SessionState::Started;
        session.attempts += 1;
        self.state.store().put_upload_session(&session).await?;

        let session_url = session.session_url.clone().unwrap_or_default();

        // Chunk loop. The offset advances only after the remote accepts a
        // chunk, and is persisted each time for resumption.
        loop {
            if active.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            if self.shutdown.is_cancelled() {
                // Graceful shutdown: persist resume state and park.
                self.state.store().put_upload_session(&session).await?;
                self.state.upload_interrupted(id).await?;
                return Err(CoreError::Cancelled);
            }

            let len = (total_size - session.offset).min(chunk_size);
            let bytes = self.cache.read_at(id, session.offset, len as u32)?;

            let result = self
                .put_chunk_with_retry(
                    &session_url,
                    ByteRange {
                        offset: session.offset,
                        len: bytes.len() as u64,
                    },
                    total_size,
                    &bytes,
                    active,
                )
                .await?;

            match result {
                ChunkResult::Accepted { next_offset } => {
                    session.offset = next_offset;
                    self.state.store().put_upload_session(&session).await?;
                }
                ChunkResult::Completed { item } => {
                    return self.finish(id, &item).await;
                }
            }
        }
    }

    async fn put_chunk_with_retry(
        &self,
        session_url: &str,
        range: ByteRange,
        total_size: u64,
        bytes: &[u8],
        active: &Arc<ActiveUpload>,
    ) -> Result<ChunkResult, CoreError> {
        let mut attempt = 0u32;
        loop {
            match self
                .remote
                .put_chunk(session_url, range, total_size, bytes)
                .await
            {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempt < CHUNK_RETRIES => {
                    attempt += 1;
                    let delay = RETRY_BASE_DELAY * 2u32.saturating_pow(attempt - 1);
                    tracing::trace!(
                        offset = range.offset,
                        attempt,
                        error = %e,
                        "chunk send failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = active.cancel.cancelled() => return Err(CoreError::Cancelled),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn finish(&self, id: &ItemId, item: &RemoteItem) -> Result<ItemId, CoreError> {
        let new_id = self.state.complete_upload(id, item).await?;
        if &new_id != id {
            // The cache file follows the adopted canonical id.
            self.cache.rekey(id, &new_id)?;
        }
        Ok(new_id)
    }

    async fn parent_remote_id(
        &self,
        entry: &MetadataEntry,
    ) -> Result<graphfs_core::domain::RemoteId, CoreError> {
        let parent_id = entry
            .parent_id()
            .ok_or_else(|| CoreError::Validation("cannot upload the root".into()))?;
        let parent = self
            .state
            .store()
            .get(parent_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("missing parent {parent_id}")))?;
        parent.item().remote_id.clone().ok_or_else(|| {
            // Parent itself not created remotely yet; retry after its
            // mutation lands.
            CoreError::Network(format!("parent {parent_id} not yet created remotely"))
        })
    }

    // ========================================================================
    // Conflict resolution
    // ========================================================================

    /// Apply the configured conflict policy to an entry whose upload hit an
    /// etag precondition failure.
    async fn handle_conflict(&self, id: &ItemId) -> Result<(), CoreError> {
        self.state.mark_conflict(id).await?;
        let entry = self.load(id).await?;
        self.feedback.notify(Notification::ConflictDetected {
            name: entry.name().to_string(),
        });

        match self.policy {
            ConflictPolicy::KeepBoth | ConflictPolicy::Merge => self.resolve_keep_both(id).await,
            ConflictPolicy::LastWriterWins => self.resolve_last_writer(id).await,
            ConflictPolicy::UserChoice => Ok(()), // stays in Conflict for the UI
        }
    }

    /// Keep both versions: the local bytes move to a conflict sibling that
    /// uploads as a new file; the original re-hydrates from the remote.
    async fn resolve_keep_both(&self, id: &ItemId) -> Result<(), CoreError> {
        let entry = self.load(id).await?;
        let parent_id = entry
            .parent_id()
            .cloned()
            .ok_or_else(|| CoreError::Validation("conflict on root".into()))?;

        // Sibling gets the local content under a conflict name.
        let mut sibling_name = conflict_name(entry.name(), 1);
        let mut attempt = 2;
        while self
            .state
            .store()
            .lookup_child(&parent_id, &sibling_name)
            .await?
            .is_some()
        {
            sibling_name = conflict_name(entry.name(), attempt);
            attempt += 1;
        }

        let sibling_item = Item::new_local(sibling_name.clone(), parent_id, false);
        let sibling_id = sibling_item.id.clone();
        let mut sibling_entry = graphfs_core::domain::MetadataEntry::from_local_create(
            sibling_item,
            entry.overlay_policy(),
        );
        let size = self.cache.copy(id, &sibling_id)?;
        sibling_entry.set_size(size);
        self.state.insert_local(&sibling_entry).await?;

        // Original takes the remote version.
        self.rehydrate_from_remote(id).await?;

        // The sibling uploads as a brand-new file.
        let _ = self.enqueue(&sibling_id).await?;
        tracing::info!(id = %id, sibling = %sibling_id, name = %sibling_name, "conflict kept both versions");
        Ok(())
    }

    async fn resolve_last_writer(&self, id: &ItemId) -> Result<(), CoreError> {
        let entry = self.load(id).await?;
        let remote_id = entry
            .item()
            .remote_id
            .clone()
            .ok_or_else(|| CoreError::Validation(format!("{id} has no remote copy")))?;
        let remote = self.remote.get_item(&remote_id).await?;

        if entry.item().mtime >= remote.mtime {
            // Local wins: go dirty again, based on the version we are
            // about to overwrite, and re-upload.
            self.state
                .resolve_conflict_local(id, remote.etag.clone())
                .await?;
            let _ = self.enqueue(id).await?;
        } else {
            self.rehydrate_from_remote(id).await?;
        }
        Ok(())
    }

    /// Replace the cached bytes with the remote version and settle the
    /// entry in `Hydrated`. The entry stays in `Conflict` while the bytes
    /// stream in, so the content invariant holds throughout.
    async fn rehydrate_from_remote(&self, id: &ItemId) -> Result<(), CoreError> {
        let entry = self.load(id).await?;
        let remote_id = entry
            .item()
            .remote_id
            .clone()
            .ok_or_else(|| CoreError::Validation(format!("{id} has no remote copy")))?;
        let remote = self.remote.get_item(&remote_id).await?;
        let bytes = self.remote.get_content(&remote_id, None).await?;
        self.cache.insert(id, &bytes)?;
        self.state
            .resolve_conflict_remote(
                id,
                remote.etag.clone(),
                bytes.len() as u64,
                remote.content_hash,
            )
            .await
    }
}

/// Conflict sibling name: `A.txt` becomes `A (conflict).txt`, then
/// `A (conflict 2).txt` on collision.
fn conflict_name(original: &str, attempt: u32) -> String {
    let marker = if attempt <= 1 {
        " (conflict)".to_string()
    } else {
        format!(" (conflict {attempt})")
    };
    match original.rfind('.') {
        Some(dot) if dot > 0 => {
            let (stem, ext) = original.split_at(dot);
            format!("{stem}{marker}{ext}")
        }
        _ => format!("{original}{marker}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_name_with_extension() {
        assert_eq!(conflict_name("A.txt", 1), "A (conflict).txt");
        assert_eq!(conflict_name("A.txt", 2), "A (conflict 2).txt");
    }

    #[test]
    fn test_conflict_name_without_extension() {
        assert_eq!(conflict_name("Makefile", 1), "Makefile (conflict)");
    }

    #[test]
    fn test_conflict_name_hidden_file() {
        // A leading dot is not an extension separator.
        assert_eq!(conflict_name(".env", 1), ".env (conflict)");
    }

    #[test]
    fn test_conflict_name_multiple_dots() {
        assert_eq!(conflict_name("a.tar.gz", 1), "a.tar (conflict).gz");
    }
}
