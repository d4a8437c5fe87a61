//! Hydration (download) manager
//!
//! Background workers that move entries from `Ghost` to `Hydrated`.
//!
//! ```text
//! ┌──────────────┐   queue(id, prio)   ┌─────────────────────┐
//! │ FUSE open()  │ ──────────────────► │  HydrationManager   │
//! │  (awaiting)  │                     │  active: DashMap    │
//! └──────────────┘                     │  fg/bg mpsc queues  │
//!        │          watch::Receiver    └─────────────────────┘
//!        │◄────────────────────────────          │
//!        │                                       ▼
//!        │                              worker tasks (N)
//!        │                              remote ──► CacheWriter
//!        │◄──────── terminal outcome ── verify hash, commit
//! ```
//!
//! Concurrent callers for the same id share one session: the first caller
//! creates it, later ones attach as waiters on its outcome channel. If
//! every waiter cancels, the session is cancelled and the entry returns to
//! `Ghost`. Sessions are persisted `Queued` in the `downloads` bucket and
//! re-enqueued on restart.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use graphfs_core::domain::{
    DownloadSession, ItemId, ItemState, MetadataEntry, QuickXorHasher, SessionState,
};
use graphfs_core::ports::{ByteRange, RemoteClient};
use graphfs_core::CoreError;
use graphfs_store::{CacheMaintainer, ContentCache, StateManager};

/// Chunk size for ranged content reads.
const DOWNLOAD_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Base delay for the retry backoff.
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Priority of a hydration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HydrationPriority {
    /// Pin re-hydration, prefetch, delta requeue.
    Background,
    /// A user is blocked on `open`.
    Foreground,
}

/// Terminal outcome shared by every waiter of a session.
type Outcome = Option<Result<(), CoreError>>;

struct ActiveHydration {
    outcome_tx: watch::Sender<Outcome>,
    cancel: CancellationToken,
    waiters: AtomicUsize,
}

/// A caller's handle onto a (possibly shared) hydration session.
pub struct HydrationTicket {
    id: ItemId,
    outcome_rx: watch::Receiver<Outcome>,
    active: Arc<DashMap<ItemId, Arc<ActiveHydration>>>,
    detached: bool,
}

impl HydrationTicket {
    /// Wait for the session's terminal outcome.
    ///
    /// Cancelling `caller` detaches this waiter; when the last waiter
    /// detaches the session itself is cancelled and the entry returns to
    /// `Ghost`.
    pub async fn wait(mut self, caller: &CancellationToken) -> Result<(), CoreError> {
        loop {
            if let Some(result) = self.outcome_rx.borrow().clone() {
                self.detached = true;
                return result;
            }
            tokio::select! {
                changed = self.outcome_rx.changed() => {
                    if changed.is_err() {
                        self.detached = true;
                        return Err(CoreError::Cancelled);
                    }
                }
                _ = caller.cancelled() => {
                    self.detach();
                    return Err(CoreError::Cancelled);
                }
            }
        }
    }

    /// Stop waiting without counting as a cancellation vote. Used by
    /// callers that only want the session started (pin re-hydration).
    pub fn forget(mut self) {
        self.detached = true;
    }

    fn detach(&mut self) {
        self.detached = true;
        if let Some(active) = self.active.get(&self.id) {
            let remaining = active.waiters.fetch_sub(1, Ordering::SeqCst) - 1;
            if remaining == 0 {
                tracing::debug!(id = %self.id, "last waiter left, cancelling hydration");
                active.cancel.cancel();
            }
        }
    }
}

impl Drop for HydrationTicket {
    fn drop(&mut self) {
        if !self.detached {
            self.detach();
        }
    }
}

/// Manages the download worker pool and per-id session deduplication.
pub struct HydrationManager {
    state: StateManager,
    cache: Arc<ContentCache>,
    maintainer: CacheMaintainer,
    remote: Arc<dyn RemoteClient>,
    active: Arc<DashMap<ItemId, Arc<ActiveHydration>>>,
    fg_tx: mpsc::Sender<ItemId>,
    bg_tx: mpsc::Sender<ItemId>,
    max_retries: u32,
    shutdown: CancellationToken,
}

impl HydrationManager {
    /// Create the manager and spawn `workers` download tasks on `tracker`.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        state: StateManager,
        cache: Arc<ContentCache>,
        maintainer: CacheMaintainer,
        remote: Arc<dyn RemoteClient>,
        workers: usize,
        queue_size: usize,
        max_retries: u32,
        shutdown: CancellationToken,
        tracker: &TaskTracker,
    ) -> Arc<Self> {
        let (fg_tx, fg_rx) = mpsc::channel(queue_size);
        let (bg_tx, bg_rx) = mpsc::channel(queue_size);

        let manager = Arc::new(Self {
            state,
            cache,
            maintainer,
            remote,
            active: Arc::new(DashMap::new()),
            fg_tx,
            bg_tx,
            max_retries,
            shutdown,
        });

        let fg_rx = Arc::new(tokio::sync::Mutex::new(fg_rx));
        let bg_rx = Arc::new(tokio::sync::Mutex::new(bg_rx));
        for worker_id in 0..workers.max(1) {
            let manager = Arc::clone(&manager);
            let fg_rx = Arc::clone(&fg_rx);
            let bg_rx = Arc::clone(&bg_rx);
            tracker.spawn(async move {
                manager.worker_loop(worker_id, fg_rx, bg_rx).await;
            });
        }

        manager
    }

    /// Queue a hydration, deduplicating in-flight sessions per id.
    ///
    /// Returns a ticket the caller awaits. A full queue yields
    /// `Backpressure` and leaves the entry untouched.
    pub async fn queue(
        &self,
        id: &ItemId,
        priority: HydrationPriority,
    ) -> Result<HydrationTicket, CoreError> {
        // Dedup: attach to a live session when one exists.
        if let Some(active) = self.active.get(id) {
            active.waiters.fetch_add(1, Ordering::SeqCst);
            return Ok(HydrationTicket {
                id: id.clone(),
                outcome_rx: active.outcome_tx.subscribe(),
                active: Arc::clone(&self.active),
                detached: false,
            });
        }

        let entry = self.load(id).await?;
        if entry.is_virtual() || entry.is_directory() {
            return Err(CoreError::Validation(format!(
                "{id} has no content to hydrate"
            )));
        }

        // Already hydrated content needs no session; hand back an
        // immediately-resolved ticket. (A dropped watch sender still lets
        // receivers borrow the final value.)
        if entry.state().requires_content() && self.cache.has_content(id) {
            let (_tx, rx) = watch::channel(Some(Ok(())));
            return Ok(HydrationTicket {
                id: id.clone(),
                outcome_rx: rx,
                active: Arc::clone(&self.active),
                detached: true,
            });
        }

        self.state.begin_hydrate(id).await?;

        let session = DownloadSession::new(id.clone());
        self.state.store().put_download_session(&session).await?;

        let (outcome_tx, outcome_rx) = watch::channel(None);
        let active = Arc::new(ActiveHydration {
            outcome_tx,
            cancel: CancellationToken::new(),
            waiters: AtomicUsize::new(1),
        });
        self.active.insert(id.clone(), Arc::clone(&active));

        let tx = match priority {
            HydrationPriority::Foreground => &self.fg_tx,
            HydrationPriority::Background => &self.bg_tx,
        };
        if tx.try_send(id.clone()).is_err() {
            // Roll the reservation back before reporting backpressure.
            self.active.remove(id);
            self.state.cancel_hydrate(id).await?;
            self.state.store().delete_download_session(id).await?;
            return Err(CoreError::Backpressure(format!(
                "hydration queue full, retry {id} later"
            )));
        }

        Ok(HydrationTicket {
            id: id.clone(),
            outcome_rx,
            active: Arc::clone(&self.active),
            detached: false,
        })
    }

    /// Re-enqueue sessions persisted `Queued`/`Started` by a previous run.
    pub async fn restore_persisted(&self) -> Result<usize, CoreError> {
        let sessions = self.state.store().list_download_sessions().await?;
        let mut restored = 0;
        for session in sessions {
            if session.state.is_terminal() {
                self.state
                    .store()
                    .delete_download_session(&session.target_item_id)
                    .await?;
                continue;
            }
            let id = session.target_item_id.clone();
            let Some(entry) = self.state.store().get(&id).await? else {
                self.state.store().delete_download_session(&id).await?;
                continue;
            };
            // The entry was persisted mid-hydration; reset to Ghost so a
            // fresh queue() walks the normal path.
            if entry.state() == ItemState::Hydrating {
                self.state.cancel_hydrate(&id).await?;
            }
            self.state.store().delete_download_session(&id).await?;
            if self.queue(&id, HydrationPriority::Background).await.is_ok() {
                restored += 1;
            }
        }
        if restored > 0 {
            tracing::info!(restored, "re-enqueued persisted hydration sessions");
        }
        Ok(restored)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_hydrating(&self, id: &ItemId) -> bool {
        self.active.contains_key(id)
    }

    /// Cancel an in-flight or queued session (deletion path). Waiters see
    /// `Cancelled`; the worker resets the entry to `Ghost`.
    pub fn cancel(&self, id: &ItemId) {
        if let Some(active) = self.active.get(id) {
            active.cancel.cancel();
        }
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
        fg_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ItemId>>>,
        bg_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ItemId>>>,
    ) {
        tracing::debug!(worker_id, "hydration worker started");
        loop {
            let id = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                id = async { fg_rx.lock().await.recv().await } => id,
                id = async { bg_rx.lock().await.recv().await } => id,
            };
            let Some(id) = id else { break };
            self.process(&id).await;
        }
        tracing::debug!(worker_id, "hydration worker stopped");
    }

    async fn process(&self, id: &ItemId) {
        let Some(active) = self.active.get(id).map(|a| Arc::clone(a.value())) else {
            return; // cancelled before a worker picked it up
        };

        let result = self.run_session(id, &active).await;

        match &result {
            Ok(()) => {
                tracing::info!(id = %id, "hydration complete");
            }
            Err(CoreError::Cancelled) => {
                tracing::debug!(id = %id, "hydration cancelled");
                if let Err(e) = self.state.cancel_hydrate(id).await {
                    tracing::warn!(id = %id, error = %e, "failed to reset cancelled hydration");
                }
            }
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "hydration failed");
                if let Err(mark_err) = self.state.mark_error(id, e).await {
                    tracing::error!(id = %id, error = %mark_err, "failed to record hydration error");
                }
            }
        }

        if let Err(e) = self.state.store().delete_download_session(id).await {
            tracing::warn!(id = %id, error = %e, "failed to drop download session");
        }

        self.active.remove(id);
        let _ = active.outcome_tx.send(Some(result));
    }

    /// Download with retries. Returns `Cancelled` when the session token
    /// fires; any other error is final (the retry budget is spent here).
    async fn run_session(
        &self,
        id: &ItemId,
        active: &Arc<ActiveHydration>,
    ) -> Result<(), CoreError> {
        let mut session = DownloadSession::new(id.clone());
        session.state = SessionState::Started;
        self.state.store().put_download_session(&session).await?;

        let mut last_err = CoreError::Network("no attempt made".into());
        for attempt in 0..=self.max_retries {
            if active.cancel.is_cancelled() || self.shutdown.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            match self.attempt_download(id, active).await {
                Ok(()) => return Ok(()),
                Err(CoreError::Cancelled) => return Err(CoreError::Cancelled),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = RETRY_BASE_DELAY * 2u32.saturating_pow(attempt);
                    tracing::debug!(
                        id = %id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "hydration attempt failed, backing off"
                    );
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

    async fn attempt_download(
        &self,
        id: &ItemId,
        active: &Arc<ActiveHydration>,
    ) -> Result<(), CoreError> {
        let entry = self.load(id).await?;
        let remote_id = entry
            .item()
            .remote_id
            .clone()
            .ok_or_else(|| CoreError::Validation(format!("{id} has no remote content")))?;
        let expected_size = entry.item().size;
        let expected_hash = entry.item().content_hash;
        let etag = entry
            .item()
            .etag
            .clone()
            .unwrap_or_else(|| graphfs_core::domain::ETag::new(""));

        self.maintainer.ensure_capacity(expected_size).await?;

        let mut writer = self.cache.insert_stream(id)?;
        let mut hasher = QuickXorHasher::new();
        let mut offset = 0u64;

        if expected_size <= DOWNLOAD_CHUNK_SIZE {
            let bytes = self.remote.get_content(&remote_id, None).await?;
            hasher.update(&bytes);
            writer.write_chunk(&bytes)?;
        } else {
            while offset < expected_size {
                if active.cancel.is_cancelled() || self.shutdown.is_cancelled() {
                    return Err(CoreError::Cancelled);
                }
                let len = (expected_size - offset).min(DOWNLOAD_CHUNK_SIZE);
                let bytes = self
                    .remote
                    .get_content(&remote_id, Some(ByteRange { offset, len }))
                    .await?;
                if bytes.is_empty() {
                    return Err(CoreError::Network(format!(
                        "empty content range at offset {offset}"
                    )));
                }
                hasher.update(&bytes);
                writer.write_chunk(&bytes)?;
                offset += bytes.len() as u64;
            }
        }

        // Verify before committing; a mismatch leaves no cache file behind.
        if let Some(expected) = expected_hash {
            let actual = hasher.finalize();
            if actual != expected {
                return Err(CoreError::Integrity(format!(
                    "content hash mismatch for {id}: expected {expected}, got {actual}"
                )));
            }
        }

        let size = writer.commit()?;
        self.state.complete_hydrate(id, etag, size).await?;
        Ok(())
    }
}

/// Watches state events and requeues hydration for pinned entries that were
/// ghosted by eviction or delta invalidation.
pub fn spawn_pin_watcher(
    state: StateManager,
    hydration: Arc<HydrationManager>,
    shutdown: CancellationToken,
    tracker: &TaskTracker,
) {
    let mut events = state.subscribe();
    tracker.spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            let event = match event {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "pin watcher lagged behind state events");
                    continue;
                }
                Err(_) => break,
            };
            if event.to != ItemState::Ghost {
                continue;
            }
            let entry = match state.store().get(&event.id).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(id = %event.id, error = %e, "pin watcher lookup failed");
                    continue;
                }
            };
            if entry.pin_mode() != graphfs_core::domain::PinMode::Always {
                continue;
            }
            tracing::info!(id = %event.id, "re-hydrating pinned entry");
            match hydration.queue(&event.id, HydrationPriority::Background).await {
                Ok(ticket) => ticket.forget(),
                Err(e) => {
                    tracing::warn!(id = %event.id, error = %e, "failed to requeue pinned entry");
                }
            }
        }
    });
}
