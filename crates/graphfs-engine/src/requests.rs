//! Metadata request manager
//!
//! Priority queue for metadata reads, primarily directory enumerations.
//! Two bounded queues (foreground / background) feed a small worker pool
//! with one worker reserved for foreground requests, so a deep tree warm
//! can never starve a blocking `readdir`.
//!
//! Requests are deduplicated by `(op, id)`: additional callers attach as
//! waiters to the in-flight job. Cancellation detaches the waiter but the
//! network call continues for the others.
//!
//! Stale-cache policy: once a directory has been enumerated, `list_children`
//! serves the store immediately and enqueues an async refresh; only a
//! never-enumerated directory blocks the caller on a foreground fetch.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use graphfs_core::domain::{ItemId, MetadataEntry};
use graphfs_core::ports::RemoteClient;
use graphfs_core::CoreError;
use graphfs_store::StateManager;

use crate::delta::ActivityTracker;
use crate::offline::OfflineTracker;

/// Priority of a metadata request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPriority {
    /// A user operation is blocked on the result.
    Foreground,
    /// Tree warming, refresh.
    Background,
}

/// Deduplication key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RequestKey {
    Children(ItemId),
    Item(ItemId),
}

type Outcome = Option<Result<(), CoreError>>;

struct InflightJob {
    outcome_tx: watch::Sender<Outcome>,
}

/// Priority queue + dedup for metadata fetches.
pub struct MetadataRequestManager {
    state: StateManager,
    remote: Arc<dyn RemoteClient>,
    activity: Arc<ActivityTracker>,
    offline: Arc<OfflineTracker>,
    inflight: Arc<DashMap<RequestKey, InflightJob>>,
    high_tx: mpsc::Sender<RequestKey>,
    low_tx: mpsc::Sender<RequestKey>,
    request_timeout: Duration,
    shutdown: CancellationToken,
}

impl MetadataRequestManager {
    /// Create the manager and spawn `workers` tasks (minimum two: one is
    /// reserved for foreground requests).
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        state: StateManager,
        remote: Arc<dyn RemoteClient>,
        activity: Arc<ActivityTracker>,
        offline: Arc<OfflineTracker>,
        workers: usize,
        high_queue_size: usize,
        low_queue_size: usize,
        request_timeout: Duration,
        shutdown: CancellationToken,
        tracker: &TaskTracker,
    ) -> Arc<Self> {
        let (high_tx, high_rx) = mpsc::channel(high_queue_size);
        let (low_tx, low_rx) = mpsc::channel(low_queue_size);

        let manager = Arc::new(Self {
            state,
            remote,
            activity,
            offline,
            inflight: Arc::new(DashMap::new()),
            high_tx,
            low_tx,
            request_timeout,
            shutdown,
        });

        let high_rx = Arc::new(tokio::sync::Mutex::new(high_rx));
        let low_rx = Arc::new(tokio::sync::Mutex::new(low_rx));
        for worker_id in 0..workers.max(2) {
            let manager = Arc::clone(&manager);
            let high_rx = Arc::clone(&high_rx);
            let low_rx = Arc::clone(&low_rx);
            // Worker 0 serves the foreground queue exclusively.
            let foreground_only = worker_id == 0;
            tracker.spawn(async move {
                manager.worker_loop(worker_id, foreground_only, high_rx, low_rx).await;
            });
        }

        manager
    }

    /// List a directory with the stale-serve policy.
    ///
    /// Served from the store when the directory has been enumerated before
    /// (with an async refresh queued); otherwise a foreground fetch is
    /// awaited under the caller's cancellation and the request timeout.
    pub async fn list_children(
        &self,
        parent: &ItemId,
        caller: &CancellationToken,
    ) -> Result<Vec<MetadataEntry>, CoreError> {
        self.activity.record_activity();

        let enumerated = self.state.store().has_enumerated(parent).await?;
        if enumerated || self.offline.is_offline() {
            if !self.offline.is_offline() {
                self.submit(RequestKey::Children(parent.clone()), RequestPriority::Background);
            }
            return self.state.store().list_children(parent).await;
        }

        // Cold directory: the caller waits for the fetch.
        let mut outcome_rx =
            match self.submit(RequestKey::Children(parent.clone()), RequestPriority::Foreground) {
                Some(rx) => rx,
                None => {
                    return Err(CoreError::Backpressure(
                        "metadata request queue full".into(),
                    ))
                }
            };

        let wait = async {
            loop {
                if let Some(result) = outcome_rx.borrow().clone() {
                    return result;
                }
                if outcome_rx.changed().await.is_err() {
                    return Err(CoreError::Cancelled);
                }
            }
        };

        tokio::select! {
            result = tokio::time::timeout(self.request_timeout, wait) => {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {
                        return Err(CoreError::Network(format!(
                            "metadata fetch for {parent} timed out"
                        )))
                    }
                }
            }
            _ = caller.cancelled() => {
                // The in-flight fetch keeps running for other waiters.
                return Err(CoreError::Cancelled);
            }
        }

        self.state.store().list_children(parent).await
    }

    /// Queue a background enumeration (tree warmer).
    pub fn warm(&self, parent: &ItemId) {
        self.submit(RequestKey::Children(parent.clone()), RequestPriority::Background);
    }

    /// Fetch a single item record in the foreground.
    pub async fn fetch_item(&self, id: &ItemId) -> Result<(), CoreError> {
        self.activity.record_activity();
        if self.offline.is_offline() {
            return Err(CoreError::Network("offline".into()));
        }
        let Some(mut rx) = self.submit(RequestKey::Item(id.clone()), RequestPriority::Foreground)
        else {
            return Err(CoreError::Backpressure("metadata request queue full".into()));
        };
        let wait = async {
            loop {
                if let Some(result) = rx.borrow().clone() {
                    return result;
                }
                if rx.changed().await.is_err() {
                    return Err(CoreError::Cancelled);
                }
            }
        };
        tokio::time::timeout(self.request_timeout, wait)
            .await
            .map_err(|_| CoreError::Network(format!("metadata fetch for {id} timed out")))?
    }

    /// Enqueue a request, deduplicating against in-flight jobs. Returns a
    /// receiver for the job outcome, or `None` when the queue is full.
    fn submit(&self, key: RequestKey, priority: RequestPriority) -> Option<watch::Receiver<Outcome>> {
        if let Some(job) = self.inflight.get(&key) {
            return Some(job.outcome_tx.subscribe());
        }

        let (outcome_tx, outcome_rx) = watch::channel(None);
        self.inflight.insert(key.clone(), InflightJob { outcome_tx });

        let tx = match priority {
            RequestPriority::Foreground => &self.high_tx,
            RequestPriority::Background => &self.low_tx,
        };
        if tx.try_send(key.clone()).is_err() {
            self.inflight.remove(&key);
            if priority == RequestPriority::Background {
                tracing::debug!("background metadata queue full, dropping refresh");
            }
            return None;
        }
        Some(outcome_rx)
    }

    // ========================================================================
    // Workers
    // ========================================================================

    async fn worker_loop(
        &self,
        worker_id: usize,
        foreground_only: bool,
        high_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<RequestKey>>>,
        low_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<RequestKey>>>,
    ) {
        tracing::debug!(worker_id, foreground_only, "metadata worker started");
        loop {
            let key = if foreground_only {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    key = async { high_rx.lock().await.recv().await } => key,
                }
            } else {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    key = async { high_rx.lock().await.recv().await } => key,
                    key = async { low_rx.lock().await.recv().await } => key,
                }
            };
            let Some(key) = key else { break };

            let result = self.process(&key).await;
            if let Err(e) = &result {
                self.offline.report_network_error(e);
                tracing::debug!(key = ?key, error = %e, "metadata fetch failed");
            }
            if let Some((_, job)) = self.inflight.remove(&key) {
                let _ = job.outcome_tx.send(Some(result));
            }
        }
        tracing::debug!(worker_id, "metadata worker stopped");
    }

    async fn process(&self, key: &RequestKey) -> Result<(), CoreError> {
        match key {
            RequestKey::Children(parent) => self.fetch_children(parent).await,
            RequestKey::Item(id) => self.fetch_one(id).await,
        }
    }

    async fn fetch_children(&self, parent: &ItemId) -> Result<(), CoreError> {
        let entry = self
            .state
            .store()
            .get(parent)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("no entry for {parent}")))?;
        let remote_id = entry
            .item()
            .remote_id
            .clone()
            .ok_or_else(|| CoreError::NotFound(format!("{parent} has no remote listing")))?;

        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .remote
                .list_children(&remote_id, page_token.as_deref())
                .await?;
            for item in &page.items {
                self.state.apply_remote_delta(item).await?;
            }
            match page.next_page {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        self.state.store().mark_enumerated(parent).await?;
        Ok(())
    }

    async fn fetch_one(&self, id: &ItemId) -> Result<(), CoreError> {
        let entry = self
            .state
            .store()
            .get(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("no entry for {id}")))?;
        let remote_id = entry
            .item()
            .remote_id
            .clone()
            .ok_or_else(|| CoreError::NotFound(format!("{id} is local-only")))?;
        let item = self.remote.get_item(&remote_id).await?;
        self.state.apply_remote_delta(&item).await?;
        Ok(())
    }
}
