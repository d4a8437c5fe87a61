//! Engine assembly
//!
//! Wires the store, the state manager, and every background manager into
//! one `Engine`, in leaves-first order: metadata store, state manager,
//! content cache, managers, queues. The FUSE facade and the CLI talk to
//! the engine; nothing below this layer knows about the kernel.
//!
//! Background tasks are grouped into per-category task trackers so
//! shutdown can drain each group under its configured timeout:
//! notifier/probe callbacks, download workers, upload workers (which
//! persist resume state when the token fires), and the remaining engine
//! loops.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use graphfs_core::domain::{ItemId, MetadataEntry};
use graphfs_core::ports::{FeedbackHandler, NotifierTransport, RemoteClient};
use graphfs_core::{Config, CoreError};
use graphfs_store::{
    CacheMaintainer, ContentCache, DatabasePool, MetadataStore, StateManager,
};

use crate::delta::{ActivityTracker, DeltaLoop};
use crate::hydration::{spawn_pin_watcher, HydrationManager};
use crate::mutation::MutationQueue;
use crate::notifier::ChangeNotifier;
use crate::offline::{spawn_connectivity_monitor, OfflineDrainer, OfflineTracker};
use crate::requests::MetadataRequestManager;
use crate::status::{FeedbackManager, StatsCollector, StatsSnapshot};
use crate::upload::UploadManager;

/// Name of the virtual volume-info overlay file in the root directory.
const VOLUME_INFO_NAME: &str = ".xdg-volume-info";

/// Key in the `settings` bucket holding the root item id.
const ROOT_ID_SETTING: &str = "root_id";

/// The assembled layering engine.
pub struct Engine {
    config: Config,
    root_id: ItemId,
    pub state: StateManager,
    pub cache: Arc<ContentCache>,
    pub maintainer: CacheMaintainer,
    pub hydration: Arc<HydrationManager>,
    pub uploads: Arc<UploadManager>,
    pub mutations: Arc<MutationQueue>,
    pub requests: Arc<MetadataRequestManager>,
    pub offline: Arc<OfflineTracker>,
    pub notifier: Arc<ChangeNotifier>,
    pub activity: Arc<ActivityTracker>,
    pub feedback: Arc<FeedbackManager>,
    stats: StatsCollector,
    shutdown: CancellationToken,
    network_tasks: TaskTracker,
    download_tasks: TaskTracker,
    upload_tasks: TaskTracker,
    engine_tasks: TaskTracker,
}

impl Engine {
    /// Build and start the engine for one mount.
    pub async fn start(
        config: Config,
        mount_point: &Path,
        remote: Arc<dyn RemoteClient>,
        transport: Option<Arc<dyn NotifierTransport>>,
        feedback_handler: Arc<dyn FeedbackHandler>,
    ) -> Result<Arc<Self>, CoreError> {
        config.validate()?;
        let mount_dir = config.mount_dir(mount_point);
        Self::start_in(config, mount_dir, remote, transport, feedback_handler).await
    }

    /// Like [`Engine::start`] but with an explicit state directory (tests).
    pub async fn start_in(
        config: Config,
        mount_dir: PathBuf,
        remote: Arc<dyn RemoteClient>,
        transport: Option<Arc<dyn NotifierTransport>>,
        feedback_handler: Arc<dyn FeedbackHandler>,
    ) -> Result<Arc<Self>, CoreError> {
        let shutdown = CancellationToken::new();
        let network_tasks = TaskTracker::new();
        let download_tasks = TaskTracker::new();
        let upload_tasks = TaskTracker::new();
        let engine_tasks = TaskTracker::new();

        // Leaves first: store, state manager, cache.
        let pool = DatabasePool::new(&mount_dir.join("metadata.db")).await?;
        let store = MetadataStore::new(&pool);
        let state = StateManager::new(store, config.overlay.default_policy);
        let cache = Arc::new(ContentCache::open(
            mount_dir.join("content"),
            config.cache.max_cache_size,
            config.cache.expiration_days,
        )?);
        let maintainer = CacheMaintainer::new(Arc::clone(&cache), state.clone());

        let feedback = Arc::new(FeedbackManager::new(feedback_handler, config.feedback.level));

        let offline = OfflineTracker::new(
            state.clone(),
            Arc::clone(&cache),
            config.offline.max_pending_changes,
            config.offline.offline_mode,
            Arc::clone(&feedback),
        );

        // Managers.
        let hydration = HydrationManager::start(
            state.clone(),
            Arc::clone(&cache),
            maintainer.clone(),
            Arc::clone(&remote),
            config.hydration.workers,
            config.hydration.queue_size,
            config.hydration.max_retries,
            shutdown.clone(),
            &download_tasks,
        );
        spawn_pin_watcher(
            state.clone(),
            Arc::clone(&hydration),
            shutdown.clone(),
            &download_tasks,
        );

        let uploads = UploadManager::start(
            state.clone(),
            Arc::clone(&cache),
            Arc::clone(&remote),
            config.upload.clone(),
            config.conflicts.policy,
            Arc::clone(&feedback),
            shutdown.clone(),
            &upload_tasks,
        );

        let mutations = MutationQueue::new(
            state.clone(),
            Arc::clone(&cache),
            Arc::clone(&remote),
            Arc::clone(&offline),
            shutdown.clone(),
            engine_tasks.clone(),
        );

        let (notifier, wake_rx) = ChangeNotifier::start(
            transport,
            config.realtime.polling_only || config.offline.offline_mode,
            shutdown.clone(),
            &network_tasks,
        );

        let activity = ActivityTracker::new(Duration::from_secs(config.delta.active_window_secs));

        let requests = MetadataRequestManager::start(
            state.clone(),
            Arc::clone(&remote),
            Arc::clone(&activity),
            Arc::clone(&offline),
            config.metadata.workers,
            config.metadata.high_queue_size,
            config.metadata.low_queue_size,
            config.shutdown.metadata_request(),
            shutdown.clone(),
            &engine_tasks,
        );

        // Background loops.
        let delta_loop = DeltaLoop::new(
            state.clone(),
            Arc::clone(&cache),
            Arc::clone(&remote),
            Arc::clone(&hydration),
            Arc::clone(&notifier),
            Arc::clone(&offline),
            Arc::clone(&activity),
            config.delta.clone(),
            config.realtime.clone(),
        );
        {
            let shutdown = shutdown.clone();
            engine_tasks.spawn(async move {
                delta_loop.run(wake_rx, shutdown).await;
            });
        }

        spawn_connectivity_monitor(
            Arc::clone(&remote),
            Arc::clone(&offline),
            Duration::from_secs(config.offline.probe_interval_secs),
            Duration::from_secs(config.offline.probe_timeout_secs),
            shutdown.clone(),
            &network_tasks,
        );

        OfflineDrainer::new(
            Arc::clone(&offline),
            Arc::clone(&mutations),
            Arc::clone(&uploads),
        )
        .spawn(shutdown.clone(), &engine_tasks);

        // Periodic cache cleanup.
        {
            let maintainer = maintainer.clone();
            let interval = config.cleanup_interval();
            let shutdown = shutdown.clone();
            engine_tasks.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // The first tick fires immediately; skip it so startup does
                // not race session restoration.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    if let Err(e) = maintainer.cleanup().await {
                        tracing::warn!(error = %e, "cache cleanup pass failed");
                    }
                }
            });
        }

        // Cached content follows id adoptions (delta reconciliation of a
        // pending local create; the upload path rekeys its own files, and a
        // second rekey of the same id is a no-op).
        {
            let mut rekeys = state.subscribe_rekeys();
            let cache = Arc::clone(&cache);
            let shutdown = shutdown.clone();
            engine_tasks.spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        event = rekeys.recv() => event,
                    };
                    match event {
                        Ok(event) => {
                            if let Err(e) = cache.rekey(&event.old_id, &event.new_id) {
                                tracing::warn!(
                                    old = %event.old_id,
                                    new = %event.new_id,
                                    error = %e,
                                    "failed to move cached content to adopted id"
                                );
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
            });
        }

        let stats = StatsCollector::new(state.store().clone(), Arc::clone(&cache));

        let root_id = bootstrap_root(&state, &cache, &remote, &offline).await?;

        let engine = Arc::new(Self {
            config,
            root_id,
            state,
            cache,
            maintainer,
            hydration,
            uploads,
            mutations,
            requests,
            offline,
            notifier,
            activity,
            feedback,
            stats,
            shutdown,
            network_tasks,
            download_tasks,
            upload_tasks,
            engine_tasks,
        });

        // Resume interrupted transfers from the previous run.
        engine.hydration.restore_persisted().await?;
        engine.uploads.restore_persisted().await?;

        tracing::info!(root = %engine.root_id, "engine started");
        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn root_id(&self) -> &ItemId {
        &self.root_id
    }

    /// Point-in-time stats snapshot (`--stats`).
    pub async fn stats(&self) -> Result<StatsSnapshot, CoreError> {
        self.stats
            .collect(
                self.offline.is_offline(),
                self.notifier.health(),
                self.hydration.active_count(),
                self.uploads.active_count(),
                self.config.shutdown.content_stats(),
            )
            .await
    }

    /// Drain all background work under the per-category timeouts.
    pub async fn shutdown(&self) {
        tracing::info!("engine shutting down");
        self.shutdown.cancel();

        for (name, tracker, timeout) in [
            (
                "network",
                &self.network_tasks,
                self.config.shutdown.network_callback(),
            ),
            (
                "downloads",
                &self.download_tasks,
                self.config.shutdown.download_worker(),
            ),
            (
                "uploads",
                &self.upload_tasks,
                self.config.shutdown.upload_graceful(),
            ),
            (
                "engine",
                &self.engine_tasks,
                self.config.shutdown.filesystem(),
            ),
        ] {
            tracker.close();
            if tokio::time::timeout(timeout, tracker.wait()).await.is_err() {
                tracing::warn!(category = name, "shutdown timeout expired with tasks still running");
            }
        }
        tracing::info!("engine stopped");
    }
}

/// Ensure the root entry (and the virtual volume-info overlay) exist.
async fn bootstrap_root(
    state: &StateManager,
    cache: &Arc<ContentCache>,
    remote: &Arc<dyn RemoteClient>,
    offline: &Arc<OfflineTracker>,
) -> Result<ItemId, CoreError> {
    if let Some(stored) = state.store().get_setting(ROOT_ID_SETTING).await? {
        let root_id = ItemId::new(stored)?;
        if state.store().get(&root_id).await?.is_some() {
            return Ok(root_id);
        }
    }

    if offline.is_offline() {
        return Err(CoreError::Network(
            "cannot bootstrap an empty metadata store while offline".into(),
        ));
    }

    let root = match remote.get_root().await {
        Ok(root) => root,
        Err(e) => {
            offline.report_network_error(&e);
            return Err(e);
        }
    };
    let root_id = ItemId::new(root.id.as_str())?;
    let root_item = graphfs_core::domain::Item::remote_directory(
        root_id.clone(),
        root.id.clone(),
        "",
        None,
        root.etag.clone(),
        root.mtime,
    );
    state
        .store()
        .put(&MetadataEntry::from_remote(
            root_item,
            state.default_overlay(),
        ))
        .await?;
    state
        .store()
        .set_setting(ROOT_ID_SETTING, root_id.as_str())
        .await?;

    // Virtual overlay: present in readdir, hydrated, never synced.
    let content = b"[Volume Info]\nName=GraphFS\nIcon=folder-remote\n";
    let volume = MetadataEntry::new_virtual(VOLUME_INFO_NAME, root_id.clone(), content.len() as u64);
    cache.insert(volume.id(), content)?;
    state.insert_virtual(&volume).await?;

    tracing::info!(root = %root_id, "metadata store bootstrapped");
    Ok(root_id)
}
