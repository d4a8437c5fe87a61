//! Delta loop
//!
//! Keeps local metadata current with the remote store. One sweep walks the
//! delta feed from the durable cursor, routes every event through the
//! State Manager, and stores the new cursor when the final page arrives;
//! applying the same page twice is a no-op.
//!
//! Cadence adapts to the notifier and to foreground activity:
//!
//! | condition                    | interval                    |
//! |------------------------------|-----------------------------|
//! | realtime healthy             | fallback (default 30 min)   |
//! | realtime degraded            | 5 min                       |
//! | realtime failed              | 10 s recovery window        |
//! | polling only                 | configured delta interval   |
//! | foreground activity recent   | active interval (60 s)      |
//!
//! A push signal from the notifier wakes the loop immediately regardless
//! of the timer.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use graphfs_core::config::{DeltaConfig, RealtimeConfig};
use graphfs_core::domain::PinMode;
use graphfs_core::ports::{DeltaEvent, RemoteClient};
use graphfs_core::CoreError;
use graphfs_store::{ContentCache, DeltaOutcome, StateManager};

use crate::hydration::{HydrationManager, HydrationPriority};
use crate::notifier::{ChangeNotifier, HealthStatus, NotifierMode};
use crate::offline::OfflineTracker;

const DEGRADED_INTERVAL: Duration = Duration::from_secs(300);
const FAILED_INTERVAL: Duration = Duration::from_secs(10);

/// Records foreground metadata activity so the loop can tighten its
/// cadence while a user is actively browsing.
pub struct ActivityTracker {
    last_active_unix: AtomicI64,
    window: Duration,
}

impl ActivityTracker {
    pub fn new(window: Duration) -> Arc<Self> {
        Arc::new(Self {
            last_active_unix: AtomicI64::new(0),
            window,
        })
    }

    /// Note a foreground metadata operation (readdir, lookup fetch).
    pub fn record_activity(&self) {
        self.last_active_unix
            .store(chrono::Utc::now().timestamp(), Ordering::SeqCst);
    }

    /// True while the last foreground activity is within the window.
    pub fn is_active(&self) -> bool {
        let last = self.last_active_unix.load(Ordering::SeqCst);
        if last == 0 {
            return false;
        }
        let elapsed = chrono::Utc::now().timestamp().saturating_sub(last);
        elapsed >= 0 && (elapsed as u64) <= self.window.as_secs()
    }
}

/// Result of one delta sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub upserts: usize,
    pub tombstones: usize,
    pub invalidated: usize,
    pub conflicts: usize,
    pub rejected_duplicates: usize,
}

/// Background loop applying remote deltas.
pub struct DeltaLoop {
    state: StateManager,
    cache: Arc<ContentCache>,
    remote: Arc<dyn RemoteClient>,
    hydration: Arc<HydrationManager>,
    notifier: Arc<ChangeNotifier>,
    offline: Arc<OfflineTracker>,
    activity: Arc<ActivityTracker>,
    delta_config: DeltaConfig,
    realtime_config: RealtimeConfig,
}

impl DeltaLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: StateManager,
        cache: Arc<ContentCache>,
        remote: Arc<dyn RemoteClient>,
        hydration: Arc<HydrationManager>,
        notifier: Arc<ChangeNotifier>,
        offline: Arc<OfflineTracker>,
        activity: Arc<ActivityTracker>,
        delta_config: DeltaConfig,
        realtime_config: RealtimeConfig,
    ) -> Self {
        Self {
            state,
            cache,
            remote,
            hydration,
            notifier,
            offline,
            activity,
            delta_config,
            realtime_config,
        }
    }

    /// Interval until the next sweep under current conditions.
    fn current_interval(&self) -> Duration {
        let base = match self.notifier.mode() {
            NotifierMode::PollingOnly => Duration::from_secs(self.delta_config.interval_secs),
            NotifierMode::Realtime => match self.notifier.health().status {
                HealthStatus::Healthy => Duration::from_secs(self.realtime_config.fallback_secs),
                HealthStatus::Degraded => DEGRADED_INTERVAL,
                HealthStatus::Failed => FAILED_INTERVAL,
            },
        };
        if self.activity.is_active() {
            base.min(Duration::from_secs(self.delta_config.active_interval_secs))
        } else {
            base
        }
    }

    /// Run until shutdown. `wake_rx` is the notifier's wake channel.
    pub async fn run(self, mut wake_rx: mpsc::Receiver<()>, shutdown: CancellationToken) {
        tracing::info!("delta loop started");
        loop {
            let interval = self.current_interval();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
                signal = wake_rx.recv() => {
                    if signal.is_none() {
                        // Notifier gone; keep polling on the timer.
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(interval) => {}
                        }
                    }
                }
            }

            if self.offline.is_offline() {
                continue;
            }

            match self.sweep().await {
                Ok(report) => {
                    if report != SweepReport::default() {
                        tracing::info!(
                            upserts = report.upserts,
                            tombstones = report.tombstones,
                            invalidated = report.invalidated,
                            conflicts = report.conflicts,
                            "delta sweep applied"
                        );
                    }
                }
                Err(e) => {
                    self.offline.report_network_error(&e);
                    tracing::warn!(error = %e, "delta sweep failed");
                }
            }
        }
        tracing::info!("delta loop stopped");
    }

    /// Walk the delta feed from the stored cursor to its end.
    pub async fn sweep(&self) -> Result<SweepReport, CoreError> {
        let mut report = SweepReport::default();
        let mut link = self.state.store().delta_link().await?;
        // (parent, name) pairs claimed by upserts within this sweep; a
        // second claim on the same name is rejected, first writer wins.
        let mut claimed_names: HashSet<(String, String)> = HashSet::new();

        loop {
            let page = self.remote.delta(link.as_deref()).await?;

            for event in &page.events {
                match event {
                    DeltaEvent::Upsert(item) => {
                        let claim = (
                            item.parent_id
                                .as_ref()
                                .map(|p| p.as_str().to_string())
                                .unwrap_or_default(),
                            item.name.clone(),
                        );
                        if !claimed_names.insert(claim) {
                            tracing::warn!(
                                name = %item.name,
                                id = %item.id,
                                "duplicate rename target within one sweep, rejecting second upsert"
                            );
                            report.rejected_duplicates += 1;
                            continue;
                        }

                        report.upserts += 1;
                        // One bad event must not sink the page; the next
                        // sweep retries it from the same cursor position.
                        match self.state.apply_remote_delta(item).await {
                            Ok(DeltaOutcome::Invalidated) => {
                                report.invalidated += 1;
                                self.after_invalidation(item).await?;
                            }
                            Ok(DeltaOutcome::ConflictDetected) => report.conflicts += 1,
                            Ok(_) => {}
                            Err(e) => {
                                tracing::warn!(id = %item.id, error = %e, "delta upsert failed");
                            }
                        }
                    }
                    DeltaEvent::Tombstone { id } => {
                        report.tombstones += 1;
                        match self.state.apply_remote_tombstone(id).await {
                            Ok(Some(local_id)) => {
                                self.state.remove(&local_id).await?;
                                self.cache.delete(&local_id)?;
                            }
                            Ok(None) => {}
                            Err(e) => {
                                tracing::warn!(id = %id, error = %e, "delta tombstone failed");
                            }
                        }
                    }
                }
            }

            if let Some(delta_link) = &page.delta_link {
                self.state.store().set_delta_link(delta_link).await?;
                break;
            }
            match page.next_link {
                Some(next) => link = Some(next),
                None => break, // defensive: a page without either link ends the sweep
            }
        }

        Ok(report)
    }

    /// Drop the stale cache file for an invalidated entry and requeue
    /// hydration when it is pinned.
    async fn after_invalidation(
        &self,
        item: &graphfs_core::ports::RemoteItem,
    ) -> Result<(), CoreError> {
        let Some(entry) = self.state.store().get_by_remote(&item.id).await? else {
            return Ok(());
        };
        let id = entry.id().clone();
        self.cache.delete(&id)?;
        if entry.pin_mode() == PinMode::Always {
            match self.hydration.queue(&id, HydrationPriority::Background).await {
                Ok(ticket) => ticket.forget(),
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "failed to requeue pinned entry after invalidation")
                }
            }
        }
        Ok(())
    }
}
