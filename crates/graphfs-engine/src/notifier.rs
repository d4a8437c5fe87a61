//! Change notifier
//!
//! Facade over the realtime push transport. In `Realtime` mode a
//! background task holds a subscription open, counts heartbeats, and wakes
//! the delta loop on every signal; transport failures reconnect with
//! exponential backoff plus jitter, and lapsed subscriptions are renewed.
//! In `PollingOnly` mode there is no task and the delta loop runs on its
//! timer alone.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use graphfs_core::ports::NotifierTransport;

/// Operating mode of the notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifierMode {
    Realtime,
    PollingOnly,
}

/// Health classification of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failed,
}

/// Health snapshot exposed to the delta loop and the stats surface.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct NotifierHealth {
    pub mode: NotifierMode,
    pub status: HealthStatus,
    pub heartbeats: u64,
    pub reconnect_count: u64,
}

const STATUS_HEALTHY: u8 = 0;
const STATUS_DEGRADED: u8 = 1;
const STATUS_FAILED: u8 = 2;

/// Consecutive reconnect failures before the channel is declared failed.
const FAILURES_TO_FAILED: u32 = 5;

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(300);

/// Facade over the push transport; owns the subscription task.
pub struct ChangeNotifier {
    mode: NotifierMode,
    status: AtomicU8,
    heartbeats: AtomicU64,
    reconnects: AtomicU64,
    wake_tx: mpsc::Sender<()>,
}

impl ChangeNotifier {
    /// Create the notifier and, in realtime mode, spawn the subscription
    /// task. Returns the notifier and the wake channel for the delta loop.
    pub fn start(
        transport: Option<Arc<dyn NotifierTransport>>,
        polling_only: bool,
        shutdown: CancellationToken,
        tracker: &TaskTracker,
    ) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (wake_tx, wake_rx) = mpsc::channel(1);

        let mode = if polling_only || transport.is_none() {
            NotifierMode::PollingOnly
        } else {
            NotifierMode::Realtime
        };

        let notifier = Arc::new(Self {
            mode,
            status: AtomicU8::new(if mode == NotifierMode::Realtime {
                STATUS_DEGRADED // degraded until the first subscribe succeeds
            } else {
                STATUS_HEALTHY
            }),
            heartbeats: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            wake_tx,
        });

        if mode == NotifierMode::Realtime {
            // Realtime mode is only selected when a transport is present.
            if let Some(transport) = transport {
                let task_notifier = Arc::clone(&notifier);
                tracker.spawn(async move {
                    task_notifier.run(transport, shutdown).await;
                });
            }
        }

        (notifier, wake_rx)
    }

    /// Current health snapshot.
    pub fn health(&self) -> NotifierHealth {
        let status = match self.status.load(Ordering::SeqCst) {
            STATUS_HEALTHY => HealthStatus::Healthy,
            STATUS_DEGRADED => HealthStatus::Degraded,
            _ => HealthStatus::Failed,
        };
        NotifierHealth {
            mode: self.mode,
            status,
            heartbeats: self.heartbeats.load(Ordering::SeqCst),
            reconnect_count: self.reconnects.load(Ordering::SeqCst),
        }
    }

    pub fn mode(&self) -> NotifierMode {
        self.mode
    }

    async fn run(&self, transport: Arc<dyn NotifierTransport>, shutdown: CancellationToken) {
        let mut consecutive_failures = 0u32;
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let mut stream = match transport.subscribe().await {
                Ok(stream) => {
                    tracing::info!("realtime subscription established");
                    consecutive_failures = 0;
                    self.status.store(STATUS_HEALTHY, Ordering::SeqCst);
                    stream
                }
                Err(e) => {
                    consecutive_failures += 1;
                    self.reconnects.fetch_add(1, Ordering::SeqCst);
                    self.status.store(
                        if consecutive_failures >= FAILURES_TO_FAILED {
                            STATUS_FAILED
                        } else {
                            STATUS_DEGRADED
                        },
                        Ordering::SeqCst,
                    );
                    let delay = backoff_with_jitter(consecutive_failures);
                    tracing::warn!(
                        error = %e,
                        consecutive_failures,
                        delay_ms = delay.as_millis() as u64,
                        "realtime subscribe failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = shutdown.cancelled() => break,
                    }
                }
            };

            // Pump signals until the stream lapses or fails.
            loop {
                let signal = tokio::select! {
                    signal = stream.next_signal() => signal,
                    _ = shutdown.cancelled() => return,
                };
                match signal {
                    Ok(Some(())) => {
                        self.heartbeats.fetch_add(1, Ordering::SeqCst);
                        // A full wake slot already means a sweep is due.
                        let _ = self.wake_tx.try_send(());
                    }
                    Ok(None) => {
                        tracing::debug!("subscription lapsed, renewing");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "realtime stream failed");
                        self.status.store(STATUS_DEGRADED, Ordering::SeqCst);
                        break;
                    }
                }
            }
        }
    }
}

/// Exponential backoff with up to one second of time-derived jitter.
fn backoff_with_jitter(failures: u32) -> Duration {
    let exp = RECONNECT_BASE * 2u32.saturating_pow(failures.saturating_sub(1).min(16));
    let capped = exp.min(RECONNECT_MAX);
    let jitter_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_nanos()) % 1000)
        .unwrap_or(0);
    capped + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use graphfs_core::ports::NotifyStream;
    use graphfs_core::CoreError;

    struct ScriptedStream {
        signals: Vec<Result<Option<()>, CoreError>>,
    }

    #[async_trait]
    impl NotifyStream for ScriptedStream {
        async fn next_signal(&mut self) -> Result<Option<()>, CoreError> {
            if self.signals.is_empty() {
                // Park forever; the test tears the task down via shutdown.
                std::future::pending::<()>().await;
                unreachable!()
            }
            self.signals.remove(0)
        }
    }

    struct ScriptedTransport {
        fail_first: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl NotifierTransport for ScriptedTransport {
        async fn subscribe(&self) -> Result<Box<dyn NotifyStream>, CoreError> {
            if self.fail_first.swap(false, Ordering::SeqCst) {
                return Err(CoreError::Network("connection refused".into()));
            }
            Ok(Box::new(ScriptedStream {
                signals: vec![Ok(Some(())), Ok(Some(()))],
            }))
        }
    }

    #[tokio::test]
    async fn test_polling_only_reports_healthy() {
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let (notifier, _rx) = ChangeNotifier::start(None, true, shutdown, &tracker);
        let health = notifier.health();
        assert_eq!(health.mode, NotifierMode::PollingOnly);
        assert_eq!(health.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_signals_count_heartbeats_and_wake() {
        let shutdown = CancellationToken::new();
        let transport = Arc::new(ScriptedTransport {
            fail_first: std::sync::atomic::AtomicBool::new(false),
        });
        let tracker = TaskTracker::new();
        let (notifier, mut wake_rx) =
            ChangeNotifier::start(Some(transport), false, shutdown.clone(), &tracker);

        // The two scripted signals coalesce into at least one wake.
        wake_rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(notifier.health().heartbeats >= 1);
        assert_eq!(notifier.health().status, HealthStatus::Healthy);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_reconnect_counts_failures() {
        let shutdown = CancellationToken::new();
        let transport = Arc::new(ScriptedTransport {
            fail_first: std::sync::atomic::AtomicBool::new(true),
        });
        let tracker = TaskTracker::new();
        let (notifier, mut wake_rx) =
            ChangeNotifier::start(Some(transport), false, shutdown.clone(), &tracker);

        wake_rx.recv().await.unwrap();
        assert!(notifier.health().reconnect_count >= 1);
        shutdown.cancel();
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let first = backoff_with_jitter(1);
        let fifth = backoff_with_jitter(5);
        assert!(fifth >= first);
        assert!(backoff_with_jitter(30) <= RECONNECT_MAX + Duration::from_secs(1));
    }
}
