//! GraphFS command-line interface
//!
//! Mounts a remote drive at the given mount point. Exit codes:
//! 0 clean unmount, 1 configuration error, 2 authentication required,
//! 3 FUSE mount failure, 4 storage failure.

mod remote;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use graphfs_core::auth;
use graphfs_core::domain::OverlayPolicy;
use graphfs_core::config::FeedbackLevel;
use graphfs_core::ports::LogFeedbackHandler;
use graphfs_core::{Config, CoreError};
use graphfs_engine::{Engine, NotifierHealth, NotifierMode, HealthStatus, StatsCollector};
use graphfs_fuse::GraphFs;

use remote::DisconnectedClient;

const EXIT_CONFIG: u8 = 1;
const EXIT_AUTH: u8 = 2;
const EXIT_MOUNT: u8 = 3;
const EXIT_STORAGE: u8 = 4;

/// Mount a remote drive as a local filesystem.
#[derive(Debug, Parser)]
#[command(name = "graphfs", version, about)]
struct Cli {
    /// Mount point for the filesystem.
    #[arg(value_name = "MOUNTPOINT", required_unless_present = "stats")]
    mountpoint: Option<PathBuf>,

    /// Configuration file (default: $XDG_CONFIG_HOME/graphfs/config.yml).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Account identifier whose tokens to use.
    #[arg(long, value_name = "ACCOUNT")]
    account: Option<String>,

    /// Cache directory override.
    #[arg(long, value_name = "PATH")]
    cache_dir: Option<PathBuf>,

    /// Days before unused cached content expires.
    #[arg(long, value_name = "DAYS")]
    cache_expiration_days: Option<u32>,

    /// Content-cache size bound in bytes (0 = unlimited).
    #[arg(long, value_name = "BYTES")]
    max_cache_size: Option<u64>,

    /// Hours between cache cleanup passes (1..=720).
    #[arg(long, value_name = "HOURS")]
    cache_cleanup_interval: Option<u32>,

    /// Base delta polling interval in seconds.
    #[arg(long, value_name = "SECONDS")]
    delta_interval: Option<u64>,

    /// Tightened delta interval while foreground activity is recent.
    #[arg(long, value_name = "SECONDS")]
    active_delta_interval: Option<u64>,

    /// Window after foreground activity with the tightened cadence.
    #[arg(long, value_name = "SECONDS")]
    active_delta_window: Option<u64>,

    /// Fallback polling interval while the realtime channel is healthy.
    #[arg(long, value_name = "SECONDS")]
    realtime_fallback_seconds: Option<u64>,

    /// Disable the realtime push channel; poll only.
    #[arg(long)]
    polling_only: bool,

    /// Hydration worker count.
    #[arg(long, value_name = "N")]
    hydration_workers: Option<usize>,

    /// Hydration queue bound.
    #[arg(long, value_name = "N")]
    hydration_queue_size: Option<usize>,

    /// Metadata worker count.
    #[arg(long, value_name = "N")]
    metadata_workers: Option<usize>,

    /// Foreground metadata queue bound.
    #[arg(long, value_name = "N")]
    metadata_high_queue_size: Option<usize>,

    /// Background metadata queue bound.
    #[arg(long, value_name = "N")]
    metadata_low_queue_size: Option<usize>,

    /// Default overlay policy: REMOTE_WINS, LOCAL_WINS or MERGED.
    #[arg(long, value_name = "POLICY")]
    overlay_policy: Option<String>,

    /// Operate offline: serve cached state, queue every mutation.
    #[arg(long)]
    offline_mode: bool,

    /// User feedback verbosity: none, basic or detailed.
    #[arg(long, value_name = "LEVEL")]
    feedback_level: Option<String>,

    /// Print a stats snapshot for the mount's store as JSON and exit.
    #[arg(long)]
    stats: bool,
}

impl Cli {
    /// Fold CLI flags over the loaded config.
    fn apply(&self, config: &mut Config) -> Result<(), CoreError> {
        if let Some(dir) = &self.cache_dir {
            config.cache.cache_dir = Some(dir.clone());
        }
        if let Some(days) = self.cache_expiration_days {
            config.cache.expiration_days = days;
        }
        if let Some(bytes) = self.max_cache_size {
            config.cache.max_cache_size = bytes;
        }
        if let Some(hours) = self.cache_cleanup_interval {
            config.cache.cleanup_interval_hours = hours;
        }
        if let Some(secs) = self.delta_interval {
            config.delta.interval_secs = secs;
        }
        if let Some(secs) = self.active_delta_interval {
            config.delta.active_interval_secs = secs;
        }
        if let Some(secs) = self.active_delta_window {
            config.delta.active_window_secs = secs;
        }
        if let Some(secs) = self.realtime_fallback_seconds {
            config.realtime.fallback_secs = secs;
        }
        if self.polling_only {
            config.realtime.polling_only = true;
        }
        if let Some(n) = self.hydration_workers {
            config.hydration.workers = n;
        }
        if let Some(n) = self.hydration_queue_size {
            config.hydration.queue_size = n;
        }
        if let Some(n) = self.metadata_workers {
            config.metadata.workers = n;
        }
        if let Some(n) = self.metadata_high_queue_size {
            config.metadata.high_queue_size = n;
        }
        if let Some(n) = self.metadata_low_queue_size {
            config.metadata.low_queue_size = n;
        }
        if let Some(policy) = &self.overlay_policy {
            config.overlay.default_policy = OverlayPolicy::parse(policy)?;
        }
        if self.offline_mode {
            config.offline.offline_mode = true;
        }
        if let Some(level) = &self.feedback_level {
            config.feedback.level = FeedbackLevel::parse(level)?;
        }
        Ok(())
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(Config::default_path);
    let mut config = match Config::load_or_default(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("graphfs: configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if let Err(e) = cli.apply(&mut config) {
        eprintln!("graphfs: configuration error: {e}");
        return ExitCode::from(EXIT_CONFIG);
    }
    if let Err(e) = config.validate() {
        eprintln!("graphfs: configuration error: {e}");
        return ExitCode::from(EXIT_CONFIG);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("graphfs: failed to start runtime: {e}");
            return ExitCode::from(EXIT_STORAGE);
        }
    };

    if cli.stats {
        return runtime.block_on(print_stats(&cli, &config));
    }

    // An online mount needs valid tokens for the remote adapter.
    if !config.offline.offline_mode {
        if let Some(account) = &cli.account {
            let path = auth::token_path(&config.cache_root(), account);
            match auth::load_tokens(&path) {
                Ok(tokens) if !tokens.is_expired() => {}
                Ok(_) => {
                    eprintln!("graphfs: tokens for {account} have expired, re-authentication required");
                    return ExitCode::from(EXIT_AUTH);
                }
                Err(e) => {
                    eprintln!("graphfs: authentication required: {e}");
                    return ExitCode::from(EXIT_AUTH);
                }
            }
        } else {
            tracing::warn!(
                "no --account given; mounting without a remote adapter (offline semantics)"
            );
        }
    }

    let Some(mountpoint) = cli.mountpoint.clone() else {
        eprintln!("graphfs: a mount point is required");
        return ExitCode::from(EXIT_CONFIG);
    };
    runtime.block_on(mount(config, mountpoint))
}

/// Mount, serve until unmounted or interrupted, then drain the engine.
async fn mount(config: Config, mountpoint: PathBuf) -> ExitCode {
    let engine = match Engine::start(
        config,
        &mountpoint,
        Arc::new(DisconnectedClient),
        None,
        Arc::new(LogFeedbackHandler),
    )
    .await
    {
        Ok(engine) => engine,
        Err(e @ CoreError::Storage(_)) => {
            eprintln!("graphfs: storage failure: {e}");
            return ExitCode::from(EXIT_STORAGE);
        }
        Err(e) => {
            eprintln!("graphfs: failed to start engine: {e}");
            return ExitCode::from(EXIT_STORAGE);
        }
    };

    let shutdown = CancellationToken::new();
    let fs = GraphFs::new(
        Arc::clone(&engine),
        tokio::runtime::Handle::current(),
        shutdown.clone(),
    );

    let options = GraphFs::mount_options("graphfs");
    let session = match tokio::task::spawn_blocking({
        let mountpoint = mountpoint.clone();
        move || fuser::spawn_mount2(fs, mountpoint, &options)
    })
    .await
    {
        Ok(Ok(session)) => session,
        Ok(Err(e)) => {
            eprintln!("graphfs: mount failed at {}: {e}", mountpoint.display());
            engine.shutdown().await;
            return ExitCode::from(EXIT_MOUNT);
        }
        Err(e) => {
            eprintln!("graphfs: mount task failed: {e}");
            engine.shutdown().await;
            return ExitCode::from(EXIT_MOUNT);
        }
    };

    tracing::info!(mountpoint = %mountpoint.display(), "mounted");

    // Serve until interrupted; the session unmounts on drop.
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "signal handler failed, shutting down");
    }
    tracing::info!("unmounting");
    shutdown.cancel();
    drop(session);
    engine.shutdown().await;
    ExitCode::SUCCESS
}

/// One-shot stats snapshot over the mount's on-disk state.
async fn print_stats(cli: &Cli, config: &Config) -> ExitCode {
    let Some(mountpoint) = &cli.mountpoint else {
        eprintln!("graphfs: --stats requires the mount point argument");
        return ExitCode::from(EXIT_CONFIG);
    };
    let mount_dir = config.mount_dir(mountpoint);

    let result: Result<String, CoreError> = async {
        let pool = graphfs_store::DatabasePool::new(&mount_dir.join("metadata.db")).await?;
        let store = graphfs_store::MetadataStore::new(&pool);
        let cache = Arc::new(graphfs_store::ContentCache::open(
            mount_dir.join("content"),
            config.cache.max_cache_size,
            config.cache.expiration_days,
        )?);
        let collector = StatsCollector::new(store, cache);
        let snapshot = collector
            .collect(
                config.offline.offline_mode,
                NotifierHealth {
                    mode: NotifierMode::PollingOnly,
                    status: HealthStatus::Healthy,
                    heartbeats: 0,
                    reconnect_count: 0,
                },
                0,
                0,
                config.shutdown.content_stats(),
            )
            .await?;
        serde_json::to_string_pretty(&snapshot)
            .map_err(|e| CoreError::Storage(format!("serialize stats: {e}")))
    }
    .await;

    match result {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("graphfs: stats failed: {e}");
            ExitCode::from(EXIT_STORAGE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flag_overrides_apply() {
        let cli = Cli::parse_from([
            "graphfs",
            "--max-cache-size",
            "1048576",
            "--hydration-workers",
            "5",
            "--overlay-policy",
            "LOCAL_WINS",
            "--polling-only",
            "--feedback-level",
            "detailed",
            "/mnt/drive",
        ]);
        let mut config = Config::default();
        cli.apply(&mut config).unwrap();
        assert_eq!(config.cache.max_cache_size, 1_048_576);
        assert_eq!(config.hydration.workers, 5);
        assert_eq!(config.overlay.default_policy, OverlayPolicy::LocalWins);
        assert!(config.realtime.polling_only);
        assert_eq!(config.feedback.level, FeedbackLevel::Detailed);
    }

    #[test]
    fn test_bad_overlay_policy_is_config_error() {
        let cli = Cli::parse_from(["graphfs", "--overlay-policy", "BOGUS", "/mnt/drive"]);
        let mut config = Config::default();
        assert!(cli.apply(&mut config).is_err());
    }

    #[test]
    fn test_stats_without_mountpoint_is_accepted_by_parser() {
        let cli = Cli::parse_from(["graphfs", "--stats"]);
        assert!(cli.stats);
        assert!(cli.mountpoint.is_none());
    }
}
