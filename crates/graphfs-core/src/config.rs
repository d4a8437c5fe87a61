//! Configuration
//!
//! Typed configuration structs mapping the YAML config file and CLI flags,
//! with defaults, validation, and the XDG path scheme: per-mount state under
//! `$XDG_CACHE_HOME/graphfs/<mount-hash>/`, account material under
//! `$XDG_CACHE_HOME/graphfs/accounts/<account-hash>/`, configuration at
//! `$XDG_CONFIG_HOME/graphfs/config.yml`.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::item::{ConflictPolicy, OverlayPolicy};
use crate::error::CoreError;

/// Application directory name under the XDG roots.
pub const APP_DIR: &str = "graphfs";

// ============================================================================
// Config sections
// ============================================================================

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub delta: DeltaConfig,
    pub realtime: RealtimeConfig,
    pub hydration: HydrationConfig,
    pub upload: UploadConfig,
    pub metadata: MetadataConfig,
    pub offline: OfflineConfig,
    pub overlay: OverlayConfig,
    pub conflicts: ConflictsConfig,
    pub feedback: FeedbackConfig,
    pub shutdown: ShutdownConfig,
}

/// Content-cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Override for the cache root; `None` uses the XDG default.
    pub cache_dir: Option<PathBuf>,
    /// Entries untouched for this many days are expired by cleanup.
    pub expiration_days: u32,
    /// Total content-size bound in bytes; 0 means unlimited.
    pub max_cache_size: u64,
    /// Hours between cleanup passes (1..=720).
    pub cleanup_interval_hours: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            expiration_days: 30,
            max_cache_size: 0,
            cleanup_interval_hours: 24,
        }
    }
}

/// Delta-loop cadence settings (seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaConfig {
    /// Base polling interval when no realtime channel is available.
    pub interval_secs: u64,
    /// Tightened interval while foreground activity is recent.
    pub active_interval_secs: u64,
    /// How long after a foreground metadata touch the tightened cadence holds.
    pub active_window_secs: u64,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            active_interval_secs: 60,
            active_window_secs: 60,
        }
    }
}

/// Realtime push-channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Disable the push channel and poll only.
    pub polling_only: bool,
    /// Fallback poll interval while the push channel is healthy.
    pub fallback_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            polling_only: false,
            fallback_secs: 1800,
        }
    }
}

/// Hydration (download) worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HydrationConfig {
    pub workers: usize,
    pub queue_size: usize,
    pub max_retries: u32,
}

impl Default for HydrationConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            queue_size: 64,
            max_retries: 3,
        }
    }
}

/// Upload worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub workers: usize,
    /// Files at or above this size use a resumable chunked session.
    pub chunked_threshold: u64,
    pub chunk_size: u64,
    pub max_retries: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            chunked_threshold: 100 * 1024 * 1024,
            chunk_size: 10 * 1024 * 1024,
            max_retries: 2,
        }
    }
}

/// Metadata request manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Worker count; one worker is always reserved for foreground requests.
    pub workers: usize,
    pub high_queue_size: usize,
    pub low_queue_size: usize,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            high_queue_size: 64,
            low_queue_size: 256,
        }
    }
}

/// Offline operation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Start in operational-offline mode (no network at all).
    pub offline_mode: bool,
    /// Cap on the durable offline change log.
    pub max_pending_changes: usize,
    /// Seconds between active connectivity probes.
    pub probe_interval_secs: u64,
    /// Probe timeout in seconds.
    pub probe_timeout_secs: u64,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            offline_mode: false,
            max_pending_changes: 1000,
            probe_interval_secs: 15,
            probe_timeout_secs: 10,
        }
    }
}

/// Overlay defaults for newly-observed entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    #[serde(rename = "defaultPolicy")]
    pub default_policy: OverlayPolicy,
}

/// Conflict-resolution settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictsConfig {
    pub policy: ConflictPolicy,
}

/// User-feedback verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackLevel {
    None,
    #[default]
    Basic,
    Detailed,
}

impl FeedbackLevel {
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "none" => Ok(FeedbackLevel::None),
            "basic" => Ok(FeedbackLevel::Basic),
            "detailed" => Ok(FeedbackLevel::Detailed),
            other => Err(CoreError::Validation(format!(
                "unknown feedback level: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub level: FeedbackLevel,
}

/// Per-category shutdown and operation timeouts (seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub download_worker_secs: u64,
    pub upload_graceful_secs: u64,
    pub filesystem_secs: u64,
    pub network_callback_secs: u64,
    pub metadata_request_secs: u64,
    pub content_stats_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            download_worker_secs: 5,
            upload_graceful_secs: 30,
            filesystem_secs: 10,
            network_callback_secs: 5,
            metadata_request_secs: 30,
            content_stats_secs: 5,
        }
    }
}

impl ShutdownConfig {
    pub fn download_worker(&self) -> Duration {
        Duration::from_secs(self.download_worker_secs)
    }

    pub fn upload_graceful(&self) -> Duration {
        Duration::from_secs(self.upload_graceful_secs)
    }

    pub fn filesystem(&self) -> Duration {
        Duration::from_secs(self.filesystem_secs)
    }

    pub fn network_callback(&self) -> Duration {
        Duration::from_secs(self.network_callback_secs)
    }

    pub fn metadata_request(&self) -> Duration {
        Duration::from_secs(self.metadata_request_secs)
    }

    pub fn content_stats(&self) -> Duration {
        Duration::from_secs(self.content_stats_secs)
    }
}

// ============================================================================
// Loading and validation
// ============================================================================

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Storage(format!("read {}: {e}", path.display())))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| CoreError::Validation(format!("parse {}: {e}", path.display())))?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to defaults when the file is
    /// missing. A present-but-broken file is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self, CoreError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Platform default config file path
    /// (`$XDG_CONFIG_HOME/graphfs/config.yml`).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join(APP_DIR)
            .join("config.yml")
    }

    /// Enforce the documented ranges. Violations are configuration errors
    /// (CLI exit code 1).
    pub fn validate(&self) -> Result<(), CoreError> {
        if !(1..=720).contains(&self.cache.cleanup_interval_hours) {
            return Err(CoreError::Validation(format!(
                "cache-cleanup-interval must be 1..=720 hours, got {}",
                self.cache.cleanup_interval_hours
            )));
        }
        if self.hydration.workers == 0 {
            return Err(CoreError::Validation("hydration-workers must be >= 1".into()));
        }
        if self.hydration.queue_size == 0 {
            return Err(CoreError::Validation(
                "hydration-queue-size must be >= 1".into(),
            ));
        }
        if self.upload.workers == 0 {
            return Err(CoreError::Validation("upload workers must be >= 1".into()));
        }
        if self.upload.chunk_size == 0 {
            return Err(CoreError::Validation("upload chunk size must be > 0".into()));
        }
        if self.metadata.workers == 0 {
            return Err(CoreError::Validation("metadata-workers must be >= 1".into()));
        }
        if self.metadata.high_queue_size == 0 || self.metadata.low_queue_size == 0 {
            return Err(CoreError::Validation(
                "metadata queue sizes must be >= 1".into(),
            ));
        }
        if self.offline.max_pending_changes == 0 {
            return Err(CoreError::Validation(
                "max pending offline changes must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Root of all GraphFS cache state (`$XDG_CACHE_HOME/graphfs`).
    pub fn cache_root(&self) -> PathBuf {
        if let Some(dir) = &self.cache.cache_dir {
            return dir.clone();
        }
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("~/.cache"))
            .join(APP_DIR)
    }

    /// Per-mount state directory: `<cache_root>/<mount-hash>/`.
    pub fn mount_dir(&self, mount_point: &Path) -> PathBuf {
        self.cache_root().join(escape_mount_path(mount_point))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.cache.cleanup_interval_hours) * 3600)
    }
}

// ============================================================================
// Path hashing
// ============================================================================

/// Systemd-style escape of an absolute mount path, used as the per-mount
/// directory name.
///
/// `/` separators become `-`; bytes outside `[a-zA-Z0-9_.]` (and any
/// leading `.`) become `\xXX`. The filesystem root escapes to `-`.
#[must_use]
pub fn escape_mount_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let trimmed = raw.trim_matches('/');
    if trimmed.is_empty() {
        return "-".to_string();
    }

    let mut out = String::with_capacity(trimmed.len());
    for (i, b) in trimmed.bytes().enumerate() {
        match b {
            b'/' => out.push('-'),
            b'.' if i == 0 => {
                let _ = write!(out, "\\x{b:02x}");
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'.' => out.push(b as char),
            _ => {
                let _ = write!(out, "\\x{b:02x}");
            }
        }
    }
    out
}

/// Account hash for the per-account directory: first 16 hex chars of the
/// SHA-256 of the lowercased, trimmed account identifier.
#[must_use]
pub fn account_hash(account: &str) -> String {
    let normalized = account.trim().to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    let mut out = String::with_capacity(16);
    for b in &digest[..8] {
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.hydration.workers, 3);
        assert_eq!(config.hydration.queue_size, 64);
        assert_eq!(config.upload.chunked_threshold, 100 * 1024 * 1024);
        assert_eq!(config.upload.chunk_size, 10 * 1024 * 1024);
        assert_eq!(config.offline.max_pending_changes, 1000);
        assert_eq!(config.shutdown.upload_graceful_secs, 30);
    }

    #[test]
    fn test_cleanup_interval_range() {
        let mut config = Config::default();
        config.cache.cleanup_interval_hours = 0;
        assert!(config.validate().is_err());
        config.cache.cleanup_interval_hours = 721;
        assert!(config.validate().is_err());
        config.cache.cleanup_interval_hours = 720;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = Config::default();
        config.hydration.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_roundtrip_with_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(
            &path,
            "cache:\n  max_cache_size: 1048576\noverlay:\n  defaultPolicy: local_wins\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.cache.max_cache_size, 1_048_576);
        assert_eq!(config.overlay.default_policy, OverlayPolicy::LocalWins);
        // Unspecified sections keep their defaults.
        assert_eq!(config.hydration.workers, 3);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = Config::load_or_default(Path::new("/nonexistent/config.yml")).unwrap();
        assert_eq!(config.cache.cleanup_interval_hours, 24);
    }

    mod escape_tests {
        use super::*;

        #[test]
        fn test_plain_path() {
            assert_eq!(
                escape_mount_path(Path::new("/home/user/OneDrive")),
                "home-user-OneDrive"
            );
        }

        #[test]
        fn test_root_path() {
            assert_eq!(escape_mount_path(Path::new("/")), "-");
        }

        #[test]
        fn test_special_characters_escaped() {
            assert_eq!(
                escape_mount_path(Path::new("/mnt/one drive")),
                "mnt-one\\x20drive"
            );
            assert_eq!(escape_mount_path(Path::new("/a-b")), "a\\x2db");
        }

        #[test]
        fn test_leading_dot_escaped() {
            assert_eq!(escape_mount_path(Path::new("/.hidden")), "\\x2ehidden");
        }
    }

    mod account_hash_tests {
        use super::*;

        #[test]
        fn test_hash_is_16_hex_chars() {
            let hash = account_hash("user@example.com");
            assert_eq!(hash.len(), 16);
            assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        }

        #[test]
        fn test_hash_is_normalized() {
            assert_eq!(
                account_hash("User@Example.COM "),
                account_hash("user@example.com")
            );
        }

        #[test]
        fn test_distinct_accounts_differ() {
            assert_ne!(account_hash("a@x.com"), account_hash("b@x.com"));
        }
    }
}
