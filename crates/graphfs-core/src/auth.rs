//! Auth token persistence
//!
//! Tokens live at
//! `$XDG_CACHE_HOME/graphfs/accounts/<account-hash>/auth_tokens.json` with
//! file mode 0600 inside a 0700 directory. The `GRAPHFS_AUTH_PATH`
//! environment variable overrides the location for tests.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{account_hash, APP_DIR};
use crate::error::CoreError;

/// Test-only override for the token file location.
pub const AUTH_PATH_ENV: &str = "GRAPHFS_AUTH_PATH";

/// Persisted OAuth token material for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthTokens {
    /// Account identifier (user principal name).
    pub account: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl AuthTokens {
    /// True once the access token needs a refresh.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Resolve the token file path for an account.
///
/// Honors the `GRAPHFS_AUTH_PATH` override, otherwise derives
/// `accounts/<account-hash>/auth_tokens.json` under the cache root.
pub fn token_path(cache_root: &Path, account: &str) -> PathBuf {
    if let Ok(path) = std::env::var(AUTH_PATH_ENV) {
        return PathBuf::from(path);
    }
    cache_root
        .join("accounts")
        .join(account_hash(account))
        .join("auth_tokens.json")
}

/// Default cache root for token resolution when no config is loaded yet.
pub fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("~/.cache"))
        .join(APP_DIR)
}

/// Load tokens from disk. `NotFound` when no token file exists.
pub fn load_tokens(path: &Path) -> Result<AuthTokens, CoreError> {
    if !path.exists() {
        return Err(CoreError::NotFound(format!(
            "no auth tokens at {}",
            path.display()
        )));
    }
    let content = fs::read_to_string(path)
        .map_err(|e| CoreError::Storage(format!("read {}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| CoreError::Auth(format!("malformed token file {}: {e}", path.display())))
}

/// Write tokens to disk with mode 0600 (directory 0700).
pub fn save_tokens(path: &Path, tokens: &AuthTokens) -> Result<(), CoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| CoreError::Storage(format!("create {}: {e}", parent.display())))?;
        fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
            .map_err(|e| CoreError::Storage(format!("chmod {}: {e}", parent.display())))?;
    }
    let content = serde_json::to_string_pretty(tokens)
        .map_err(|e| CoreError::Storage(format!("serialize tokens: {e}")))?;
    fs::write(path, content)
        .map_err(|e| CoreError::Storage(format!("write {}: {e}", path.display())))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|e| CoreError::Storage(format!("chmod {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_tokens() -> AuthTokens {
        AuthTokens {
            account: "user@example.com".into(),
            access_token: "at-123".into(),
            refresh_token: Some("rt-456".into()),
            expires_at: Utc::now() + Duration::hours(1),
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts").join("abc").join("auth_tokens.json");

        let tokens = sample_tokens();
        save_tokens(&path, &tokens).unwrap();
        let loaded = load_tokens(&path).unwrap();
        assert_eq!(loaded, tokens);
    }

    #[test]
    fn test_file_mode_is_0600() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth_tokens.json");
        save_tokens(&path, &sample_tokens()).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let err = load_tokens(Path::new("/nonexistent/auth_tokens.json")).unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[test]
    fn test_expiry_check() {
        let mut tokens = sample_tokens();
        assert!(!tokens.is_expired());
        tokens.expires_at = Utc::now() - Duration::seconds(1);
        assert!(tokens.is_expired());
    }

    #[test]
    fn test_token_path_derivation() {
        let path = token_path(Path::new("/cache/graphfs"), "User@Example.com");
        let expected_hash = account_hash("User@Example.com");
        assert_eq!(
            path,
            PathBuf::from("/cache/graphfs")
                .join("accounts")
                .join(expected_hash)
                .join("auth_tokens.json")
        );
    }
}
