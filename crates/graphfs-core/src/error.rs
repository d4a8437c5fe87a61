//! Error taxonomy
//!
//! One enum covers every failure class the layering engine distinguishes.
//! Foreground (FUSE-facing) code maps these to POSIX errno via
//! [`CoreError::errno`]; background workers consult
//! [`CoreError::is_transient`] to decide between retry and surfacing.
//!
//! Offline detection is passive classification of network errors plus an
//! active probe (see `graphfs-engine`). HTTP response errors are explicitly
//! *not* offline signals: a 401 means reauthenticate, not "the network is
//! down".

use thiserror::Error;

/// Failure classes of the layering engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Metadata absent or the entry has been deleted.
    #[error("not found: {0}")]
    NotFound(String),

    /// State-machine violation. Programmer error; never silently coerced.
    #[error("invalid item state transition from {from} to {to}")]
    InvalidTransition {
        /// State the entry was in.
        from: &'static str,
        /// State the caller asked for.
        to: &'static str,
    },

    /// Embedded store I/O failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Transport-level failure talking to the remote store.
    #[error("network error: {0}")]
    Network(String),

    /// Token invalid or expired. Surfaced to the user, never treated as offline.
    #[error("authentication required: {0}")]
    Auth(String),

    /// ETag mismatch detected at write time.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A bounded queue is full; the caller should retry later.
    #[error("queue full: {0}")]
    Backpressure(String),

    /// Content hash mismatch after a transfer.
    #[error("integrity failure: {0}")]
    Integrity(String),

    /// The caller's context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Filesystem permission or capability mismatch.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Extended-attribute capability mismatch on the hosting filesystem.
    #[error("xattr unsupported: {0}")]
    Xattr(String),

    /// Input failed domain validation.
    #[error("validation failed: {0}")]
    Validation(String),
}

impl CoreError {
    /// POSIX errno for foreground propagation to the kernel.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            CoreError::NotFound(_) => libc::ENOENT,
            CoreError::Backpressure(_) => libc::EAGAIN,
            CoreError::Integrity(_) | CoreError::Storage(_) => libc::EIO,
            CoreError::Permission(_) | CoreError::Auth(_) => libc::EPERM,
            CoreError::Network(_) => libc::EIO,
            CoreError::Cancelled => libc::EINTR,
            CoreError::Xattr(_) => libc::ENOTSUP,
            CoreError::Validation(_) => libc::EINVAL,
            // Conflict on release does not fail the call; anywhere else it
            // surfaces as EIO rather than losing the write silently.
            CoreError::Conflict(_) => libc::EIO,
            CoreError::InvalidTransition { .. } => libc::EIO,
        }
    }

    /// True for failures a background worker should retry with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::Network(_) | CoreError::Backpressure(_)
        )
    }
}

// ============================================================================
// Offline classification
// ============================================================================

/// Substrings that mark a network error as an offline indicator.
///
/// Matched case-insensitively against the error text. HTTP status failures
/// (401/403/404/5xx) never reach this list; they are reported as
/// `Auth`/`NotFound`/`Network` by the client and are not offline signals.
const OFFLINE_PATTERNS: &[&str] = &[
    "no such host",
    "network is unreachable",
    "connection refused",
    "connection timed out",
    "dial tcp",
    "context deadline exceeded",
    "no route to host",
    "network is down",
    "temporary failure in name resolution",
    "operation timed out",
];

/// Classify an error as an offline indicator.
///
/// Only `Network` errors are candidates; the message is searched for the
/// known transport-failure patterns.
#[must_use]
pub fn is_offline_error(err: &CoreError) -> bool {
    let CoreError::Network(msg) = err else {
        return false;
    };
    let lowered = msg.to_lowercase();
    OFFLINE_PATTERNS.iter().any(|p| lowered.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    mod errno_tests {
        use super::*;

        #[test]
        fn test_errno_mapping() {
            assert_eq!(CoreError::NotFound("x".into()).errno(), libc::ENOENT);
            assert_eq!(CoreError::Backpressure("q".into()).errno(), libc::EAGAIN);
            assert_eq!(CoreError::Integrity("h".into()).errno(), libc::EIO);
            assert_eq!(CoreError::Storage("db".into()).errno(), libc::EIO);
            assert_eq!(CoreError::Permission("p".into()).errno(), libc::EPERM);
            assert_eq!(CoreError::Cancelled.errno(), libc::EINTR);
            assert_eq!(CoreError::Xattr("x".into()).errno(), libc::ENOTSUP);
        }

        #[test]
        fn test_display_includes_transition_states() {
            let err = CoreError::InvalidTransition {
                from: "Ghost",
                to: "Uploading",
            };
            assert_eq!(
                err.to_string(),
                "invalid item state transition from Ghost to Uploading"
            );
        }
    }

    mod offline_tests {
        use super::*;

        #[test]
        fn test_transport_failures_are_offline() {
            for msg in [
                "dial tcp 1.2.3.4:443: connect: connection refused",
                "lookup graph.example.com: No Such Host",
                "read: Network is unreachable",
                "Temporary failure in name resolution",
                "context deadline exceeded",
            ] {
                assert!(
                    is_offline_error(&CoreError::Network(msg.to_string())),
                    "expected offline: {msg}"
                );
            }
        }

        #[test]
        fn test_http_failures_are_not_offline() {
            assert!(!is_offline_error(&CoreError::Network(
                "HTTP 503 service unavailable".into()
            )));
            assert!(!is_offline_error(&CoreError::Auth("HTTP 401".into())));
            assert!(!is_offline_error(&CoreError::NotFound("HTTP 404".into())));
        }

        #[test]
        fn test_matching_is_case_insensitive() {
            assert!(is_offline_error(&CoreError::Network(
                "CONNECTION TIMED OUT".into()
            )));
        }

        #[test]
        fn test_transient_classification() {
            assert!(CoreError::Network("x".into()).is_transient());
            assert!(CoreError::Backpressure("x".into()).is_transient());
            assert!(!CoreError::Auth("x".into()).is_transient());
            assert!(!CoreError::Integrity("x".into()).is_transient());
        }
    }
}
