//! Facade error type
//!
//! Thin wrapper over [`CoreError`] adding the handful of conditions that
//! only exist at the kernel boundary, with a single place that maps
//! everything to errno for replies.

use thiserror::Error;

use graphfs_core::CoreError;

#[derive(Debug, Error)]
pub enum FuseError {
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Unknown inode number.
    #[error("stale inode {0}")]
    StaleInode(u64),

    /// Unknown file handle.
    #[error("bad file handle {0}")]
    BadHandle(u64),

    /// Directory not empty on rmdir.
    #[error("directory not empty")]
    NotEmpty,

    /// Operation not valid for the node type.
    #[error("is a directory")]
    IsDirectory,

    #[error("not a directory")]
    NotDirectory,

    /// Name component exceeds NAME_MAX or contains a NUL.
    #[error("invalid name: {0}")]
    InvalidName(String),
}

impl FuseError {
    /// POSIX errno for the kernel reply.
    pub fn errno(&self) -> i32 {
        match self {
            FuseError::Core(core) => core.errno(),
            FuseError::StaleInode(_) => libc::ESTALE,
            FuseError::BadHandle(_) => libc::EBADF,
            FuseError::NotEmpty => libc::ENOTEMPTY,
            FuseError::IsDirectory => libc::EISDIR,
            FuseError::NotDirectory => libc::ENOTDIR,
            FuseError::InvalidName(_) => libc::ENAMETOOLONG,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FuseError::StaleInode(7).errno(), libc::ESTALE);
        assert_eq!(FuseError::NotEmpty.errno(), libc::ENOTEMPTY);
        assert_eq!(
            FuseError::Core(CoreError::NotFound("x".into())).errno(),
            libc::ENOENT
        );
        assert_eq!(
            FuseError::Core(CoreError::Backpressure("q".into())).errno(),
            libc::EAGAIN
        );
    }
}
