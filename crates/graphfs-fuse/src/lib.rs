//! GraphFS FUSE facade
//!
//! The kernel-facing layer: a `fuser::Filesystem` implementation that
//! translates VFS operations into local-first engine actions, an inode
//! table keeping kernel inode numbers stable across renames and id
//! adoptions, and the extended-attribute status surface.

pub mod error;
pub mod filesystem;
pub mod inode;
pub mod xattr;

pub use error::FuseError;
pub use filesystem::GraphFs;
pub use inode::{InodeTable, ROOT_INO};
