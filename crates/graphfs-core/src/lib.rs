//! GraphFS core
//!
//! Domain model, error taxonomy, configuration, and port traits shared by
//! every other crate in the workspace. This crate has no I/O of its own
//! beyond config/token files; the metadata store, content cache, and
//! background managers build on top of it.

pub mod auth;
pub mod config;
pub mod domain;
pub mod error;
pub mod ports;

pub use config::Config;
pub use error::{is_offline_error, CoreError};
