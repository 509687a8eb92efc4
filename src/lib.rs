//! ccjk-sync - configuration artifact sync
//!
//! Keeps skills, workflows, settings and MCP configs in step between a local
//! store and a remote backend (filesystem, GitHub Gist, WebDAV or S3), with
//! checkpoint-based change detection and pluggable conflict resolution.

pub mod config;
pub mod error;
pub mod sync;
pub mod types;

pub use config::{AppConfig, ProviderConfig, SyncOptions};
pub use error::{AdapterError, AdapterErrorCode, AdapterResult, Result, SyncError};
pub use sync::SyncEngine;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
