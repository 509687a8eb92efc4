//! Config artifact sync
//!
//! The engine diffs a local store and a remote backend against the last
//! checkpoint, resolves collisions and moves items both ways.
//!
//! # Feature Flags
//!
//! The S3 adapter requires the `cloud` feature. Everything else is always
//! available.

pub mod adapter;
pub mod changes;
pub mod checkpoint;
pub mod conflict;
mod engine;
pub mod retry;
pub mod store;
mod worker;

pub use adapter::{create_adapter, normalize_key, CloudAdapter};
pub use changes::ChangeDetector;
pub use checkpoint::{
    Checkpoint, CheckpointEntry, CheckpointStore, FileCheckpointStore, ListingFingerprint,
    MemoryCheckpointStore,
};
pub use conflict::{
    ConflictDetector, ConflictInfo, ConflictResolver, ConflictType, MergeResult, ResolveOutcome,
    ThreeWayMerge,
};
pub use engine::SyncEngine;
pub use retry::{backoff_delay, RetryPolicy};
pub use store::{DirectoryStore, LocalStore, MemoryStore};
pub use worker::{SyncCommand, SyncWorker, WorkerConfig};
