//! Conflict handling
//!
//! Provides:
//! - Pairing of local and remote changes that touch the same item
//! - Classification of each collision
//! - Three-way merge for text and field merge for JSON objects
//! - Resolution strategies, including a manual review queue

mod detector;
mod merge;
mod resolver;

pub use detector::{ConflictDetector, ConflictInfo, ConflictType, Pairing};
pub use merge::{MergeResult, MergeStats, ThreeWayMerge};
pub use resolver::{ConflictResolver, ResolveOutcome};
