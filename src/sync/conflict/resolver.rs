//! Conflict resolution strategies

use chrono::Utc;

use super::detector::{as_object, ConflictInfo, ConflictType};
use super::ThreeWayMerge;
use crate::types::{sha256_hex, ConflictStrategy, Resolution, SyncConflict, SyncableItem};

/// What a strategy decided for one conflict
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    /// Apply `item` to both sides
    Resolved {
        resolution: Resolution,
        item: SyncableItem,
    },
    /// Leave the item untouched until a user decides
    Manual { reason: String },
}

/// Conflict resolver with various strategies
pub struct ConflictResolver {
    merger: ThreeWayMerge,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self {
            merger: ThreeWayMerge::new(),
        }
    }

    /// Resolve a conflict under the configured strategy.
    /// `base` is the last synced content, used for text merges.
    pub fn resolve(
        &self,
        conflict: &SyncConflict,
        info: &ConflictInfo,
        strategy: ConflictStrategy,
        base: Option<&str>,
    ) -> ResolveOutcome {
        match strategy {
            ConflictStrategy::LocalWins => self.pick(conflict, Resolution::Local),
            ConflictStrategy::RemoteWins => self.pick(conflict, Resolution::Remote),
            ConflictStrategy::NewestWins => self.pick(conflict, Self::newest(conflict)),
            ConflictStrategy::SmartMerge => self.smart_merge(conflict, info, base),
            ConflictStrategy::Manual => ResolveOutcome::Manual {
                reason: info.description.clone(),
            },
        }
    }

    /// Resolve without ever deferring to a human: manual becomes local-wins
    /// and an unmergeable smart-merge becomes newest-wins
    pub fn resolve_forced(
        &self,
        conflict: &SyncConflict,
        info: &ConflictInfo,
        strategy: ConflictStrategy,
        base: Option<&str>,
    ) -> (Resolution, SyncableItem) {
        let strategy = match strategy {
            ConflictStrategy::Manual => ConflictStrategy::LocalWins,
            other => other,
        };
        match self.resolve(conflict, info, strategy, base) {
            ResolveOutcome::Resolved { resolution, item } => (resolution, item),
            ResolveOutcome::Manual { .. } => {
                let resolution = Self::newest(conflict);
                (resolution, self.stamp(conflict, Self::side(conflict, resolution)))
            }
        }
    }

    /// Materialize a user's decision on a queued conflict
    pub fn apply(
        &self,
        conflict: &SyncConflict,
        resolution: Resolution,
        base: Option<&str>,
    ) -> SyncableItem {
        match resolution {
            Resolution::Local | Resolution::Remote => {
                self.stamp(conflict, Self::side(conflict, resolution))
            }
            Resolution::Merged => match &conflict.merged_item {
                Some(item) => self.stamp(conflict, item),
                None => self.merged_item(conflict, base, true).unwrap_or_else(|| {
                    self.stamp(conflict, Self::side(conflict, Self::newest(conflict)))
                }),
            },
        }
    }

    /// Later modification wins; an exact tie goes to local
    pub fn newest(conflict: &SyncConflict) -> Resolution {
        if conflict.remote_item.last_modified > conflict.local_item.last_modified {
            Resolution::Remote
        } else {
            Resolution::Local
        }
    }

    fn side(conflict: &SyncConflict, resolution: Resolution) -> &SyncableItem {
        match resolution {
            Resolution::Remote => &conflict.remote_item,
            Resolution::Local | Resolution::Merged => &conflict.local_item,
        }
    }

    fn pick(&self, conflict: &SyncConflict, resolution: Resolution) -> ResolveOutcome {
        ResolveOutcome::Resolved {
            resolution,
            item: self.stamp(conflict, Self::side(conflict, resolution)),
        }
    }

    /// Re-stamp the winner so both replicas converge on a version newer than
    /// either input. Deletions stay deletions.
    fn stamp(&self, conflict: &SyncConflict, winner: &SyncableItem) -> SyncableItem {
        let mut item = winner.clone();
        if item.is_tombstone() {
            return item;
        }
        item.version = conflict
            .local_item
            .version
            .max(conflict.remote_item.version)
            + 1;
        item.content_hash = sha256_hex(item.content.as_bytes());
        item.last_modified = Utc::now();
        item
    }

    fn smart_merge(
        &self,
        conflict: &SyncConflict,
        info: &ConflictInfo,
        base: Option<&str>,
    ) -> ResolveOutcome {
        match info.conflict_type {
            // A deletion has nothing to merge with
            ConflictType::DeleteModify => self.pick(conflict, Self::newest(conflict)),
            ConflictType::StructuredFields | ConflictType::NonOverlapping => {
                match self.merged_item(conflict, base, false) {
                    Some(item) => {
                        let resolution = if item.content == conflict.local_item.content {
                            Resolution::Local
                        } else if item.content == conflict.remote_item.content {
                            Resolution::Remote
                        } else {
                            Resolution::Merged
                        };
                        ResolveOutcome::Resolved { resolution, item }
                    }
                    None => ResolveOutcome::Manual {
                        reason: "merge produced conflicting edits".to_string(),
                    },
                }
            }
            ConflictType::ContentConflict | ConflictType::CreateCreate => {
                ResolveOutcome::Manual {
                    reason: if base.is_none() {
                        "no common base to merge against".to_string()
                    } else {
                        info.description.clone()
                    },
                }
            }
        }
    }

    /// Merge both sides into one item. With `allow_markers`, overlapping text
    /// edits are kept between conflict markers instead of failing.
    fn merged_item(
        &self,
        conflict: &SyncConflict,
        base: Option<&str>,
        allow_markers: bool,
    ) -> Option<SyncableItem> {
        let local = &conflict.local_item;
        let remote = &conflict.remote_item;
        if local.is_tombstone() || remote.is_tombstone() {
            return None;
        }

        let content = match (as_object(local), as_object(remote)) {
            (Some(l), Some(r)) => {
                let local_is_newer = local.last_modified >= remote.last_modified;
                let merged = self.merger.merge_objects(&l, &r, local_is_newer);
                serde_json::to_string_pretty(&serde_json::Value::Object(merged)).ok()?
            }
            _ => {
                let result = self.merger.merge(base.unwrap_or(""), &local.content, &remote.content);
                if !allow_markers && (base.is_none() || !result.success) {
                    return None;
                }
                result.content
            }
        };

        let mut item = local.clone();
        item.content = content;
        item.metadata = self
            .merger
            .merge_metadata_map(None, &local.metadata, &remote.metadata);
        Some(self.stamp(conflict, &item))
    }
}
