//! Collision pairing and conflict classification

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ThreeWayMerge;
use crate::types::{Change, ChangeType, SyncableItem};

/// Types of conflicts that can occur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    /// Both sides edited the same lines
    ContentConflict,
    /// Both sides edited text, in disjoint line ranges
    NonOverlapping,
    /// Both sides hold JSON objects; merge field by field
    StructuredFields,
    /// One side deleted, the other modified
    DeleteModify,
    /// Both sides created the same id with different content
    CreateCreate,
}

/// Information about a detected conflict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub conflict_type: ConflictType,
    /// Severity (0-100, higher = more severe)
    pub severity: u8,
    pub description: String,
}

impl ConflictInfo {
    fn new(conflict_type: ConflictType) -> Self {
        let (severity, description) = match conflict_type {
            ConflictType::ContentConflict => {
                (80, "Both sides modified the same lines".to_string())
            }
            ConflictType::NonOverlapping => (
                40,
                "Both sides modified different lines and can be merged".to_string(),
            ),
            ConflictType::StructuredFields => (
                30,
                "Both sides modified a JSON object; fields can be merged".to_string(),
            ),
            ConflictType::DeleteModify => (
                90,
                "One side deleted the item while the other modified it".to_string(),
            ),
            ConflictType::CreateCreate => (
                70,
                "Both sides created an item with the same id".to_string(),
            ),
        };
        Self {
            conflict_type,
            severity,
            description,
        }
    }

    /// Whether smart-merge can produce a result without a human
    pub fn can_auto_merge(&self) -> bool {
        matches!(
            self.conflict_type,
            ConflictType::NonOverlapping | ConflictType::StructuredFields
        )
    }
}

/// Changes split by whether the other side touched the same item
#[derive(Debug, Default)]
pub struct Pairing {
    pub local_only: Vec<Change>,
    pub remote_only: Vec<Change>,
    /// (local, remote) pairs in item id order
    pub colliding: Vec<(Change, Change)>,
}

/// Conflict detector
pub struct ConflictDetector {
    merger: ThreeWayMerge,
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn as_object(item: &SyncableItem) -> Option<serde_json::Map<String, serde_json::Value>> {
    match serde_json::from_str::<serde_json::Value>(&item.content) {
        Ok(serde_json::Value::Object(map)) => Some(map),
        _ => None,
    }
}

impl ConflictDetector {
    pub fn new() -> Self {
        Self {
            merger: ThreeWayMerge::new(),
        }
    }

    /// Group per-side changes by item id
    pub fn pair(&self, local: Vec<Change>, remote: Vec<Change>) -> Pairing {
        let mut remote_by_id: BTreeMap<String, Change> = remote
            .into_iter()
            .map(|c| (c.item.id.clone(), c))
            .collect();

        let mut pairing = Pairing::default();
        for change in local {
            match remote_by_id.remove(&change.item.id) {
                Some(other) => pairing.colliding.push((change, other)),
                None => pairing.local_only.push(change),
            }
        }
        pairing.remote_only = remote_by_id.into_values().collect();
        pairing.colliding.sort_by(|a, b| a.0.item.id.cmp(&b.0.item.id));
        pairing
    }

    /// Classify two colliding changes. `None` means both sides already
    /// agree (equal content hashes) and nothing needs resolving.
    pub fn detect(&self, base: Option<&str>, local: &Change, remote: &Change) -> Option<ConflictInfo> {
        if local.item.content_hash == remote.item.content_hash {
            return None;
        }

        let local_deleted = local.change_type == ChangeType::Delete || local.item.is_tombstone();
        let remote_deleted = remote.change_type == ChangeType::Delete || remote.item.is_tombstone();
        let conflict_type = if local_deleted || remote_deleted {
            ConflictType::DeleteModify
        } else if as_object(&local.item).is_some() && as_object(&remote.item).is_some() {
            ConflictType::StructuredFields
        } else if local.change_type == ChangeType::Create && remote.change_type == ChangeType::Create
        {
            ConflictType::CreateCreate
        } else {
            match base {
                Some(base)
                    if self
                        .merger
                        .merges_cleanly(base, &local.item.content, &remote.item.content) =>
                {
                    ConflictType::NonOverlapping
                }
                _ => ConflictType::ContentConflict,
            }
        };

        Some(ConflictInfo::new(conflict_type))
    }
}
