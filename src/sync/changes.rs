//! Change detection against the checkpoint
//!
//! Both sides are diffed the same way: an id with no checkpoint entry is a
//! create, an id whose fingerprint moved is an update, and a checkpoint entry
//! with no current observation is a delete. Output is ordered creates,
//! updates, deletes, each by id, so passes are deterministic.

use std::collections::HashSet;

use chrono::Utc;

use super::checkpoint::{Checkpoint, CheckpointEntry};
use crate::types::{
    parse_remote_key, Change, ChangeSource, ChangeType, ItemType, RemoteItem, SyncableItem,
};

/// Metadata key on placeholder items built from a remote listing
pub const REMOTE_KEY_META: &str = "remoteKey";

/// Something observed on one side that can be compared to a checkpoint entry
pub trait Observation {
    fn id(&self) -> &str;
    fn item_type(&self) -> ItemType;
    fn differs_from(&self, entry: &CheckpointEntry) -> bool;
    /// Item carried by the resulting change
    fn to_item(&self, entry: Option<&CheckpointEntry>) -> SyncableItem;
}

impl Observation for SyncableItem {
    fn id(&self) -> &str {
        &self.id
    }

    fn item_type(&self) -> ItemType {
        self.item_type
    }

    fn differs_from(&self, entry: &CheckpointEntry) -> bool {
        self.content_hash != entry.content_hash || self.version != entry.version
    }

    fn to_item(&self, _entry: Option<&CheckpointEntry>) -> SyncableItem {
        self.clone()
    }
}

/// A remote listing entry whose key parsed as an item key
#[derive(Debug, Clone)]
pub struct RemoteObservation {
    pub id: String,
    pub item_type: ItemType,
    pub remote: RemoteItem,
}

impl RemoteObservation {
    pub fn from_listing(remote: RemoteItem) -> Option<Self> {
        if remote.is_directory {
            return None;
        }
        let (item_type, id) = parse_remote_key(&remote.key)?;
        Some(Self {
            id,
            item_type,
            remote,
        })
    }
}

impl Observation for RemoteObservation {
    fn id(&self) -> &str {
        &self.id
    }

    fn item_type(&self) -> ItemType {
        self.item_type
    }

    /// Listing checksums are authoritative. Without one, any listing entry
    /// that is not exactly the one recorded at sync time is a candidate.
    /// Candidates are confirmed by download before they are applied.
    fn differs_from(&self, entry: &CheckpointEntry) -> bool {
        match (&self.remote.checksum, &entry.remote_checksum) {
            (Some(current), Some(synced)) => current != synced,
            (Some(_), None) => true,
            (None, _) => entry
                .listing
                .as_ref()
                .map_or(true, |seen| !seen.matches(&self.remote)),
        }
    }

    fn to_item(&self, entry: Option<&CheckpointEntry>) -> SyncableItem {
        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert(
            REMOTE_KEY_META.to_string(),
            serde_json::Value::String(self.remote.key.clone()),
        );
        SyncableItem {
            id: self.id.clone(),
            item_type: self.item_type,
            name: entry
                .map(|e| e.name.clone())
                .unwrap_or_else(|| self.id.clone()),
            content: String::new(),
            content_hash: self.remote.checksum.clone().unwrap_or_default(),
            version: entry.map_or(0, |e| e.version),
            last_modified: self.remote.last_modified.unwrap_or_else(Utc::now),
            metadata,
        }
    }
}

/// Diffs observations against a checkpoint
#[derive(Debug, Default, Clone, Copy)]
pub struct ChangeDetector;

impl ChangeDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn detect<O: Observation>(
        &self,
        observed: &[O],
        checkpoint: &Checkpoint,
        source: ChangeSource,
        types: &[ItemType],
    ) -> Vec<Change> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut changes = Vec::new();

        for observation in observed {
            if !types.contains(&observation.item_type()) {
                continue;
            }
            if !seen.insert(observation.id()) {
                tracing::warn!(id = observation.id(), ?source, "duplicate item id, ignoring");
                continue;
            }
            match checkpoint.get(observation.id()) {
                None => changes.push(Change::new(
                    ChangeType::Create,
                    observation.to_item(None),
                    source,
                )),
                Some(entry) if observation.differs_from(entry) => changes.push(Change::new(
                    ChangeType::Update,
                    observation.to_item(Some(entry)),
                    source,
                )),
                Some(_) => {}
            }
        }

        for (id, entry) in &checkpoint.entries {
            if types.contains(&entry.item_type) && !seen.contains(id.as_str()) {
                changes.push(Change::new(ChangeType::Delete, entry.tombstone(id), source));
            }
        }

        changes.sort_by(|a, b| {
            rank(a.change_type)
                .cmp(&rank(b.change_type))
                .then_with(|| a.item.id.cmp(&b.item.id))
        });
        changes
    }

    pub fn detect_local(
        &self,
        items: &[SyncableItem],
        checkpoint: &Checkpoint,
        types: &[ItemType],
    ) -> Vec<Change> {
        self.detect(items, checkpoint, ChangeSource::Local, types)
    }

    /// Remote keys that do not parse as item keys are ignored
    pub fn detect_remote(
        &self,
        listing: &[RemoteItem],
        checkpoint: &Checkpoint,
        types: &[ItemType],
    ) -> Vec<Change> {
        let observed: Vec<RemoteObservation> = listing
            .iter()
            .cloned()
            .filter_map(RemoteObservation::from_listing)
            .collect();
        self.detect(&observed, checkpoint, ChangeSource::Remote, types)
    }
}

fn rank(change_type: ChangeType) -> u8 {
    match change_type {
        ChangeType::Create => 0,
        ChangeType::Update => 1,
        ChangeType::Delete => 2,
    }
}
