//! Last-synced snapshot per item
//!
//! The checkpoint is the common ancestor for change detection: an item that
//! matches its checkpoint entry is unchanged on that side. It is persisted as
//! a JSON map keyed by item id and is only rewritten after a pass completes.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::types::{ItemType, RemoteItem, SyncableItem, TOMBSTONE_KEY};

/// Fingerprint of one item as of its last successful sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointEntry {
    pub item_type: ItemType,
    pub name: String,
    pub content_hash: String,
    pub version: u64,
    pub remote_key: String,
    /// Checksum the backend reported for our last upload/download
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_checksum: Option<String>,
    pub synced_at: DateTime<Utc>,
    /// Synced content, kept as the merge base for text items
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Listing entry seen for the synced payload, on backends whose
    /// listings carry no checksum
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing: Option<ListingFingerprint>,
}

/// What a checksum-less listing reported for an item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingFingerprint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl ListingFingerprint {
    pub fn of(remote: &RemoteItem) -> Self {
        Self {
            last_modified: remote.last_modified,
            size: remote.size,
            etag: remote.etag.clone(),
        }
    }

    /// ETags decide when both carry one; otherwise time and size must both
    /// be equal. No clock comparison is involved.
    pub fn matches(&self, remote: &RemoteItem) -> bool {
        match (&self.etag, &remote.etag) {
            (Some(seen), Some(current)) => seen == current,
            _ => self.last_modified == remote.last_modified && self.size == remote.size,
        }
    }
}

impl CheckpointEntry {
    /// Deletion marker for an item that vanished from one side
    pub fn tombstone(&self, id: &str) -> SyncableItem {
        let mut metadata = BTreeMap::new();
        metadata.insert(TOMBSTONE_KEY.to_string(), serde_json::Value::Bool(true));
        SyncableItem {
            id: id.to_string(),
            item_type: self.item_type,
            name: self.name.clone(),
            content: String::new(),
            content_hash: self.content_hash.clone(),
            version: self.version,
            last_modified: self.synced_at,
            metadata,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint {
    pub entries: BTreeMap<String, CheckpointEntry>,
}

impl Checkpoint {
    pub fn get(&self, id: &str) -> Option<&CheckpointEntry> {
        self.entries.get(id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Record an item as synced
    pub fn record(
        &mut self,
        item: &SyncableItem,
        remote_checksum: Option<String>,
        synced_at: DateTime<Utc>,
    ) {
        self.entries.insert(
            item.id.clone(),
            CheckpointEntry {
                item_type: item.item_type,
                name: item.name.clone(),
                content_hash: item.content_hash.clone(),
                version: item.version,
                remote_key: item.remote_key(),
                remote_checksum,
                synced_at,
                content: Some(item.content.clone()),
                listing: None,
            },
        );
    }

    /// Attach the listing fingerprint observed for an entry
    pub fn set_listing(&mut self, id: &str, listing: Option<ListingFingerprint>) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.listing = listing;
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<CheckpointEntry> {
        self.entries.remove(id)
    }

    /// Base content for a three-way merge
    pub fn base_content(&self, id: &str) -> Option<&str> {
        self.entries.get(id).and_then(|e| e.content.as_deref())
    }
}

/// Persistence for the checkpoint
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self) -> Result<Checkpoint>;

    /// Replace the stored checkpoint atomically
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    async fn clear(&self) -> Result<()>;
}

/// Write a file by renaming a sibling temp file over it
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| SyncError::Storage(format!("persist {}: {}", path.display(), e)))?;
    Ok(())
}

/// Checkpoint stored as a JSON file
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<Checkpoint> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Checkpoint::default()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| {
            SyncError::Storage(format!("corrupt checkpoint {}: {}", self.path.display(), e))
        })
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| SyncError::Internal(format!("checkpoint writer panicked: {}", e)))??;
        tracing::debug!(entries = checkpoint.len(), path = %self.path.display(), "checkpoint saved");
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process checkpoint, for tests and embedding
#[derive(Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<Checkpoint>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Checkpoint {
        self.inner.lock().clone()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> Result<Checkpoint> {
        Ok(self.inner.lock().clone())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        *self.inner.lock() = checkpoint.clone();
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.inner.lock() = Checkpoint::default();
        Ok(())
    }
}
