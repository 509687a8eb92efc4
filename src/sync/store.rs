//! Local item stores
//!
//! The engine reads a snapshot of local items once per pass and hands all
//! writes back in a single `apply` call at the end.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use walkdir::WalkDir;

use super::checkpoint::write_atomic;
use crate::error::{Result, SyncError};
use crate::types::{is_valid_item_id, ItemRef, ItemType, SyncableItem};

/// Source and sink of local items
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Every live item of the given types
    async fn snapshot(&self, types: &[ItemType]) -> Result<Vec<SyncableItem>>;

    /// Persist pulled items and drop removed ones
    async fn apply(&self, writes: &[SyncableItem], removals: &[ItemRef]) -> Result<()>;
}

/// Items stored as `<root>/<type>/<id>.json`
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of an item file; ids that would leave the type directory are refused
    fn item_path(&self, item_type: ItemType, id: &str) -> Result<PathBuf> {
        if !is_valid_item_id(id) {
            return Err(SyncError::Storage(format!(
                "refusing unsafe item id {:?}",
                id
            )));
        }
        Ok(self
            .root
            .join(item_type.as_str())
            .join(format!("{}.json", id)))
    }

    fn scan(root: &Path, types: &[ItemType]) -> Result<Vec<SyncableItem>> {
        let mut items = Vec::new();
        for item_type in types {
            let dir = root.join(item_type.as_str());
            if !dir.is_dir() {
                continue;
            }
            for entry in WalkDir::new(&dir).sort_by_file_name() {
                let entry = entry.map_err(|e| SyncError::Storage(e.to_string()))?;
                let path = entry.path();
                if !entry.file_type().is_file()
                    || path.extension().and_then(|e| e.to_str()) != Some("json")
                {
                    continue;
                }
                let bytes = std::fs::read(path)?;
                match serde_json::from_slice::<SyncableItem>(&bytes) {
                    Ok(item) if !is_valid_item_id(&item.id) => tracing::warn!(
                        path = %path.display(),
                        id = %item.id,
                        "item id is not a safe relative path, skipping"
                    ),
                    Ok(item) if item.item_type == *item_type => items.push(item),
                    Ok(item) => tracing::warn!(
                        path = %path.display(),
                        found = %item.item_type,
                        "item stored under the wrong type directory, skipping"
                    ),
                    Err(e) => tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "unreadable item file, skipping"
                    ),
                }
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl LocalStore for DirectoryStore {
    async fn snapshot(&self, types: &[ItemType]) -> Result<Vec<SyncableItem>> {
        let root = self.root.clone();
        let types = types.to_vec();
        tokio::task::spawn_blocking(move || Self::scan(&root, &types))
            .await
            .map_err(|e| SyncError::Internal(format!("store scan panicked: {}", e)))?
    }

    async fn apply(&self, writes: &[SyncableItem], removals: &[ItemRef]) -> Result<()> {
        let mut files = Vec::with_capacity(writes.len());
        for item in writes {
            files.push((
                self.item_path(item.item_type, &item.id)?,
                serde_json::to_vec_pretty(item)?,
            ));
        }
        let removed = removals
            .iter()
            .map(|r| self.item_path(r.item_type, &r.id))
            .collect::<Result<Vec<_>>>()?;

        tokio::task::spawn_blocking(move || -> Result<()> {
            for (path, bytes) in files {
                write_atomic(&path, &bytes)?;
            }
            for path in removed {
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| SyncError::Internal(format!("store writer panicked: {}", e)))?
    }
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    items: RwLock<BTreeMap<String, SyncableItem>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: impl IntoIterator<Item = SyncableItem>) -> Self {
        let store = Self::new();
        for item in items {
            store.insert(item);
        }
        store
    }

    pub fn insert(&self, item: SyncableItem) {
        self.items.write().insert(item.id.clone(), item);
    }

    pub fn remove(&self, id: &str) -> Option<SyncableItem> {
        self.items.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<SyncableItem> {
        self.items.read().get(id).cloned()
    }

    pub fn items(&self) -> Vec<SyncableItem> {
        self.items.read().values().cloned().collect()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn snapshot(&self, types: &[ItemType]) -> Result<Vec<SyncableItem>> {
        Ok(self
            .items
            .read()
            .values()
            .filter(|i| types.contains(&i.item_type))
            .cloned()
            .collect())
    }

    async fn apply(&self, writes: &[SyncableItem], removals: &[ItemRef]) -> Result<()> {
        let mut items = self.items.write();
        for item in writes {
            items.insert(item.id.clone(), item.clone());
        }
        for removal in removals {
            items.remove(&removal.id);
        }
        Ok(())
    }
}
