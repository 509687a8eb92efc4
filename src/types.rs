//! Core types for ccjk-sync

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{AdapterError, AdapterErrorCode};

/// Compute the SHA-256 hex digest of a byte slice
pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Remote storage backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    Local,
    GithubGist,
    Webdav,
    S3,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Local => "local",
            Provider::GithubGist => "github-gist",
            Provider::Webdav => "webdav",
            Provider::S3 => "s3",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of configuration artifact being synced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemType {
    Skills,
    Workflows,
    Settings,
    McpConfigs,
}

impl ItemType {
    pub const ALL: [ItemType; 4] = [
        ItemType::Skills,
        ItemType::Workflows,
        ItemType::Settings,
        ItemType::McpConfigs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Skills => "skills",
            ItemType::Workflows => "workflows",
            ItemType::Settings => "settings",
            ItemType::McpConfigs => "mcp-configs",
        }
    }
}

impl std::fmt::Display for ItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "skills" | "skill" => Ok(ItemType::Skills),
            "workflows" | "workflow" => Ok(ItemType::Workflows),
            "settings" => Ok(ItemType::Settings),
            "mcp-configs" | "mcp" => Ok(ItemType::McpConfigs),
            _ => Err(format!("Unknown item type: {}", s)),
        }
    }
}

/// One unit of sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncableItem {
    /// Stable identifier
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    pub name: String,
    /// Opaque serialized payload
    pub content: String,
    /// SHA-256 of `content`
    pub content_hash: String,
    pub version: u64,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl SyncableItem {
    /// Create a first-version item
    pub fn new(
        id: impl Into<String>,
        item_type: ItemType,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        Self {
            id: id.into(),
            item_type,
            name: name.into(),
            content_hash: sha256_hex(content.as_bytes()),
            content,
            version: 1,
            last_modified: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    /// Produce the next version with new content
    pub fn with_content(&self, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            content_hash: sha256_hex(content.as_bytes()),
            content,
            version: self.version + 1,
            last_modified: Utc::now(),
            ..self.clone()
        }
    }

    /// Set the modification time (builder style)
    pub fn modified_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_modified = at;
        self
    }

    /// Whether the stored hash matches the content
    pub fn verify_hash(&self) -> bool {
        self.content_hash == sha256_hex(self.content.as_bytes())
    }

    /// Whether this is a deletion marker rather than a live item
    pub fn is_tombstone(&self) -> bool {
        self.metadata
            .get(TOMBSTONE_KEY)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn item_ref(&self) -> ItemRef {
        ItemRef {
            id: self.id.clone(),
            item_type: self.item_type,
        }
    }

    /// Canonical remote key: `<type>/<id>.json`
    pub fn remote_key(&self) -> String {
        remote_key_for(self.item_type, &self.id)
    }
}

pub(crate) const TOMBSTONE_KEY: &str = "deleted";

/// Remote key for an item id
pub fn remote_key_for(item_type: ItemType, id: &str) -> String {
    crate::sync::normalize_key(&format!("{}/{}.json", item_type.as_str(), id))
}

/// Parse a normalized remote key back into its item type and id
pub fn parse_remote_key(key: &str) -> Option<(ItemType, String)> {
    let (type_part, rest) = key.split_once('/')?;
    let item_type: ItemType = type_part.parse().ok()?;
    if type_part != item_type.as_str() {
        return None;
    }
    let id = rest.strip_suffix(".json")?;
    if !is_valid_item_id(id) {
        return None;
    }
    Some((item_type, id.to_string()))
}

/// Whether an id can be used as a path relative to its type directory.
///
/// Ids may nest with `/`, but every segment must be non-empty and neither
/// `.` nor `..`; backslashes and NULs are refused outright.
pub fn is_valid_item_id(id: &str) -> bool {
    !id.is_empty()
        && !id.contains(|c: char| c == '\\' || c == '\0')
        && id
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}

/// Identifier pair used when removing items from a local store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRef {
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: ItemType,
}

/// Kind of delta
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

/// Which replica observed the change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeSource {
    Local,
    Remote,
}

/// An observed delta for one item on one side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub id: String,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub item: SyncableItem,
    pub timestamp: DateTime<Utc>,
    pub source: ChangeSource,
}

impl Change {
    pub fn new(change_type: ChangeType, item: SyncableItem, source: ChangeSource) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            change_type,
            item,
            timestamp: Utc::now(),
            source,
        }
    }

    pub fn item_id(&self) -> &str {
        &self.item.id
    }
}

/// Sync direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    Push,
    Pull,
    #[default]
    Bidirectional,
}

impl SyncDirection {
    pub fn allows_push(self) -> bool {
        matches!(self, SyncDirection::Push | SyncDirection::Bidirectional)
    }

    pub fn allows_pull(self) -> bool {
        matches!(self, SyncDirection::Pull | SyncDirection::Bidirectional)
    }
}

impl std::str::FromStr for SyncDirection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "push" | "push-only" => Ok(SyncDirection::Push),
            "pull" | "pull-only" => Ok(SyncDirection::Pull),
            "bidirectional" | "both" => Ok(SyncDirection::Bidirectional),
            _ => Err(format!(
                "Unknown sync direction: {} (use push|pull|bidirectional)",
                s
            )),
        }
    }
}

/// Strategy applied to colliding changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    LocalWins,
    RemoteWins,
    #[default]
    NewestWins,
    SmartMerge,
    Manual,
}

impl std::str::FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "local-wins" | "local" => Ok(ConflictStrategy::LocalWins),
            "remote-wins" | "remote" => Ok(ConflictStrategy::RemoteWins),
            "newest-wins" | "newest" => Ok(ConflictStrategy::NewestWins),
            "smart-merge" | "merge" => Ok(ConflictStrategy::SmartMerge),
            "manual" => Ok(ConflictStrategy::Manual),
            _ => Err(format!("Unknown conflict strategy: {}", s)),
        }
    }
}

/// Outcome of a resolved conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Local,
    Remote,
    Merged,
}

impl std::str::FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "local" => Ok(Resolution::Local),
            "remote" => Ok(Resolution::Remote),
            "merged" | "merge" => Ok(Resolution::Merged),
            _ => Err(format!(
                "Unknown resolution: {} (use local|remote|merged)",
                s
            )),
        }
    }
}

/// Two colliding changes to the same item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    pub id: String,
    pub item_id: String,
    pub item_type: ItemType,
    pub local_item: SyncableItem,
    pub remote_item: SyncableItem,
    pub local_change: Change,
    pub remote_change: Change,
    pub detected_at: DateTime<Utc>,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    /// User-supplied content for a `merged` resolution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_item: Option<SyncableItem>,
}

impl SyncConflict {
    pub fn new(local_change: Change, remote_change: Change) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            item_id: local_change.item.id.clone(),
            item_type: local_change.item.item_type,
            local_item: local_change.item.clone(),
            remote_item: remote_change.item.clone(),
            local_change,
            remote_change,
            detected_at: Utc::now(),
            resolved: false,
            resolution: None,
            merged_item: None,
        }
    }

    /// Mark as resolved
    pub fn resolve(&mut self, resolution: Resolution) {
        self.resolved = true;
        self.resolution = Some(resolution);
    }
}

/// Per-item error class reported in a sync result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncErrorCode {
    NetworkError,
    TimeoutError,
    QuotaError,
    ValidationError,
    ConnectionFailed,
    AuthenticationFailed,
    NotFound,
    PermissionDenied,
    RateLimited,
    InvalidConfig,
    NotConnected,
    UnknownError,
}

impl From<AdapterErrorCode> for SyncErrorCode {
    fn from(code: AdapterErrorCode) -> Self {
        match code {
            AdapterErrorCode::NetworkError => SyncErrorCode::NetworkError,
            AdapterErrorCode::Timeout => SyncErrorCode::TimeoutError,
            AdapterErrorCode::QuotaExceeded => SyncErrorCode::QuotaError,
            AdapterErrorCode::ConnectionFailed => SyncErrorCode::ConnectionFailed,
            AdapterErrorCode::AuthenticationFailed => SyncErrorCode::AuthenticationFailed,
            AdapterErrorCode::NotFound => SyncErrorCode::NotFound,
            AdapterErrorCode::PermissionDenied => SyncErrorCode::PermissionDenied,
            AdapterErrorCode::RateLimited => SyncErrorCode::RateLimited,
            AdapterErrorCode::InvalidConfig => SyncErrorCode::InvalidConfig,
            AdapterErrorCode::NotConnected => SyncErrorCode::NotConnected,
            AdapterErrorCode::UnknownError => SyncErrorCode::UnknownError,
        }
    }
}

/// A per-item failure attached to a sync result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncItemError {
    pub item_id: String,
    pub code: SyncErrorCode,
    pub message: String,
    #[serde(default)]
    pub attempts: u32,
}

impl SyncItemError {
    pub fn from_adapter(item_id: impl Into<String>, err: &AdapterError, attempts: u32) -> Self {
        Self {
            item_id: item_id.into(),
            code: err.code.into(),
            message: err.to_string(),
            attempts,
        }
    }

    pub fn validation(item_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            code: SyncErrorCode::ValidationError,
            message: message.into(),
            attempts: 1,
        }
    }
}

/// Aggregated outcome of one sync pass
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub direction: SyncDirection,
    pub pushed: Vec<SyncableItem>,
    pub pulled: Vec<SyncableItem>,
    pub conflicts: Vec<SyncConflict>,
    pub errors: Vec<SyncItemError>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub cancelled: bool,
}

/// Engine status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Conflict,
    Error,
}

/// Cumulative counters across passes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub total_synced: u64,
    pub pushed: u64,
    pub pulled: u64,
    pub conflicts_resolved: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
}

/// Persisted engine state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub status: SyncStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub progress: u8,
    #[serde(default)]
    pub conflicts: Vec<SyncConflict>,
    #[serde(default)]
    pub stats: SyncStats,
}

impl SyncState {
    pub fn unresolved_conflicts(&self) -> impl Iterator<Item = &SyncConflict> {
        self.conflicts.iter().filter(|c| !c.resolved)
    }
}

/// Result of an adapter upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub success: bool,
    pub key: String,
    pub size: u64,
    pub checksum: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Result of an adapter download
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadResult {
    pub success: bool,
    pub data: Vec<u8>,
    pub size: u64,
    /// Checksum recorded at upload time
    pub checksum: String,
    pub last_modified: Option<DateTime<Utc>>,
}

/// A remote listing entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteItem {
    pub key: String,
    pub name: String,
    pub size: u64,
    pub is_directory: bool,
    pub last_modified: Option<DateTime<Utc>>,
    /// Upload-time checksum, when the backend exposes it in listings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Opaque version tag (HTTP ETag) where the backend has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}
