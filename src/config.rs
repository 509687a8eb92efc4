//! Provider and sync configuration
//!
//! Provider settings are a tagged union keyed by `provider`, so every backend
//! is dispatched exhaustively when an adapter is constructed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AdapterError, AdapterResult, Result, SyncError};
use crate::types::{ConflictStrategy, ItemType, Provider, SyncDirection};

/// Default per-call adapter timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default GitHub REST API base
pub const GITHUB_API_BASE: &str = "https://api.github.com";

/// Environment variable overriding the provider token / access key
pub const TOKEN_ENV: &str = "CCJK_SYNC_TOKEN";

/// Environment variable overriding the provider secret / password
pub const SECRET_ENV: &str = "CCJK_SYNC_SECRET";

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_private() -> bool {
    true
}

/// Filesystem backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalConfig {
    pub base_dir: PathBuf,
    #[serde(default = "default_timeout_ms", alias = "timeout")]
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

/// GitHub Gist backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GistConfig {
    pub token: String,
    #[serde(default = "default_private")]
    pub is_private: bool,
    /// Extra gist to include in listings (e.g. one shared from another account)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gist_id: Option<String>,
    /// Override for GitHub Enterprise or tests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    #[serde(default = "default_timeout_ms", alias = "timeout")]
    pub timeout_ms: u64,
}

/// WebDAV backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebDavConfig {
    pub endpoint: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_timeout_ms", alias = "timeout")]
    pub timeout_ms: u64,
}

/// S3-compatible backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Access key id
    pub token: String,
    pub secret_key: String,
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Key prefix inside the bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default = "default_timeout_ms", alias = "timeout")]
    pub timeout_ms: u64,
}

/// Configuration for exactly one remote provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "kebab-case")]
pub enum ProviderConfig {
    Local(LocalConfig),
    GithubGist(GistConfig),
    Webdav(WebDavConfig),
    S3(S3Config),
}

impl ProviderConfig {
    pub fn provider(&self) -> Provider {
        match self {
            ProviderConfig::Local(_) => Provider::Local,
            ProviderConfig::GithubGist(_) => Provider::GithubGist,
            ProviderConfig::Webdav(_) => Provider::Webdav,
            ProviderConfig::S3(_) => Provider::S3,
        }
    }

    pub fn timeout(&self) -> Duration {
        let ms = match self {
            ProviderConfig::Local(c) => c.timeout_ms,
            ProviderConfig::GithubGist(c) => c.timeout_ms,
            ProviderConfig::Webdav(c) => c.timeout_ms,
            ProviderConfig::S3(c) => c.timeout_ms,
        };
        Duration::from_millis(ms.max(1))
    }

    /// Check the shape of the config before any I/O
    pub fn validate(&self) -> AdapterResult<()> {
        let provider = self.provider();
        let missing = |field: &str| {
            Err(AdapterError::invalid_config(
                provider,
                format!("missing required field: {}", field),
            ))
        };
        match self {
            ProviderConfig::Local(c) => {
                if c.base_dir.as_os_str().is_empty() {
                    return missing("baseDir");
                }
            }
            ProviderConfig::GithubGist(c) => {
                if c.token.trim().is_empty() {
                    return missing("token");
                }
            }
            ProviderConfig::Webdav(c) => {
                if c.endpoint.trim().is_empty() {
                    return missing("endpoint");
                }
                if !(c.endpoint.starts_with("http://") || c.endpoint.starts_with("https://")) {
                    return Err(AdapterError::invalid_config(
                        provider,
                        "endpoint must be an http(s) URL",
                    ));
                }
                if c.username.is_empty() {
                    return missing("username");
                }
            }
            ProviderConfig::S3(c) => {
                if c.bucket.trim().is_empty() {
                    return missing("bucket");
                }
                if c.token.is_empty() || c.secret_key.is_empty() {
                    return missing("token/secretKey");
                }
            }
        }
        Ok(())
    }

    /// Let secrets from the environment override file values
    pub fn apply_env_secrets(&mut self) {
        let token = std::env::var(TOKEN_ENV).ok().filter(|v| !v.is_empty());
        let secret = std::env::var(SECRET_ENV).ok().filter(|v| !v.is_empty());
        match self {
            ProviderConfig::Local(_) => {}
            ProviderConfig::GithubGist(c) => {
                if let Some(token) = token {
                    c.token = token;
                }
            }
            ProviderConfig::Webdav(c) => {
                if let Some(secret) = secret {
                    c.password = secret;
                }
            }
            ProviderConfig::S3(c) => {
                if let Some(token) = token {
                    c.token = token;
                }
                if let Some(secret) = secret {
                    c.secret_key = secret;
                }
            }
        }
    }

    /// Expand `~` in filesystem paths
    pub fn expand_paths(&mut self) {
        if let ProviderConfig::Local(c) = self {
            let raw = c.base_dir.to_string_lossy().to_string();
            c.base_dir = PathBuf::from(shellexpand::tilde(&raw).to_string());
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_item_types() -> Vec<ItemType> {
    ItemType::ALL.to_vec()
}

fn default_concurrency() -> usize {
    4
}

/// Options for a single sync pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOptions {
    #[serde(default)]
    pub direction: SyncDirection,
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_item_types")]
    pub item_types: Vec<ItemType>,
    /// Plan without remote writes, downloads or local changes. Remote
    /// candidates are judged from the listing alone: a collision is dropped
    /// when the listing checksum equals the local payload's, and is reported
    /// as a conflict otherwise, even if a download would show both agree.
    #[serde(default)]
    pub dry_run: bool,
    /// Apply the strategy to every collision, `manual` falling back to
    /// `local-wins`, without raising conflict records
    #[serde(default)]
    pub force: bool,
    /// Upper bound on in-flight adapter calls
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            direction: SyncDirection::default(),
            conflict_strategy: ConflictStrategy::default(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            item_types: default_item_types(),
            dry_run: false,
            force: false,
            concurrency: default_concurrency(),
        }
    }
}

impl SyncOptions {
    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn includes(&self, item_type: ItemType) -> bool {
        self.item_types.contains(&item_type)
    }
}

/// On-disk application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Where checkpoint and state files live
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    /// Root of the directory-backed local item store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_dir: Option<String>,
    #[serde(default)]
    pub sync: SyncOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderConfig>,
}

impl AppConfig {
    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::config_dir()
            .ok_or_else(|| SyncError::Config("config directory not found".to_string()))?;
        Ok(base.join("ccjk-sync").join("config.toml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("read config {}: {}", path.display(), e)))?;
        let mut config: Self = toml::from_str(&contents)
            .map_err(|e| SyncError::Config(format!("parse config {}: {}", path.display(), e)))?;
        if let Some(provider) = config.provider.as_mut() {
            provider.expand_paths();
            provider.apply_env_secrets();
        }
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)
            .map_err(|e| SyncError::Config(format!("render config: {}", e)))?;
        std::fs::write(path, rendered)?;
        Ok(())
    }

    /// Resolved data directory (checkpoint + state)
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(PathBuf::from(shellexpand::tilde(dir).to_string())),
            None => dirs::data_dir()
                .map(|d| d.join("ccjk-sync"))
                .ok_or_else(|| SyncError::Config("data directory not found".to_string())),
        }
    }

    /// Resolved local item root
    pub fn items_dir(&self) -> Result<PathBuf> {
        match &self.items_dir {
            Some(dir) => Ok(PathBuf::from(shellexpand::tilde(dir).to_string())),
            None => Ok(self.data_dir()?.join("items")),
        }
    }
}
