//! Cloud adapter contract and backends
//!
//! Every backend exposes the same connect / upload / download / list / delete
//! surface over opaque keys. Keys are normalized before they reach a backend,
//! and a disconnected adapter refuses every storage operation.

mod gist;
mod local;
#[cfg(feature = "cloud")]
mod s3;
mod webdav;

pub use gist::GistAdapter;
pub use local::LocalAdapter;
#[cfg(feature = "cloud")]
pub use s3::S3Adapter;
pub use webdav::WebDavAdapter;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::config::ProviderConfig;
use crate::error::{AdapterError, AdapterResult};
use crate::types::{DownloadResult, Provider, RemoteItem, UploadResult};

/// Uniform storage contract over a remote backend
#[async_trait]
pub trait CloudAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Validate credentials and prime the listing cache
    async fn connect(&self) -> AdapterResult<()>;

    /// Drop the session. Idempotent.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    async fn upload(&self, key: &str, data: &[u8]) -> AdapterResult<UploadResult>;

    async fn download(&self, key: &str) -> AdapterResult<DownloadResult>;

    /// Enumerate keys under a prefix (empty prefix lists everything)
    async fn list(&self, prefix: &str) -> AdapterResult<Vec<RemoteItem>>;

    async fn delete(&self, key: &str) -> AdapterResult<bool>;

    /// Backend-specific cap on retry attempts, if any
    fn retry_limit(&self) -> Option<u32> {
        None
    }
}

/// Canonical key form: forward slashes, no leading/trailing or doubled slashes
pub fn normalize_key(key: &str) -> String {
    key.replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Normalize a key, rejecting the empty key and keys that climb out of the base
pub(crate) fn checked_key(provider: Provider, key: &str) -> AdapterResult<String> {
    let key = normalize_key(key);
    if key.is_empty() {
        return Err(AdapterError::invalid_config(provider, "empty remote key"));
    }
    if key.contains('\0') || key.split('/').any(|s| s == "." || s == "..") {
        return Err(AdapterError::invalid_config(
            provider,
            format!("remote key {:?} has relative segments", key),
        ));
    }
    Ok(key)
}

/// Build the adapter for a provider config
pub fn create_adapter(config: ProviderConfig) -> AdapterResult<Arc<dyn CloudAdapter>> {
    config.validate()?;
    let adapter: Arc<dyn CloudAdapter> = match config {
        ProviderConfig::Local(c) => Arc::new(LocalAdapter::new(c)),
        ProviderConfig::GithubGist(c) => Arc::new(GistAdapter::new(c)?),
        ProviderConfig::Webdav(c) => Arc::new(WebDavAdapter::new(c)?),
        #[cfg(feature = "cloud")]
        ProviderConfig::S3(c) => Arc::new(S3Adapter::new(c)),
        #[cfg(not(feature = "cloud"))]
        ProviderConfig::S3(_) => {
            return Err(AdapterError::invalid_config(
                Provider::S3,
                "built without the `cloud` feature",
            ))
        }
    };
    Ok(adapter)
}

/// Run an adapter call under the configured timeout
pub(crate) async fn with_timeout<T, F>(
    provider: Provider,
    timeout: Duration,
    fut: F,
) -> AdapterResult<T>
where
    F: Future<Output = AdapterResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::timeout(provider, timeout)),
    }
}

/// Connection flag plus the last listing, shared by all backends
pub(crate) struct AdapterSession {
    provider: Provider,
    connected: AtomicBool,
    listing: RwLock<BTreeMap<String, RemoteItem>>,
}

impl AdapterSession {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            connected: AtomicBool::new(false),
            listing: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn ensure_connected(&self) -> AdapterResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(AdapterError::not_connected(self.provider))
        }
    }

    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.listing.write().clear();
    }

    /// Replace cached entries under `prefix` with a fresh listing
    pub fn cache_listing(&self, prefix: &str, items: &[RemoteItem]) {
        let mut listing = self.listing.write();
        listing.retain(|key, _| !key.starts_with(prefix));
        for item in items {
            listing.insert(item.key.clone(), item.clone());
        }
    }

    pub fn cache_upsert(&self, item: RemoteItem) {
        self.listing.write().insert(item.key.clone(), item);
    }

    pub fn cache_remove(&self, key: &str) {
        self.listing.write().remove(key);
    }

    pub fn cached(&self, key: &str) -> Option<RemoteItem> {
        self.listing.read().get(key).cloned()
    }
}

/// Finish `connect`: mark the session live, then prime the cache.
/// A failed first listing leaves the adapter disconnected.
pub(crate) async fn prime_session<A>(adapter: &A, session: &AdapterSession) -> AdapterResult<()>
where
    A: CloudAdapter + ?Sized,
{
    session.mark_connected();
    match adapter.list("").await {
        Ok(items) => {
            tracing::debug!(
                provider = %adapter.provider(),
                entries = items.len(),
                "adapter connected"
            );
            Ok(())
        }
        Err(e) => {
            session.mark_disconnected();
            Err(e)
        }
    }
}

/// Last path segment of a key
pub(crate) fn key_name(key: &str) -> String {
    key.rsplit('/').next().unwrap_or(key).to_string()
}
