//! Filesystem backend
//!
//! Payloads live at `<base_dir>/<key>`. The upload-time checksum is kept in a
//! sidecar under `<base_dir>/.ccjk-meta/` so listings can report it without
//! rehashing every file.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use super::{checked_key, key_name, normalize_key, prime_session, with_timeout};
use super::{AdapterSession, CloudAdapter};
use crate::config::LocalConfig;
use crate::error::{AdapterError, AdapterErrorCode, AdapterResult};
use crate::types::{sha256_hex, DownloadResult, Provider, RemoteItem, UploadResult};

const META_DIR: &str = ".ccjk-meta";
const TMP_PREFIX: &str = ".ccjk-tmp";
const PROVIDER: Provider = Provider::Local;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Sidecar {
    checksum: String,
    size: u64,
    uploaded_at: DateTime<Utc>,
}

/// Adapter over a local (or mounted) directory
pub struct LocalAdapter {
    base_dir: PathBuf,
    timeout: Duration,
    max_retries: Option<u32>,
    session: AdapterSession,
}

impl LocalAdapter {
    pub fn new(config: LocalConfig) -> Self {
        Self {
            base_dir: config.base_dir,
            timeout: Duration::from_millis(config.timeout_ms.max(1)),
            max_retries: config.max_retries,
            session: AdapterSession::new(PROVIDER),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn payload_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(key)
    }

    fn sidecar_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(META_DIR).join(format!("{}.meta", key))
    }

    async fn write_atomic(path: &Path, data: &[u8]) -> AdapterResult<()> {
        let path = path.to_path_buf();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir)?;
            let mut tmp = tempfile::Builder::new()
                .prefix(TMP_PREFIX)
                .tempfile_in(dir)?;
            tmp.write_all(&data)?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| {
            AdapterError::new(PROVIDER, AdapterErrorCode::UnknownError, "writer task failed")
                .with_cause(e)
        })?
        .map_err(|e| AdapterError::from_io(PROVIDER, e))
    }

    async fn do_upload(&self, key: &str, data: &[u8]) -> AdapterResult<UploadResult> {
        self.session.ensure_connected()?;
        let key = checked_key(PROVIDER, key)?;
        let checksum = sha256_hex(data);
        let uploaded_at = Utc::now();

        Self::write_atomic(&self.payload_path(&key), data).await?;
        let sidecar = Sidecar {
            checksum: checksum.clone(),
            size: data.len() as u64,
            uploaded_at,
        };
        let sidecar_bytes = serde_json::to_vec(&sidecar).map_err(|e| {
            AdapterError::new(PROVIDER, AdapterErrorCode::UnknownError, "encode sidecar")
                .with_cause(e)
        })?;
        Self::write_atomic(&self.sidecar_path(&key), &sidecar_bytes).await?;

        self.session.cache_upsert(RemoteItem {
            key: key.clone(),
            name: key_name(&key),
            size: data.len() as u64,
            is_directory: false,
            last_modified: Some(uploaded_at),
            checksum: Some(checksum.clone()),
            etag: None,
        });

        tracing::debug!(key = %key, bytes = data.len(), "local upload");
        Ok(UploadResult {
            success: true,
            key,
            size: data.len() as u64,
            checksum,
            uploaded_at,
        })
    }

    async fn do_download(&self, key: &str) -> AdapterResult<DownloadResult> {
        self.session.ensure_connected()?;
        let key = checked_key(PROVIDER, key)?;
        let path = self.payload_path(&key);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AdapterError::not_found(PROVIDER, &key))
            }
            Err(e) => return Err(AdapterError::from_io(PROVIDER, e)),
        };
        let modified = tokio::fs::metadata(&path)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);

        // Files dropped in by hand have no sidecar; hash them instead
        let checksum = match read_sidecar(&self.sidecar_path(&key)) {
            Some(sidecar) => sidecar.checksum,
            None => sha256_hex(&data),
        };

        Ok(DownloadResult {
            success: true,
            size: data.len() as u64,
            data,
            checksum,
            last_modified: modified,
        })
    }

    async fn do_list(&self, prefix: &str) -> AdapterResult<Vec<RemoteItem>> {
        self.session.ensure_connected()?;
        let prefix = normalize_key(prefix);
        let base = self.base_dir.clone();
        let scan_prefix = prefix.clone();

        let items = tokio::task::spawn_blocking(move || scan(&base, &scan_prefix))
            .await
            .map_err(|e| {
                AdapterError::new(PROVIDER, AdapterErrorCode::UnknownError, "listing task failed")
                    .with_cause(e)
            })??;

        self.session.cache_listing(&prefix, &items);
        Ok(items)
    }

    async fn do_delete(&self, key: &str) -> AdapterResult<bool> {
        self.session.ensure_connected()?;
        let key = checked_key(PROVIDER, key)?;
        match tokio::fs::remove_file(self.payload_path(&key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AdapterError::not_found(PROVIDER, &key))
            }
            Err(e) => return Err(AdapterError::from_io(PROVIDER, e)),
        }
        match tokio::fs::remove_file(self.sidecar_path(&key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(AdapterError::from_io(PROVIDER, e)),
        }
        self.session.cache_remove(&key);
        Ok(true)
    }
}

fn read_sidecar(path: &Path) -> Option<Sidecar> {
    let bytes = std::fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn scan(base: &Path, prefix: &str) -> AdapterResult<Vec<RemoteItem>> {
    if !base.exists() {
        return Ok(Vec::new());
    }
    let mut items = Vec::new();
    let walker = WalkDir::new(base)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.file_name() != META_DIR);

    for entry in walker {
        let entry = entry.map_err(|e| {
            AdapterError::new(PROVIDER, AdapterErrorCode::UnknownError, "walk failed").with_cause(e)
        })?;
        let Ok(relative) = entry.path().strip_prefix(base) else {
            continue;
        };
        let key = normalize_key(&relative.to_string_lossy());
        if key_name(&key).starts_with(TMP_PREFIX) || !key.starts_with(prefix) {
            continue;
        }
        let metadata = entry.metadata().ok();
        let is_directory = entry.file_type().is_dir();
        let sidecar = if is_directory {
            None
        } else {
            read_sidecar(&base.join(META_DIR).join(format!("{}.meta", key)))
        };
        items.push(RemoteItem {
            name: key_name(&key),
            key,
            size: metadata.as_ref().map(|m| m.len()).unwrap_or(0),
            is_directory,
            last_modified: metadata
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from),
            checksum: sidecar.map(|s| s.checksum),
            etag: None,
        });
    }
    Ok(items)
}

#[async_trait]
impl CloudAdapter for LocalAdapter {
    fn provider(&self) -> Provider {
        PROVIDER
    }

    async fn connect(&self) -> AdapterResult<()> {
        if self.base_dir.as_os_str().is_empty() {
            return Err(AdapterError::invalid_config(PROVIDER, "baseDir is empty"));
        }
        tokio::fs::create_dir_all(&self.base_dir).await.map_err(|e| {
            AdapterError::new(
                PROVIDER,
                AdapterErrorCode::ConnectionFailed,
                format!("cannot open {}", self.base_dir.display()),
            )
            .with_cause(e)
        })?;
        prime_session(self, &self.session).await
    }

    async fn disconnect(&self) {
        self.session.mark_disconnected();
    }

    fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    async fn upload(&self, key: &str, data: &[u8]) -> AdapterResult<UploadResult> {
        with_timeout(PROVIDER, self.timeout, self.do_upload(key, data)).await
    }

    async fn download(&self, key: &str) -> AdapterResult<DownloadResult> {
        with_timeout(PROVIDER, self.timeout, self.do_download(key)).await
    }

    async fn list(&self, prefix: &str) -> AdapterResult<Vec<RemoteItem>> {
        with_timeout(PROVIDER, self.timeout, self.do_list(prefix)).await
    }

    async fn delete(&self, key: &str) -> AdapterResult<bool> {
        with_timeout(PROVIDER, self.timeout, self.do_delete(key)).await
    }

    fn retry_limit(&self) -> Option<u32> {
        self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(dir: &Path) -> LocalAdapter {
        LocalAdapter::new(LocalConfig {
            base_dir: dir.join("remote"),
            timeout_ms: 5_000,
            max_retries: None,
        })
    }

    #[tokio::test]
    async fn test_operations_require_connect() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());
        let err = adapter.upload("skills/a.json", b"{}").await.unwrap_err();
        assert_eq!(err.code, AdapterErrorCode::NotConnected);
        let err = adapter.list("").await.unwrap_err();
        assert_eq!(err.code, AdapterErrorCode::NotConnected);
    }

    #[tokio::test]
    async fn test_upload_download_preserves_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());
        adapter.connect().await.unwrap();

        let uploaded = adapter.upload("/skills//a.json", b"payload").await.unwrap();
        assert_eq!(uploaded.key, "skills/a.json");
        assert_eq!(uploaded.checksum, sha256_hex(b"payload"));

        let downloaded = adapter.download("skills/a.json").await.unwrap();
        assert_eq!(downloaded.data, b"payload");
        assert_eq!(downloaded.checksum, uploaded.checksum);
        assert_eq!(downloaded.size, 7);
    }

    #[tokio::test]
    async fn test_list_reports_checksums_and_hides_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());
        adapter.connect().await.unwrap();
        adapter.upload("skills/a.json", b"a").await.unwrap();
        adapter.upload("settings/b.json", b"b").await.unwrap();

        let all = adapter.list("").await.unwrap();
        let files: Vec<_> = all.iter().filter(|i| !i.is_directory).collect();
        assert_eq!(files.len(), 2);
        assert!(all.iter().all(|i| !i.key.starts_with(META_DIR)));
        let a = files.iter().find(|i| i.key == "skills/a.json").unwrap();
        assert_eq!(a.checksum.as_deref(), Some(sha256_hex(b"a").as_str()));

        let skills: Vec<_> = adapter
            .list("skills/")
            .await
            .unwrap()
            .into_iter()
            .filter(|i| !i.is_directory)
            .collect();
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].name, "a.json");
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());
        adapter.connect().await.unwrap();
        adapter.upload("skills/a.json", b"a").await.unwrap();

        assert!(adapter.delete("skills/a.json").await.unwrap());
        let err = adapter.delete("skills/a.json").await.unwrap_err();
        assert_eq!(err.code, AdapterErrorCode::NotFound);
        let err = adapter.download("skills/a.json").await.unwrap_err();
        assert_eq!(err.code, AdapterErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_keys_cannot_leave_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());
        adapter.connect().await.unwrap();

        let err = adapter.upload("skills/../../pwned.json", b"x").await.unwrap_err();
        assert_eq!(err.code, AdapterErrorCode::InvalidConfig);
        assert!(!dir.path().join("pwned.json").exists());

        let err = adapter.download("../secret").await.unwrap_err();
        assert_eq!(err.code, AdapterErrorCode::InvalidConfig);
    }

    #[tokio::test]
    async fn test_concurrent_uploads_of_one_key() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = std::sync::Arc::new(adapter(dir.path()));
        adapter.connect().await.unwrap();

        let writers: Vec<_> = (0..16)
            .map(|i| {
                let adapter = adapter.clone();
                tokio::spawn(async move {
                    adapter
                        .upload("skills/a.json", format!("payload {}", i).as_bytes())
                        .await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let files: Vec<_> = adapter
            .list("")
            .await
            .unwrap()
            .into_iter()
            .filter(|i| !i.is_directory)
            .collect();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].key, "skills/a.json");

        let leftovers = WalkDir::new(dir.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TMP_PREFIX))
            .count();
        assert_eq!(leftovers, 0);
        let data = adapter.download("skills/a.json").await.unwrap().data;
        assert!(String::from_utf8(data).unwrap().starts_with("payload "));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());
        adapter.connect().await.unwrap();
        adapter.disconnect().await;
        adapter.disconnect().await;
        assert!(!adapter.is_connected());
    }
}
