//! GitHub Gist backend
//!
//! One gist per key. The gist description carries a small JSON record
//! (`{"ccjk":true,"key":..,"checksum":..}`) so listings can map gists back to
//! keys and report upload checksums without fetching file bodies. File
//! content is base64 so arbitrary bytes survive the text-only API.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use super::{checked_key, key_name, normalize_key, prime_session, with_timeout};
use super::{AdapterSession, CloudAdapter};
use crate::config::{GistConfig, GITHUB_API_BASE};
use crate::error::{AdapterError, AdapterErrorCode, AdapterResult};
use crate::types::{sha256_hex, DownloadResult, Provider, RemoteItem, UploadResult};

const PROVIDER: Provider = Provider::GithubGist;

/// Concurrent requests allowed against the API
const MAX_IN_FLIGHT: usize = 2;

/// Longest we will sit out a known rate-limit window before failing fast
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

const PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 50;

/// Side-channel record stored in the gist description
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GistRecord {
    ccjk: bool,
    key: String,
    checksum: String,
}

impl GistRecord {
    fn parse(description: Option<&str>) -> Option<Self> {
        let record: GistRecord = serde_json::from_str(description?).ok()?;
        record.ccjk.then_some(record)
    }
}

#[derive(Debug, Deserialize)]
struct GistFile {
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    truncated: Option<bool>,
    #[serde(default)]
    raw_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Gist {
    id: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    files: HashMap<String, GistFile>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    message: Option<String>,
}

/// Where a key lives
#[derive(Debug, Clone)]
struct GistEntry {
    gist_id: String,
    filename: String,
    checksum: String,
    size: u64,
    updated_at: Option<DateTime<Utc>>,
}

impl GistEntry {
    fn remote_item(&self, key: &str) -> RemoteItem {
        RemoteItem {
            key: key.to_string(),
            name: key_name(key),
            size: self.size,
            is_directory: false,
            last_modified: self.updated_at,
            checksum: Some(self.checksum.clone()),
            etag: None,
        }
    }
}

/// Last rate-limit headers seen
#[derive(Debug, Default, Clone, Copy)]
struct RateLimit {
    remaining: Option<u64>,
    reset_at: Option<DateTime<Utc>>,
}

/// Adapter over the GitHub Gist REST API
pub struct GistAdapter {
    config: GistConfig,
    api_base: String,
    client: reqwest::Client,
    timeout: Duration,
    session: AdapterSession,
    entries: RwLock<HashMap<String, GistEntry>>,
    rate: Mutex<RateLimit>,
    permits: Semaphore,
}

impl GistAdapter {
    pub fn new(config: GistConfig) -> AdapterResult<Self> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", config.token.trim()))
            .map_err(|_| AdapterError::invalid_config(PROVIDER, "token contains invalid characters"))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("ccjk-sync"));
        headers.insert(
            "x-github-api-version",
            HeaderValue::from_static("2022-11-28"),
        );

        let timeout = Duration::from_millis(config.timeout_ms.max(1));
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| AdapterError::from_reqwest(PROVIDER, e))?;

        let api_base = config
            .api_base
            .clone()
            .unwrap_or_else(|| GITHUB_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            config,
            api_base,
            client,
            timeout,
            session: AdapterSession::new(PROVIDER),
            entries: RwLock::new(HashMap::new()),
            rate: Mutex::new(RateLimit::default()),
            permits: Semaphore::new(MAX_IN_FLIGHT),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    fn filename_for(key: &str) -> String {
        format!("{}.b64", key.replace('/', "__"))
    }

    /// Wait out an exhausted window if it resets soon, otherwise fail fast
    async fn respect_rate_limit(&self) -> AdapterResult<()> {
        let rate = *self.rate.lock();
        if rate.remaining != Some(0) {
            return Ok(());
        }
        let Some(reset_at) = rate.reset_at else {
            return Ok(());
        };
        let now = Utc::now();
        if reset_at <= now {
            return Ok(());
        }
        let wait = (reset_at - now).to_std().unwrap_or_default();
        if wait > MAX_RATE_LIMIT_WAIT {
            return Err(AdapterError::new(
                PROVIDER,
                AdapterErrorCode::RateLimited,
                format!("rate limit exhausted until {}", reset_at.to_rfc3339()),
            )
            .with_retry_after(reset_at));
        }
        tracing::warn!(wait_ms = wait.as_millis() as u64, "gist rate limit exhausted, waiting");
        tokio::time::sleep(wait).await;
        Ok(())
    }

    fn record_rate_limit(&self, headers: &HeaderMap) {
        let header_u64 = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
        };
        let remaining = header_u64("x-ratelimit-remaining");
        let reset_at = header_u64("x-ratelimit-reset")
            .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single());
        if remaining.is_some() || reset_at.is_some() {
            let mut rate = self.rate.lock();
            rate.remaining = remaining.or(rate.remaining);
            rate.reset_at = reset_at.or(rate.reset_at);
        }
    }

    /// Send a request, tracking rate limits and mapping failure statuses
    async fn send(&self, request: RequestBuilder) -> AdapterResult<Response> {
        let _permit = self.permits.acquire().await.map_err(|e| {
            AdapterError::new(PROVIDER, AdapterErrorCode::UnknownError, "request gate closed")
                .with_cause(e)
        })?;
        self.respect_rate_limit().await?;

        let response = request
            .send()
            .await
            .map_err(|e| AdapterError::from_reqwest(PROVIDER, e))?;
        self.record_rate_limit(response.headers());

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        let message = response
            .json::<ApiMessage>()
            .await
            .ok()
            .and_then(|m| m.message)
            .unwrap_or_else(|| status.to_string());
        Err(self.classify(status, &message, retry_after))
    }

    fn classify(
        &self,
        status: StatusCode,
        message: &str,
        retry_after: Option<DateTime<Utc>>,
    ) -> AdapterError {
        let rate = *self.rate.lock();
        let (code, retry_at) = match status.as_u16() {
            401 => (AdapterErrorCode::AuthenticationFailed, None),
            403 if rate.remaining == Some(0) => (AdapterErrorCode::RateLimited, rate.reset_at),
            403 => (AdapterErrorCode::PermissionDenied, None),
            404 => (AdapterErrorCode::NotFound, None),
            429 => (
                AdapterErrorCode::RateLimited,
                retry_after.or(rate.reset_at),
            ),
            _ => (AdapterErrorCode::UnknownError, None),
        };
        let mut err = AdapterError::new(PROVIDER, code, format!("{}: {}", status, message));
        if let Some(at) = retry_at {
            err = err.with_retry_after(at);
        }
        err
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> AdapterResult<T> {
        let response = self.send(self.client.get(self.url(path))).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| AdapterError::from_reqwest(PROVIDER, e))
    }

    async fn fetch_gists(&self) -> AdapterResult<Vec<Gist>> {
        let mut gists: Vec<Gist> = Vec::new();
        for page in 1..=MAX_PAGES {
            let batch: Vec<Gist> = self
                .get_json(&format!("/gists?per_page={}&page={}", PAGE_SIZE, page))
                .await?;
            let done = batch.len() < PAGE_SIZE;
            gists.extend(batch);
            if done {
                break;
            }
        }

        if let Some(extra) = self.config.gist_id.as_deref() {
            if !gists.iter().any(|g| g.id == extra) {
                let gist: Gist = self.get_json(&format!("/gists/{}", extra)).await?;
                gists.push(gist);
            }
        }
        Ok(gists)
    }

    fn index(gists: Vec<Gist>) -> HashMap<String, GistEntry> {
        let mut entries = HashMap::new();
        for gist in gists {
            let Some(record) = GistRecord::parse(gist.description.as_deref()) else {
                continue;
            };
            let key = normalize_key(&record.key);
            let filename = Self::filename_for(&key);
            let size = gist.files.get(&filename).and_then(|f| f.size).unwrap_or(0);
            entries.insert(
                key,
                GistEntry {
                    gist_id: gist.id,
                    filename,
                    checksum: record.checksum,
                    size,
                    updated_at: gist.updated_at,
                },
            );
        }
        entries
    }

    async fn lookup(&self, key: &str) -> AdapterResult<GistEntry> {
        if let Some(entry) = self.entries.read().get(key).cloned() {
            return Ok(entry);
        }
        // Someone else may have created it since our last listing
        self.do_list("").await?;
        self.entries
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| AdapterError::not_found(PROVIDER, key))
    }

    async fn do_list(&self, prefix: &str) -> AdapterResult<Vec<RemoteItem>> {
        self.session.ensure_connected()?;
        let prefix = normalize_key(prefix);
        let entries = Self::index(self.fetch_gists().await?);

        let mut items: Vec<RemoteItem> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, entry)| entry.remote_item(key))
            .collect();
        items.sort_by(|a, b| a.key.cmp(&b.key));

        *self.entries.write() = entries;
        self.session.cache_listing(&prefix, &items);
        Ok(items)
    }

    async fn do_upload(&self, key: &str, data: &[u8]) -> AdapterResult<UploadResult> {
        self.session.ensure_connected()?;
        let key = checked_key(PROVIDER, key)?;
        let checksum = sha256_hex(data);
        let filename = Self::filename_for(&key);
        let description = serde_json::to_string(&GistRecord {
            ccjk: true,
            key: key.clone(),
            checksum: checksum.clone(),
        })
        .map_err(|e| {
            AdapterError::new(PROVIDER, AdapterErrorCode::UnknownError, "encode description")
                .with_cause(e)
        })?;
        let content = base64::engine::general_purpose::STANDARD.encode(data);

        let mut files = serde_json::Map::new();
        files.insert(filename.clone(), serde_json::json!({ "content": content }));

        let existing = self.entries.read().get(&key).cloned();
        let request = match &existing {
            Some(entry) => {
                // Drop a stale file if the naming scheme changed
                if entry.filename != filename {
                    files.insert(entry.filename.clone(), serde_json::Value::Null);
                }
                self.client
                    .request(Method::PATCH, self.url(&format!("/gists/{}", entry.gist_id)))
                    .json(&serde_json::json!({ "description": description, "files": files }))
            }
            None => self.client.post(self.url("/gists")).json(&serde_json::json!({
                "description": description,
                "public": !self.config.is_private,
                "files": files,
            })),
        };

        let gist: Gist = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| AdapterError::from_reqwest(PROVIDER, e))?;

        let uploaded_at = gist.updated_at.unwrap_or_else(Utc::now);
        let entry = GistEntry {
            gist_id: gist.id,
            filename,
            checksum: checksum.clone(),
            size: data.len() as u64,
            updated_at: Some(uploaded_at),
        };
        self.session.cache_upsert(entry.remote_item(&key));
        self.entries.write().insert(key.clone(), entry);

        tracing::debug!(key = %key, created = existing.is_none(), "gist upload");
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
        let entry = self.lookup(&key).await?;
        let gist: Gist = self.get_json(&format!("/gists/{}", entry.gist_id)).await?;
        let record = GistRecord::parse(gist.description.as_deref());

        let file = gist
            .files
            .get(&entry.filename)
            .ok_or_else(|| AdapterError::not_found(PROVIDER, &key))?;

        let encoded = match (&file.content, file.truncated.unwrap_or(false), &file.raw_url) {
            (Some(content), false, _) => content.clone(),
            (_, _, Some(raw_url)) => self
                .send(self.client.get(raw_url))
                .await?
                .text()
                .await
                .map_err(|e| AdapterError::from_reqwest(PROVIDER, e))?,
            _ => return Err(AdapterError::not_found(PROVIDER, &key)),
        };

        let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        let data = base64::engine::general_purpose::STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| {
                AdapterError::new(PROVIDER, AdapterErrorCode::UnknownError, "gist content is not base64")
                    .with_cause(e)
            })?;

        let checksum = record
            .map(|r| r.checksum)
            .unwrap_or_else(|| sha256_hex(&data));
        Ok(DownloadResult {
            success: true,
            size: data.len() as u64,
            data,
            checksum,
            last_modified: gist.updated_at,
        })
    }

    async fn do_delete(&self, key: &str) -> AdapterResult<bool> {
        self.session.ensure_connected()?;
        let key = checked_key(PROVIDER, key)?;
        let entry = self.lookup(&key).await?;
        self.send(
            self.client
                .delete(self.url(&format!("/gists/{}", entry.gist_id))),
        )
        .await?;
        self.entries.write().remove(&key);
        self.session.cache_remove(&key);
        Ok(true)
    }
}

#[async_trait]
impl CloudAdapter for GistAdapter {
    fn provider(&self) -> Provider {
        PROVIDER
    }

    async fn connect(&self) -> AdapterResult<()> {
        if self.config.token.trim().is_empty() {
            return Err(AdapterError::invalid_config(PROVIDER, "token is empty"));
        }
        with_timeout(PROVIDER, self.timeout, async {
            self.send(self.client.get(self.url("/user"))).await?;
            Ok::<(), AdapterError>(())
        })
        .await?;
        prime_session(self, &self.session).await
    }

    async fn disconnect(&self) {
        self.session.mark_disconnected();
        self.entries.write().clear();
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_requires_marker() {
        let ok = GistRecord::parse(Some(r#"{"ccjk":true,"key":"skills/a.json","checksum":"abc"}"#));
        assert_eq!(ok.map(|r| r.key).as_deref(), Some("skills/a.json"));
        assert!(GistRecord::parse(Some(r#"{"ccjk":false,"key":"k","checksum":"c"}"#)).is_none());
        assert!(GistRecord::parse(Some("my dotfiles")).is_none());
        assert!(GistRecord::parse(None).is_none());
    }

    #[test]
    fn test_filename_has_no_slashes() {
        assert_eq!(GistAdapter::filename_for("skills/a.json"), "skills__a.json.b64");
    }

    #[test]
    fn test_index_skips_foreign_gists() {
        let gists: Vec<Gist> = serde_json::from_value(serde_json::json!([
            {
                "id": "g1",
                "description": "{\"ccjk\":true,\"key\":\"skills/a.json\",\"checksum\":\"c1\"}",
                "updated_at": "2026-01-01T00:00:00Z",
                "files": { "skills__a.json.b64": { "size": 12 } }
            },
            { "id": "g2", "description": "scratch notes", "files": {} }
        ]))
        .unwrap();
        let index = GistAdapter::index(gists);
        assert_eq!(index.len(), 1);
        let entry = &index["skills/a.json"];
        assert_eq!(entry.gist_id, "g1");
        assert_eq!(entry.size, 12);
        assert_eq!(entry.checksum, "c1");
    }

    #[test]
    fn test_classify_rate_limit_vs_permission() {
        let adapter = GistAdapter::new(GistConfig {
            token: "t".to_string(),
            is_private: true,
            gist_id: None,
            api_base: Some("http://127.0.0.1:1".to_string()),
            timeout_ms: 1000,
        })
        .unwrap();

        let err = adapter.classify(StatusCode::FORBIDDEN, "nope", None);
        assert_eq!(err.code, AdapterErrorCode::PermissionDenied);

        let reset = Utc::now() + chrono::Duration::seconds(30);
        *adapter.rate.lock() = RateLimit {
            remaining: Some(0),
            reset_at: Some(reset),
        };
        let err = adapter.classify(StatusCode::FORBIDDEN, "limit", None);
        assert_eq!(err.code, AdapterErrorCode::RateLimited);
        assert_eq!(err.retry_after, Some(reset));

        let err = adapter.classify(StatusCode::UNAUTHORIZED, "bad creds", None);
        assert_eq!(err.code, AdapterErrorCode::AuthenticationFailed);
    }
}
