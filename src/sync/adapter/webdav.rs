//! WebDAV backend
//!
//! Keys map to paths under the endpoint collection. Parent collections are
//! created with MKCOL on upload. Upload checksums are stored next to each
//! payload as `<key>.sha256`; listings leave `checksum` empty and the engine
//! falls back to modification times.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::{Method, RequestBuilder, Response, StatusCode};

use super::{checked_key, key_name, normalize_key, prime_session, with_timeout};
use super::{AdapterSession, CloudAdapter};
use crate::config::WebDavConfig;
use crate::error::{AdapterError, AdapterErrorCode, AdapterResult};
use crate::types::{sha256_hex, DownloadResult, Provider, RemoteItem, UploadResult};

const PROVIDER: Provider = Provider::Webdav;
const CHECKSUM_SUFFIX: &str = ".sha256";

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:resourcetype/>
    <d:getcontentlength/>
    <d:getlastmodified/>
    <d:getetag/>
  </d:prop>
</d:propfind>"#;

/// One `<response>` from a multistatus body
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct DavEntry {
    pub href: String,
    pub is_collection: bool,
    pub content_length: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

#[derive(Clone, Copy)]
enum DavField {
    Href,
    Length,
    Modified,
    ETag,
}

/// Parse a PROPFIND multistatus document
pub(crate) fn parse_multistatus(xml: &str) -> Result<Vec<DavEntry>, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<DavEntry> = None;
    let mut field: Option<DavField> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"response" => current = Some(DavEntry::default()),
                b"href" => field = Some(DavField::Href),
                b"getcontentlength" => field = Some(DavField::Length),
                b"getlastmodified" => field = Some(DavField::Modified),
                b"getetag" => field = Some(DavField::ETag),
                b"collection" => {
                    if let Some(entry) = current.as_mut() {
                        entry.is_collection = true;
                    }
                }
                _ => {}
            },
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"collection" {
                    if let Some(entry) = current.as_mut() {
                        entry.is_collection = true;
                    }
                }
            }
            Event::Text(t) => {
                if let (Some(field), Some(entry)) = (field, current.as_mut()) {
                    let text = t.unescape()?;
                    let text = text.trim();
                    match field {
                        DavField::Href => entry.href = text.to_string(),
                        DavField::Length => entry.content_length = text.parse().ok(),
                        DavField::Modified => {
                            entry.last_modified = DateTime::parse_from_rfc2822(text)
                                .ok()
                                .map(|dt| dt.with_timezone(&Utc))
                        }
                        DavField::ETag => entry.etag = Some(text.to_string()),
                    }
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"response" => {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                }
                b"href" | b"getcontentlength" | b"getlastmodified" | b"getetag" => {
                    field = None
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(entries)
}

/// Adapter over a WebDAV collection
pub struct WebDavAdapter {
    config: WebDavConfig,
    endpoint: reqwest::Url,
    client: reqwest::Client,
    timeout: Duration,
    session: AdapterSession,
}

impl WebDavAdapter {
    pub fn new(config: WebDavConfig) -> AdapterResult<Self> {
        // A trailing slash makes the endpoint a collection base for joins
        let raw = format!("{}/", config.endpoint.trim_end_matches('/'));
        let endpoint = reqwest::Url::parse(&raw).map_err(|e| {
            AdapterError::invalid_config(PROVIDER, format!("invalid endpoint: {}", e))
        })?;
        let timeout = Duration::from_millis(config.timeout_ms.max(1));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("ccjk-sync")
            .build()
            .map_err(|e| AdapterError::from_reqwest(PROVIDER, e))?;

        Ok(Self {
            config,
            endpoint,
            client,
            timeout,
            session: AdapterSession::new(PROVIDER),
        })
    }

    /// Absolute URL for a key (or collection path)
    fn url_for(&self, key: &str, collection: bool) -> String {
        let encoded: Vec<String> = key
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| urlencoding::encode(s).into_owned())
            .collect();
        let mut url = format!("{}{}", self.endpoint, encoded.join("/"));
        if collection && !encoded.is_empty() {
            url.push('/');
        }
        url
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        self.client
            .request(method, url)
            .basic_auth(&self.config.username, Some(&self.config.password))
    }

    fn propfind(&self, url: String, depth: &str) -> RequestBuilder {
        let method = Method::from_bytes(b"PROPFIND").unwrap_or(Method::GET);
        self.request(method, url)
            .header("Depth", depth)
            .header("Content-Type", "application/xml; charset=utf-8")
            .body(PROPFIND_BODY)
    }

    fn classify(status: StatusCode, context: &str) -> AdapterError {
        let code = match status.as_u16() {
            401 => AdapterErrorCode::AuthenticationFailed,
            403 => AdapterErrorCode::PermissionDenied,
            404 => AdapterErrorCode::NotFound,
            429 => AdapterErrorCode::RateLimited,
            507 => AdapterErrorCode::QuotaExceeded,
            _ => AdapterErrorCode::UnknownError,
        };
        AdapterError::new(PROVIDER, code, format!("{} failed: {}", context, status))
    }

    async fn send(&self, request: RequestBuilder, context: &str) -> AdapterResult<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| AdapterError::from_reqwest(PROVIDER, e))?;
        let status = response.status();
        if status.is_success() || status.as_u16() == 207 {
            Ok(response)
        } else {
            Err(Self::classify(status, context))
        }
    }

    /// Key relative to the endpoint for an href from a multistatus body
    fn key_from_href(&self, href: &str) -> Option<String> {
        let path = match reqwest::Url::parse(href) {
            Ok(url) => url.path().to_string(),
            Err(_) => href.to_string(),
        };
        let decoded = urlencoding::decode(&path).ok()?.into_owned();
        let base = urlencoding::decode(self.endpoint.path()).ok()?.into_owned();
        let relative = decoded.strip_prefix(base.trim_end_matches('/'))?;
        Some(normalize_key(relative))
    }

    /// Create every missing collection above `key`
    async fn ensure_parents(&self, key: &str) -> AdapterResult<()> {
        let segments: Vec<&str> = key.split('/').collect();
        let mut path = String::new();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(segment);
            let response = self
                .request(
                    Method::from_bytes(b"MKCOL").unwrap_or(Method::PUT),
                    self.url_for(&path, true),
                )
                .send()
                .await
                .map_err(|e| AdapterError::from_reqwest(PROVIDER, e))?;
            // 405: already exists
            match response.status().as_u16() {
                200..=299 | 405 => {}
                _ => return Err(Self::classify(response.status(), "MKCOL")),
            }
        }
        Ok(())
    }

    async fn do_upload(&self, key: &str, data: &[u8]) -> AdapterResult<UploadResult> {
        self.session.ensure_connected()?;
        let key = checked_key(PROVIDER, key)?;
        let checksum = sha256_hex(data);

        self.ensure_parents(&key).await?;
        self.send(
            self.request(Method::PUT, self.url_for(&key, false))
                .body(data.to_vec()),
            "PUT",
        )
        .await?;
        self.send(
            self.request(
                Method::PUT,
                self.url_for(&format!("{}{}", key, CHECKSUM_SUFFIX), false),
            )
            .body(checksum.clone()),
            "PUT checksum",
        )
        .await?;

        let uploaded_at = Utc::now();
        self.session.cache_upsert(RemoteItem {
            key: key.clone(),
            name: key_name(&key),
            size: data.len() as u64,
            is_directory: false,
            last_modified: Some(uploaded_at),
            checksum: Some(checksum.clone()),
            etag: None,
        });
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
        let response = self
            .send(self.request(Method::GET, self.url_for(&key, false)), "GET")
            .await?;
        let last_modified = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let data = response
            .bytes()
            .await
            .map_err(|e| AdapterError::from_reqwest(PROVIDER, e))?
            .to_vec();

        let sidecar = self
            .request(
                Method::GET,
                self.url_for(&format!("{}{}", key, CHECKSUM_SUFFIX), false),
            )
            .send()
            .await
            .ok()
            .filter(|r| r.status().is_success());
        let checksum = match sidecar {
            Some(response) => response
                .text()
                .await
                .ok()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| sha256_hex(&data)),
            None => sha256_hex(&data),
        };

        Ok(DownloadResult {
            success: true,
            size: data.len() as u64,
            data,
            checksum,
            last_modified,
        })
    }

    async fn do_list(&self, prefix: &str) -> AdapterResult<Vec<RemoteItem>> {
        self.session.ensure_connected()?;
        let prefix = normalize_key(prefix);

        // Depth: infinity is often disabled, so walk one level at a time
        let mut pending: VecDeque<String> = VecDeque::from([String::new()]);
        let mut items = Vec::new();
        while let Some(collection) = pending.pop_front() {
            let body = self
                .send(self.propfind(self.url_for(&collection, true), "1"), "PROPFIND")
                .await?
                .text()
                .await
                .map_err(|e| AdapterError::from_reqwest(PROVIDER, e))?;
            let entries = parse_multistatus(&body).map_err(|e| {
                AdapterError::new(PROVIDER, AdapterErrorCode::UnknownError, "malformed PROPFIND response")
                    .with_cause(e)
            })?;

            for entry in entries {
                let Some(key) = self.key_from_href(&entry.href) else {
                    continue;
                };
                if key.is_empty() || key == collection || key.ends_with(CHECKSUM_SUFFIX) {
                    continue;
                }
                if entry.is_collection {
                    // Only descend where the prefix can still match
                    if prefix.starts_with(&key) || key.starts_with(&prefix) {
                        pending.push_back(key.clone());
                    }
                }
                if !key.starts_with(&prefix) {
                    continue;
                }
                items.push(RemoteItem {
                    name: key_name(&key),
                    size: entry.content_length.unwrap_or(0),
                    is_directory: entry.is_collection,
                    last_modified: entry.last_modified,
                    checksum: None,
                    etag: entry.etag,
                    key,
                });
            }
        }

        items.sort_by(|a, b| a.key.cmp(&b.key));
        self.session.cache_listing(&prefix, &items);
        Ok(items)
    }

    async fn do_delete(&self, key: &str) -> AdapterResult<bool> {
        self.session.ensure_connected()?;
        let key = checked_key(PROVIDER, key)?;
        self.send(
            self.request(Method::DELETE, self.url_for(&key, false)),
            "DELETE",
        )
        .await?;
        let _ = self
            .request(
                Method::DELETE,
                self.url_for(&format!("{}{}", key, CHECKSUM_SUFFIX), false),
            )
            .send()
            .await;
        self.session.cache_remove(&key);
        Ok(true)
    }
}

#[async_trait]
impl CloudAdapter for WebDavAdapter {
    fn provider(&self) -> Provider {
        PROVIDER
    }

    async fn connect(&self) -> AdapterResult<()> {
        with_timeout(PROVIDER, self.timeout, async {
            self.send(self.propfind(self.endpoint.to_string(), "0"), "PROPFIND")
                .await
                .map_err(|e| match e.code {
                    AdapterErrorCode::NetworkError | AdapterErrorCode::UnknownError => {
                        AdapterError::new(
                            PROVIDER,
                            AdapterErrorCode::ConnectionFailed,
                            "WebDAV endpoint unreachable",
                        )
                        .with_cause(e)
                    }
                    _ => e,
                })?;
            Ok::<(), AdapterError>(())
        })
        .await?;
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
}
