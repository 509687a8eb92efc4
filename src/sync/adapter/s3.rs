//! S3-compatible backend (AWS, R2, MinIO)

use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use tokio::sync::OnceCell;

use super::{checked_key, key_name, normalize_key, prime_session, with_timeout};
use super::{AdapterSession, CloudAdapter};
use crate::config::S3Config;
use crate::error::{AdapterError, AdapterErrorCode, AdapterResult};
use crate::types::{sha256_hex, DownloadResult, Provider, RemoteItem, UploadResult};

const PROVIDER: Provider = Provider::S3;
const CHECKSUM_META: &str = "sha256";
const DEFAULT_REGION: &str = "us-east-1";

/// Map an SDK failure onto the adapter error codes
fn map_sdk_error<E, R>(err: SdkError<E, R>, context: &str) -> AdapterError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let code = match &err {
        SdkError::TimeoutError(_) => AdapterErrorCode::Timeout,
        SdkError::DispatchFailure(failure) if failure.is_timeout() => AdapterErrorCode::Timeout,
        SdkError::DispatchFailure(_) => AdapterErrorCode::ConnectionFailed,
        SdkError::ConstructionFailure(_) => AdapterErrorCode::InvalidConfig,
        _ => match err.code() {
            Some(
                "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken" | "InvalidToken",
            ) => AdapterErrorCode::AuthenticationFailed,
            Some("AccessDenied") => AdapterErrorCode::PermissionDenied,
            Some("NoSuchBucket") => AdapterErrorCode::InvalidConfig,
            Some("NoSuchKey" | "NotFound") => AdapterErrorCode::NotFound,
            Some("SlowDown" | "TooManyRequests") => AdapterErrorCode::RateLimited,
            Some("QuotaExceeded" | "EntityTooLarge") => AdapterErrorCode::QuotaExceeded,
            _ => AdapterErrorCode::UnknownError,
        },
    };
    AdapterError::new(PROVIDER, code, format!("{} failed", context))
        .with_cause(DisplayErrorContext(&err))
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

/// Adapter over an S3 bucket
pub struct S3Adapter {
    config: S3Config,
    prefix: String,
    timeout: Duration,
    client: OnceCell<S3Client>,
    session: AdapterSession,
}

impl S3Adapter {
    pub fn new(config: S3Config) -> Self {
        let prefix = config
            .prefix
            .as_deref()
            .map(normalize_key)
            .unwrap_or_default();
        Self {
            timeout: Duration::from_millis(config.timeout_ms.max(1)),
            config,
            prefix,
            client: OnceCell::new(),
            session: AdapterSession::new(PROVIDER),
        }
    }

    async fn client(&self) -> &S3Client {
        self.client
            .get_or_init(|| async {
                let credentials = Credentials::new(
                    &self.config.token,
                    &self.config.secret_key,
                    None,
                    None,
                    "ccjk-sync",
                );
                let region = self
                    .config
                    .region
                    .clone()
                    .unwrap_or_else(|| DEFAULT_REGION.to_string());
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(region))
                    .credentials_provider(credentials)
                    .load()
                    .await;

                let mut builder = aws_sdk_s3::config::Builder::from(&shared);
                if let Some(endpoint) = &self.config.endpoint {
                    builder = builder.endpoint_url(endpoint).force_path_style(true);
                }
                S3Client::from_conf(builder.build())
            })
            .await
    }

    fn object_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    fn key_from_object(&self, object_key: &str) -> Option<String> {
        if self.prefix.is_empty() {
            return Some(normalize_key(object_key));
        }
        object_key
            .strip_prefix(&self.prefix)
            .filter(|rest| rest.starts_with('/'))
            .map(normalize_key)
    }

    async fn do_upload(&self, key: &str, data: &[u8]) -> AdapterResult<UploadResult> {
        self.session.ensure_connected()?;
        let key = checked_key(PROVIDER, key)?;
        let checksum = sha256_hex(data);

        self.client()
            .await
            .put_object()
            .bucket(&self.config.bucket)
            .key(self.object_key(&key))
            .metadata(CHECKSUM_META, &checksum)
            .content_type("application/octet-stream")
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, "put_object"))?;

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

        tracing::info!(
            "Uploaded {} bytes to s3://{}/{}",
            data.len(),
            self.config.bucket,
            self.object_key(&key)
        );
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
            .client()
            .await
            .get_object()
            .bucket(&self.config.bucket)
            .key(self.object_key(&key))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, "get_object"))?;

        let stored_checksum = response
            .metadata()
            .and_then(|m| m.get(CHECKSUM_META))
            .cloned();
        let last_modified = response.last_modified().and_then(to_chrono);
        let data = response
            .body
            .collect()
            .await
            .map_err(|e| {
                AdapterError::new(PROVIDER, AdapterErrorCode::NetworkError, "read object body")
                    .with_cause(e)
            })?
            .into_bytes()
            .to_vec();

        Ok(DownloadResult {
            success: true,
            size: data.len() as u64,
            checksum: stored_checksum.unwrap_or_else(|| sha256_hex(&data)),
            data,
            last_modified,
        })
    }

    async fn do_list(&self, prefix: &str) -> AdapterResult<Vec<RemoteItem>> {
        self.session.ensure_connected()?;
        let prefix = normalize_key(prefix);
        let client = self.client().await;

        let mut items = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut request = client
                .list_objects_v2()
                .bucket(&self.config.bucket)
                .prefix(self.object_key(&prefix));
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| map_sdk_error(e, "list_objects_v2"))?;

            for object in response.contents() {
                let Some(key) = object.key().and_then(|k| self.key_from_object(k)) else {
                    continue;
                };
                if key.is_empty() || !key.starts_with(&prefix) {
                    continue;
                }
                items.push(RemoteItem {
                    name: key_name(&key),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    is_directory: key.ends_with('/'),
                    last_modified: object.last_modified().and_then(to_chrono),
                    checksum: None,
                    etag: object.e_tag().map(String::from),
                    key,
                });
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        self.session.cache_listing(&prefix, &items);
        Ok(items)
    }

    async fn do_delete(&self, key: &str) -> AdapterResult<bool> {
        self.session.ensure_connected()?;
        let key = checked_key(PROVIDER, key)?;
        let client = self.client().await;
        let object_key = self.object_key(&key);

        // DeleteObject succeeds on missing keys; check with HEAD first so absence is reported
        match client
            .head_object()
            .bucket(&self.config.bucket)
            .key(&object_key)
            .send()
            .await
        {
            Ok(_) => {}
            Err(SdkError::ServiceError(e)) if e.err().is_not_found() => {
                return Err(AdapterError::not_found(PROVIDER, &key));
            }
            Err(e) => return Err(map_sdk_error(e, "head_object")),
        }

        client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, "delete_object"))?;
        self.session.cache_remove(&key);
        Ok(true)
    }
}

#[async_trait]
impl CloudAdapter for S3Adapter {
    fn provider(&self) -> Provider {
        PROVIDER
    }

    async fn connect(&self) -> AdapterResult<()> {
        with_timeout(PROVIDER, self.timeout, async {
            self.client()
                .await
                .head_bucket()
                .bucket(&self.config.bucket)
                .send()
                .await
                .map_err(|e| map_sdk_error(e, "head_bucket"))?;
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
