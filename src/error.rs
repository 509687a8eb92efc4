//! Error types for ccjk-sync

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Provider;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Result type alias for adapter operations
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Main error type for ccjk-sync
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("sync already in progress")]
    InProgress,

    #[error("Sync engine is not configured with a provider")]
    NotConfigured,

    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Adapter(e) => !e.code.is_terminal(),
            SyncError::InProgress | SyncError::Io(_) => true,
            _ => false,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Adapter(e) => e.code.as_str(),
            SyncError::InProgress => "SYNC_IN_PROGRESS",
            SyncError::NotConfigured => "NOT_CONFIGURED",
            SyncError::ConflictNotFound(_) => "CONFLICT_NOT_FOUND",
            SyncError::InvalidInput(_) => "VALIDATION_ERROR",
            SyncError::Config(_) => "INVALID_CONFIG",
            SyncError::Storage(_) => "STORAGE_ERROR",
            SyncError::Serialization(_) => "SERIALIZATION_ERROR",
            SyncError::Io(_) => "IO_ERROR",
            SyncError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Failure classes every cloud adapter reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdapterErrorCode {
    ConnectionFailed,
    AuthenticationFailed,
    NotFound,
    PermissionDenied,
    RateLimited,
    QuotaExceeded,
    NetworkError,
    Timeout,
    InvalidConfig,
    UnknownError,
    /// Operation attempted on a disconnected adapter
    NotConnected,
}

impl AdapterErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            AdapterErrorCode::AuthenticationFailed => "AUTHENTICATION_FAILED",
            AdapterErrorCode::NotFound => "NOT_FOUND",
            AdapterErrorCode::PermissionDenied => "PERMISSION_DENIED",
            AdapterErrorCode::RateLimited => "RATE_LIMITED",
            AdapterErrorCode::QuotaExceeded => "QUOTA_EXCEEDED",
            AdapterErrorCode::NetworkError => "NETWORK_ERROR",
            AdapterErrorCode::Timeout => "TIMEOUT",
            AdapterErrorCode::InvalidConfig => "INVALID_CONFIG",
            AdapterErrorCode::UnknownError => "UNKNOWN_ERROR",
            AdapterErrorCode::NotConnected => "NOT_CONNECTED",
        }
    }

    /// Codes the engine never retries. Not-found is terminal only for deletes,
    /// which the retry loop handles separately.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AdapterErrorCode::AuthenticationFailed
                | AdapterErrorCode::InvalidConfig
                | AdapterErrorCode::NotConnected
        )
    }
}

impl std::fmt::Display for AdapterErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error raised by a cloud adapter
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{provider} adapter error [{code}]: {message}")]
#[serde(rename_all = "camelCase")]
pub struct AdapterError {
    pub message: String,
    pub code: AdapterErrorCode,
    pub provider: Provider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    /// When a rate limit window resets, if the backend told us
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
}

impl AdapterError {
    pub fn new(provider: Provider, code: AdapterErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            provider,
            cause: None,
            retry_after: None,
        }
    }

    pub fn with_cause(mut self, cause: impl std::fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    pub fn with_retry_after(mut self, at: DateTime<Utc>) -> Self {
        self.retry_after = Some(at);
        self
    }

    pub fn not_connected(provider: Provider) -> Self {
        Self::new(
            provider,
            AdapterErrorCode::NotConnected,
            "adapter is not connected",
        )
    }

    pub fn invalid_config(provider: Provider, message: impl Into<String>) -> Self {
        Self::new(provider, AdapterErrorCode::InvalidConfig, message)
    }

    pub fn not_found(provider: Provider, key: &str) -> Self {
        Self::new(
            provider,
            AdapterErrorCode::NotFound,
            format!("remote key not found: {}", key),
        )
    }

    pub fn timeout(provider: Provider, after: std::time::Duration) -> Self {
        Self::new(
            provider,
            AdapterErrorCode::Timeout,
            format!("operation timed out after {}ms", after.as_millis()),
        )
    }

    /// Map a reqwest transport failure
    pub fn from_reqwest(provider: Provider, err: reqwest::Error) -> Self {
        let code = if err.is_timeout() {
            AdapterErrorCode::Timeout
        } else if err.is_connect() {
            AdapterErrorCode::ConnectionFailed
        } else if err.is_decode() {
            AdapterErrorCode::UnknownError
        } else {
            AdapterErrorCode::NetworkError
        };
        Self::new(provider, code, "HTTP request failed").with_cause(err)
    }

    /// Map a filesystem failure
    pub fn from_io(provider: Provider, err: std::io::Error) -> Self {
        let code = match err.kind() {
            std::io::ErrorKind::NotFound => AdapterErrorCode::NotFound,
            std::io::ErrorKind::PermissionDenied => AdapterErrorCode::PermissionDenied,
            std::io::ErrorKind::TimedOut => AdapterErrorCode::Timeout,
            _ => AdapterErrorCode::UnknownError,
        };
        Self::new(provider, code, "filesystem operation failed").with_cause(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_codes() {
        assert!(AdapterErrorCode::AuthenticationFailed.is_terminal());
        assert!(AdapterErrorCode::InvalidConfig.is_terminal());
        assert!(AdapterErrorCode::NotConnected.is_terminal());
        assert!(!AdapterErrorCode::Timeout.is_terminal());
        assert!(!AdapterErrorCode::RateLimited.is_terminal());
        assert!(!AdapterErrorCode::NotFound.is_terminal());
    }

    #[test]
    fn test_adapter_error_serializes_code_as_wire_string() {
        let err = AdapterError::new(
            Provider::GithubGist,
            AdapterErrorCode::AuthenticationFailed,
            "bad token",
        );
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "AUTHENTICATION_FAILED");
        assert_eq!(json["provider"], "github-gist");
        assert!(json.get("cause").is_none());
    }

    #[test]
    fn test_sync_error_retryable() {
        let timeout = SyncError::from(AdapterError::timeout(
            Provider::Local,
            std::time::Duration::from_secs(1),
        ));
        assert!(timeout.is_retryable());
        assert_eq!(timeout.code(), "TIMEOUT");

        let auth = SyncError::from(AdapterError::new(
            Provider::S3,
            AdapterErrorCode::AuthenticationFailed,
            "denied",
        ));
        assert!(!auth.is_retryable());
    }
}
