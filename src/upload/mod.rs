//! Upload module
//!
//! Protocol adapters for transferring a [`ByteSource`] to a remote endpoint,
//! plus the dispatcher that picks one of them per upload.

use crate::metrics;
use crate::source::ByteSource;
use chrono::{DateTime, Utc};
use control::UploadControl;
use hooks::UploadStart;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

pub mod chunked;
pub mod codec;
pub mod control;
pub mod dispatcher;
pub mod hooks;
pub mod multipart;
pub mod retry;
pub mod tus;

pub use chunked::{ChunkedConfig, ChunkedUploader};
pub use dispatcher::UploadDispatcher;
pub use hooks::{UploadHooks, UploadProgress};
pub use multipart::{MultipartConfig, MultipartUploader};
pub use retry::RetryPolicy;
pub use tus::{TusConfig, TusUploader};

/// Default upload timeout (5 minutes)
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Upload errors
#[derive(Error, Debug, Clone)]
pub enum UploadError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("{context} failed with status {status}")]
    Http { context: String, status: u16 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Upload session expired: {0}")]
    SessionExpired(String),

    #[error("Upload incomplete: server has {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },

    #[error("Upload aborted")]
    Aborted,

    #[error("Upload timed out after {0:?}")]
    Timeout(Duration),

    #[error("Byte source error: {0}")]
    Source(String),
}

impl UploadError {
    /// Whether the retry policy may attempt the operation again
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::Network(_) | UploadError::Http { .. })
    }

    /// Abort or timeout, as opposed to a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, UploadError::Aborted | UploadError::Timeout(_))
    }

    pub(crate) fn http(context: impl Into<String>, status: reqwest::StatusCode) -> Self {
        UploadError::Http {
            context: context.into(),
            status: status.as_u16(),
        }
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(e: reqwest::Error) -> Self {
        UploadError::Network(e.to_string())
    }
}

impl From<std::io::Error> for UploadError {
    fn from(e: std::io::Error) -> Self {
        UploadError::Source(e.to_string())
    }
}

/// Wire protocol used for a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMethod {
    /// Custom chunked-REST protocol
    #[serde(alias = "rest")]
    Chunked,
    /// TUS 1.0 resumable protocol
    Tus,
    /// Single-shot multipart form upload
    Multipart,
}

impl UploadMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadMethod::Chunked => "chunked",
            UploadMethod::Tus => "tus",
            UploadMethod::Multipart => "multipart",
        }
    }
}

impl fmt::Display for UploadMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadMethod {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chunked" | "rest" => Ok(UploadMethod::Chunked),
            "tus" => Ok(UploadMethod::Tus),
            "multipart" => Ok(UploadMethod::Multipart),
            other => Err(UploadError::Config(format!(
                "Unknown upload method '{}': must be 'chunked', 'tus' or 'multipart'",
                other
            ))),
        }
    }
}

/// Terminal status of an uploaded file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Completed,
}

/// Result descriptor shared by every adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub id: String,
    pub name: String,
    pub original_name: String,
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub bytes_written: u64,
    pub status: FileStatus,
    pub url: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// File descriptor as returned by a server; every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RemoteFileMeta {
    pub id: Option<String>,
    pub name: Option<String>,
    pub original_name: Option<String>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub size: Option<u64>,
    pub bytes_written: Option<u64>,
    pub url: Option<String>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    pub created_at: Option<String>,
}

impl RemoteFileMeta {
    /// Parse a response body, falling back to an empty descriptor for
    /// anything that is not a JSON object.
    pub fn parse_lenient(body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_default()
    }

    /// Complete the descriptor with local knowledge of the source.
    ///
    /// Server-reported values win; `size` falls back to the source size and
    /// `bytes_written` to the server size.
    pub fn into_file_meta(
        self,
        source: &dyn ByteSource,
        fallback_id: &str,
        fallback_url: Option<String>,
    ) -> FileMeta {
        let size = self.size.unwrap_or_else(|| source.size());
        let created_at = self
            .created_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        FileMeta {
            id: self.id.unwrap_or_else(|| fallback_id.to_string()),
            name: self.name.unwrap_or_else(|| source.name().to_string()),
            original_name: self
                .original_name
                .unwrap_or_else(|| source.name().to_string()),
            filename: self.filename.unwrap_or_else(|| source.name().to_string()),
            content_type: self
                .content_type
                .unwrap_or_else(|| source.content_type().to_string()),
            size,
            bytes_written: self.bytes_written.unwrap_or(size),
            status: FileStatus::Completed,
            url: self.url.or(fallback_url),
            metadata: self.metadata.unwrap_or_default(),
            created_at,
        }
    }
}

/// Uniform upload contract implemented by every protocol adapter
#[async_trait::async_trait]
pub trait Uploader: Send + Sync {
    /// Protocol spoken by this adapter
    fn method(&self) -> UploadMethod;

    /// Transfer the whole source and return the server's file descriptor
    async fn upload(&self, source: Arc<dyn ByteSource>) -> Result<FileMeta, UploadError>;

    /// Suspend the active transfer before its next request
    fn pause(&self);

    /// Continue a paused transfer
    fn resume(&self);

    /// Cancel the active transfer; in-flight requests are dropped
    fn abort(&self);

    /// Abort anything in flight and forget all upload state
    fn reset(&self);
}

/// Build an HTTP client that attaches `headers` to every request
pub(crate) fn build_client(headers: &BTreeMap<String, String>) -> Result<reqwest::Client, UploadError> {
    let mut default_headers = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| UploadError::Config(format!("Invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| UploadError::Config(format!("Invalid value for header '{}': {}", name, e)))?;
        default_headers.insert(name, value);
    }

    reqwest::Client::builder()
        .default_headers(default_headers)
        .build()
        .map_err(|e| UploadError::Config(e.to_string()))
}

/// Validate an endpoint URL
pub(crate) fn check_endpoint(endpoint: &str) -> Result<(), UploadError> {
    reqwest::Url::parse(endpoint)
        .map(|_| ())
        .map_err(|e| UploadError::Config(format!("Invalid endpoint '{}': {}", endpoint, e)))
}

/// Drive one `upload()` call: start hook, timeout, metrics, terminal hook.
pub(crate) async fn supervise<F>(
    method: UploadMethod,
    hooks: &UploadHooks,
    timeout: Duration,
    control: &UploadControl,
    source: &dyn ByteSource,
    transfer: F,
) -> Result<FileMeta, UploadError>
where
    F: Future<Output = Result<FileMeta, UploadError>>,
{
    hooks.start(&UploadStart {
        method,
        name: source.name().to_string(),
        size: source.size(),
    });

    let started = Instant::now();
    let result = control::with_timeout(timeout, control, transfer).await;
    let elapsed = started.elapsed();
    metrics::record_upload_duration(method.as_str(), elapsed.as_secs_f64());

    match &result {
        Ok(meta) => {
            metrics::record_upload_success(method.as_str(), meta.bytes_written);
            tracing::info!(
                method = %method,
                file_id = %meta.id,
                bytes_written = meta.bytes_written,
                duration_ms = elapsed.as_millis() as u64,
                "Upload completed"
            );
        }
        Err(e) if e.is_cancellation() => {
            metrics::record_upload_failure(method.as_str(), true);
            tracing::warn!(method = %method, error = %e, "Upload cancelled");
        }
        Err(e) => {
            metrics::record_upload_failure(method.as_str(), false);
            tracing::error!(
                method = %method,
                error = %e,
                duration_ms = elapsed.as_millis() as u64,
                "Upload failed"
            );
        }
    }

    hooks.finish(&result);
    result
}
