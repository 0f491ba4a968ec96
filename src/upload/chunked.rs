//! Chunked-REST upload adapter
//!
//! Speaks the custom chunked protocol:
//!
//! | Step | Request | Response |
//! |------|---------|----------|
//! | create | `POST {endpoint}` with `X-Chunked-Upload`, `X-Total-Size` | `X-Upload-ID` or `Location` |
//! | status | `HEAD {endpoint}/{id}` | `X-Upload-Offset`, `X-Received-Chunks` |
//! | chunk | `PATCH {endpoint}/{id}` with `X-Chunk-Offset` | `X-Upload-Offset` |
//! | fetch | `GET {endpoint}/{id}` | file descriptor JSON |
//!
//! Chunks carry their offset explicitly, so they are sent concurrently and
//! may arrive in any order. Concurrency is unbounded unless
//! [`ChunkedConfig::max_concurrent_chunks`] is set.
//!
//! # Example
//!
//! ```no_run
//! use resumable_uploadr::source::MemorySource;
//! use resumable_uploadr::upload::{ChunkedConfig, ChunkedUploader, Uploader};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let uploader = ChunkedUploader::new(ChunkedConfig::new("https://files.example.com/upload"))?;
//! let source = Arc::new(MemorySource::new("hello.txt", &b"Hello, World!"[..]));
//! let meta = uploader.upload(source).await?;
//! println!("Uploaded {} ({} bytes)", meta.id, meta.size);
//! # Ok(())
//! # }
//! ```

use super::codec::{header_str, header_u64, parse_received_chunks, upload_id_from_location};
use super::control::UploadControl;
use super::retry::{fetch_with_retry, RetryPolicy};
use super::{
    build_client, check_endpoint, supervise, FileMeta, RemoteFileMeta, UploadError, UploadHooks,
    UploadMethod, UploadProgress, Uploader, DEFAULT_UPLOAD_TIMEOUT,
};
use crate::metrics;
use crate::source::ByteSource;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use reqwest::header::{CONTENT_DISPOSITION, LOCATION};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// Default chunk size (5MB)
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

const HEADER_CHUNKED_UPLOAD: &str = "X-Chunked-Upload";
const HEADER_TOTAL_SIZE: &str = "X-Total-Size";
const HEADER_FILE_METADATA: &str = "X-File-Metadata";
const HEADER_UPLOAD_ID: &str = "X-Upload-ID";
const HEADER_UPLOAD_OFFSET: &str = "X-Upload-Offset";
const HEADER_RECEIVED_CHUNKS: &str = "X-Received-Chunks";
const HEADER_CHUNK_OFFSET: &str = "X-Chunk-Offset";

/// Chunked-REST adapter configuration
#[derive(Debug, Clone)]
pub struct ChunkedConfig {
    /// Session collection URL
    pub endpoint: String,
    /// Bytes per chunk
    pub chunk_size: u64,
    /// Retry policy applied to every request
    pub retry: RetryPolicy,
    /// Sent as JSON in `X-File-Metadata`
    pub metadata: BTreeMap<String, String>,
    /// Extra headers attached to every request
    pub headers: BTreeMap<String, String>,
    /// Deadline for a whole `upload()` call
    pub timeout: Duration,
    /// Cap on chunks in flight; `None` sends all of them at once
    pub max_concurrent_chunks: Option<usize>,
}

impl ChunkedConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryPolicy::default(),
            metadata: BTreeMap::new(),
            headers: BTreeMap::new(),
            timeout: DEFAULT_UPLOAD_TIMEOUT,
            max_concurrent_chunks: None,
        }
    }
}

/// Server-reported state of an upload session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkStatus {
    pub offset: u64,
    pub received_chunks: Vec<u64>,
}

/// State of one `upload()` call
#[derive(Debug)]
struct ChunkedSession {
    control: UploadControl,
    total_size: u64,
    chunk_size: u64,
    upload_id: Mutex<Option<String>>,
    uploaded: Mutex<BTreeSet<u64>>,
}

impl ChunkedSession {
    fn new(total_size: u64, chunk_size: u64) -> Self {
        Self {
            control: UploadControl::new(),
            total_size,
            chunk_size,
            upload_id: Mutex::new(None),
            uploaded: Mutex::new(BTreeSet::new()),
        }
    }

    fn upload_id(&self) -> Option<String> {
        self.upload_id.lock().clone()
    }

    fn chunk_end(&self, start: u64) -> u64 {
        start.saturating_add(self.chunk_size).min(self.total_size)
    }

    /// Chunk ranges the server has not acknowledged
    fn pending_ranges(&self) -> Vec<(u64, u64)> {
        let uploaded = self.uploaded.lock();
        std::iter::successors(Some(0u64), |start| start.checked_add(self.chunk_size))
            .take_while(|start| *start < self.total_size)
            .filter(|start| !uploaded.contains(start))
            .map(|start| (start, self.chunk_end(start)))
            .collect()
    }

    fn is_uploaded(&self, start: u64) -> bool {
        self.uploaded.lock().contains(&start)
    }

    fn mark_uploaded(&self, start: u64) {
        self.uploaded.lock().insert(start);
    }

    /// Only offsets on a chunk boundary inside the file are kept
    fn seed(&self, offsets: &[u64]) {
        let mut uploaded = self.uploaded.lock();
        for &offset in offsets {
            if offset < self.total_size && offset % self.chunk_size == 0 {
                uploaded.insert(offset);
            }
        }
    }

    /// Bytes covered by acknowledged chunks
    fn local_offset(&self) -> u64 {
        self.uploaded
            .lock()
            .iter()
            .map(|&start| self.chunk_end(start) - start)
            .sum()
    }
}

/// Chunked-REST uploader
pub struct ChunkedUploader {
    config: ChunkedConfig,
    client: reqwest::Client,
    hooks: UploadHooks,
    session: Mutex<Option<Arc<ChunkedSession>>>,
}

impl ChunkedUploader {
    /// Create a new chunked-REST uploader
    pub fn new(config: ChunkedConfig) -> Result<Self, UploadError> {
        check_endpoint(&config.endpoint)?;
        if config.chunk_size == 0 {
            return Err(UploadError::Config("chunk_size must be greater than 0".into()));
        }
        if config.max_concurrent_chunks == Some(0) {
            return Err(UploadError::Config(
                "max_concurrent_chunks must be greater than 0".into(),
            ));
        }

        let client = build_client(&config.headers)?;
        Ok(Self {
            config,
            client,
            hooks: UploadHooks::default(),
            session: Mutex::new(None),
        })
    }

    /// Attach observers
    pub fn with_hooks(mut self, hooks: UploadHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &ChunkedConfig {
        &self.config
    }

    /// Bytes the server holds for the active upload.
    ///
    /// Queries the server when a session exists, otherwise (or if the query
    /// fails) sums the locally acknowledged chunks.
    pub async fn get_offset(&self) -> u64 {
        let Some(session) = self.current() else {
            return 0;
        };

        if let Some(id) = session.upload_id() {
            match self.query_status(&id, &session.control).await {
                Ok(status) => return status.offset,
                Err(e) => {
                    tracing::debug!(upload_id = %id, error = %e, "Falling back to local offset");
                }
            }
        }
        session.local_offset()
    }

    fn current(&self) -> Option<Arc<ChunkedSession>> {
        self.session.lock().clone()
    }

    fn release(&self, session: &Arc<ChunkedSession>) {
        let mut slot = self.session.lock();
        if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
            *slot = None;
        }
    }

    fn session_url(&self, upload_id: &str) -> String {
        format!("{}/{}", self.config.endpoint.trim_end_matches('/'), upload_id)
    }

    /// Open an upload session and return its id
    #[tracing::instrument(
        name = "upload.chunked.create",
        skip(self, source, control),
        fields(
            upload.name = %source.name(),
            upload.size = source.size(),
            upload.id = tracing::field::Empty
        ),
        err
    )]
    async fn create_session(
        &self,
        source: &dyn ByteSource,
        control: &UploadControl,
    ) -> Result<String, UploadError> {
        let metadata = if self.config.metadata.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&self.config.metadata)
                    .map_err(|e| UploadError::Config(e.to_string()))?,
            )
        };
        let disposition = format!(
            "attachment; filename=\"{}\"",
            source.name().replace('"', "'")
        );

        let response = fetch_with_retry(
            || {
                let mut request = self
                    .client
                    .post(&self.config.endpoint)
                    .header(HEADER_CHUNKED_UPLOAD, "true")
                    .header(HEADER_TOTAL_SIZE, source.size())
                    .header(CONTENT_DISPOSITION, disposition.as_str());
                if let Some(metadata) = &metadata {
                    request = request.header(HEADER_FILE_METADATA, metadata.as_str());
                }
                request
            },
            &self.config.retry,
            control,
            "chunked.create",
        )
        .await?;

        if !response.status().is_success() {
            return Err(UploadError::http("Create upload session", response.status()));
        }

        let headers = response.headers();
        let upload_id = header_str(headers, HEADER_UPLOAD_ID)
            .map(str::to_string)
            .or_else(|| header_str(headers, LOCATION.as_str()).and_then(upload_id_from_location))
            .ok_or_else(|| {
                UploadError::Protocol("Server returned neither X-Upload-ID nor Location".into())
            })?;

        tracing::Span::current().record("upload.id", upload_id.as_str());
        tracing::info!(upload_id = %upload_id, "Created chunked upload session");
        Ok(upload_id)
    }

    /// Ask the server which bytes it already holds
    #[tracing::instrument(name = "upload.chunked.status", skip(self, control), err)]
    pub(crate) async fn query_status(
        &self,
        upload_id: &str,
        control: &UploadControl,
    ) -> Result<ChunkStatus, UploadError> {
        let url = self.session_url(upload_id);
        let response = fetch_with_retry(
            || self.client.head(&url),
            &self.config.retry,
            control,
            "chunked.status",
        )
        .await?;

        if !response.status().is_success() {
            return Err(UploadError::http("Query upload status", response.status()));
        }

        let headers = response.headers();
        Ok(ChunkStatus {
            offset: header_u64(headers, HEADER_UPLOAD_OFFSET).unwrap_or(0),
            received_chunks: header_str(headers, HEADER_RECEIVED_CHUNKS)
                .map(parse_received_chunks)
                .unwrap_or_default(),
        })
    }

    /// Send every chunk the server has not acknowledged yet
    async fn upload_chunks(
        &self,
        source: &dyn ByteSource,
        session: &ChunkedSession,
        upload_id: &str,
    ) -> Result<(), UploadError> {
        let status = self.query_status(upload_id, &session.control).await?;
        session.seed(&status.received_chunks);

        let pending = session.pending_ranges();
        if pending.is_empty() {
            tracing::debug!(upload_id = %upload_id, "Server already holds every chunk");
            return Ok(());
        }

        let limit = self
            .config
            .max_concurrent_chunks
            .unwrap_or(pending.len())
            .max(1);
        tracing::debug!(
            upload_id = %upload_id,
            chunks = pending.len(),
            concurrency = limit,
            "Dispatching chunks"
        );

        let url = self.session_url(upload_id);
        let results: Vec<Result<(), UploadError>> = stream::iter(pending)
            .map(|(start, end)| self.send_chunk(source, session, &url, start, end))
            .buffer_unordered(limit)
            .collect()
            .await;

        session.control.check()?;
        results.into_iter().collect()
    }

    async fn send_chunk(
        &self,
        source: &dyn ByteSource,
        session: &ChunkedSession,
        url: &str,
        start: u64,
        end: u64,
    ) -> Result<(), UploadError> {
        session.control.wait_if_paused().await?;
        if session.is_uploaded(start) {
            return Ok(());
        }

        let body = source.slice(start, end).await?;
        let response = fetch_with_retry(
            || {
                self.client
                    .patch(url)
                    .header(HEADER_CHUNK_OFFSET, start)
                    .body(body.clone())
            },
            &self.config.retry,
            &session.control,
            "chunked.patch",
        )
        .await?;

        if !response.status().is_success() {
            metrics::record_chunk(UploadMethod::Chunked.as_str(), false);
            return Err(UploadError::http(
                format!("Upload chunk at offset {}", start),
                response.status(),
            ));
        }

        session.mark_uploaded(start);
        metrics::record_chunk(UploadMethod::Chunked.as_str(), true);

        let current = header_u64(response.headers(), HEADER_UPLOAD_OFFSET).unwrap_or(end);
        tracing::debug!(offset = start, bytes = end - start, server_offset = current, "Chunk acknowledged");
        self.hooks
            .progress(UploadProgress::new(current, session.total_size));
        Ok(())
    }

    /// Verify the server holds everything, then fetch its file descriptor
    #[tracing::instrument(name = "upload.chunked.finalize", skip(self, source, session), err)]
    async fn finalize(
        &self,
        source: &dyn ByteSource,
        session: &ChunkedSession,
        upload_id: &str,
    ) -> Result<FileMeta, UploadError> {
        let status = self.query_status(upload_id, &session.control).await?;
        if status.offset < session.total_size {
            return Err(UploadError::Incomplete {
                received: status.offset,
                expected: session.total_size,
            });
        }

        let url = self.session_url(upload_id);
        let response = fetch_with_retry(
            || self.client.get(&url),
            &self.config.retry,
            &session.control,
            "chunked.fetch",
        )
        .await?;

        if !response.status().is_success() {
            return Err(UploadError::http("Fetch uploaded file", response.status()));
        }

        let body = session.control.guard(response.bytes()).await??;
        Ok(RemoteFileMeta::parse_lenient(&body).into_file_meta(source, upload_id, Some(url)))
    }

    async fn transfer(
        &self,
        source: &dyn ByteSource,
        session: &ChunkedSession,
    ) -> Result<FileMeta, UploadError> {
        let upload_id = self.create_session(source, &session.control).await?;
        *session.upload_id.lock() = Some(upload_id.clone());

        self.upload_chunks(source, session, &upload_id).await?;
        self.finalize(source, session, &upload_id).await
    }
}

#[async_trait]
impl Uploader for ChunkedUploader {
    fn method(&self) -> UploadMethod {
        UploadMethod::Chunked
    }

    async fn upload(&self, source: Arc<dyn ByteSource>) -> Result<FileMeta, UploadError> {
        let session = Arc::new(ChunkedSession::new(source.size(), self.config.chunk_size));
        *self.session.lock() = Some(session.clone());

        let result = supervise(
            UploadMethod::Chunked,
            &self.hooks,
            self.config.timeout,
            &session.control,
            source.as_ref(),
            self.transfer(source.as_ref(), &session),
        )
        .await;

        self.release(&session);
        result
    }

    fn pause(&self) {
        if let Some(session) = self.current() {
            session.control.pause();
        }
    }

    fn resume(&self) {
        if let Some(session) = self.current() {
            session.control.resume();
        }
    }

    fn abort(&self) {
        if let Some(session) = self.session.lock().take() {
            tracing::info!(upload_id = ?session.upload_id(), "Aborting chunked upload");
            session.control.abort();
        }
    }

    fn reset(&self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_ranges() {
        let session = ChunkedSession::new(12, 5);
        assert_eq!(session.pending_ranges(), vec![(0, 5), (5, 10), (10, 12)]);

        session.seed(&[5, 7, 100]);
        assert_eq!(session.pending_ranges(), vec![(0, 5), (10, 12)]);
        assert_eq!(session.local_offset(), 5);

        session.mark_uploaded(10);
        assert_eq!(session.local_offset(), 7);
    }

    #[test]
    fn test_empty_source_has_no_chunks() {
        let session = ChunkedSession::new(0, 5);
        assert!(session.pending_ranges().is_empty());
    }

    #[test]
    fn test_oversized_chunk_is_one_range() {
        let session = ChunkedSession::new(10, u64::MAX);
        assert_eq!(session.pending_ranges(), vec![(0, 10)]);
        assert_eq!(session.chunk_end(5), 10);

        let session = ChunkedSession::new(u64::MAX, u64::MAX / 2 + 1);
        assert_eq!(
            session.pending_ranges(),
            vec![(0, u64::MAX / 2 + 1), (u64::MAX / 2 + 1, u64::MAX)]
        );
    }

    #[test]
    fn test_config_validation() {
        assert!(ChunkedUploader::new(ChunkedConfig::new("not a url")).is_err());

        let mut config = ChunkedConfig::new("http://localhost/upload");
        config.chunk_size = 0;
        assert!(ChunkedUploader::new(config).is_err());

        let mut config = ChunkedConfig::new("http://localhost/upload");
        config.max_concurrent_chunks = Some(0);
        assert!(ChunkedUploader::new(config).is_err());
    }

    #[test]
    fn test_session_url() {
        let uploader = ChunkedUploader::new(ChunkedConfig::new("http://localhost/upload/")).unwrap();
        assert_eq!(uploader.session_url("abc"), "http://localhost/upload/abc");
    }

    #[tokio::test]
    async fn test_offset_without_session() {
        let uploader = ChunkedUploader::new(ChunkedConfig::new("http://localhost/upload")).unwrap();
        assert_eq!(uploader.get_offset().await, 0);
    }
}
