//! TUS 1.0 upload adapter
//!
//! Implements the core and creation extensions of the TUS resumable upload
//! protocol. Chunks are sent strictly one after another because every
//! `PATCH` must carry the offset confirmed by the previous response.
//!
//! Status handling for `PATCH`:
//!
//! | Status | Meaning | Action |
//! |--------|---------|--------|
//! | 204 | chunk stored | continue from the returned `Upload-Offset` |
//! | 409 | offset mismatch | re-read the offset with `HEAD`, continue (no retry consumed; backs off while the offset is stuck) |
//! | 404 / 410 | upload expired | fail |
//! | 415 | content type rejected | fail |
//! | other | transient | linear backoff, re-read offset, retry |

use super::codec::{
    decode_upload_metadata, encode_upload_metadata, header_str, header_u64, resolve_location,
    upload_id_from_location,
};
use super::control::UploadControl;
use super::retry::RetryPolicy;
use super::{
    build_client, check_endpoint, supervise, FileMeta, FileStatus, UploadError, UploadHooks,
    UploadMethod, UploadProgress, Uploader, DEFAULT_UPLOAD_TIMEOUT,
};
use crate::metrics;
use crate::source::ByteSource;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::StatusCode;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Protocol version sent in `Tus-Resumable`
pub const TUS_VERSION: &str = "1.0.0";

/// Default chunk size (1MB)
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

const HEADER_TUS_RESUMABLE: &str = "Tus-Resumable";
const HEADER_UPLOAD_LENGTH: &str = "Upload-Length";
const HEADER_UPLOAD_OFFSET: &str = "Upload-Offset";
const HEADER_UPLOAD_METADATA: &str = "Upload-Metadata";
const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

/// Consecutive 409s that leave the server offset unchanged before giving up
pub const MAX_STALE_CONFLICTS: u32 = 10;

/// TUS adapter configuration
#[derive(Debug, Clone)]
pub struct TusConfig {
    /// Creation endpoint
    pub endpoint: String,
    /// Bytes per `PATCH`
    pub chunk_size: u64,
    /// Retry policy for chunk requests (linear backoff)
    pub retry: RetryPolicy,
    /// Extra `Upload-Metadata` entries; `filename` and `filetype` are always sent
    pub metadata: BTreeMap<String, String>,
    /// Extra headers attached to every request
    pub headers: BTreeMap<String, String>,
    /// Deadline for a whole `upload()` call
    pub timeout: Duration,
}

impl TusConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryPolicy::default(),
            metadata: BTreeMap::new(),
            headers: BTreeMap::new(),
            timeout: DEFAULT_UPLOAD_TIMEOUT,
        }
    }
}

/// Mutable part of a TUS upload
#[derive(Debug, Default)]
struct TusState {
    upload_url: Option<String>,
    offset: u64,
    retry_count: u32,
    stale_conflicts: u32,
}

#[derive(Debug)]
struct TusSession {
    control: UploadControl,
    total_size: u64,
    state: Mutex<TusState>,
}

impl TusSession {
    fn new(total_size: u64) -> Self {
        Self {
            control: UploadControl::new(),
            total_size,
            state: Mutex::new(TusState::default()),
        }
    }

    fn offset(&self) -> u64 {
        self.state.lock().offset
    }

    fn set_offset(&self, offset: u64) {
        self.state.lock().offset = offset;
    }
}

/// Outcome of one `PATCH`
enum PatchOutcome {
    Stored(u64),
    Conflict,
    Retry(UploadError),
}

/// TUS uploader
pub struct TusUploader {
    config: TusConfig,
    client: reqwest::Client,
    hooks: UploadHooks,
    session: Mutex<Option<Arc<TusSession>>>,
}

impl TusUploader {
    /// Create a new TUS uploader
    pub fn new(config: TusConfig) -> Result<Self, UploadError> {
        check_endpoint(&config.endpoint)?;
        if config.chunk_size == 0 {
            return Err(UploadError::Config("chunk_size must be greater than 0".into()));
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

    pub fn config(&self) -> &TusConfig {
        &self.config
    }

    /// Last offset confirmed by the server for the active upload
    pub fn offset(&self) -> u64 {
        self.current().map(|s| s.offset()).unwrap_or(0)
    }

    /// URL of the active upload resource, once created
    pub fn upload_url(&self) -> Option<String> {
        let session = self.current()?;
        let url = session.state.lock().upload_url.clone();
        url
    }

    fn current(&self) -> Option<Arc<TusSession>> {
        self.session.lock().clone()
    }

    fn release(&self, session: &Arc<TusSession>) {
        let mut slot = self.session.lock();
        if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
            *slot = None;
        }
    }

    fn upload_metadata(&self, source: &dyn ByteSource) -> BTreeMap<String, String> {
        let mut metadata = self.config.metadata.clone();
        metadata.insert("filename".into(), source.name().to_string());
        metadata.insert("filetype".into(), source.content_type().to_string());
        metadata
    }

    /// Create the upload resource; returns its URL and initial offset
    #[tracing::instrument(
        name = "upload.tus.create",
        skip(self, source, control),
        fields(upload.name = %source.name(), upload.size = source.size()),
        err
    )]
    async fn create_upload(
        &self,
        source: &dyn ByteSource,
        control: &UploadControl,
    ) -> Result<(String, u64), UploadError> {
        let metadata = encode_upload_metadata(&self.upload_metadata(source));
        let request = self
            .client
            .post(&self.config.endpoint)
            .header(HEADER_TUS_RESUMABLE, TUS_VERSION)
            .header(HEADER_UPLOAD_LENGTH, source.size())
            .header(HEADER_UPLOAD_METADATA, metadata);

        let response = control.guard(request.send()).await??;
        if !response.status().is_success() {
            return Err(UploadError::http("Create TUS upload", response.status()));
        }

        let location = header_str(response.headers(), LOCATION.as_str())
            .ok_or_else(|| UploadError::Protocol("TUS create response has no Location".into()))?;
        let upload_url = resolve_location(&self.config.endpoint, location)?;
        let offset = header_u64(response.headers(), HEADER_UPLOAD_OFFSET).unwrap_or(0);

        tracing::info!(upload_url = %upload_url, offset = offset, "Created TUS upload");
        Ok((upload_url, offset))
    }

    /// Read the server's offset; a missing upload counts as offset 0
    #[tracing::instrument(name = "upload.tus.offset", skip(self, control), err)]
    async fn fetch_offset(
        &self,
        upload_url: &str,
        control: &UploadControl,
    ) -> Result<u64, UploadError> {
        let request = self
            .client
            .head(upload_url)
            .header(HEADER_TUS_RESUMABLE, TUS_VERSION);
        let response = control.guard(request.send()).await??;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE | StatusCode::FORBIDDEN => {
                tracing::debug!(status = response.status().as_u16(), "No upload data on server yet");
                Ok(0)
            }
            status if status.is_success() => {
                Ok(header_u64(response.headers(), HEADER_UPLOAD_OFFSET).unwrap_or(0))
            }
            status => Err(UploadError::http("Fetch TUS offset", status)),
        }
    }

    async fn patch_chunk(
        &self,
        source: &dyn ByteSource,
        session: &TusSession,
        upload_url: &str,
        offset: u64,
    ) -> Result<PatchOutcome, UploadError> {
        let end = offset
            .saturating_add(self.config.chunk_size)
            .min(session.total_size);
        let body = source.slice(offset, end).await?;

        let request = self
            .client
            .patch(upload_url)
            .header(HEADER_TUS_RESUMABLE, TUS_VERSION)
            .header(HEADER_UPLOAD_OFFSET, offset)
            .header(CONTENT_TYPE, OFFSET_OCTET_STREAM)
            .body(body);

        let response = match session.control.guard(request.send()).await? {
            Ok(response) => response,
            Err(e) => return Ok(PatchOutcome::Retry(e.into())),
        };

        match response.status() {
            StatusCode::NO_CONTENT => {
                let new_offset = header_u64(response.headers(), HEADER_UPLOAD_OFFSET).ok_or_else(
                    || UploadError::Protocol("PATCH response has no Upload-Offset".into()),
                )?;
                Ok(PatchOutcome::Stored(new_offset))
            }
            StatusCode::CONFLICT => Ok(PatchOutcome::Conflict),
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(UploadError::SessionExpired(format!(
                "{} returned {}",
                upload_url,
                response.status().as_u16()
            ))),
            StatusCode::UNSUPPORTED_MEDIA_TYPE => Err(UploadError::Protocol(format!(
                "Server rejected Content-Type {}",
                OFFSET_OCTET_STREAM
            ))),
            status => Ok(PatchOutcome::Retry(UploadError::http(
                format!("TUS PATCH at offset {}", offset),
                status,
            ))),
        }
    }

    /// Send chunks until the server holds the whole source
    async fn upload_chunks(
        &self,
        source: &dyn ByteSource,
        session: &TusSession,
        upload_url: &str,
    ) -> Result<(), UploadError> {
        while session.offset() < session.total_size {
            session.control.wait_if_paused().await?;

            let offset = session.offset();
            match self.patch_chunk(source, session, upload_url, offset).await? {
                PatchOutcome::Stored(new_offset) => {
                    metrics::record_chunk(UploadMethod::Tus.as_str(), true);
                    if new_offset <= offset {
                        return Err(UploadError::Protocol(format!(
                            "Server offset did not advance past {}",
                            offset
                        )));
                    }
                    {
                        let mut state = session.state.lock();
                        state.offset = new_offset;
                        state.stale_conflicts = 0;
                    }
                    self.hooks
                        .progress(UploadProgress::new(new_offset, session.total_size));
                }
                PatchOutcome::Conflict => {
                    let server_offset = self.fetch_offset(upload_url, &session.control).await?;
                    tracing::info!(
                        local_offset = offset,
                        server_offset = server_offset,
                        "Offset conflict, resyncing"
                    );
                    if server_offset != offset {
                        let mut state = session.state.lock();
                        state.offset = server_offset;
                        state.stale_conflicts = 0;
                        continue;
                    }

                    // Server keeps rejecting the offset it reports itself
                    let stale = {
                        let mut state = session.state.lock();
                        state.stale_conflicts += 1;
                        state.stale_conflicts
                    };
                    if stale > MAX_STALE_CONFLICTS {
                        return Err(UploadError::Protocol(format!(
                            "Offset conflict at {} persisted after {} resyncs",
                            offset, MAX_STALE_CONFLICTS
                        )));
                    }
                    session
                        .control
                        .sleep(self.config.retry.linear_delay(stale))
                        .await?;
                }
                PatchOutcome::Retry(error) => {
                    metrics::record_chunk(UploadMethod::Tus.as_str(), false);
                    let retry_count = {
                        let mut state = session.state.lock();
                        state.retry_count += 1;
                        state.retry_count
                    };
                    if retry_count > self.config.retry.budget() {
                        return Err(error);
                    }

                    tracing::warn!(
                        error = %error,
                        retry_count = retry_count,
                        offset = offset,
                        "Chunk failed, retrying"
                    );
                    metrics::record_retry("tus.patch");
                    session
                        .control
                        .sleep(self.config.retry.linear_delay(retry_count))
                        .await?;

                    match self.fetch_offset(upload_url, &session.control).await {
                        Ok(server_offset) => session.set_offset(server_offset),
                        Err(e) if e.is_retryable() => {
                            tracing::warn!(error = %e, "Offset lookup failed, keeping local offset");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(())
    }

    /// Read final metadata and build the result
    #[tracing::instrument(name = "upload.tus.finalize", skip(self, source, session), err)]
    async fn finalize(
        &self,
        source: &dyn ByteSource,
        session: &TusSession,
        upload_url: &str,
    ) -> Result<FileMeta, UploadError> {
        let request = self
            .client
            .head(upload_url)
            .header(HEADER_TUS_RESUMABLE, TUS_VERSION);
        let response = session.control.guard(request.send()).await??;
        if !response.status().is_success() {
            return Err(UploadError::http("Fetch TUS upload info", response.status()));
        }

        let headers = response.headers();
        let metadata = header_str(headers, HEADER_UPLOAD_METADATA)
            .map(decode_upload_metadata)
            .unwrap_or_default();
        let size = header_u64(headers, HEADER_UPLOAD_LENGTH).unwrap_or(session.total_size);
        let content_type = metadata
            .get("filetype")
            .cloned()
            .or_else(|| {
                header_str(headers, CONTENT_TYPE.as_str())
                    .filter(|ct| *ct != OFFSET_OCTET_STREAM)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| source.content_type().to_string());
        let name = metadata
            .get("filename")
            .cloned()
            .unwrap_or_else(|| source.name().to_string());

        Ok(FileMeta {
            id: upload_id_from_location(upload_url).unwrap_or_else(|| upload_url.to_string()),
            name: name.clone(),
            original_name: source.name().to_string(),
            filename: name,
            content_type,
            size,
            bytes_written: session.offset(),
            status: FileStatus::Completed,
            url: Some(upload_url.to_string()),
            metadata: metadata
                .into_iter()
                .map(|(k, v)| (k, serde_json::Value::String(v)))
                .collect(),
            created_at: Utc::now(),
        })
    }

    async fn transfer(
        &self,
        source: &dyn ByteSource,
        session: &TusSession,
    ) -> Result<FileMeta, UploadError> {
        let (upload_url, initial_offset) = self.create_upload(source, &session.control).await?;
        {
            let mut state = session.state.lock();
            state.upload_url = Some(upload_url.clone());
            state.offset = initial_offset;
        }

        self.upload_chunks(source, session, &upload_url).await?;
        self.finalize(source, session, &upload_url).await
    }
}

#[async_trait]
impl Uploader for TusUploader {
    fn method(&self) -> UploadMethod {
        UploadMethod::Tus
    }

    async fn upload(&self, source: Arc<dyn ByteSource>) -> Result<FileMeta, UploadError> {
        let session = Arc::new(TusSession::new(source.size()));
        *self.session.lock() = Some(session.clone());

        let result = supervise(
            UploadMethod::Tus,
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
            tracing::info!(offset = session.offset(), "Aborting TUS upload");
            session.control.abort();
        }
    }

    fn reset(&self) {
        self.abort();
    }
}
