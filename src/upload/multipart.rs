//! Multipart upload adapter
//!
//! Sends a whole source in one `multipart/form-data` request (field `file`,
//! optional JSON field `metadata`). There is no chunking and no resume.
//!
//! Every item added with [`MultipartUploader::add`] runs on its own task and
//! reports through a broadcast event bus:
//!
//! | Event | When |
//! |-------|------|
//! | `ITEM_START` | request about to be sent |
//! | `ITEM_PROGRESS` | a body slice was read and handed to the transport |
//! | `ITEM_FINISH` | server accepted the file |
//! | `ITEM_ERROR` | request failed or was aborted |
//!
//! [`Uploader::upload`] wraps the bus in a single future that resolves on the
//! first terminal event for its item.

use super::codec::{header_str, resolve_location};
use super::control::UploadControl;
use super::{
    build_client, check_endpoint, supervise, FileMeta, RemoteFileMeta, UploadError, UploadHooks,
    UploadMethod, UploadProgress, Uploader, DEFAULT_UPLOAD_TIMEOUT,
};
use crate::source::ByteSource;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use reqwest::header::LOCATION;
use reqwest::multipart::{Form, Part};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Size of the body slices progress is reported on
const PROGRESS_SLICE: usize = 64 * 1024;

/// Event bus capacity
const EVENT_CAPACITY: usize = 1024;

const HEADER_FILE_METADATA: &str = "X-File-Metadata";

/// Multipart adapter configuration
#[derive(Debug, Clone)]
pub struct MultipartConfig {
    /// Form endpoint
    pub endpoint: String,
    /// Sent as the `metadata` field and in `X-File-Metadata`
    pub metadata: BTreeMap<String, String>,
    /// Extra headers attached to every request
    pub headers: BTreeMap<String, String>,
    /// Deadline for a whole `upload()` call
    pub timeout: Duration,
}

impl MultipartConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            metadata: BTreeMap::new(),
            headers: BTreeMap::new(),
            timeout: DEFAULT_UPLOAD_TIMEOUT,
        }
    }
}

/// Lifecycle of an upload item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Uploading,
    Completed,
    Error,
    Aborted,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Completed | ItemStatus::Error | ItemStatus::Aborted
        )
    }
}

/// One file tracked by the uploader
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadItem {
    pub id: String,
    pub name: String,
    pub content_type: String,
    pub size: u64,
    pub status: ItemStatus,
    pub loaded: u64,
    /// Percentage, 0-100
    pub completed: u8,
    pub error: Option<String>,
    pub upload_response: Option<FileMeta>,
    pub url: Option<String>,
}

/// Event names on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemEventKind {
    Start,
    Progress,
    Finish,
    Error,
}

impl ItemEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemEventKind::Start => "ITEM_START",
            ItemEventKind::Progress => "ITEM_PROGRESS",
            ItemEventKind::Finish => "ITEM_FINISH",
            ItemEventKind::Error => "ITEM_ERROR",
        }
    }
}

impl fmt::Display for ItemEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event published on the bus; `item` is a snapshot taken when it was sent
#[derive(Debug, Clone)]
pub struct ItemEvent {
    pub kind: ItemEventKind,
    pub item: UploadItem,
    pub error: Option<UploadError>,
}

struct MultipartInner {
    config: MultipartConfig,
    client: reqwest::Client,
    hooks: UploadHooks,
    items: Mutex<Vec<UploadItem>>,
    controls: Mutex<HashMap<String, UploadControl>>,
    events: broadcast::Sender<ItemEvent>,
}

impl MultipartInner {
    /// Apply `f` to the tracked item and return a snapshot; `fallback` keeps
    /// a local copy current in case the item was cleared meanwhile.
    fn update<F>(&self, fallback: &mut UploadItem, f: F) -> UploadItem
    where
        F: Fn(&mut UploadItem),
    {
        f(fallback);
        let mut items = self.items.lock();
        match items.iter_mut().find(|item| item.id == fallback.id) {
            Some(item) => {
                f(item);
                item.clone()
            }
            None => fallback.clone(),
        }
    }

    fn emit(&self, kind: ItemEventKind, item: UploadItem, error: Option<UploadError>) {
        tracing::trace!(event = %kind, item_id = %item.id, "Multipart event");
        // No receivers is fine
        let _ = self.events.send(ItemEvent { kind, item, error });
    }

    async fn run_item(
        self: Arc<Self>,
        mut item: UploadItem,
        source: Arc<dyn ByteSource>,
        control: UploadControl,
    ) {
        let started = self.update(&mut item, |i| i.status = ItemStatus::Uploading);
        self.emit(ItemEventKind::Start, started, None);

        let result = control
            .guard(self.clone().send(item.clone(), source))
            .await
            .and_then(|sent| sent);
        self.controls.lock().remove(&item.id);

        match result {
            Ok(meta) => {
                let finished = self.update(&mut item, |i| {
                    i.status = ItemStatus::Completed;
                    i.loaded = i.size;
                    i.completed = 100;
                    i.url = meta.url.clone();
                    i.upload_response = Some(meta.clone());
                });
                tracing::info!(item_id = %finished.id, file_id = %meta.id, "Multipart upload finished");
                self.emit(ItemEventKind::Finish, finished, None);
            }
            Err(e) => {
                let status = if matches!(e, UploadError::Aborted) {
                    ItemStatus::Aborted
                } else {
                    ItemStatus::Error
                };
                let message = e.to_string();
                let failed = self.update(&mut item, |i| {
                    i.status = status;
                    i.error = Some(message.clone());
                });
                tracing::warn!(item_id = %failed.id, error = %e, "Multipart upload failed");
                self.emit(ItemEventKind::Error, failed, Some(e));
            }
        }
    }

    fn report_progress(&self, item: &mut UploadItem, loaded: u64) {
        let progress = UploadProgress::new(loaded, item.size);
        let snapshot = self.update(item, |i| {
            i.loaded = progress.uploaded;
            i.completed = progress.percentage;
        });
        self.hooks.progress(progress);
        self.emit(ItemEventKind::Progress, snapshot, None);
    }

    #[tracing::instrument(
        name = "upload.multipart.send",
        skip(self, item, source),
        fields(item.id = %item.id, upload.size = item.size),
        err
    )]
    async fn send(
        self: Arc<Self>,
        item: UploadItem,
        source: Arc<dyn ByteSource>,
    ) -> Result<FileMeta, UploadError> {
        let size = source.size();

        // Slices are read from the source only as the transport pulls them
        let tracked = {
            let inner = self.clone();
            let reader = source.clone();
            let mut tracked_item = item.clone();
            let mut loaded = 0u64;
            stream::iter((0..size).step_by(PROGRESS_SLICE))
                .then(move |start| {
                    let reader = reader.clone();
                    async move {
                        let end = start.saturating_add(PROGRESS_SLICE as u64).min(size);
                        reader.slice(start, end).await
                    }
                })
                .map(move |slice| match slice {
                    Ok(slice) => {
                        loaded += slice.len() as u64;
                        inner.report_progress(&mut tracked_item, loaded);
                        Ok::<Bytes, std::io::Error>(slice)
                    }
                    Err(e) => Err(std::io::Error::other(e.to_string())),
                })
        };

        let part = Part::stream_with_length(reqwest::Body::wrap_stream(tracked), size)
            .file_name(source.name().to_string())
            .mime_str(source.content_type())
            .map_err(|e| {
                UploadError::Source(format!(
                    "Invalid content type '{}': {}",
                    source.content_type(),
                    e
                ))
            })?;

        let mut form = Form::new().part("file", part);
        let mut request = self.client.post(&self.config.endpoint);
        if !self.config.metadata.is_empty() {
            let metadata = serde_json::to_string(&self.config.metadata)
                .map_err(|e| UploadError::Config(e.to_string()))?;
            form = form.text("metadata", metadata.clone());
            request = request.header(HEADER_FILE_METADATA, metadata);
        }

        let response = request.multipart(form).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::http("Multipart upload", status));
        }

        let location = header_str(response.headers(), LOCATION.as_str())
            .and_then(|loc| resolve_location(&self.config.endpoint, loc).ok());
        let body = response.bytes().await?;

        Ok(RemoteFileMeta::parse_lenient(&body).into_file_meta(
            source.as_ref(),
            &item.id,
            location,
        ))
    }
}

/// Multipart uploader with an item list and event bus
pub struct MultipartUploader {
    inner: Arc<MultipartInner>,
}

impl MultipartUploader {
    /// Create a new multipart uploader
    pub fn new(config: MultipartConfig) -> Result<Self, UploadError> {
        check_endpoint(&config.endpoint)?;
        let client = build_client(&config.headers)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            inner: Arc::new(MultipartInner {
                config,
                client,
                hooks: UploadHooks::default(),
                items: Mutex::new(Vec::new()),
                controls: Mutex::new(HashMap::new()),
                events,
            }),
        })
    }

    /// Attach observers. Must be called before any item is added.
    pub fn with_hooks(self, hooks: UploadHooks) -> Self {
        let inner = match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.hooks = hooks;
                inner
            }
            Err(shared) => {
                tracing::warn!("Hooks ignored: uploader already in use");
                return Self { inner: shared };
            }
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &MultipartConfig {
        &self.inner.config
    }

    /// Subscribe to item events
    pub fn subscribe(&self) -> broadcast::Receiver<ItemEvent> {
        self.inner.events.subscribe()
    }

    /// Queue a source and start sending it; returns the item id.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn add(&self, source: Arc<dyn ByteSource>) -> String {
        self.add_with_control(source).0
    }

    fn add_with_control(&self, source: Arc<dyn ByteSource>) -> (String, UploadControl) {
        let item = UploadItem {
            id: uuid::Uuid::new_v4().to_string(),
            name: source.name().to_string(),
            content_type: source.content_type().to_string(),
            size: source.size(),
            status: ItemStatus::Pending,
            loaded: 0,
            completed: 0,
            error: None,
            upload_response: None,
            url: None,
        };
        let id = item.id.clone();
        let control = UploadControl::new();

        self.inner.items.lock().push(item.clone());
        self.inner
            .controls
            .lock()
            .insert(id.clone(), control.clone());

        tracing::debug!(item_id = %id, name = %item.name, size = item.size, "Queued multipart item");
        tokio::spawn(self.inner.clone().run_item(item, source, control.clone()));
        (id, control)
    }

    /// Snapshot of every tracked item
    pub fn items(&self) -> Vec<UploadItem> {
        self.inner.items.lock().clone()
    }

    pub fn item(&self, id: &str) -> Option<UploadItem> {
        self.inner.items.lock().iter().find(|i| i.id == id).cloned()
    }

    /// Cancel one in-flight item; returns false if it is not running
    pub fn abort_item(&self, id: &str) -> bool {
        let control = self.inner.controls.lock().remove(id);
        match control {
            Some(control) => {
                control.abort();
                if let Some(item) = self.inner.items.lock().iter_mut().find(|i| i.id == id) {
                    item.status = ItemStatus::Aborted;
                }
                tracing::info!(item_id = %id, "Aborted multipart item");
                true
            }
            None => false,
        }
    }

    /// Forget every item, aborting those still running
    pub fn clear(&self) {
        Uploader::abort(self);
        self.inner.items.lock().clear();
    }

    /// Wait for the first terminal event of `id`
    async fn wait_for(
        &self,
        mut events: broadcast::Receiver<ItemEvent>,
        id: &str,
    ) -> Result<FileMeta, UploadError> {
        loop {
            match events.recv().await {
                Ok(event) if event.item.id == id => match event.kind {
                    ItemEventKind::Finish => {
                        return event.item.upload_response.ok_or_else(|| {
                            UploadError::Protocol("Finished item has no response".into())
                        })
                    }
                    ItemEventKind::Error => {
                        return Err(event.error.unwrap_or(UploadError::Aborted));
                    }
                    ItemEventKind::Start | ItemEventKind::Progress => {}
                },
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped = skipped, "Event receiver lagged");
                    if let Some(item) = self.item(id).filter(|i| i.status.is_terminal()) {
                        return match item.status {
                            ItemStatus::Completed => item.upload_response.ok_or_else(|| {
                                UploadError::Protocol("Finished item has no response".into())
                            }),
                            ItemStatus::Aborted => Err(UploadError::Aborted),
                            _ => Err(UploadError::Protocol(
                                item.error.unwrap_or_else(|| "upload failed".into()),
                            )),
                        };
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(UploadError::Aborted),
            }
        }
    }
}

#[async_trait]
impl Uploader for MultipartUploader {
    fn method(&self) -> UploadMethod {
        UploadMethod::Multipart
    }

    async fn upload(&self, source: Arc<dyn ByteSource>) -> Result<FileMeta, UploadError> {
        let events = self.subscribe();
        let (id, control) = self.add_with_control(source.clone());

        supervise(
            UploadMethod::Multipart,
            &self.inner.hooks,
            self.inner.config.timeout,
            &control,
            source.as_ref(),
            self.wait_for(events, &id),
        )
        .await
    }

    fn pause(&self) {
        tracing::debug!("Pause is not supported for multipart uploads");
    }

    fn resume(&self) {
        tracing::debug!("Resume is not supported for multipart uploads");
    }

    fn abort(&self) {
        let ids: Vec<String> = self.inner.controls.lock().keys().cloned().collect();
        for id in ids {
            self.abort_item(&id);
        }
    }

    fn reset(&self) {
        self.clear();
    }
}
