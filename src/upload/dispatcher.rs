//! Upload method selection
//!
//! The dispatcher owns up to one adapter per protocol and decides which one
//! handles each upload:
//!
//! 1. an explicit method always wins (its endpoint must be configured);
//! 2. a single configured endpoint is used for everything;
//! 3. otherwise ("auto"): sources larger than `tus_threshold` go to TUS when
//!    available, then chunked-REST, then multipart.
//!
//! Control calls (`pause`, `resume`, `abort`, `reset`) are forwarded to the
//! adapter of the most recent upload. A source no adapter can take is
//! rejected and reported to the error observer.

use super::{
    ChunkedUploader, FileMeta, MultipartUploader, TusUploader, UploadError, UploadHooks,
    UploadMethod, Uploader,
};
use crate::config::Config;
use crate::source::ByteSource;
use parking_lot::Mutex;
use std::sync::Arc;

/// Default size above which TUS is preferred (10MB)
pub const DEFAULT_TUS_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Protocol selector over a set of adapters
pub struct UploadDispatcher {
    chunked: Option<Arc<ChunkedUploader>>,
    tus: Option<Arc<TusUploader>>,
    multipart: Option<Arc<MultipartUploader>>,
    method: Option<UploadMethod>,
    tus_threshold: u64,
    hooks: UploadHooks,
    active: Mutex<Option<UploadMethod>>,
}

impl UploadDispatcher {
    /// Start an empty dispatcher; add adapters and finish with
    /// [`UploadDispatcherBuilder::build`].
    pub fn builder() -> UploadDispatcherBuilder {
        UploadDispatcherBuilder::default()
    }

    /// Build all adapters named by a configuration
    pub fn from_config(config: &Config, hooks: UploadHooks) -> Result<Self, UploadError> {
        let mut builder = Self::builder()
            .method(config.method)
            .tus_threshold(config.tus_threshold)
            .hooks(hooks.clone());

        if let Some(chunked) = config.chunked_config() {
            builder = builder.chunked(ChunkedUploader::new(chunked)?.with_hooks(hooks.clone()));
        }
        if let Some(tus) = config.tus_config() {
            builder = builder.tus(TusUploader::new(tus)?.with_hooks(hooks.clone()));
        }
        if let Some(multipart) = config.multipart_config() {
            builder = builder.multipart(MultipartUploader::new(multipart)?.with_hooks(hooks));
        }

        builder.build()
    }

    /// Explicit method, if any
    pub fn method(&self) -> Option<UploadMethod> {
        self.method
    }

    /// Method of the most recent upload
    pub fn active_method(&self) -> Option<UploadMethod> {
        *self.active.lock()
    }

    fn has(&self, method: UploadMethod) -> bool {
        match method {
            UploadMethod::Chunked => self.chunked.is_some(),
            UploadMethod::Tus => self.tus.is_some(),
            UploadMethod::Multipart => self.multipart.is_some(),
        }
    }

    fn configured(&self) -> Vec<UploadMethod> {
        [UploadMethod::Chunked, UploadMethod::Tus, UploadMethod::Multipart]
            .into_iter()
            .filter(|m| self.has(*m))
            .collect()
    }

    /// Pick the protocol for a source of `size` bytes
    pub fn select(&self, size: u64) -> Result<UploadMethod, UploadError> {
        if let Some(method) = self.method {
            return if self.has(method) {
                Ok(method)
            } else {
                Err(UploadError::Config(format!(
                    "Method '{}' selected but no {} endpoint is configured",
                    method, method
                )))
            };
        }

        let configured = self.configured();
        match configured.as_slice() {
            [] => Err(UploadError::Config("No upload endpoint configured".into())),
            [only] => Ok(*only),
            _ if size > self.tus_threshold && self.tus.is_some() => Ok(UploadMethod::Tus),
            _ if self.chunked.is_some() => Ok(UploadMethod::Chunked),
            _ if self.multipart.is_some() => Ok(UploadMethod::Multipart),
            _ => Ok(UploadMethod::Tus),
        }
    }

    fn adapter(&self, method: UploadMethod) -> Option<Arc<dyn Uploader>> {
        match method {
            UploadMethod::Chunked => self.chunked.clone().map(|u| u as Arc<dyn Uploader>),
            UploadMethod::Tus => self.tus.clone().map(|u| u as Arc<dyn Uploader>),
            UploadMethod::Multipart => self.multipart.clone().map(|u| u as Arc<dyn Uploader>),
        }
    }

    fn active_adapter(&self) -> Option<Arc<dyn Uploader>> {
        self.active_method().and_then(|m| self.adapter(m))
    }

    fn route(&self, size: u64) -> Result<(UploadMethod, Arc<dyn Uploader>), UploadError> {
        let method = self.select(size)?;
        let adapter = self
            .adapter(method)
            .ok_or_else(|| UploadError::Config(format!("No {} adapter", method)))?;
        Ok((method, adapter))
    }

    /// Upload through the selected adapter
    #[tracing::instrument(
        name = "upload.dispatch",
        skip(self, source),
        fields(upload.name = %source.name(), upload.size = source.size(), upload.method = tracing::field::Empty),
        err
    )]
    pub async fn upload(&self, source: Arc<dyn ByteSource>) -> Result<FileMeta, UploadError> {
        let (method, adapter) = match self.route(source.size()) {
            Ok(routed) => routed,
            Err(e) => {
                let result = Err(e);
                self.hooks.finish(&result);
                return result;
            }
        };

        tracing::Span::current().record("upload.method", method.as_str());
        tracing::info!(method = %method, "Selected upload method");
        *self.active.lock() = Some(method);

        adapter.upload(source).await
    }

    /// No-op for multipart, which cannot pause
    pub fn pause(&self) {
        if let Some(adapter) = self.active_adapter() {
            adapter.pause();
        }
    }

    pub fn resume(&self) {
        if let Some(adapter) = self.active_adapter() {
            adapter.resume();
        }
    }

    pub fn abort(&self) {
        if let Some(adapter) = self.active_adapter() {
            adapter.abort();
        }
    }

    /// Reset the active adapter and forget the selection
    pub fn reset(&self) {
        if let Some(adapter) = self.active_adapter() {
            adapter.reset();
        }
        *self.active.lock() = None;
    }

    pub fn chunked(&self) -> Option<&ChunkedUploader> {
        self.chunked.as_deref()
    }

    pub fn tus(&self) -> Option<&TusUploader> {
        self.tus.as_deref()
    }

    pub fn multipart(&self) -> Option<&MultipartUploader> {
        self.multipart.as_deref()
    }
}

/// Builder for [`UploadDispatcher`]
pub struct UploadDispatcherBuilder {
    chunked: Option<ChunkedUploader>,
    tus: Option<TusUploader>,
    multipart: Option<MultipartUploader>,
    method: Option<UploadMethod>,
    tus_threshold: u64,
    hooks: UploadHooks,
}

impl Default for UploadDispatcherBuilder {
    fn default() -> Self {
        Self {
            chunked: None,
            tus: None,
            multipart: None,
            method: None,
            tus_threshold: DEFAULT_TUS_THRESHOLD,
            hooks: UploadHooks::default(),
        }
    }
}

impl UploadDispatcherBuilder {
    pub fn chunked(mut self, uploader: ChunkedUploader) -> Self {
        self.chunked = Some(uploader);
        self
    }

    pub fn tus(mut self, uploader: TusUploader) -> Self {
        self.tus = Some(uploader);
        self
    }

    pub fn multipart(mut self, uploader: MultipartUploader) -> Self {
        self.multipart = Some(uploader);
        self
    }

    /// Explicit method; `None` selects automatically
    pub fn method(mut self, method: Option<UploadMethod>) -> Self {
        self.method = method;
        self
    }

    pub fn tus_threshold(mut self, threshold: u64) -> Self {
        self.tus_threshold = threshold;
        self
    }

    /// Observers for failures that happen before an adapter is picked
    pub fn hooks(mut self, hooks: UploadHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Build the dispatcher, failing fast on an unusable configuration
    pub fn build(self) -> Result<UploadDispatcher, UploadError> {
        let dispatcher = UploadDispatcher {
            chunked: self.chunked.map(Arc::new),
            tus: self.tus.map(Arc::new),
            multipart: self.multipart.map(Arc::new),
            method: self.method,
            tus_threshold: self.tus_threshold,
            hooks: self.hooks,
            active: Mutex::new(None),
        };

        if dispatcher.configured().is_empty() {
            return Err(UploadError::Config("No upload endpoint configured".into()));
        }
        if let Some(method) = dispatcher.method {
            if !dispatcher.has(method) {
                return Err(UploadError::Config(format!(
                    "Method '{}' selected but no {} endpoint is configured",
                    method, method
                )));
            }
        }

        Ok(dispatcher)
    }
}
