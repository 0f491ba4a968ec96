//! Upload observers
//!
//! Callbacks an adapter invokes over the lifetime of one `upload()` call.

use super::{FileMeta, UploadError, UploadMethod};
use std::fmt;
use std::sync::Arc;

/// Progress of a running transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub uploaded: u64,
    pub total: u64,
    pub percentage: u8,
}

impl UploadProgress {
    /// Build a progress report; percentage is rounded and capped at 100
    pub fn new(uploaded: u64, total: u64) -> Self {
        let percentage = if total == 0 {
            100
        } else {
            ((uploaded as f64 / total as f64) * 100.0).round().min(100.0) as u8
        };
        Self {
            uploaded,
            total,
            percentage,
        }
    }
}

/// Start notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadStart {
    pub method: UploadMethod,
    pub name: String,
    pub size: u64,
}

type StartFn = Arc<dyn Fn(&UploadStart) + Send + Sync>;
type ProgressFn = Arc<dyn Fn(UploadProgress) + Send + Sync>;
type SuccessFn = Arc<dyn Fn(&FileMeta) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(&UploadError) + Send + Sync>;

/// Optional callbacks; cheap to clone and share between adapters
#[derive(Clone, Default)]
pub struct UploadHooks {
    on_start: Option<StartFn>,
    on_progress: Option<ProgressFn>,
    on_success: Option<SuccessFn>,
    on_error: Option<ErrorFn>,
}

impl fmt::Debug for UploadHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadHooks")
            .field("on_start", &self.on_start.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl UploadHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(mut self, f: impl Fn(&UploadStart) + Send + Sync + 'static) -> Self {
        self.on_start = Some(Arc::new(f));
        self
    }

    pub fn on_progress(mut self, f: impl Fn(UploadProgress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }

    pub fn on_success(mut self, f: impl Fn(&FileMeta) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&UploadError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub(crate) fn start(&self, start: &UploadStart) {
        if let Some(f) = &self.on_start {
            f(start);
        }
    }

    pub(crate) fn progress(&self, progress: UploadProgress) {
        if let Some(f) = &self.on_progress {
            f(progress);
        }
    }

    /// Report the terminal outcome of one `upload()` call
    pub(crate) fn finish(&self, result: &Result<FileMeta, UploadError>) {
        match result {
            Ok(meta) => {
                if let Some(f) = &self.on_success {
                    f(meta);
                }
            }
            Err(e) => {
                if let Some(f) = &self.on_error {
                    f(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_progress_rounding() {
        assert_eq!(UploadProgress::new(0, 3).percentage, 0);
        assert_eq!(UploadProgress::new(1, 3).percentage, 33);
        assert_eq!(UploadProgress::new(2, 3).percentage, 67);
        assert_eq!(UploadProgress::new(5, 3).percentage, 100);
        assert_eq!(UploadProgress::new(0, 0).percentage, 100);
    }

    #[test]
    fn test_hooks_invoked() {
        let seen = Arc::new(AtomicU64::new(0));
        let hooks = {
            let seen = seen.clone();
            UploadHooks::new().on_progress(move |p| {
                seen.store(p.uploaded, Ordering::SeqCst);
            })
        };

        hooks.progress(UploadProgress::new(42, 100));
        assert_eq!(seen.load(Ordering::SeqCst), 42);

        // Missing callbacks are no-ops
        hooks.finish(&Err(UploadError::Aborted));
    }
}
