//! Pause / abort signalling for a single upload attempt
//!
//! Pausing is a `watch` channel so a waiting transfer wakes as soon as
//! [`UploadControl::resume`] is called. Aborting cancels a
//! [`CancellationToken`] that every network future is raced against.

use super::UploadError;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Control handle shared between an adapter and its running transfer
#[derive(Debug, Clone)]
pub struct UploadControl {
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl Default for UploadControl {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadControl {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            paused,
            cancel: CancellationToken::new(),
        }
    }

    /// Request a pause; ignored once aborted
    pub fn pause(&self) {
        if !self.is_aborted() {
            self.paused.send_replace(true);
        }
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Cancel the attempt. Clears the pause flag so waiters observe the abort.
    pub fn abort(&self) {
        self.cancel.cancel();
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail fast if the attempt was aborted
    pub fn check(&self) -> Result<(), UploadError> {
        if self.is_aborted() {
            Err(UploadError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Suspend while paused.
    ///
    /// Returns `Ok(true)` if the caller actually waited for a resume.
    pub async fn wait_if_paused(&self) -> Result<bool, UploadError> {
        self.check()?;

        let mut rx = self.paused.subscribe();
        if !*rx.borrow_and_update() {
            return Ok(false);
        }

        tracing::debug!("Upload paused, waiting for resume");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(UploadError::Aborted),
                changed = rx.changed() => {
                    if changed.is_err() || !*rx.borrow_and_update() {
                        break;
                    }
                }
            }
        }

        self.check()?;
        tracing::debug!("Upload resumed");
        Ok(true)
    }

    /// Run a future unless the attempt is aborted first
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, UploadError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(UploadError::Aborted),
            out = fut => Ok(out),
        }
    }

    /// Sleep for `delay` unless aborted
    pub async fn sleep(&self, delay: Duration) -> Result<(), UploadError> {
        self.guard(tokio::time::sleep(delay)).await
    }
}

/// Race a transfer against a timer.
///
/// On expiry the attempt is aborted, so the transfer future and every
/// request it owns are dropped instead of running on in the background.
pub async fn with_timeout<F, T>(
    timeout: Duration,
    control: &UploadControl,
    transfer: F,
) -> Result<T, UploadError>
where
    F: Future<Output = Result<T, UploadError>>,
{
    match tokio::time::timeout(timeout, transfer).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(timeout_secs = timeout.as_secs_f64(), "Upload timed out");
            control.abort();
            Err(UploadError::Timeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_not_paused_returns_immediately() {
        let control = UploadControl::new();
        assert!(!control.wait_if_paused().await.unwrap());
    }

    #[tokio::test]
    async fn test_resume_wakes_waiter() {
        let control = Arc::new(UploadControl::new());
        control.pause();

        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.wait_if_paused().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        control.resume();
        assert!(waiter.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_abort_wakes_paused_waiter() {
        let control = Arc::new(UploadControl::new());
        control.pause();

        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.wait_if_paused().await })
        };

        control.abort();
        assert!(matches!(waiter.await.unwrap(), Err(UploadError::Aborted)));
        assert!(!control.is_paused());
    }

    #[tokio::test]
    async fn test_pause_after_abort_is_ignored() {
        let control = UploadControl::new();
        control.abort();
        control.pause();
        assert!(!control.is_paused());
        assert!(control.check().is_err());
    }

    #[tokio::test]
    async fn test_guard_cancels_pending_future() {
        let control = UploadControl::new();
        control.abort();
        let result = control.guard(std::future::pending::<()>()).await;
        assert!(matches!(result, Err(UploadError::Aborted)));
    }

    #[tokio::test]
    async fn test_timeout_aborts_control() {
        let control = UploadControl::new();
        let result: Result<(), _> = with_timeout(
            Duration::from_millis(10),
            &control,
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;

        assert!(matches!(result, Err(UploadError::Timeout(_))));
        assert!(control.is_aborted());
    }
}
