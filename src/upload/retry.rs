//! Bounded retry with backoff
//!
//! The chunked-REST adapter sends every request through [`fetch_with_retry`]
//! (exponential backoff). The TUS adapter applies the linear variant
//! ([`RetryPolicy::linear_delay`]) at its chunk call site.

use super::control::UploadControl;
use super::UploadError;
use crate::metrics;
use std::time::Duration;

/// Default number of retries after the first attempt
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay between attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retry at all
    pub enabled: bool,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Base delay, scaled by the backoff shape
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Retries available for one operation
    pub fn budget(&self) -> u32 {
        if self.enabled {
            self.max_retries
        } else {
            0
        }
    }

    /// `base * 2^attempts_made`, no jitter
    pub fn exponential_delay(&self, attempts_made: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempts_made))
    }

    /// `base * retry_count`
    pub fn linear_delay(&self, retry_count: u32) -> Duration {
        self.base_delay.saturating_mul(retry_count)
    }
}

/// Send a request, retrying failures with exponential backoff.
///
/// `build` is called once per attempt. Transport errors and non-2xx responses
/// are retried while the budget lasts; after that the last failing response
/// is returned as-is (callers check the status) and the last transport error
/// is returned as [`UploadError::Network`]. Every attempt and every delay is
/// raced against `control`, so an abort stops the loop immediately.
pub async fn fetch_with_retry<F>(
    build: F,
    policy: &RetryPolicy,
    control: &UploadControl,
    operation: &str,
) -> Result<reqwest::Response, UploadError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut retries_left = policy.budget();
    let mut attempts_made = 0u32;

    loop {
        control.check()?;

        let outcome = control.guard(build().send()).await?;
        match outcome {
            Ok(response) if response.status().is_success() => return Ok(response),
            Ok(response) if retries_left == 0 => return Ok(response),
            Err(e) if retries_left == 0 => return Err(e.into()),
            Ok(response) => {
                tracing::warn!(
                    operation = operation,
                    status = response.status().as_u16(),
                    retries_left = retries_left,
                    "Request failed, retrying"
                );
            }
            Err(e) => {
                tracing::warn!(
                    operation = operation,
                    error = %e,
                    retries_left = retries_left,
                    "Request error, retrying"
                );
            }
        }

        metrics::record_retry(operation);
        control.sleep(policy.exponential_delay(attempts_made)).await?;
        attempts_made += 1;
        retries_left -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            enabled: true,
            max_retries,
            base_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_backoff_shapes() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.exponential_delay(0), Duration::from_millis(1000));
        assert_eq!(policy.exponential_delay(2), Duration::from_millis(4000));
        assert_eq!(policy.linear_delay(3), Duration::from_millis(3000));
        assert_eq!(RetryPolicy::disabled().budget(), 0);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/flaky", server.uri());
        let control = UploadControl::new();

        let response = fetch_with_retry(|| client.get(&url), &fast_policy(2), &control, "test")
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 503);
    }

    #[tokio::test]
    async fn test_recovers_after_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/flaky", server.uri());
        let control = UploadControl::new();

        let response = fetch_with_retry(|| client.get(&url), &fast_policy(3), &control, "test")
            .await
            .unwrap();

        assert!(response.status().is_success());
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_disabled_retry_single_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = server.uri();
        let control = UploadControl::new();

        let response = fetch_with_retry(|| client.get(&url), &RetryPolicy::disabled(), &control, "test")
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 500);
    }

    #[tokio::test]
    async fn test_connection_error_surfaces_as_network() {
        let client = reqwest::Client::new();
        let control = UploadControl::new();

        let result = fetch_with_retry(
            || client.get("http://127.0.0.1:19999/"),
            &fast_policy(1),
            &control,
            "test",
        )
        .await;

        assert!(matches!(result, Err(UploadError::Network(_))));
    }

    #[tokio::test]
    async fn test_aborted_before_send() {
        let client = reqwest::Client::new();
        let control = UploadControl::new();
        control.abort();

        let result = fetch_with_retry(
            || client.get("http://127.0.0.1:19999/"),
            &fast_policy(1),
            &control,
            "test",
        )
        .await;

        assert!(matches!(result, Err(UploadError::Aborted)));
    }
}
