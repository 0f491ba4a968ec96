//! Configuration module for Resumable Uploadr
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation.
//!
//! ```yaml
//! endpoints:
//!   chunked: "https://files.example.com/upload"
//!   tus: "https://files.example.com/tus"
//!   multipart: "https://files.example.com/form"
//! method: tus            # optional; absent = auto
//! tus_threshold: 10485760
//! chunk_size: 5242880    # optional; per-protocol default otherwise
//! max_retries: 3
//! retry: true
//! retry_delay_ms: 1000
//! timeout_secs: 300
//! max_concurrent_chunks: 8
//! metadata: { project: demo }
//! headers: { Authorization: "Bearer ${TOKEN}" }
//! ```

use crate::upload::dispatcher::DEFAULT_TUS_THRESHOLD;
use crate::upload::retry::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY};
use crate::upload::{
    ChunkedConfig, MultipartConfig, RetryPolicy, TusConfig, UploadMethod, DEFAULT_UPLOAD_TIMEOUT,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::{expand_env_vars, ConfigLoader};

// ============================================================================
// Validation Helpers
// ============================================================================

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    (url.starts_with("http://") || url.starts_with("https://"))
        && reqwest::Url::parse(url).is_ok()
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub endpoints: EndpointsConfig,

    /// Explicit upload method; `None` selects automatically
    #[serde(default)]
    pub method: Option<UploadMethod>,

    /// Sources larger than this go to TUS in auto mode
    #[serde(default = "default_tus_threshold")]
    pub tus_threshold: u64,

    /// Chunk size for chunked-REST and TUS; each protocol has its own default
    #[serde(default)]
    pub chunk_size: Option<u64>,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry")]
    pub retry: bool,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub max_concurrent_chunks: Option<usize>,

    /// Metadata sent with every upload
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Headers attached to every request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoints: EndpointsConfig::default(),
            method: None,
            tus_threshold: default_tus_threshold(),
            chunk_size: None,
            max_retries: default_max_retries(),
            retry: default_retry(),
            retry_delay_ms: default_retry_delay_ms(),
            timeout_secs: default_timeout_secs(),
            max_concurrent_chunks: None,
            metadata: BTreeMap::new(),
            headers: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        ConfigLoader::parse(content)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoints = self.endpoints.configured();
        if endpoints.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one endpoint must be configured".into(),
            ));
        }

        for (method, url) in &endpoints {
            if !is_valid_http_url(url) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid {} endpoint '{}': must be an http:// or https:// URL",
                    method, url
                )));
            }
        }

        if let Some(method) = self.method {
            if self.endpoints.get(method).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "Method '{}' selected but endpoints.{} is not set",
                    method, method
                )));
            }
        }

        if self.chunk_size == Some(0) {
            return Err(ConfigError::ValidationError(
                "chunk_size must be greater than 0".into(),
            ));
        }

        if self.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.max_concurrent_chunks == Some(0) {
            return Err(ConfigError::ValidationError(
                "max_concurrent_chunks must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            enabled: self.retry,
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Chunked-REST adapter settings, if its endpoint is set
    pub fn chunked_config(&self) -> Option<ChunkedConfig> {
        let endpoint = self.endpoints.chunked.as_ref()?;
        let mut config = ChunkedConfig::new(endpoint.clone());
        if let Some(size) = self.chunk_size {
            config.chunk_size = size;
        }
        config.retry = self.retry_policy();
        config.metadata = self.metadata.clone();
        config.headers = self.headers.clone();
        config.timeout = self.timeout();
        config.max_concurrent_chunks = self.max_concurrent_chunks;
        Some(config)
    }

    /// TUS adapter settings, if its endpoint is set
    pub fn tus_config(&self) -> Option<TusConfig> {
        let endpoint = self.endpoints.tus.as_ref()?;
        let mut config = TusConfig::new(endpoint.clone());
        if let Some(size) = self.chunk_size {
            config.chunk_size = size;
        }
        config.retry = self.retry_policy();
        config.metadata = self.metadata.clone();
        config.headers = self.headers.clone();
        config.timeout = self.timeout();
        Some(config)
    }

    /// Multipart adapter settings, if its endpoint is set
    pub fn multipart_config(&self) -> Option<MultipartConfig> {
        let endpoint = self.endpoints.multipart.as_ref()?;
        let mut config = MultipartConfig::new(endpoint.clone());
        config.metadata = self.metadata.clone();
        config.headers = self.headers.clone();
        config.timeout = self.timeout();
        Some(config)
    }
}

/// Endpoint per protocol
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointsConfig {
    /// Chunked-REST session collection
    #[serde(default, alias = "rest")]
    pub chunked: Option<String>,
    #[serde(default)]
    pub tus: Option<String>,
    #[serde(default)]
    pub multipart: Option<String>,
}

impl EndpointsConfig {
    pub fn get(&self, method: UploadMethod) -> Option<&str> {
        match method {
            UploadMethod::Chunked => self.chunked.as_deref(),
            UploadMethod::Tus => self.tus.as_deref(),
            UploadMethod::Multipart => self.multipart.as_deref(),
        }
    }

    fn configured(&self) -> Vec<(UploadMethod, &str)> {
        [UploadMethod::Chunked, UploadMethod::Tus, UploadMethod::Multipart]
            .into_iter()
            .filter_map(|m| self.get(m).map(|url| (m, url)))
            .collect()
    }
}

fn default_tus_threshold() -> u64 {
    DEFAULT_TUS_THRESHOLD
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry() -> bool {
    true
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY.as_millis() as u64
}

fn default_timeout_secs() -> u64 {
    DEFAULT_UPLOAD_TIMEOUT.as_secs()
}
