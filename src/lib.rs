//! Resumable Uploadr Library
//!
//! Client-side resumable upload engine for large files.
//!
//! # Features
//!
//! - **Chunked REST**: Concurrent chunk `PATCH`es with server-side resume
//! - **TUS 1.0.0**: Sequential core protocol with offset recovery on conflict
//! - **Multipart**: Single-shot form upload with a per-item event bus
//! - **Auto Selection**: Picks a protocol by configured endpoints and file size
//! - **Control**: Pause, resume, abort and timeout on every upload
//!
//! # Example
//!
//! ```no_run
//! use resumable_uploadr::{config::Config, source::FileSource, upload::UploadHooks, UploadDispatcher};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let dispatcher = UploadDispatcher::from_config(&config, UploadHooks::new())?;
//!     let source = FileSource::open("video.mp4").await?;
//!     let meta = dispatcher.upload(Arc::new(source)).await?;
//!     println!("{}", meta.id);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod metrics;
pub mod source;
pub mod upload;

// Re-export commonly used types
pub use config::Config;
pub use source::{ByteSource, FileSource, MemorySource};
pub use upload::{FileMeta, UploadDispatcher, UploadError, UploadMethod};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
