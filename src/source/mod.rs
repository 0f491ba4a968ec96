//! Byte sources
//!
//! A byte source is anything with a known size that can produce an arbitrary
//! half-open byte range on demand. Adapters never mutate a source.

use crate::upload::UploadError;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Content type used when none is known
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Random-access source of upload data
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Total size in bytes
    fn size(&self) -> u64;

    /// File name reported to the server
    fn name(&self) -> &str;

    /// MIME type reported to the server
    fn content_type(&self) -> &str;

    /// Read the byte range `[start, end)`
    async fn slice(&self, start: u64, end: u64) -> Result<Bytes, UploadError>;
}

fn check_range(start: u64, end: u64, size: u64) -> Result<(), UploadError> {
    if start > end || end > size {
        return Err(UploadError::Source(format!(
            "Invalid range [{}, {}) for source of {} bytes",
            start, end, size
        )));
    }
    Ok(())
}

/// In-memory source
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    content_type: String,
    data: Bytes,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            data: data.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }

    async fn slice(&self, start: u64, end: u64) -> Result<Bytes, UploadError> {
        check_range(start, end, self.size())?;
        Ok(self.data.slice(start as usize..end as usize))
    }
}

/// File-backed source
///
/// Each slice reopens the file, so concurrent slices never share a cursor.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    name: String,
    content_type: String,
    size: u64,
}

impl FileSource {
    /// Open a file and read its size
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, UploadError> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(UploadError::Source(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        Ok(Self {
            path,
            name,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            size: metadata.len(),
        })
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ByteSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }

    async fn slice(&self, start: u64, end: u64) -> Result<Bytes, UploadError> {
        check_range(start, end, self.size)?;

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(start)).await?;

        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_memory_slice() {
        let source = MemorySource::new("a.txt", &b"hello world"[..]);
        assert_eq!(source.size(), 11);
        assert_eq!(source.slice(6, 11).await.unwrap(), Bytes::from("world"));
        assert!(source.slice(6, 12).await.is_err());
        assert!(source.slice(5, 4).await.is_err());
    }

    #[tokio::test]
    async fn test_file_slice() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();
        file.flush().unwrap();

        let source = FileSource::open(file.path())
            .await
            .unwrap()
            .with_content_type("text/plain");

        assert_eq!(source.size(), 10);
        assert_eq!(source.content_type(), "text/plain");
        assert_eq!(source.slice(3, 7).await.unwrap(), Bytes::from("3456"));
        assert_eq!(source.slice(10, 10).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_open_missing_file() {
        let result = FileSource::open("/definitely/not/here.bin").await;
        assert!(matches!(result, Err(UploadError::Source(_))));
    }
}
