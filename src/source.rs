//! Transfer sources described by capability, not by concrete type

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};

use crate::error::{Result, TransferError};

/// What a source can do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceCapabilities {
    /// Total size is known up front
    pub sized: bool,
    /// Can be re-read from any offset cheaply (local file, memory)
    pub seekable: bool,
    /// Supports ranged reads, possibly over the network
    pub range_readable: bool,
    /// Content hash is known without reading
    pub hash_known: bool,
}

impl SourceCapabilities {
    pub fn supports_ranges(&self) -> bool {
        self.seekable || self.range_readable
    }
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait TransferSource: Send + Sync {
    /// Human-readable name for logs and errors
    fn describe(&self) -> String;

    fn size(&self) -> Option<u64>;

    fn known_hash(&self) -> Option<String> {
        None
    }

    fn modified_at(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn capabilities(&self) -> SourceCapabilities;

    /// Read exactly `length` bytes at `offset`
    async fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let _ = (offset, length);
        Err(TransferError::InvalidArgument(format!(
            "{} does not support ranged reads",
            self.describe()
        )))
    }

    /// Sequential reader over the whole content
    async fn open_stream(&self) -> Result<BoxedReader>;
}

// ============================================================================
// Local File
// ============================================================================

pub struct LocalFileSource {
    path: PathBuf,
    size: u64,
    modified_at: Option<DateTime<Utc>>,
}

impl LocalFileSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(TransferError::InvalidArgument(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        Ok(Self {
            size: metadata.len(),
            modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TransferSource for LocalFileSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn modified_at(&self) -> Option<DateTime<Utc>> {
        self.modified_at
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            sized: true,
            seekable: true,
            range_readable: true,
            hash_known: false,
        }
    }

    async fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn open_stream(&self) -> Result<BoxedReader> {
        let file = tokio::fs::File::open(&self.path).await?;
        Ok(Box::new(file))
    }
}

// ============================================================================
// In-Memory
// ============================================================================

pub struct MemorySource {
    name: String,
    data: Arc<Vec<u8>>,
    hash: Option<String>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data: Arc::new(data),
            hash: None,
        }
    }

    /// Attach a hash that is already known
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[async_trait]
impl TransferSource for MemorySource {
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn known_hash(&self) -> Option<String> {
        self.hash.clone()
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            sized: true,
            seekable: true,
            range_readable: true,
            hash_known: self.hash.is_some(),
        }
    }

    async fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let start = offset as usize;
        let end = offset.saturating_add(length) as usize;
        self.data
            .get(start..end)
            .map(|s| s.to_vec())
            .ok_or_else(|| {
                TransferError::InvalidArgument(format!(
                    "range {}..{} outside {} bytes of {}",
                    start,
                    end,
                    self.data.len(),
                    self.name
                ))
            })
    }

    async fn open_stream(&self) -> Result<BoxedReader> {
        Ok(Box::new(std::io::Cursor::new(self.data.as_ref().clone())))
    }
}

// ============================================================================
// One-Shot Stream
// ============================================================================

/// A stream that can be read once and never reopened
pub struct StreamSource {
    name: String,
    size: Option<u64>,
    hash: Option<String>,
    reader: parking_lot::Mutex<Option<BoxedReader>>,
}

impl StreamSource {
    pub fn new(name: impl Into<String>, size: Option<u64>, reader: BoxedReader) -> Self {
        Self {
            name: name.into(),
            size,
            hash: None,
            reader: parking_lot::Mutex::new(Some(reader)),
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }
}

#[async_trait]
impl TransferSource for StreamSource {
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn size(&self) -> Option<u64> {
        self.size
    }

    fn known_hash(&self) -> Option<String> {
        self.hash.clone()
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            sized: self.size.is_some(),
            seekable: false,
            range_readable: false,
            hash_known: self.hash.is_some(),
        }
    }

    async fn open_stream(&self) -> Result<BoxedReader> {
        self.reader.lock().take().ok_or_else(|| {
            TransferError::InvalidArgument(format!("{} was already consumed", self.name))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_local_file_ranges() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();

        let source = LocalFileSource::open(file.path()).await.unwrap();
        assert_eq!(source.size(), Some(10));
        assert!(source.capabilities().seekable);
        assert_eq!(source.read_range(3, 4).await.unwrap(), b"3456");
        assert!(source.read_range(8, 4).await.is_err());
    }

    #[tokio::test]
    async fn test_stream_is_one_shot() {
        let source = StreamSource::new("pipe", None, Box::new(std::io::Cursor::new(b"abc".to_vec())));
        assert!(!source.capabilities().supports_ranges());

        let mut reader = source.open_stream().await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abc");

        assert!(source.open_stream().await.is_err());
        assert!(source.read_range(0, 1).await.is_err());
    }
}
