//! Cross-Store Transfer Selector
//!
//! Sources that cannot be re-read cheaply are buffered locally before an
//! upload, and hashed on the way so the handshake can carry a content hash:
//!
//! - `Direct`: seekable sources (local files, memory) need no buffer
//! - `Memory`: small objects are read fully into memory
//! - `Hybrid`: medium range-readable objects are fetched with parallel
//!   ranged reads into a staging file
//! - `Disk`: everything else is streamed once into a staging file
//!
//! Every path yields a seekable source with a known hash, so the upload can
//! retry chunks without reopening the original.

pub mod remote_source;

pub use remote_source::RemoteObjectSource;

use std::io::SeekFrom;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::config::CrossStoreConfig;
use crate::error::{Result, TransferError};
use crate::hash::{compute_hash, HashAccumulator};
use crate::source::{
    BoxedReader, LocalFileSource, MemorySource, SourceCapabilities, TransferSource,
};

/// Read size for streaming copies
const STREAM_BUFFER_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStrategy {
    Direct,
    Memory,
    Hybrid,
    Disk,
}

/// Pick a buffering strategy from what the source can do and how big it is
pub fn select_strategy(
    capabilities: SourceCapabilities,
    size: Option<u64>,
    config: &CrossStoreConfig,
) -> BufferStrategy {
    if capabilities.seekable {
        return BufferStrategy::Direct;
    }
    match size {
        Some(size) if size <= config.memory_threshold => BufferStrategy::Memory,
        Some(size) if size <= config.hybrid_threshold && capabilities.range_readable => {
            BufferStrategy::Hybrid
        }
        _ => BufferStrategy::Disk,
    }
}

/// A source ready for upload: re-readable by range, size known
pub struct PreparedSource {
    pub source: Arc<dyn TransferSource>,
    pub size: u64,
    /// Known up front or computed while buffering; absent only for large
    /// direct sources
    pub content_hash: Option<String>,
    pub strategy: BufferStrategy,
}

pub struct TransferSelector {
    config: CrossStoreConfig,
    /// Direct sources up to this size are hashed before upload
    prehash_limit: u64,
}

impl TransferSelector {
    pub fn new(config: CrossStoreConfig, prehash_limit: u64) -> Self {
        Self {
            config,
            prehash_limit,
        }
    }

    pub fn strategy_for(&self, source: &dyn TransferSource) -> BufferStrategy {
        select_strategy(source.capabilities(), source.size(), &self.config)
    }

    pub async fn prepare(
        &self,
        source: Arc<dyn TransferSource>,
        cancel: &CancellationToken,
    ) -> Result<PreparedSource> {
        let strategy = self.strategy_for(source.as_ref());
        tracing::debug!(
            source = %source.describe(),
            size = ?source.size(),
            strategy = ?strategy,
            "Preparing transfer source"
        );

        let prepared = match strategy {
            BufferStrategy::Direct => self.direct(source, cancel).await?,
            BufferStrategy::Memory => self.memory(source, cancel).await?,
            BufferStrategy::Hybrid => self.hybrid(source, cancel).await?,
            BufferStrategy::Disk => self.disk(source, cancel).await?,
        };
        Ok(prepared)
    }

    async fn direct(
        &self,
        source: Arc<dyn TransferSource>,
        cancel: &CancellationToken,
    ) -> Result<PreparedSource> {
        let size = source.size().ok_or_else(|| {
            TransferError::InvalidArgument(format!("{} has no known size", source.describe()))
        })?;

        let content_hash = match source.known_hash() {
            Some(hash) => Some(hash),
            None if size <= self.prehash_limit => {
                let mut reader = source.open_stream().await?;
                let (hash, read) = copy_hashing(&mut reader, None, cancel, &source.describe()).await?;
                check_size(source.as_ref(), size, read)?;
                Some(hash)
            }
            None => None,
        };

        Ok(PreparedSource {
            source,
            size,
            content_hash,
            strategy: BufferStrategy::Direct,
        })
    }

    async fn memory(
        &self,
        source: Arc<dyn TransferSource>,
        cancel: &CancellationToken,
    ) -> Result<PreparedSource> {
        let name = source.describe();
        let size = source.size().unwrap_or(0);

        let data = if source.capabilities().supports_ranges() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::cancelled("buffer", name.clone())),
                read = source.read_range(0, size) => read?,
            }
        } else {
            let mut data = Vec::new();
            data.try_reserve_exact(size as usize).map_err(|e| {
                TransferError::ResourceExhausted(format!("buffering {} bytes of {}: {}", size, name, e))
            })?;
            let mut limited = source.open_stream().await?.take(size.saturating_add(1));
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::cancelled("buffer", name.clone())),
                read = limited.read_to_end(&mut data) => { read?; }
            }
            data
        };
        check_size(source.as_ref(), size, data.len() as u64)?;

        let hash = compute_hash(&data);
        check_known_hash(source.as_ref(), &hash)?;

        Ok(PreparedSource {
            source: Arc::new(MemorySource::new(name, data).with_hash(hash.clone())),
            size,
            content_hash: Some(hash),
            strategy: BufferStrategy::Memory,
        })
    }

    /// Parallel ranged reads written at their offsets into a staging file
    ///
    /// Reads complete in any order but are consumed in order, so at most
    /// `hybrid_streams` ranges are held in memory at once.
    async fn hybrid(
        &self,
        source: Arc<dyn TransferSource>,
        cancel: &CancellationToken,
    ) -> Result<PreparedSource> {
        let name = source.describe();
        let size = source.size().unwrap_or(0);
        let range_size = self.config.range_size.max(1);

        let staging = self.staging_file(&name)?;
        let file = tokio::fs::File::from_std(staging.reopen()?);
        file.set_len(size).await.map_err(|e| {
            TransferError::ResourceExhausted(format!("staging {} bytes of {}: {}", size, name, e))
        })?;
        let file = tokio::sync::Mutex::new(file);

        let accumulator = HashAccumulator::new(size, range_size);
        let ranges = (0..accumulator.total_chunks()).map(|index| {
            let offset = index * range_size;
            (index, offset, range_size.min(size - offset))
        });

        let reads = stream::iter(ranges)
            .map(|(index, offset, length)| {
                let source = source.clone();
                async move {
                    let data = source.read_range(offset, length).await?;
                    Ok::<_, TransferError>((index, offset, data))
                }
            })
            .buffered(self.config.hybrid_streams.max(1))
            .try_for_each(|(index, offset, data)| {
                let (accumulator, file) = (&accumulator, &file);
                async move {
                    accumulator.write_chunk(index, &data)?;
                    let mut file = file.lock().await;
                    file.seek(SeekFrom::Start(offset)).await?;
                    file.write_all(&data).await?;
                    Ok::<(), TransferError>(())
                }
            });

        tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::cancelled("buffer", name.clone())),
            result = reads => result?,
        }

        file.into_inner().sync_all().await?;
        let hash = accumulator.finalize()?;
        check_known_hash(source.as_ref(), &hash)?;

        tracing::debug!(source = %name, size, ranges = accumulator.total_chunks(), "Staged with ranged reads");
        self.staged(source.as_ref(), staging, size, hash, BufferStrategy::Hybrid)
            .await
    }

    /// One pass over the stream into a staging file, hashing as it goes
    async fn disk(
        &self,
        source: Arc<dyn TransferSource>,
        cancel: &CancellationToken,
    ) -> Result<PreparedSource> {
        let name = source.describe();
        let staging = self.staging_file(&name)?;
        let mut file = tokio::fs::File::from_std(staging.reopen()?);

        let mut reader = source.open_stream().await?;
        let (hash, size) = copy_hashing(&mut reader, Some(&mut file), cancel, &name).await?;
        file.sync_all().await?;

        if let Some(expected) = source.size() {
            check_size(source.as_ref(), expected, size)?;
        }
        check_known_hash(source.as_ref(), &hash)?;

        tracing::debug!(source = %name, size, "Staged to disk");
        self.staged(source.as_ref(), staging, size, hash, BufferStrategy::Disk)
            .await
    }

    fn staging_file(&self, name: &str) -> Result<NamedTempFile> {
        let created = match &self.config.temp_dir {
            Some(dir) => NamedTempFile::new_in(dir),
            None => NamedTempFile::new(),
        };
        created.map_err(|e| {
            TransferError::ResourceExhausted(format!("no staging file for {}: {}", name, e))
        })
    }

    async fn staged(
        &self,
        original: &dyn TransferSource,
        staging: NamedTempFile,
        size: u64,
        hash: String,
        strategy: BufferStrategy,
    ) -> Result<PreparedSource> {
        let local = LocalFileSource::open(staging.path()).await?;
        let source = StagedSource {
            name: original.describe(),
            modified_at: original.modified_at(),
            hash: hash.clone(),
            local,
            _staging: staging,
        };
        Ok(PreparedSource {
            source: Arc::new(source),
            size,
            content_hash: Some(hash),
            strategy,
        })
    }
}

// ============================================================================
// Staged Copy
// ============================================================================

/// A local staging copy standing in for the original source; the file is
/// removed when this is dropped
struct StagedSource {
    name: String,
    modified_at: Option<DateTime<Utc>>,
    hash: String,
    local: LocalFileSource,
    _staging: NamedTempFile,
}

#[async_trait]
impl TransferSource for StagedSource {
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn size(&self) -> Option<u64> {
        self.local.size()
    }

    fn known_hash(&self) -> Option<String> {
        Some(self.hash.clone())
    }

    fn modified_at(&self) -> Option<DateTime<Utc>> {
        self.modified_at
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            hash_known: true,
            ..self.local.capabilities()
        }
    }

    async fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        self.local.read_range(offset, length).await
    }

    async fn open_stream(&self) -> Result<BoxedReader> {
        self.local.open_stream().await
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Drain `reader`, hashing everything and copying it to `sink` if given
async fn copy_hashing(
    reader: &mut BoxedReader,
    mut sink: Option<&mut tokio::fs::File>,
    cancel: &CancellationToken,
    name: &str,
) -> Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::cancelled("read", name)),
            read = reader.read(&mut buf) => read?,
        };
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        if let Some(file) = sink.as_deref_mut() {
            file.write_all(&buf[..read]).await.map_err(|e| {
                TransferError::ResourceExhausted(format!("staging {}: {}", name, e))
            })?;
        }
        total += read as u64;
    }

    Ok((hex::encode(hasher.finalize()), total))
}

fn check_size(source: &dyn TransferSource, expected: u64, actual: u64) -> Result<()> {
    if expected != actual {
        return Err(TransferError::Integrity(format!(
            "{} yielded {} bytes, expected {}",
            source.describe(),
            actual,
            expected
        )));
    }
    Ok(())
}

fn check_known_hash(source: &dyn TransferSource, actual: &str) -> Result<()> {
    match source.known_hash() {
        Some(expected) if !expected.eq_ignore_ascii_case(actual) => Err(TransferError::HashMismatch {
            target: source.describe(),
            expected,
            actual: actual.to_string(),
        }),
        _ => Ok(()),
    }
}
