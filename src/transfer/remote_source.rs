//! Objects on a provider read back as transfer sources

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

use crate::api::{Call, Remote, RemoteEntry};
use crate::config::TimeoutConfig;
use crate::error::{Result, TransferError};
use crate::pacer::endpoint;
use crate::source::{BoxedReader, SourceCapabilities, TransferSource};

/// A stored file, readable by range through the paced call site
#[derive(Clone)]
pub struct RemoteObjectSource {
    remote: Arc<Remote>,
    path: String,
    entry: RemoteEntry,
    timeouts: TimeoutConfig,
    /// Request size used by `open_stream`
    range_size: u64,
}

impl RemoteObjectSource {
    pub fn new(
        remote: Arc<Remote>,
        path: impl Into<String>,
        entry: RemoteEntry,
        timeouts: TimeoutConfig,
        range_size: u64,
    ) -> Self {
        Self {
            remote,
            path: path.into(),
            entry,
            timeouts,
            range_size: range_size.max(1),
        }
    }

    pub fn entry(&self) -> &RemoteEntry {
        &self.entry
    }
}

#[async_trait]
impl TransferSource for RemoteObjectSource {
    fn describe(&self) -> String {
        self.path.clone()
    }

    fn size(&self) -> Option<u64> {
        Some(self.entry.size)
    }

    fn known_hash(&self) -> Option<String> {
        self.entry.content_hash.clone()
    }

    fn modified_at(&self) -> Option<DateTime<Utc>> {
        Some(self.entry.modified_at)
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            sized: true,
            seekable: false,
            range_readable: true,
            hash_known: self.entry.content_hash.is_some(),
        }
    }

    async fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        if offset.saturating_add(length) > self.entry.size {
            return Err(TransferError::InvalidArgument(format!(
                "range {}+{} outside {} bytes of {}",
                offset, length, self.entry.size, self.path
            )));
        }

        let id = self.entry.id.as_str();
        let call = Call::new(
            endpoint::READ_RANGE,
            "read_range",
            &self.path,
            self.timeouts.for_transfer(length),
        );
        let data = self
            .remote
            .call(call, |api, cred| async move { api.read_range(&cred, id, offset, length).await })
            .await?;

        if data.len() as u64 != length {
            return Err(TransferError::Integrity(format!(
                "{} returned {} bytes for a {} byte range at {}",
                self.path,
                data.len(),
                length,
                offset
            )));
        }
        Ok(data)
    }

    /// Sequential ranged reads pumped through an in-process pipe
    ///
    /// A failed read closes the pipe early; readers see a short stream.
    async fn open_stream(&self) -> Result<BoxedReader> {
        let (mut writer, reader) = tokio::io::duplex(self.range_size as usize);
        let this = self.clone();

        tokio::spawn(async move {
            let mut offset = 0u64;
            while offset < this.entry.size {
                let length = this.range_size.min(this.entry.size - offset);
                let data = match this.read_range(offset, length).await {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::warn!(path = %this.path, offset, error = %e, "Remote stream read failed");
                        return;
                    }
                };
                if writer.write_all(&data).await.is_err() {
                    // Reader dropped
                    return;
                }
                offset += length;
            }
            let _ = writer.shutdown().await;
        });

        Ok(Box::new(reader))
    }
}
