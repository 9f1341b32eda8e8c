//! Chunked Upload Engine
//!
//! A bounded pool of workers pulls chunk indices from a shared queue. Each
//! worker reads its byte range once, feeds the hash accumulator, hashes the
//! chunk and uploads it through the paced, retried call site. Workers report
//! on a channel; the coordinator owns the progress record and persists it
//! after every chunk transition.
//!
//! Chunks already uploaded by an earlier run are read and hashed but not
//! sent. If the local bytes no longer match the acknowledged hash the chunk
//! is queued for upload again.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::progress::ProgressStore;
use super::throughput::ThroughputMeter;
use super::types::{ChunkState, SessionProgress, UploadSession};
use crate::api::{Call, Remote};
use crate::config::{ChunkConfig, TimeoutConfig};
use crate::error::{Result, TransferError};
use crate::hash::{compute_hash, HashAccumulator};
use crate::pacer::endpoint;
use crate::source::TransferSource;

/// Worker pool bounds before the user ceiling applies
const MIN_OPTIMAL_WORKERS: u64 = 2;
const MAX_OPTIMAL_WORKERS: u64 = 8;

#[derive(Debug, Clone)]
struct WorkItem {
    index: u64,
    offset: u64,
    size: u64,
    /// Already on the provider with this hash; only read and verify
    verify: Option<String>,
}

#[derive(Debug)]
enum ChunkEvent {
    Started { index: u64 },
    Uploaded { index: u64, hash: String },
    Verified { index: u64 },
    Failed { index: u64, error: TransferError },
}

/// Everything a worker task needs, cheaply clonable
#[derive(Clone)]
struct WorkerContext {
    remote: Arc<Remote>,
    meter: Arc<ThroughputMeter>,
    source: Arc<dyn TransferSource>,
    accumulator: Arc<HashAccumulator>,
    queue: Arc<Mutex<VecDeque<WorkItem>>>,
    events: mpsc::UnboundedSender<ChunkEvent>,
    cancel: CancellationToken,
    session_id: Arc<str>,
    target: Arc<str>,
    integrity_retries: u32,
    timeouts: TimeoutConfig,
}

pub struct ChunkedUploader {
    remote: Arc<Remote>,
    progress: Arc<ProgressStore>,
    meter: Arc<ThroughputMeter>,
    config: ChunkConfig,
    timeouts: TimeoutConfig,
}

impl ChunkedUploader {
    pub fn new(
        remote: Arc<Remote>,
        progress: Arc<ProgressStore>,
        meter: Arc<ThroughputMeter>,
        config: ChunkConfig,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            remote,
            progress,
            meter,
            config,
            timeouts,
        }
    }

    /// Workers for a session: min(optimal for the chunk size, user ceiling,
    /// remaining work)
    pub fn worker_count(&self, chunk_size: u64, queued: usize) -> usize {
        let optimal = (self.config.max_chunk_size / chunk_size.max(1))
            .clamp(MIN_OPTIMAL_WORKERS, MAX_OPTIMAL_WORKERS) as usize;
        optimal.min(self.config.max_workers.max(1)).min(queued).max(1)
    }

    /// Transfer every chunk not yet uploaded; returns the SHA-256 of the
    /// whole source
    pub async fn run(
        &self,
        session: &UploadSession,
        source: Arc<dyn TransferSource>,
        progress: &mut SessionProgress,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let accumulator = Arc::new(HashAccumulator::new(session.size, session.chunk_size));

        // Leftovers from an interrupted run start over
        for chunk in progress.chunks.iter_mut() {
            if matches!(chunk.state, ChunkState::Uploading | ChunkState::Failed) {
                chunk.state = ChunkState::Pending;
            }
        }

        let queue: VecDeque<WorkItem> = progress
            .chunks
            .iter()
            .map(|chunk| WorkItem {
                index: chunk.index,
                offset: chunk.offset,
                size: chunk.size,
                verify: chunk
                    .is_uploaded()
                    .then(|| chunk.hash.clone().unwrap_or_default()),
            })
            .collect();

        let total = progress.total_chunks;
        let to_send = total - progress.uploaded_count();
        let workers = self.worker_count(session.chunk_size, queue.len());

        tracing::info!(
            session_id = %session.id,
            file_name = %session.name,
            chunks = total,
            skipped = total - to_send,
            workers,
            "Uploading chunks"
        );

        let child = cancel.child_token();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let context = WorkerContext {
            remote: self.remote.clone(),
            meter: self.meter.clone(),
            source,
            accumulator: accumulator.clone(),
            queue: Arc::new(Mutex::new(queue)),
            events: tx,
            cancel: child.clone(),
            session_id: Arc::from(session.id.as_str()),
            target: Arc::from(session.remote_path.as_str()),
            integrity_retries: self.config.integrity_retries.max(1),
            timeouts: self.timeouts.clone(),
        };

        let mut tasks = JoinSet::new();
        for _ in 0..workers {
            tasks.spawn(run_worker(context.clone()));
        }
        drop(context);

        let mut failure: Option<(u64, TransferError)> = None;
        while let Some(event) = rx.recv().await {
            let changed = match event {
                ChunkEvent::Started { index } => set_chunk(progress, index, ChunkState::Uploading, None),
                ChunkEvent::Uploaded { index, hash } => {
                    tracing::debug!(session_id = %session.id, chunk_index = index, "Chunk uploaded");
                    set_chunk(progress, index, ChunkState::Uploaded, Some(hash))
                }
                ChunkEvent::Verified { .. } => false,
                ChunkEvent::Failed { index, error } => {
                    if error.is_cancelled() {
                        set_chunk(progress, index, ChunkState::Pending, None)
                    } else {
                        tracing::warn!(
                            session_id = %session.id,
                            chunk_index = index,
                            error = %error,
                            "Chunk failed, stopping session"
                        );
                        if failure.is_none() {
                            failure = Some((index, error));
                            child.cancel();
                        }
                        set_chunk(progress, index, ChunkState::Failed, None)
                    }
                }
            };

            if changed {
                if let Err(e) = self.progress.save(progress).await {
                    tracing::warn!(session_id = %session.id, error = %e, "Could not persist chunk progress");
                    if failure.is_none() {
                        failure = Some((u64::MAX, e));
                        child.cancel();
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if failure.is_none() {
                    failure = Some((u64::MAX, TransferError::Worker(e.to_string())));
                }
            }
        }

        let completed = progress.uploaded_count();

        if cancel.is_cancelled() {
            tracing::info!(session_id = %session.id, completed, total, "Upload cancelled");
            return Err(TransferError::cancelled("upload", session.remote_path.clone()));
        }

        if let Some((index, error)) = failure {
            return Err(TransferError::ChunkFailed {
                session_id: session.id.clone(),
                chunk_index: index,
                completed,
                total,
                source: Box::new(error),
            });
        }

        if completed != total {
            return Err(TransferError::Integrity(format!(
                "session {} ended with {} of {} chunks uploaded",
                session.id, completed, total
            )));
        }

        accumulator.finalize()
    }
}

/// Update one chunk record; returns whether anything changed
fn set_chunk(progress: &mut SessionProgress, index: u64, state: ChunkState, hash: Option<String>) -> bool {
    let Some(chunk) = progress.chunks.iter_mut().find(|c| c.index == index) else {
        return false;
    };
    // A verified chunk only leaves Uploaded when it is sent again
    if chunk.state == ChunkState::Uploaded
        && matches!(state, ChunkState::Pending | ChunkState::Failed)
    {
        return false;
    }
    chunk.state = state;
    if hash.is_some() || state != ChunkState::Uploaded {
        chunk.hash = hash;
    }
    true
}

// ============================================================================
// Worker
// ============================================================================

async fn run_worker(ctx: WorkerContext) {
    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let Some(item) = ctx.queue.lock().pop_front() else {
            break;
        };

        let index = item.index;
        if let Err(error) = process_chunk(&ctx, item).await {
            let _ = ctx.events.send(ChunkEvent::Failed { index, error });
            break;
        }
    }
}

async fn process_chunk(ctx: &WorkerContext, item: WorkItem) -> Result<()> {
    let data = tokio::select! {
        _ = ctx.cancel.cancelled() => return Err(TransferError::cancelled("read", ctx.target.to_string())),
        data = ctx.source.read_range(item.offset, item.size) => data?,
    };

    ctx.accumulator.write_chunk(item.index, &data)?;
    let hash = compute_hash(&data);

    if let Some(expected) = &item.verify {
        if expected.eq_ignore_ascii_case(&hash) {
            let _ = ctx.events.send(ChunkEvent::Verified { index: item.index });
            return Ok(());
        }
        tracing::warn!(
            session_id = %ctx.session_id,
            chunk_index = item.index,
            "Uploaded chunk no longer matches source, re-queuing"
        );
    }

    let _ = ctx.events.send(ChunkEvent::Started { index: item.index });
    upload_with_verification(ctx, &item, &data, &hash).await?;
    let _ = ctx.events.send(ChunkEvent::Uploaded {
        index: item.index,
        hash,
    });
    Ok(())
}

/// Upload one chunk, re-sending it when the acknowledged hash differs
async fn upload_with_verification(ctx: &WorkerContext, item: &WorkItem, data: &[u8], hash: &str) -> Result<()> {
    let session_id: &str = &ctx.session_id;
    let (index, offset) = (item.index, item.offset);

    for attempt in 1..=ctx.integrity_retries {
        let call = Call::new(
            endpoint::UPLOAD_CHUNK,
            "upload_chunk",
            &ctx.target,
            ctx.timeouts.for_transfer(item.size),
        )
        .cancel(&ctx.cancel);

        let started = Instant::now();
        let ack = ctx
            .remote
            .call(call, |api, cred| async move {
                api.upload_chunk(&cred, session_id, index, offset, data, hash).await
            })
            .await?;
        ctx.meter.record(item.size, started.elapsed());

        if ack.hash.eq_ignore_ascii_case(hash) {
            return Ok(());
        }
        tracing::warn!(
            session_id,
            chunk_index = index,
            attempt,
            expected = hash,
            acknowledged = %ack.hash,
            "Chunk acknowledged with a different hash, re-uploading"
        );
    }

    Err(TransferError::Integrity(format!(
        "chunk {} of session {} acknowledged with a different hash {} times",
        index, session_id, ctx.integrity_retries
    )))
}
