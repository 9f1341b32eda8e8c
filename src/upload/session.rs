//! Upload Session Manager
//!
//! Opens provider sessions, picks single-shot or chunked transfer, resolves
//! name collisions and finds resumable progress. A hash sent with the
//! handshake lets the provider answer with an existing copy, in which case
//! the session is done before any byte moves.
//!
//! Open sessions are indexed by (parent, name, size, hash) so a second open
//! for the same content returns the session already in flight.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::chunked::ChunkedUploader;
use super::completion::Finalizer;
use super::progress::ProgressStore;
use super::throughput::ThroughputMeter;
use super::types::{
    ChunkState, SessionProgress, SessionState, TransferObject, UploadSession, UploadStrategy,
    UploadTarget,
};
use crate::api::{Call, CreateSessionRequest, CreateSessionResponse, Remote};
use crate::config::{ChunkConfig, EngineConfig, TimeoutConfig};
use crate::error::{ErrorCategory, Result, TransferError};
use crate::hash::compute_hash;
use crate::pacer::endpoint;
use crate::path::{join_path, numbered_name, parent_path, timestamped_name, ROOT};
use crate::source::{MemorySource, TransferSource};

/// Identity of an open request, used to collapse duplicate opens
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    parent_id: String,
    name: String,
    size: u64,
    content_hash: Option<String>,
}

impl From<&UploadTarget> for SessionKey {
    fn from(target: &UploadTarget) -> Self {
        Self {
            parent_id: target.parent_id.clone(),
            name: target.name.clone(),
            size: target.size,
            content_hash: target.content_hash.as_ref().map(|h| h.to_ascii_lowercase()),
        }
    }
}

/// Key under which progress for a source/destination pair is found again
fn resume_key(target: &UploadTarget) -> String {
    format!(
        "{}\n{}\n{}\n{}",
        target.source_key, target.parent_id, target.name, target.size
    )
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionManagerInner>,
}

struct SessionManagerInner {
    remote: Arc<Remote>,
    progress: Arc<ProgressStore>,
    meter: Arc<ThroughputMeter>,
    uploader: ChunkedUploader,
    finalizer: Finalizer,
    config: ChunkConfig,
    timeouts: TimeoutConfig,
    active: RwLock<HashMap<SessionKey, Arc<UploadSession>>>,
    open_locks: parking_lot::Mutex<HashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(
        remote: Arc<Remote>,
        progress: Arc<ProgressStore>,
        meter: Arc<ThroughputMeter>,
        config: &EngineConfig,
    ) -> Self {
        let uploader = ChunkedUploader::new(
            remote.clone(),
            progress.clone(),
            meter.clone(),
            config.chunk.clone(),
            config.timeouts.clone(),
        );
        let finalizer = Finalizer::new(
            remote.clone(),
            config.completion.clone(),
            config.timeouts.clone(),
        );

        Self {
            inner: Arc::new(SessionManagerInner {
                remote,
                progress,
                meter,
                uploader,
                finalizer,
                config: config.chunk.clone(),
                timeouts: config.timeouts.clone(),
                active: RwLock::new(HashMap::new()),
                open_locks: parking_lot::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of sessions opened and not yet finished
    pub async fn active_count(&self) -> usize {
        self.inner.active.read().await.len()
    }

    // ========================================================================
    // Open
    // ========================================================================

    /// Open (or resume, or reuse) a session for `target`
    ///
    /// A dedup hit returns a session that is already done.
    pub async fn open(
        &self,
        target: &UploadTarget,
        cancel: &CancellationToken,
    ) -> Result<Arc<UploadSession>> {
        let key = SessionKey::from(target);
        let lock = self
            .inner
            .open_locks
            .lock()
            .entry(key.clone())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        if let Some(session) = self.inner.active.read().await.get(&key) {
            if !session.state().is_terminal() {
                tracing::debug!(session_id = %session.id, "Reusing open session");
                return Ok(session.clone());
            }
        }

        let resume_key = resume_key(target);
        if let Some(session) = self.resume(target, &resume_key, cancel).await? {
            let session = Arc::new(session);
            self.inner.active.write().await.insert(key, session.clone());
            return Ok(session);
        }

        let chunk_size = self.chunk_size_for(target)?;
        let strategy = if target.size < self.inner.config.single_shot_limit {
            UploadStrategy::SingleShot
        } else {
            UploadStrategy::Chunked
        };

        let (response, name) = self
            .create_remote_session(target, chunk_size, cancel)
            .await?;
        let remote_path = if target.remote_path.starts_with(ROOT) {
            let dir = parent_path(&target.remote_path).unwrap_or_else(|| ROOT.to_string());
            join_path(&dir, &name)
        } else {
            // Only the parent id is known
            name.clone()
        };

        let session = Arc::new(UploadSession::new(
            response.session_id,
            target,
            name,
            remote_path,
            chunk_size,
            strategy,
            resume_key,
            0,
        ));

        if response.is_duplicate {
            let existing = response.existing.ok_or_else(|| {
                TransferError::Integrity(format!(
                    "provider reported a duplicate of {} without the stored file",
                    session.remote_path
                ))
            })?;
            session.finish_deduplicated(TransferObject::from_entry(&session.remote_path, &existing));
            tracing::info!(
                session_id = %session.id,
                file_name = %session.name,
                file_size = session.size,
                "Content already stored, upload skipped"
            );
            return Ok(session);
        }

        if strategy == UploadStrategy::Chunked {
            self.inner
                .progress
                .save(&SessionProgress::plan(&session))
                .await?;
        }

        tracing::info!(
            session_id = %session.id,
            file_name = %session.name,
            file_size = session.size,
            chunk_size = session.chunk_size,
            chunks = session.total_chunks,
            strategy = ?strategy,
            "Upload session opened"
        );

        self.inner.active.write().await.insert(key, session.clone());
        Ok(session)
    }

    /// Chunk size from measured throughput, grown if the count would exceed
    /// the ceiling
    fn chunk_size_for(&self, target: &UploadTarget) -> Result<u64> {
        let config = &self.inner.config;
        let chunk_size = self.inner.meter.chunk_size(
            config.target_chunk_duration,
            config.min_chunk_size,
            config.max_chunk_size,
            config.default_chunk_size,
        );

        if target.size.div_ceil(chunk_size) <= config.max_chunks {
            return Ok(chunk_size);
        }

        let needed = target.size.div_ceil(config.max_chunks.max(1));
        if needed > config.max_chunk_size {
            return Err(TransferError::TooManyChunks {
                target: target.remote_path.clone(),
                chunks: target.size.div_ceil(config.max_chunk_size),
                max: config.max_chunks,
            });
        }
        Ok(needed)
    }

    /// Handshake under the original name, then `name (n)`, then a timestamped
    /// name
    async fn create_remote_session(
        &self,
        target: &UploadTarget,
        chunk_size: u64,
        cancel: &CancellationToken,
    ) -> Result<(CreateSessionResponse, String)> {
        let max = self.inner.config.max_name_attempts;
        let candidates = std::iter::once(target.name.clone())
            .chain((1..=max).map(|n| numbered_name(&target.name, n)))
            .chain(std::iter::once(timestamped_name(
                &target.name,
                Utc::now().timestamp(),
            )));

        for name in candidates {
            let request = CreateSessionRequest {
                parent_id: target.parent_id.clone(),
                name: name.clone(),
                size: target.size,
                content_hash: target.content_hash.clone(),
                chunk_size,
                total_chunks: target.size.div_ceil(chunk_size),
            };
            let request = &request;
            let call = Call::new(
                endpoint::CREATE_SESSION,
                "open_session",
                &target.remote_path,
                self.inner.timeouts.metadata,
            )
            .cancel(cancel);

            match self
                .inner
                .remote
                .call(call, |api, cred| async move { api.create_session(&cred, request).await })
                .await
            {
                Ok(response) => return Ok((response, name)),
                Err(e) if e.category() == ErrorCategory::Conflict => {
                    tracing::debug!(file_name = %name, "Name taken, trying another");
                }
                Err(e) => return Err(e),
            }
        }

        Err(TransferError::NameConflict {
            parent_id: target.parent_id.clone(),
            name: target.name.clone(),
            attempts: max + 2,
        })
    }

    /// Reload persisted progress and check it against what the provider
    /// still holds
    async fn resume(
        &self,
        target: &UploadTarget,
        resume_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<UploadSession>> {
        let progress_store = &self.inner.progress;
        let Some(mut progress) = progress_store.find(resume_key).await? else {
            return Ok(None);
        };

        let hash_differs = match (&progress.content_hash, &target.content_hash) {
            (Some(saved), Some(wanted)) => !saved.eq_ignore_ascii_case(wanted),
            _ => false,
        };
        if progress.size != target.size || progress.parent_id != target.parent_id || hash_differs {
            tracing::info!(session_id = %progress.session_id, "Saved progress no longer matches source");
            progress_store.remove(&progress).await?;
            return Ok(None);
        }

        let session_id = progress.session_id.as_str();
        let call = Call::new(
            endpoint::UPLOADED_CHUNKS,
            "resume",
            &target.remote_path,
            self.inner.timeouts.metadata,
        )
        .cancel(cancel);
        let acks = match self
            .inner
            .remote
            .call(call, |api, cred| async move { api.uploaded_chunks(&cred, session_id).await })
            .await
        {
            Ok(acks) => acks,
            Err(e) if e.category() == ErrorCategory::NotFound => {
                tracing::info!(session_id, "Provider session expired, starting over");
                progress_store.remove(&progress).await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let acked: HashMap<u64, String> = acks
            .into_iter()
            .map(|ack| (ack.chunk_index, ack.hash))
            .collect();

        let mut requeued = 0u64;
        for chunk in progress.chunks.iter_mut() {
            let confirmed = chunk.is_uploaded()
                && matches!(
                    (acked.get(&chunk.index), &chunk.hash),
                    (Some(remote), Some(local)) if remote.eq_ignore_ascii_case(local)
                );
            if !confirmed {
                if chunk.is_uploaded() {
                    requeued += 1;
                }
                chunk.state = ChunkState::Pending;
                chunk.hash = None;
            }
        }
        progress_store.save(&progress).await?;

        let session = UploadSession::new(
            progress.session_id.clone(),
            target,
            progress.name.clone(),
            progress.remote_path.clone(),
            progress.chunk_size,
            UploadStrategy::Chunked,
            resume_key.to_string(),
            progress.uploaded_count(),
        );

        tracing::info!(
            session_id = %session.id,
            file_name = %session.name,
            resumed = session.resumed_chunks,
            requeued,
            chunks = session.total_chunks,
            "Resuming upload session"
        );
        Ok(Some(session))
    }

    // ========================================================================
    // Run
    // ========================================================================

    /// Transfer the content of `source` through `session` and confirm it
    pub async fn run(
        &self,
        session: &Arc<UploadSession>,
        source: Arc<dyn TransferSource>,
        cancel: &CancellationToken,
    ) -> Result<TransferObject> {
        let _running = session.run_lock.lock().await;
        if let Some(object) = session.result() {
            return Ok(object);
        }

        let outcome = match session.strategy {
            UploadStrategy::SingleShot => self.run_single(session, source, cancel).await,
            UploadStrategy::Chunked => self.run_chunked(session, source, cancel).await,
        };

        match outcome {
            Ok(object) => {
                session.finish(object.clone());
                self.release(session).await;
                tracing::info!(
                    session_id = %session.id,
                    file_name = %session.name,
                    file_id = %object.file_id,
                    file_size = object.size,
                    "Upload complete"
                );
                Ok(object)
            }
            Err(e) => {
                self.fail(session, &e).await;
                Err(e)
            }
        }
    }

    async fn run_single(
        &self,
        session: &UploadSession,
        source: Arc<dyn TransferSource>,
        cancel: &CancellationToken,
    ) -> Result<TransferObject> {
        session.set_state(SessionState::Transferring);
        let data = read_all(source.as_ref(), session.size).await?;
        let hash = compute_hash(&data);
        check_declared_hash(session, &hash)?;

        let session_id = session.id.as_str();
        let (bytes, digest) = (data.as_slice(), hash.as_str());

        for attempt in 1..=self.inner.config.integrity_retries.max(1) {
            let call = Call::new(
                endpoint::UPLOAD_SINGLE,
                "upload",
                &session.remote_path,
                self.inner.timeouts.for_transfer(session.size),
            )
            .cancel(cancel);

            let outcome = self
                .inner
                .remote
                .call(call, |api, cred| async move {
                    api.upload_single(&cred, session_id, bytes, digest).await
                })
                .await;

            match outcome {
                Ok(entry) => {
                    let stored = entry.content_hash.as_deref().unwrap_or(digest);
                    if stored.eq_ignore_ascii_case(digest) && entry.size == session.size {
                        return Ok(TransferObject::from_entry(&session.remote_path, &entry));
                    }
                    tracing::warn!(
                        session_id,
                        attempt,
                        expected = digest,
                        stored,
                        "Stored file does not match, discarding"
                    );
                    self.delete_remote(&entry.id, &session.remote_path).await;
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        session_id,
                        error = %e,
                        "Single-shot upload failed, falling back to chunks"
                    );
                    let source = Arc::new(MemorySource::new(session.name.clone(), data));
                    return self.run_chunked(session, source, cancel).await;
                }
            }
        }

        Err(TransferError::HashMismatch {
            target: session.remote_path.clone(),
            expected: hash,
            actual: "differs from stored file".to_string(),
        })
    }

    async fn run_chunked(
        &self,
        session: &UploadSession,
        source: Arc<dyn TransferSource>,
        cancel: &CancellationToken,
    ) -> Result<TransferObject> {
        if !source.capabilities().supports_ranges() {
            return Err(TransferError::InvalidArgument(format!(
                "{} cannot be read by range",
                source.describe()
            )));
        }
        session.set_state(SessionState::Transferring);

        let progress_store = &self.inner.progress;
        let mut progress = match progress_store.load(&session.id).await? {
            Some(p) if p.size == session.size && p.chunk_size == session.chunk_size => p,
            _ => {
                let plan = SessionProgress::plan(session);
                progress_store.save(&plan).await?;
                plan
            }
        };

        let digest = self
            .inner
            .uploader
            .run(session, source, &mut progress, cancel)
            .await?;
        check_declared_hash(session, &digest)?;

        session.set_state(SessionState::Completing);
        let file = self.inner.finalizer.complete(session, cancel).await?;

        let stored = file.content_hash.as_deref().unwrap_or(&digest);
        if file.size != session.size || !stored.eq_ignore_ascii_case(&digest) {
            self.delete_remote(&file.id, &session.remote_path).await;
            return Err(TransferError::HashMismatch {
                target: session.remote_path.clone(),
                expected: digest.clone(),
                actual: format!("{} ({} bytes)", stored, file.size),
            });
        }

        progress_store.remove(&progress).await?;
        Ok(TransferObject::from_entry(&session.remote_path, &file))
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    async fn release(&self, session: &Arc<UploadSession>) {
        self.inner
            .active
            .write()
            .await
            .retain(|_, open| !Arc::ptr_eq(open, session));
        self.inner
            .open_locks
            .lock()
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Forget a session that will not be run; saved progress is kept
    pub async fn detach(&self, session: &Arc<UploadSession>) {
        if session.result().is_none() {
            session.set_state(SessionState::Aborted);
        }
        self.release(session).await;
    }

    /// Drop the session handle; abandon the provider session unless the
    /// failure can be resumed
    async fn fail(&self, session: &Arc<UploadSession>, error: &TransferError) {
        session.set_state(SessionState::Aborted);
        self.release(session).await;

        let resumable = !matches!(
            error,
            TransferError::CompletionFailed { .. }
                | TransferError::HashMismatch { .. }
                | TransferError::IncompleteCoverage { .. }
        );
        if resumable {
            tracing::info!(session_id = %session.id, error = %error, "Upload stopped, progress kept");
            return;
        }

        tracing::warn!(session_id = %session.id, error = %error, "Abandoning upload session");
        let session_id = session.id.as_str();
        let call = Call::new(
            endpoint::ABORT_SESSION,
            "abort",
            &session.remote_path,
            self.inner.timeouts.metadata,
        );
        if let Err(e) = self
            .inner
            .remote
            .call(call, |api, cred| async move { api.abort_session(&cred, session_id).await })
            .await
        {
            tracing::debug!(session_id, error = %e, "Abort failed");
        }

        match self.inner.progress.load(session_id).await {
            Ok(Some(progress)) => {
                if let Err(e) = self.inner.progress.remove(&progress).await {
                    tracing::warn!(session_id, error = %e, "Could not drop progress record");
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(session_id, error = %e, "Could not read progress record"),
        }
    }

    async fn delete_remote(&self, id: &str, remote_path: &str) {
        let call = Call::new(
            endpoint::DELETE,
            "delete",
            remote_path,
            self.inner.timeouts.metadata,
        );
        if let Err(e) = self
            .inner
            .remote
            .call(call, |api, cred| async move { api.delete_entry(&cred, id).await })
            .await
        {
            tracing::warn!(file_id = id, error = %e, "Could not delete mismatched file");
        }
    }
}

fn check_declared_hash(session: &UploadSession, actual: &str) -> Result<()> {
    match &session.content_hash {
        Some(expected) if !expected.eq_ignore_ascii_case(actual) => Err(TransferError::HashMismatch {
            target: session.remote_path.clone(),
            expected: expected.clone(),
            actual: actual.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Whole content of a source known to be `size` bytes
async fn read_all(source: &dyn TransferSource, size: u64) -> Result<Vec<u8>> {
    if source.capabilities().supports_ranges() {
        return source.read_range(0, size).await;
    }

    let reader = source.open_stream().await?;
    let mut data = Vec::with_capacity(size as usize);
    reader.take(size.saturating_add(1)).read_to_end(&mut data).await?;
    if data.len() as u64 != size {
        return Err(TransferError::Integrity(format!(
            "{} yielded {} bytes, expected {}",
            source.describe(),
            data.len(),
            size
        )));
    }
    Ok(data)
}
