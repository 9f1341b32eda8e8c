//! Upload session types

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::api::RemoteEntry;

// ============================================================================
// States
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    Transferring,
    Completing,
    Done,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    Pending,
    Uploading,
    Uploaded,
    /// Last attempt failed; goes back to pending on the next run
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStrategy {
    /// Whole content in one request
    SingleShot,
    Chunked,
}

// ============================================================================
// Progress Records
// ============================================================================

/// Transfer state of one chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub index: u64,
    pub offset: u64,
    pub size: u64,
    /// SHA-256 of the chunk as acknowledged by the provider
    pub hash: Option<String>,
    pub state: ChunkState,
}

impl ChunkRecord {
    pub fn is_uploaded(&self) -> bool {
        self.state == ChunkState::Uploaded
    }
}

/// Persisted progress of a chunked session, keyed by session id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionProgress {
    pub session_id: String,
    /// Identifies the source/destination pair across restarts
    pub resume_key: String,
    pub parent_id: String,
    pub name: String,
    pub remote_path: String,
    pub size: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub content_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub chunks: Vec<ChunkRecord>,
}

impl SessionProgress {
    /// Fresh plan for `session`: every chunk pending
    pub fn plan(session: &UploadSession) -> Self {
        let chunk_size = session.chunk_size;
        let chunks = (0..session.total_chunks)
            .map(|index| {
                let offset = index * chunk_size;
                ChunkRecord {
                    index,
                    offset,
                    size: chunk_size.min(session.size - offset),
                    hash: None,
                    state: ChunkState::Pending,
                }
            })
            .collect();

        Self {
            session_id: session.id.clone(),
            resume_key: session.resume_key.clone(),
            parent_id: session.parent_id.clone(),
            name: session.name.clone(),
            remote_path: session.remote_path.clone(),
            size: session.size,
            chunk_size,
            total_chunks: session.total_chunks,
            content_hash: session.content_hash.clone(),
            created_at: session.created_at,
            chunks,
        }
    }

    pub fn uploaded_count(&self) -> u64 {
        self.chunks.iter().filter(|c| c.is_uploaded()).count() as u64
    }

    pub fn is_complete(&self) -> bool {
        self.uploaded_count() == self.total_chunks
    }
}

// ============================================================================
// Requests and Results
// ============================================================================

/// What the caller wants uploaded, and where
#[derive(Debug, Clone)]
pub struct UploadTarget {
    pub parent_id: String,
    pub name: String,
    /// Normalized remote path of the new file
    pub remote_path: String,
    pub size: u64,
    pub content_hash: Option<String>,
    /// Stable identity of the source (path, size, mtime)
    pub source_key: String,
}

/// A transfer the provider has confirmed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferObject {
    pub remote_path: String,
    pub file_id: String,
    pub size: u64,
    pub content_hash: Option<String>,
    pub modified_at: DateTime<Utc>,
    pub is_dir: bool,
}

impl TransferObject {
    pub fn from_entry(remote_path: &str, entry: &RemoteEntry) -> Self {
        Self {
            remote_path: remote_path.to_string(),
            file_id: entry.id.clone(),
            size: entry.size,
            content_hash: entry.content_hash.clone(),
            modified_at: entry.modified_at,
            is_dir: entry.is_dir,
        }
    }
}

// ============================================================================
// Session Handle
// ============================================================================

/// One in-flight upload
///
/// Size and chunk size are fixed at open. State and result change as the
/// session runs; `run_lock` keeps two callers from driving it at once.
#[derive(Debug)]
pub struct UploadSession {
    pub id: String,
    pub parent_id: String,
    /// Final name, after collision resolution
    pub name: String,
    pub remote_path: String,
    pub size: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub content_hash: Option<String>,
    pub strategy: UploadStrategy,
    pub resume_key: String,
    pub created_at: DateTime<Utc>,
    /// Chunks already on the provider when the session was opened
    pub resumed_chunks: u64,
    state: Mutex<SessionState>,
    result: Mutex<Option<TransferObject>>,
    deduplicated: AtomicBool,
    pub(crate) run_lock: tokio::sync::Mutex<()>,
}

impl UploadSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        target: &UploadTarget,
        name: String,
        remote_path: String,
        chunk_size: u64,
        strategy: UploadStrategy,
        resume_key: String,
        resumed_chunks: u64,
    ) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            id,
            parent_id: target.parent_id.clone(),
            name,
            remote_path,
            size: target.size,
            chunk_size,
            total_chunks: target.size.div_ceil(chunk_size),
            content_hash: target.content_hash.clone(),
            strategy,
            resume_key,
            created_at: Utc::now(),
            resumed_chunks,
            state: Mutex::new(SessionState::Initializing),
            result: Mutex::new(None),
            deduplicated: AtomicBool::new(false),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    /// Confirmed result once the session is done
    pub fn result(&self) -> Option<TransferObject> {
        self.result.lock().clone()
    }

    pub(crate) fn finish(&self, object: TransferObject) {
        *self.result.lock() = Some(object);
        self.set_state(SessionState::Done);
    }

    /// Finished by a provider dedup hit, without sending bytes
    pub(crate) fn finish_deduplicated(&self, object: TransferObject) {
        self.deduplicated.store(true, Ordering::Relaxed);
        self.finish(object);
    }

    pub fn is_deduplicated(&self) -> bool {
        self.deduplicated.load(Ordering::Relaxed)
    }
}
