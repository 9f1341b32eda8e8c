//! In-memory provider used by unit tests
//!
//! Keeps a directory tree, upload sessions and file contents in memory,
//! counts every call per operation and lets tests inject failures.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{
    ApiResult, ChunkAck, CompletionStatus, CreateSessionRequest, CreateSessionResponse,
    Credential, ListPage, RemoteEntry, StorageApi,
};
use crate::error::ApiError;
use crate::hash::compute_hash;

pub const ROOT_ID: &str = "root";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    GetEntry,
    ListChildren,
    CreateDir,
    Delete,
    Rename,
    Move,
    CreateSession,
    UploadChunk,
    UploadedChunks,
    UploadSingle,
    Complete,
    SessionStatus,
    AbortSession,
    ReadRange,
}

struct MockSession {
    parent_id: String,
    name: String,
    size: u64,
    content_hash: Option<String>,
    chunks: BTreeMap<u64, Vec<u8>>,
    /// Status polls left before an async completion finishes
    pending_polls: u32,
    result: Option<CompletionStatus>,
}

#[derive(Default)]
struct MockState {
    entries: HashMap<String, RemoteEntry>,
    contents: HashMap<String, Vec<u8>>,
    sessions: HashMap<String, MockSession>,
    calls: HashMap<Op, u32>,
    uploaded_chunk_log: Vec<u64>,
    failures: HashMap<Op, VecDeque<ApiError>>,
    chunk_failures: HashMap<u64, ApiError>,
    corrupt_acks: HashMap<u64, u32>,
    completion_polls: u32,
    page_size: usize,
    reject_single: bool,
}

/// A response parked between being computed and being returned
struct HeldCall {
    computed: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

pub struct MockStorage {
    state: Mutex<MockState>,
    held: Mutex<HashMap<Op, HeldCall>>,
}

impl Default for MockStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStorage {
    pub fn new() -> Self {
        let mut state = MockState {
            page_size: 100,
            ..Default::default()
        };
        state.entries.insert(
            ROOT_ID.to_string(),
            RemoteEntry {
                id: ROOT_ID.to_string(),
                parent_id: None,
                name: String::new(),
                is_dir: true,
                size: 0,
                content_hash: None,
                modified_at: Utc::now(),
            },
        );
        Self {
            state: Mutex::new(state),
            held: Mutex::new(HashMap::new()),
        }
    }

    // ========================================================================
    // Fixtures
    // ========================================================================

    pub fn add_dir(&self, parent_id: &str, name: &str) -> RemoteEntry {
        let mut state = self.state.lock();
        insert_entry(&mut state, parent_id, name, true, None)
    }

    pub fn add_file(&self, parent_id: &str, name: &str, content: &[u8]) -> RemoteEntry {
        let mut state = self.state.lock();
        insert_entry(&mut state, parent_id, name, false, Some(content.to_vec()))
    }

    pub fn content(&self, id: &str) -> Option<Vec<u8>> {
        self.state.lock().contents.get(id).cloned()
    }

    pub fn find(&self, parent_id: &str, name: &str) -> Option<RemoteEntry> {
        let state = self.state.lock();
        find_child(&state, parent_id, name).cloned()
    }

    pub fn set_page_size(&self, page_size: usize) {
        self.state.lock().page_size = page_size.max(1);
    }

    // ========================================================================
    // Failure Injection
    // ========================================================================

    /// Fail the next call of `op` with `error`; queued errors are used in order
    pub fn fail_next(&self, op: Op, error: ApiError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Fail every upload of chunk `index` until cleared
    pub fn fail_chunk(&self, index: u64, error: ApiError) {
        self.state.lock().chunk_failures.insert(index, error);
    }

    pub fn clear_chunk_failures(&self) {
        self.state.lock().chunk_failures.clear();
    }

    /// Acknowledge the next `times` uploads of chunk `index` with a wrong hash
    pub fn corrupt_ack(&self, index: u64, times: u32) {
        self.state.lock().corrupt_acks.insert(index, times);
    }

    /// Finalize answers "processing" and needs `polls` status calls
    pub fn set_completion_polls(&self, polls: u32) {
        self.state.lock().completion_polls = polls;
    }

    /// Park the next `op` response after it is computed. The first channel
    /// fires once the response is built; it goes out when the second fires.
    /// Only listings and ranged reads can be held.
    pub fn hold_next(&self, op: Op) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (computed, computed_rx) = oneshot::channel();
        let (release_tx, release) = oneshot::channel();
        self.held.lock().insert(op, HeldCall { computed, release });
        (computed_rx, release_tx)
    }

    /// Refuse one-request uploads with a 413
    pub fn reject_single_uploads(&self) {
        self.state.lock().reject_single = true;
    }

    /// Drop a session's stored chunks, as if the provider lost them
    pub fn forget_chunk(&self, session_id: &str, index: u64) {
        if let Some(session) = self.state.lock().sessions.get_mut(session_id) {
            session.chunks.remove(&index);
        }
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn count(&self, op: Op) -> u32 {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Indices of every accepted chunk upload, in arrival order
    pub fn uploaded_chunk_log(&self) -> Vec<u64> {
        self.state.lock().uploaded_chunk_log.clone()
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    fn begin(&self, op: Op) -> ApiResult<parking_lot::MutexGuard<'_, MockState>> {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_default() += 1;
        if let Some(error) = state.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            return Err(error);
        }
        Ok(state)
    }

    async fn release_held(&self, op: Op) {
        let held = self.held.lock().remove(&op);
        if let Some(held) = held {
            let _ = held.computed.send(());
            let _ = held.release.await;
        }
    }

    fn page(&self, parent_id: &str, page_token: Option<&str>) -> ApiResult<ListPage> {
        let state = self.begin(Op::ListChildren)?;
        require_dir(&state, parent_id)?;

        let mut children: Vec<RemoteEntry> = state
            .entries
            .values()
            .filter(|e| e.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));

        let start: usize = match page_token {
            Some(token) => token
                .parse()
                .map_err(|_| ApiError::http(400, "bad page token"))?,
            None => 0,
        };
        let end = (start + state.page_size).min(children.len());
        let next_page_token = (end < children.len()).then(|| end.to_string());

        Ok(ListPage {
            entries: children.get(start..end).map(|s| s.to_vec()).unwrap_or_default(),
            next_page_token,
        })
    }
}

fn insert_entry(
    state: &mut MockState,
    parent_id: &str,
    name: &str,
    is_dir: bool,
    content: Option<Vec<u8>>,
) -> RemoteEntry {
    let id = Uuid::new_v4().to_string();
    let entry = RemoteEntry {
        id: id.clone(),
        parent_id: Some(parent_id.to_string()),
        name: name.to_string(),
        is_dir,
        size: content.as_ref().map(|c| c.len() as u64).unwrap_or(0),
        content_hash: content.as_deref().map(compute_hash),
        modified_at: Utc::now(),
    };
    state.entries.insert(id.clone(), entry.clone());
    if let Some(content) = content {
        state.contents.insert(id, content);
    }
    entry
}

fn find_child<'a>(state: &'a MockState, parent_id: &str, name: &str) -> Option<&'a RemoteEntry> {
    state
        .entries
        .values()
        .find(|e| e.parent_id.as_deref() == Some(parent_id) && e.name == name)
}

fn not_found(what: &str) -> ApiError {
    ApiError::http(404, format!("{} not found", what)).with_code("NOT_FOUND")
}

fn conflict(name: &str) -> ApiError {
    ApiError::http(409, format!("{} already exists", name)).with_code("NAME_CONFLICT")
}

fn require_dir(state: &MockState, id: &str) -> ApiResult<()> {
    match state.entries.get(id) {
        Some(entry) if entry.is_dir => Ok(()),
        Some(_) => Err(ApiError::http(400, format!("{} is not a directory", id))),
        None => Err(not_found(id)),
    }
}

/// Finish a session whose chunks are all present
fn assemble(state: &mut MockState, session_id: &str) -> CompletionStatus {
    let Some(session) = state.sessions.get(session_id) else {
        return CompletionStatus::Failed {
            error: "unknown session".to_string(),
        };
    };

    let data: Vec<u8> = session.chunks.values().flatten().copied().collect();
    if data.len() as u64 != session.size {
        return CompletionStatus::Failed {
            error: format!("expected {} bytes, have {}", session.size, data.len()),
        };
    }
    if let Some(expected) = &session.content_hash {
        if *expected != compute_hash(&data) {
            return CompletionStatus::Failed {
                error: "content hash mismatch".to_string(),
            };
        }
    }

    let parent_id = session.parent_id.clone();
    let name = session.name.clone();
    let file = insert_entry(state, &parent_id, &name, false, Some(data));
    let status = CompletionStatus::Complete { file };
    if let Some(session) = state.sessions.get_mut(session_id) {
        session.result = Some(status.clone());
    }
    status
}

#[async_trait]
impl StorageApi for MockStorage {
    async fn get_entry(&self, _credential: &Credential, id: &str) -> ApiResult<RemoteEntry> {
        let state = self.begin(Op::GetEntry)?;
        state.entries.get(id).cloned().ok_or_else(|| not_found(id))
    }

    async fn list_children(
        &self,
        _credential: &Credential,
        parent_id: &str,
        page_token: Option<&str>,
    ) -> ApiResult<ListPage> {
        let page = self.page(parent_id, page_token)?;
        self.release_held(Op::ListChildren).await;
        Ok(page)
    }

    async fn create_dir(
        &self,
        _credential: &Credential,
        parent_id: &str,
        name: &str,
    ) -> ApiResult<RemoteEntry> {
        let mut state = self.begin(Op::CreateDir)?;
        require_dir(&state, parent_id)?;
        if find_child(&state, parent_id, name).is_some() {
            return Err(conflict(name));
        }
        Ok(insert_entry(&mut state, parent_id, name, true, None))
    }

    async fn delete_entry(&self, _credential: &Credential, id: &str) -> ApiResult<()> {
        let mut state = self.begin(Op::Delete)?;
        if state.entries.remove(id).is_none() {
            return Err(not_found(id));
        }
        state.contents.remove(id);

        // Drop descendants
        let mut doomed: HashSet<String> = HashSet::from([id.to_string()]);
        loop {
            let children: Vec<String> = state
                .entries
                .values()
                .filter(|e| e.parent_id.as_ref().is_some_and(|p| doomed.contains(p)))
                .filter(|e| !doomed.contains(&e.id))
                .map(|e| e.id.clone())
                .collect();
            if children.is_empty() {
                break;
            }
            doomed.extend(children);
        }
        for id in doomed {
            state.entries.remove(&id);
            state.contents.remove(&id);
        }
        Ok(())
    }

    async fn rename_entry(
        &self,
        _credential: &Credential,
        id: &str,
        new_name: &str,
    ) -> ApiResult<RemoteEntry> {
        let mut state = self.begin(Op::Rename)?;
        let parent_id = state
            .entries
            .get(id)
            .ok_or_else(|| not_found(id))?
            .parent_id
            .clone()
            .unwrap_or_default();
        if find_child(&state, &parent_id, new_name).is_some() {
            return Err(conflict(new_name));
        }
        let entry = state.entries.get_mut(id).ok_or_else(|| not_found(id))?;
        entry.name = new_name.to_string();
        entry.modified_at = Utc::now();
        Ok(entry.clone())
    }

    async fn move_entry(
        &self,
        _credential: &Credential,
        id: &str,
        new_parent_id: &str,
    ) -> ApiResult<RemoteEntry> {
        let mut state = self.begin(Op::Move)?;
        require_dir(&state, new_parent_id)?;
        let name = state.entries.get(id).ok_or_else(|| not_found(id))?.name.clone();
        if find_child(&state, new_parent_id, &name).is_some() {
            return Err(conflict(&name));
        }
        let entry = state.entries.get_mut(id).ok_or_else(|| not_found(id))?;
        entry.parent_id = Some(new_parent_id.to_string());
        Ok(entry.clone())
    }

    async fn create_session(
        &self,
        _credential: &Credential,
        request: &CreateSessionRequest,
    ) -> ApiResult<CreateSessionResponse> {
        let mut state = self.begin(Op::CreateSession)?;
        require_dir(&state, &request.parent_id)?;
        if find_child(&state, &request.parent_id, &request.name).is_some() {
            return Err(conflict(&request.name));
        }

        let session_id = Uuid::new_v4().to_string();

        let duplicate_of = request.content_hash.as_ref().and_then(|hash| {
            state
                .entries
                .values()
                .find(|e| !e.is_dir && e.content_hash.as_ref() == Some(hash))
                .map(|e| e.id.clone())
        });

        if let Some(source_id) = duplicate_of {
            let content = state.contents.get(&source_id).cloned().unwrap_or_default();
            let file = insert_entry(
                &mut state,
                &request.parent_id,
                &request.name,
                false,
                Some(content),
            );
            return Ok(CreateSessionResponse {
                session_id,
                is_duplicate: true,
                existing: Some(file),
            });
        }

        let pending_polls = state.completion_polls;
        state.sessions.insert(
            session_id.clone(),
            MockSession {
                parent_id: request.parent_id.clone(),
                name: request.name.clone(),
                size: request.size,
                content_hash: request.content_hash.clone(),
                chunks: BTreeMap::new(),
                pending_polls,
                result: None,
            },
        );

        Ok(CreateSessionResponse {
            session_id,
            is_duplicate: false,
            existing: None,
        })
    }

    async fn upload_chunk(
        &self,
        _credential: &Credential,
        session_id: &str,
        chunk_index: u64,
        _offset: u64,
        data: &[u8],
        _hash: &str,
    ) -> ApiResult<ChunkAck> {
        let mut state = self.begin(Op::UploadChunk)?;
        if let Some(error) = state.chunk_failures.get(&chunk_index) {
            return Err(error.clone());
        }

        let corrupt = match state.corrupt_acks.get_mut(&chunk_index) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        };

        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| not_found(session_id))?;
        session.chunks.insert(chunk_index, data.to_vec());
        state.uploaded_chunk_log.push(chunk_index);

        let hash = if corrupt {
            compute_hash(b"corrupted in transit")
        } else {
            compute_hash(data)
        };
        Ok(ChunkAck { chunk_index, hash })
    }

    async fn uploaded_chunks(
        &self,
        _credential: &Credential,
        session_id: &str,
    ) -> ApiResult<Vec<ChunkAck>> {
        let state = self.begin(Op::UploadedChunks)?;
        let session = state
            .sessions
            .get(session_id)
            .ok_or_else(|| not_found(session_id))?;
        Ok(session
            .chunks
            .iter()
            .map(|(index, data)| ChunkAck {
                chunk_index: *index,
                hash: compute_hash(data),
            })
            .collect())
    }

    async fn upload_single(
        &self,
        _credential: &Credential,
        session_id: &str,
        data: &[u8],
        _hash: &str,
    ) -> ApiResult<RemoteEntry> {
        let mut state = self.begin(Op::UploadSingle)?;
        if state.reject_single {
            return Err(ApiError::http(413, "payload too large"));
        }
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| not_found(session_id))?;
        session.chunks.clear();
        session.chunks.insert(0, data.to_vec());

        match assemble(&mut state, session_id) {
            CompletionStatus::Complete { file } => Ok(file),
            CompletionStatus::Failed { error } => Err(ApiError::http(400, error)),
            CompletionStatus::Processing => Err(ApiError::http(500, "unexpected state")),
        }
    }

    async fn complete_session(
        &self,
        _credential: &Credential,
        session_id: &str,
    ) -> ApiResult<CompletionStatus> {
        let mut state = self.begin(Op::Complete)?;
        let session = state
            .sessions
            .get(session_id)
            .ok_or_else(|| not_found(session_id))?;
        if let Some(result) = &session.result {
            return Ok(result.clone());
        }
        if session.pending_polls > 0 {
            return Ok(CompletionStatus::Processing);
        }
        Ok(assemble(&mut state, session_id))
    }

    async fn session_status(
        &self,
        _credential: &Credential,
        session_id: &str,
    ) -> ApiResult<CompletionStatus> {
        let mut state = self.begin(Op::SessionStatus)?;
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| not_found(session_id))?;
        if let Some(result) = &session.result {
            return Ok(result.clone());
        }
        if session.pending_polls > 1 {
            session.pending_polls -= 1;
            return Ok(CompletionStatus::Processing);
        }
        session.pending_polls = 0;
        Ok(assemble(&mut state, session_id))
    }

    async fn abort_session(&self, _credential: &Credential, session_id: &str) -> ApiResult<()> {
        let mut state = self.begin(Op::AbortSession)?;
        state.sessions.remove(session_id);
        Ok(())
    }

    async fn read_range(
        &self,
        _credential: &Credential,
        id: &str,
        offset: u64,
        length: u64,
    ) -> ApiResult<Vec<u8>> {
        let data = {
            let state = self.begin(Op::ReadRange)?;
            let content = state.contents.get(id).ok_or_else(|| not_found(id))?;
            let start = (offset as usize).min(content.len());
            let end = (offset.saturating_add(length) as usize).min(content.len());
            content[start..end].to_vec()
        };
        self.release_held(Op::ReadRange).await;
        Ok(data)
    }
}

// ============================================================================
// Test Wiring
// ============================================================================

/// Engine configuration with millisecond pacing and tiny chunks
pub fn fast_config() -> crate::config::EngineConfig {
    use crate::config::{EngineConfig, PacerClassConfig};
    use std::time::Duration;

    let mut config = EngineConfig {
        root_id: ROOT_ID.to_string(),
        ..EngineConfig::default()
    };
    for class in config.pacer.classes.values_mut() {
        *class = PacerClassConfig::new(1, 20, 2);
    }
    config.retry.base_delay = Duration::from_millis(5);
    config.retry.max_delay = Duration::from_millis(50);
    config.chunk.min_chunk_size = 1024;
    config.chunk.max_chunk_size = 1024;
    config.chunk.default_chunk_size = 1024;
    config.chunk.single_shot_limit = 1024;
    config.chunk.max_chunks = 1_000;
    config.completion.poll_step = Duration::from_millis(5);
    config.completion.poll_plateau = Duration::from_millis(20);
    config.cross_store.memory_threshold = 4 * 1024;
    config.cross_store.hybrid_threshold = 16 * 1024;
    config.cross_store.range_size = 1024;
    config.concurrency.download_range_size = 1024;
    config
}

pub fn test_remote(
    mock: &std::sync::Arc<MockStorage>,
    config: &crate::config::EngineConfig,
) -> std::sync::Arc<super::Remote> {
    use crate::pacer::PacerRegistry;
    use crate::retry::RetryPolicy;

    std::sync::Arc::new(super::Remote::new(
        mock.clone(),
        std::sync::Arc::new(super::StaticCredentials::new("test-token")),
        PacerRegistry::new(&config.pacer),
        RetryPolicy::new(config.retry.clone()),
    ))
}
