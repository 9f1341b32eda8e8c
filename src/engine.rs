//! Engine context
//!
//! One [`TransferEngine`] owns everything that would otherwise be global:
//! the pacer registry and retry policy (inside [`Remote`]), the metadata
//! caches, the progress store, the session manager and the upload/download
//! slots. It is cheap to clone and safe to share between tasks.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

use crate::api::{Call, CredentialProvider, ListPage, Remote, RemoteEntry, StorageApi};
use crate::cache::{KvStore, MemoryKvStore, MetadataCache, Mutation, NamespacedStore, PathEntry, SqliteKvStore};
use crate::config::EngineConfig;
use crate::error::{ErrorCategory, Result, TransferError};
use crate::hash::HashAccumulator;
use crate::pacer::{endpoint, PacerRegistry};
use crate::path::{file_name, join_path, normalize_path, parent_path, ROOT};
use crate::retry::RetryPolicy;
use crate::source::{LocalFileSource, TransferSource};
use crate::transfer::{BufferStrategy, RemoteObjectSource, TransferSelector};
use crate::upload::{ProgressStore, SessionManager, ThroughputMeter, TransferObject, UploadTarget};

/// Key-value stores backing the caches and upload progress
pub struct EngineStores {
    pub progress: Arc<dyn KvStore>,
    pub cache: MetadataCache,
}

impl EngineStores {
    pub fn in_memory(config: &EngineConfig) -> Self {
        Self {
            progress: Arc::new(MemoryKvStore::new(config.cache.max_entries)),
            cache: MetadataCache::in_memory(config.cache.clone()),
        }
    }

    /// Every store as a namespace of one shared database
    pub fn shared(store: Arc<dyn KvStore>, config: &EngineConfig) -> Self {
        let namespace = |name: &str| -> Arc<dyn KvStore> {
            Arc::new(NamespacedStore::new(store.clone(), name))
        };
        Self {
            progress: namespace("upload"),
            cache: MetadataCache::new(
                namespace("parents"),
                namespace("listings"),
                namespace("paths"),
                config.cache.clone(),
            ),
        }
    }
}

#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    remote: Arc<Remote>,
    cache: MetadataCache,
    sessions: SessionManager,
    selector: TransferSelector,
    upload_slots: Semaphore,
    download_slots: Semaphore,
}

impl TransferEngine {
    /// Engine with in-memory caches and progress
    pub fn new(
        config: EngineConfig,
        api: Arc<dyn StorageApi>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let stores = EngineStores::in_memory(&config);
        Self::with_stores(config, api, credentials, stores)
    }

    /// Engine whose caches and upload progress live in the SQLite database
    /// named by `progress_db`, so interrupted uploads resume after a restart
    pub async fn connect(
        config: EngineConfig,
        api: Arc<dyn StorageApi>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        let stores = match &config.progress_db {
            Some(url) => {
                let db = SqliteKvStore::connect(url).await?;
                tracing::info!(database = %url, "Progress store opened");
                EngineStores::shared(Arc::new(db), &config)
            }
            None => EngineStores::in_memory(&config),
        };
        Ok(Self::with_stores(config, api, credentials, stores))
    }

    pub fn with_stores(
        config: EngineConfig,
        api: Arc<dyn StorageApi>,
        credentials: Arc<dyn CredentialProvider>,
        stores: EngineStores,
    ) -> Self {
        let remote = Arc::new(Remote::new(
            api,
            credentials,
            PacerRegistry::new(&config.pacer),
            RetryPolicy::new(config.retry.clone()),
        ));
        let progress = Arc::new(ProgressStore::new(stores.progress, config.chunk.session_ttl));
        let sessions = SessionManager::new(
            remote.clone(),
            progress,
            Arc::new(ThroughputMeter::default()),
            &config,
        );
        let selector = TransferSelector::new(config.cross_store.clone(), config.chunk.prehash_limit);

        Self {
            inner: Arc::new(EngineInner {
                upload_slots: Semaphore::new(config.concurrency.max_concurrent_uploads.max(1)),
                download_slots: Semaphore::new(config.concurrency.max_concurrent_downloads.max(1)),
                remote,
                cache: stores.cache,
                sessions,
                selector,
                config,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn cache(&self) -> &MetadataCache {
        &self.inner.cache
    }

    fn root_entry(&self) -> PathEntry {
        PathEntry {
            id: self.inner.config.root_id.clone(),
            is_dir: true,
            parent_id: None,
        }
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Identifier of the entry at `path`, through the path cache
    pub async fn resolve_path(&self, path: &str) -> Result<PathEntry> {
        let path = normalize_path(path)?;
        let mut current = self.root_entry();
        let mut current_path = ROOT.to_string();

        for segment in segments(&path) {
            let next_path = join_path(&current_path, segment);
            current = self
                .child_entry(&current, &current_path, segment, &next_path)
                .await?
                .ok_or_else(|| TransferError::NotFound(next_path.clone()))?;
            current_path = next_path;
        }
        Ok(current)
    }

    /// One page of a directory listing, through the listing cache
    pub async fn list_page(&self, parent_id: &str, cursor: Option<&str>) -> Result<ListPage> {
        let cache = &self.inner.cache;
        if let Some(page) = cache.listing(parent_id, cursor).await? {
            return Ok(page);
        }

        let seen = cache.generation().await;
        let call = Call::new(
            endpoint::LIST_CHILDREN,
            "list",
            parent_id,
            self.inner.config.timeouts.metadata,
        );
        match self
            .inner
            .remote
            .call(call, |api, cred| async move { api.list_children(&cred, parent_id, cursor).await })
            .await
        {
            Ok(page) => {
                cache.store_listing(seen, parent_id, cursor, &page).await?;
                cache.set_parent_valid(seen, parent_id, true).await?;
                Ok(page)
            }
            Err(e) => {
                if e.category() == ErrorCategory::NotFound {
                    cache.set_parent_valid(seen, parent_id, false).await?;
                }
                Err(e)
            }
        }
    }

    /// Every entry in the directory at `path`
    pub async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let dir = self.resolve_path(path).await?;
        if !dir.is_dir {
            return Err(TransferError::NotADirectory(path.to_string()));
        }

        let mut entries = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.list_page(&dir.id, cursor.as_deref()).await?;
            entries.extend(page.entries);
            match page.next_page_token {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(entries)
    }

    /// Child `name` of `parent`, from the path cache or the parent's listing
    async fn child_entry(
        &self,
        parent: &PathEntry,
        parent_path: &str,
        name: &str,
        path: &str,
    ) -> Result<Option<PathEntry>> {
        if let Some(entry) = self.inner.cache.path(path).await? {
            return Ok(Some(entry));
        }
        if !parent.is_dir {
            return Err(TransferError::NotADirectory(parent_path.to_string()));
        }

        let seen = self.inner.cache.generation().await;
        let Some(found) = self.find_child(&parent.id, name).await? else {
            return Ok(None);
        };
        let entry = PathEntry::from(&found);
        self.inner.cache.store_path(seen, path, &entry).await?;
        Ok(Some(entry))
    }

    async fn find_child(&self, parent_id: &str, name: &str) -> Result<Option<RemoteEntry>> {
        let mut cursor: Option<String> = None;
        loop {
            let page = self.list_page(parent_id, cursor.as_deref()).await?;
            if let Some(entry) = page.entries.into_iter().find(|e| e.name == name) {
                return Ok(Some(entry));
            }
            match page.next_page_token {
                Some(next) => cursor = Some(next),
                None => return Ok(None),
            }
        }
    }

    async fn get_entry(&self, id: &str, target: &str) -> Result<RemoteEntry> {
        let call = Call::new(
            endpoint::GET_ENTRY,
            "stat",
            target,
            self.inner.config.timeouts.metadata,
        );
        self.inner
            .remote
            .call(call, |api, cred| async move { api.get_entry(&cred, id).await })
            .await
    }

    /// Fail unless `parent_id` names an existing directory; answers are
    /// cached both ways
    async fn check_parent(&self, parent_id: &str) -> Result<()> {
        let cache = &self.inner.cache;
        match cache.parent_valid(parent_id).await? {
            Some(true) => return Ok(()),
            Some(false) => return Err(TransferError::NotFound(parent_id.to_string())),
            None => {}
        }

        let seen = cache.generation().await;
        match self.get_entry(parent_id, parent_id).await {
            Ok(entry) => {
                cache.set_parent_valid(seen, parent_id, entry.is_dir).await?;
                if !entry.is_dir {
                    return Err(TransferError::NotADirectory(parent_id.to_string()));
                }
                Ok(())
            }
            Err(e) if e.category() == ErrorCategory::NotFound => {
                cache.set_parent_valid(seen, parent_id, false).await?;
                Err(TransferError::NotFound(parent_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Identifier of the directory at `path`, creating missing levels
    pub async fn ensure_parent(&self, path: &str) -> Result<String> {
        let path = normalize_path(path)?;
        let mut current = self.root_entry();
        let mut current_path = ROOT.to_string();

        for segment in segments(&path) {
            let next_path = join_path(&current_path, segment);
            let next = match self
                .child_entry(&current, &current_path, segment, &next_path)
                .await?
            {
                Some(entry) => entry,
                None => PathEntry::from(&self.create_dir(&current.id, segment, &next_path).await?),
            };
            if !next.is_dir {
                return Err(TransferError::NotADirectory(next_path));
            }
            current = next;
            current_path = next_path;
        }
        Ok(current.id)
    }

    /// Create the directory at `path`; an existing directory is returned as is
    pub async fn mkdir(&self, path: &str) -> Result<TransferObject> {
        let path = normalize_path(path)?;
        let (parent, name) = split(&path)?;
        let parent_id = self.ensure_parent(&parent).await?;

        if let Some(existing) = self.find_child(&parent_id, name).await? {
            if !existing.is_dir {
                return Err(TransferError::NotADirectory(path));
            }
            return Ok(TransferObject::from_entry(&path, &existing));
        }

        let entry = self.create_dir(&parent_id, name, &path).await?;
        Ok(TransferObject::from_entry(&path, &entry))
    }

    async fn create_dir(&self, parent_id: &str, name: &str, path: &str) -> Result<RemoteEntry> {
        let call = Call::new(
            endpoint::CREATE_DIR,
            "mkdir",
            path,
            self.inner.config.timeouts.metadata,
        );
        let outcome = self
            .inner
            .remote
            .call(call, |api, cred| async move { api.create_dir(&cred, parent_id, name).await })
            .await;

        let seen = self
            .inner
            .cache
            .invalidate(&Mutation::Created {
                parent_id: parent_id.to_string(),
                path: Some(path.to_string()),
            })
            .await?;

        let entry = match outcome {
            Ok(entry) => entry,
            // Created concurrently by someone else
            Err(e) if e.category() == ErrorCategory::Conflict => self
                .find_child(parent_id, name)
                .await?
                .filter(|entry| entry.is_dir)
                .ok_or(e)?,
            Err(e) => return Err(e),
        };

        tracing::debug!(path, id = %entry.id, "Directory ready");
        self.inner.cache.store_path(seen, path, &PathEntry::from(&entry)).await?;
        self.inner.cache.set_parent_valid(seen, &entry.id, true).await?;
        Ok(entry)
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        let path = normalize_path(path)?;
        split(&path)?;
        let entry = self.resolve_path(&path).await?;

        let id = entry.id.as_str();
        let call = Call::new(endpoint::DELETE, "delete", &path, self.inner.config.timeouts.metadata);
        self.inner
            .remote
            .call(call, |api, cred| async move { api.delete_entry(&cred, id).await })
            .await?;

        self.inner
            .cache
            .invalidate(&Mutation::Deleted {
                id: entry.id.clone(),
                parent_id: entry.parent_id.clone(),
                path: Some(path.clone()),
            })
            .await?;
        tracing::info!(path = %path, "Deleted");
        Ok(())
    }

    pub async fn rename(&self, path: &str, new_name: &str) -> Result<TransferObject> {
        if new_name.is_empty() || new_name.contains('/') || new_name == "." || new_name == ".." {
            return Err(TransferError::InvalidArgument(format!("invalid name: {new_name:?}")));
        }
        let path = normalize_path(path)?;
        let (parent, _) = split(&path)?;
        let entry = self.resolve_path(&path).await?;

        let id = entry.id.as_str();
        let call = Call::new(endpoint::RENAME, "rename", &path, self.inner.config.timeouts.metadata);
        let renamed = self
            .inner
            .remote
            .call(call, |api, cred| async move { api.rename_entry(&cred, id, new_name).await })
            .await?;

        let new_path = join_path(&parent, new_name);
        let cache = &self.inner.cache;
        let seen = cache
            .invalidate(&Mutation::Renamed {
                id: entry.id.clone(),
                parent_id: entry.parent_id.clone(),
                old_path: Some(path.clone()),
                new_path: Some(new_path.clone()),
            })
            .await?;
        cache.store_path(seen, &new_path, &PathEntry::from(&renamed)).await?;

        tracing::info!(from = %path, to = %new_path, "Renamed");
        Ok(TransferObject::from_entry(&new_path, &renamed))
    }

    /// Move the entry at `path` into the directory `new_parent`
    pub async fn move_to(&self, path: &str, new_parent: &str) -> Result<TransferObject> {
        let path = normalize_path(path)?;
        let (_, name) = split(&path)?;
        let entry = self.resolve_path(&path).await?;
        let new_parent = normalize_path(new_parent)?;
        if new_parent == path || new_parent.starts_with(&format!("{}/", path)) {
            return Err(TransferError::InvalidArgument(format!(
                "cannot move {} into itself",
                path
            )));
        }
        let new_parent_id = self.ensure_parent(&new_parent).await?;

        let (id, dest) = (entry.id.as_str(), new_parent_id.as_str());
        let call = Call::new(endpoint::MOVE, "move", &path, self.inner.config.timeouts.metadata);
        let moved = self
            .inner
            .remote
            .call(call, |api, cred| async move { api.move_entry(&cred, id, dest).await })
            .await?;

        let new_path = join_path(&new_parent, name);
        let cache = &self.inner.cache;
        let seen = cache
            .invalidate(&Mutation::Moved {
                id: entry.id.clone(),
                old_parent_id: entry.parent_id.clone(),
                new_parent_id: new_parent_id.clone(),
                old_path: Some(path.clone()),
                new_path: Some(new_path.clone()),
            })
            .await?;
        cache.store_path(seen, &new_path, &PathEntry::from(&moved)).await?;

        tracing::info!(from = %path, to = %new_path, "Moved");
        Ok(TransferObject::from_entry(&new_path, &moved))
    }

    // ========================================================================
    // Uploads
    // ========================================================================

    /// Upload a local file to `remote_path`
    pub async fn upload(
        &self,
        local_path: impl AsRef<Path>,
        remote_path: &str,
        cancel: &CancellationToken,
    ) -> Result<TransferObject> {
        let source = Arc::new(LocalFileSource::open(local_path).await?);
        self.copy_from(source, remote_path, cancel).await
    }

    /// Upload any source (local, in-memory, another store) to
    /// `remote_path`, creating missing parent directories
    pub async fn copy_from(
        &self,
        source: Arc<dyn TransferSource>,
        remote_path: &str,
        cancel: &CancellationToken,
    ) -> Result<TransferObject> {
        let path = normalize_path(remote_path)?;
        let (parent, name) = split(&path)?;
        let parent_id = self.ensure_parent(&parent).await?;
        self.upload_into(source, &parent_id, name, path.clone(), cancel)
            .await
    }

    /// Upload into a directory known only by identifier
    ///
    /// The result's `remote_path` is the bare file name.
    pub async fn upload_to_parent(
        &self,
        source: Arc<dyn TransferSource>,
        parent_id: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<TransferObject> {
        if name.is_empty() || name.contains('/') {
            return Err(TransferError::InvalidArgument(format!("invalid name: {name:?}")));
        }
        self.check_parent(parent_id).await?;
        self.upload_into(source, parent_id, name, name.to_string(), cancel)
            .await
    }

    async fn upload_into(
        &self,
        source: Arc<dyn TransferSource>,
        parent_id: &str,
        name: &str,
        remote_path: String,
        cancel: &CancellationToken,
    ) -> Result<TransferObject> {
        let _slot = self.slot(&self.inner.upload_slots, "upload", &remote_path, cancel).await?;
        let sessions = &self.inner.sessions;
        let target = |size: u64, content_hash: Option<String>, source_key: String| UploadTarget {
            parent_id: parent_id.to_string(),
            name: name.to_string(),
            remote_path: remote_path.clone(),
            size,
            content_hash,
            source_key,
        };
        let source_key = source_key(source.as_ref());

        // A known hash gets a dedup attempt before anything is buffered
        let mut early_session = None;
        if self.inner.selector.strategy_for(source.as_ref()) != BufferStrategy::Direct {
            if let (Some(hash), Some(size)) = (source.known_hash(), source.size()) {
                let session = sessions
                    .open(&target(size, Some(hash), source_key.clone()), cancel)
                    .await?;
                if session.is_deduplicated() {
                    let object = sessions.run(&session, source, cancel).await?;
                    return self.record_upload(parent_id, object).await;
                }
                early_session = Some(session);
            }
        }

        let prepared = match self.inner.selector.prepare(source, cancel).await {
            Ok(prepared) => prepared,
            Err(e) => {
                if let Some(session) = &early_session {
                    sessions.detach(session).await;
                }
                return Err(e);
            }
        };
        let session = sessions
            .open(&target(prepared.size, prepared.content_hash, source_key), cancel)
            .await?;
        let object = sessions.run(&session, prepared.source, cancel).await?;
        self.record_upload(parent_id, object).await
    }

    async fn record_upload(&self, parent_id: &str, object: TransferObject) -> Result<TransferObject> {
        let absolute = object.remote_path.starts_with(ROOT);
        let cache = &self.inner.cache;
        let seen = cache
            .invalidate(&Mutation::Created {
                parent_id: parent_id.to_string(),
                path: absolute.then(|| object.remote_path.clone()),
            })
            .await?;
        if absolute {
            let entry = PathEntry {
                id: object.file_id.clone(),
                is_dir: false,
                parent_id: Some(parent_id.to_string()),
            };
            cache.store_path(seen, &object.remote_path, &entry).await?;
        }
        Ok(object)
    }

    // ========================================================================
    // Downloads
    // ========================================================================

    /// A stored file as a source for copies elsewhere
    pub async fn remote_source(&self, path: &str) -> Result<RemoteObjectSource> {
        let path = normalize_path(path)?;
        let found = self.resolve_path(&path).await?;
        if found.is_dir {
            return Err(TransferError::InvalidArgument(format!("{} is a directory", path)));
        }
        let entry = self.get_entry(&found.id, &path).await?;
        Ok(RemoteObjectSource::new(
            self.inner.remote.clone(),
            path,
            entry,
            self.inner.config.timeouts.clone(),
            self.inner.config.concurrency.download_range_size,
        ))
    }

    /// Download `remote_path` to `local_path` with parallel ranged reads
    ///
    /// Data lands in a `.part` file that is renamed once size and hash check
    /// out.
    pub async fn download(
        &self,
        remote_path: &str,
        local_path: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> Result<TransferObject> {
        let source = self.remote_source(remote_path).await?;
        let path = source.describe();
        let _slot = self.slot(&self.inner.download_slots, "download", &path, cancel).await?;

        let local_path = local_path.as_ref();
        let part_path = PathBuf::from(format!("{}.part", local_path.display()));
        let entry = source.entry().clone();

        match self.fetch_ranges(&source, &part_path, cancel).await {
            Ok(digest) => {
                if let Some(expected) = &entry.content_hash {
                    if !expected.eq_ignore_ascii_case(&digest) {
                        let _ = tokio::fs::remove_file(&part_path).await;
                        return Err(TransferError::HashMismatch {
                            target: path,
                            expected: expected.clone(),
                            actual: digest,
                        });
                    }
                }
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&part_path).await;
                return Err(e);
            }
        }

        tokio::fs::rename(&part_path, local_path).await?;
        tracing::info!(
            path = %path,
            local = %local_path.display(),
            file_size = entry.size,
            "Download complete"
        );
        Ok(TransferObject::from_entry(&path, &entry))
    }

    /// Write every range of `source` into `part_path`; returns the digest
    ///
    /// Ranges are fetched concurrently but consumed in order, which bounds
    /// memory to `download_streams` ranges.
    async fn fetch_ranges(
        &self,
        source: &RemoteObjectSource,
        part_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let concurrency = &self.inner.config.concurrency;
        let size = source.entry().size;
        let range_size = concurrency.download_range_size.max(1);

        let file = tokio::fs::File::create(part_path).await?;
        file.set_len(size).await?;
        let file = tokio::sync::Mutex::new(file);

        let accumulator = HashAccumulator::new(size, range_size);
        let ranges = (0..accumulator.total_chunks()).map(|index| {
            let offset = index * range_size;
            (index, offset, range_size.min(size - offset))
        });

        let writes = stream::iter(ranges)
            .map(|(index, offset, length)| async move {
                let data = source.read_range(offset, length).await?;
                Ok::<_, TransferError>((index, offset, data))
            })
            .buffered(concurrency.download_streams.max(1))
            .try_for_each(|(index, offset, data)| {
                let (accumulator, file) = (&accumulator, &file);
                async move {
                    accumulator.write_chunk(index, &data)?;
                    let mut file = file.lock().await;
                    file.seek(std::io::SeekFrom::Start(offset)).await?;
                    file.write_all(&data).await?;
                    Ok::<(), TransferError>(())
                }
            });

        tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::cancelled("download", source.describe())),
            result = writes => result?,
        }

        file.into_inner().sync_all().await?;
        accumulator.finalize()
    }

    async fn slot<'a>(
        &self,
        slots: &'a Semaphore,
        op: &str,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<SemaphorePermit<'a>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::cancelled(op, target)),
            permit = slots.acquire() => permit.map_err(|e| TransferError::Worker(e.to_string())),
        }
    }
}

/// Non-root segments of a normalized path
fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Parent path and name of a normalized, non-root path
fn split(path: &str) -> Result<(String, &str)> {
    match (parent_path(path), file_name(path)) {
        (Some(parent), Some(name)) => Ok((parent, name)),
        _ => Err(TransferError::InvalidArgument(
            "the root directory cannot be the target".to_string(),
        )),
    }
}

/// Identity of a source across restarts
fn source_key(source: &dyn TransferSource) -> String {
    let modified = source
        .modified_at()
        .map(|at| at.timestamp_millis())
        .unwrap_or_default();
    format!("{}@{}", source.describe(), modified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::{fast_config, MockStorage, Op, ROOT_ID};
    use crate::api::StaticCredentials;
    use crate::hash::compute_hash;
    use crate::source::{BoxedReader, MemorySource, StreamSource};
    use std::io::Write;

    fn engine_with(mock: &Arc<MockStorage>, config: EngineConfig) -> TransferEngine {
        TransferEngine::new(config, mock.clone(), Arc::new(StaticCredentials::new("t")))
    }

    fn engine(mock: &Arc<MockStorage>) -> TransferEngine {
        engine_with(mock, fast_config())
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 13 % 256) as u8).collect()
    }

    fn local_file(data: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    fn names(entries: &[RemoteEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_upload_local_file_in_chunks() {
        let mock = Arc::new(MockStorage::new());
        let engine = engine(&mock);
        let data = content(7 * 1024 + 3);
        let file = local_file(&data);

        let object = engine
            .upload(file.path(), "/backups/2024/db.dump", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(object.remote_path, "/backups/2024/db.dump");
        assert_eq!(object.size, data.len() as u64);
        assert_eq!(mock.content(&object.file_id).unwrap(), data);
        assert_eq!(mock.count(Op::UploadChunk), 8);
        assert_eq!(engine.resolve_path("/backups/2024/db.dump").await.unwrap().id, object.file_id);
    }

    #[tokio::test]
    async fn test_listing_reflects_upload_immediately() {
        let mock = Arc::new(MockStorage::new());
        let engine = engine(&mock);
        let cancel = CancellationToken::new();
        engine.mkdir("/docs").await.unwrap();

        assert!(engine.list("/docs").await.unwrap().is_empty());
        // Served from cache
        let listed = mock.count(Op::ListChildren);
        assert!(engine.list("/docs").await.unwrap().is_empty());
        assert_eq!(mock.count(Op::ListChildren), listed);

        let source = Arc::new(MemorySource::new("notes", b"hello".to_vec()));
        engine.copy_from(source, "/docs/notes.txt", &cancel).await.unwrap();

        let entries = engine.list("/docs").await.unwrap();
        assert_eq!(names(&entries), vec!["notes.txt"]);
    }

    #[tokio::test]
    async fn test_listing_fetched_before_upload_is_not_cached() {
        let mock = Arc::new(MockStorage::new());
        let engine = engine(&mock);
        let (computed, release) = mock.hold_next(Op::ListChildren);

        let lister = engine.clone();
        let in_flight = tokio::spawn(async move { lister.list_page(ROOT_ID, None).await });
        computed.await.unwrap();

        let source = Arc::new(MemorySource::new("new", b"fresh".to_vec()));
        engine
            .copy_from(source, "/new.txt", &CancellationToken::new())
            .await
            .unwrap();

        release.send(()).unwrap();
        let old_page = in_flight.await.unwrap().unwrap();
        assert!(old_page.entries.is_empty());

        assert_eq!(names(&engine.list("/").await.unwrap()), vec!["new.txt"]);
    }

    #[tokio::test]
    async fn test_paginated_listing() {
        let mock = Arc::new(MockStorage::new());
        mock.set_page_size(2);
        for i in 0..5 {
            mock.add_file(ROOT_ID, &format!("f{}", i), b"x");
        }
        let engine = engine(&mock);

        let first = engine.list_page(ROOT_ID, None).await.unwrap();
        assert_eq!(first.entries.len(), 2);
        assert!(first.next_page_token.is_some());

        let all = engine.list("/").await.unwrap();
        assert_eq!(names(&all), vec!["f0", "f1", "f2", "f3", "f4"]);
    }

    #[tokio::test]
    async fn test_resolve_uses_path_cache() {
        let mock = Arc::new(MockStorage::new());
        let a = mock.add_dir(ROOT_ID, "a");
        let b = mock.add_dir(&a.id, "b");
        let engine = engine(&mock);

        assert_eq!(engine.resolve_path("/a/b/").await.unwrap().id, b.id);
        let listed = mock.count(Op::ListChildren);
        assert_eq!(engine.resolve_path("a/b").await.unwrap().id, b.id);
        assert_eq!(mock.count(Op::ListChildren), listed);

        assert!(matches!(
            engine.resolve_path("/a/missing").await,
            Err(TransferError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_rename_move_invalidate() {
        let mock = Arc::new(MockStorage::new());
        let engine = engine(&mock);
        let cancel = CancellationToken::new();

        for name in ["a.txt", "b.txt", "c.txt"] {
            let source = Arc::new(MemorySource::new(name, name.as_bytes().to_vec()));
            engine.copy_from(source, &format!("/in/{}", name), &cancel).await.unwrap();
        }
        assert_eq!(engine.list("/in").await.unwrap().len(), 3);

        engine.delete("/in/a.txt").await.unwrap();
        assert!(matches!(
            engine.resolve_path("/in/a.txt").await,
            Err(TransferError::NotFound(_))
        ));

        let renamed = engine.rename("/in/b.txt", "bee.txt").await.unwrap();
        assert_eq!(renamed.remote_path, "/in/bee.txt");
        assert!(engine.resolve_path("/in/b.txt").await.is_err());

        let moved = engine.move_to("/in/c.txt", "/out").await.unwrap();
        assert_eq!(moved.remote_path, "/out/c.txt");

        assert_eq!(names(&engine.list("/in").await.unwrap()), vec!["bee.txt"]);
        assert_eq!(names(&engine.list("/out").await.unwrap()), vec!["c.txt"]);
        assert_eq!(engine.resolve_path("/out/c.txt").await.unwrap().id, moved.file_id);
    }

    #[tokio::test]
    async fn test_mkdir_is_idempotent() {
        let mock = Arc::new(MockStorage::new());
        let engine = engine(&mock);

        let first = engine.mkdir("/photos/2023").await.unwrap();
        let second = engine.mkdir("/photos/2023").await.unwrap();
        assert_eq!(first.file_id, second.file_id);
        assert!(first.is_dir);
        assert_eq!(mock.count(Op::CreateDir), 2);
    }

    #[tokio::test]
    async fn test_known_hash_dedups_before_buffering() {
        let mock = Arc::new(MockStorage::new());
        let data = content(20 * 1024);
        mock.add_file(ROOT_ID, "original.iso", &data);
        let engine = engine(&mock);

        let reader: BoxedReader = Box::new(std::io::Cursor::new(data.clone()));
        let source = Arc::new(
            StreamSource::new("pipe", Some(data.len() as u64), reader).with_hash(compute_hash(&data)),
        );
        let object = engine
            .copy_from(source.clone(), "/copy.iso", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(object.remote_path, "/copy.iso");
        assert_eq!(mock.count(Op::UploadChunk), 0);
        // The stream was never consumed
        assert!(source.open_stream().await.is_ok());
    }

    #[tokio::test]
    async fn test_cross_store_copy() {
        let origin = Arc::new(MockStorage::new());
        let destination = Arc::new(MockStorage::new());
        let data = content(10 * 1024);
        origin.add_file(ROOT_ID, "medium.bin", &data);

        let from = engine(&origin);
        let to = engine(&destination);
        let source = Arc::new(from.remote_source("/medium.bin").await.unwrap());

        let object = to
            .copy_from(source, "/mirror/medium.bin", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(destination.content(&object.file_id).unwrap(), data);
        assert_eq!(origin.count(Op::ReadRange), 10);
        assert_eq!(destination.count(Op::UploadChunk), 10);
    }

    #[tokio::test]
    async fn test_download_in_ranges() {
        let mock = Arc::new(MockStorage::new());
        let data = content(5 * 1024 + 100);
        let dir = mock.add_dir(ROOT_ID, "media");
        mock.add_file(&dir.id, "clip.mp4", &data);
        let engine = engine(&mock);

        let target = tempfile::tempdir().unwrap();
        let local = target.path().join("clip.mp4");
        let object = engine
            .download("/media/clip.mp4", &local, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(object.size, data.len() as u64);
        assert_eq!(std::fs::read(&local).unwrap(), data);
        assert_eq!(mock.count(Op::ReadRange), 6);
        assert!(!target.path().join("clip.mp4.part").exists());
    }

    #[tokio::test]
    async fn test_stalled_range_bounds_reads_ahead() {
        let mock = Arc::new(MockStorage::new());
        let data = content(20 * 1024);
        mock.add_file(ROOT_ID, "long.bin", &data);
        let engine = engine(&mock);
        let streams = engine.config().concurrency.download_streams as u32;

        let (computed, release) = mock.hold_next(Op::ReadRange);
        let target = tempfile::tempdir().unwrap();
        let local = target.path().join("long.bin");
        let downloader = engine.clone();
        let path = local.clone();
        let download = tokio::spawn(async move {
            downloader
                .download("/long.bin", &path, &CancellationToken::new())
                .await
        });

        computed.await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(mock.count(Op::ReadRange) <= streams);

        release.send(()).unwrap();
        download.await.unwrap().unwrap();
        assert_eq!(std::fs::read(&local).unwrap(), data);
        assert_eq!(mock.count(Op::ReadRange), 20);
    }

    #[tokio::test]
    async fn test_download_of_directory_is_rejected() {
        let mock = Arc::new(MockStorage::new());
        mock.add_dir(ROOT_ID, "media");
        let engine = engine(&mock);

        let target = tempfile::tempdir().unwrap();
        let err = engine
            .download("/media", target.path().join("x"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_missing_parent_id_is_cached() {
        let mock = Arc::new(MockStorage::new());
        let engine = engine(&mock);
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let source = Arc::new(MemorySource::new("x", b"x".to_vec()));
            let err = engine
                .upload_to_parent(source, "no-such-dir", "x.txt", &cancel)
                .await
                .unwrap_err();
            assert!(matches!(err, TransferError::NotFound(_)));
        }
        assert_eq!(mock.count(Op::GetEntry), 1);
    }

    #[tokio::test]
    async fn test_upload_to_parent_by_id() {
        let mock = Arc::new(MockStorage::new());
        let dir = mock.add_dir(ROOT_ID, "inbox");
        let engine = engine(&mock);

        let source = Arc::new(MemorySource::new("letter", content(3000)));
        let object = engine
            .upload_to_parent(source, &dir.id, "letter.txt", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(object.remote_path, "letter.txt");
        assert!(mock.find(&dir.id, "letter.txt").is_some());
        assert_eq!(names(&engine.list("/inbox").await.unwrap()), vec!["letter.txt"]);
    }

    #[tokio::test]
    async fn test_interrupted_upload_resumes_after_restart() {
        let mock = Arc::new(MockStorage::new());
        let db = tempfile::tempdir().unwrap();
        let mut config = fast_config();
        config.chunk.max_workers = 1;
        config.progress_db = Some(format!("sqlite://{}", db.path().join("ferry.db").display()));

        let data = content(6 * 1024);
        let file = local_file(&data);
        let cancel = CancellationToken::new();

        mock.fail_chunk(3, crate::error::ApiError::http(403, "forbidden"));
        let first = TransferEngine::connect(config.clone(), mock.clone(), Arc::new(StaticCredentials::new("t")))
            .await
            .unwrap();
        let err = first.upload(file.path(), "/big.bin", &cancel).await.unwrap_err();
        match err {
            TransferError::ChunkFailed { completed, total, .. } => {
                assert_eq!((completed, total), (3, 6));
            }
            other => panic!("unexpected error: {other}"),
        }
        drop(first);

        mock.clear_chunk_failures();
        let second = TransferEngine::connect(config, mock.clone(), Arc::new(StaticCredentials::new("t")))
            .await
            .unwrap();
        let object = second.upload(file.path(), "/big.bin", &cancel).await.unwrap();

        assert_eq!(mock.uploaded_chunk_log(), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(object.content_hash, Some(compute_hash(&data)));
        assert_eq!(mock.session_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_upload_reports_cancellation() {
        let mock = Arc::new(MockStorage::new());
        let engine = engine(&mock);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let source = Arc::new(MemorySource::new("x", content(4096)));
        let err = engine.copy_from(source, "/x.bin", &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(engine.sessions().active_count().await, 0);
    }
}
