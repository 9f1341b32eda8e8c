//! Durable chunk progress
//!
//! One record per session under `progress/session/{id}`, plus an index
//! `progress/source/{resume key hash}` → session id so a restarted process
//! can find the session for the same source and destination. Saves for one
//! session are serialized; different sessions save concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::types::SessionProgress;
use crate::cache::KvStore;
use crate::error::Result;
use crate::hash::compute_hash;

const SESSION_PREFIX: &str = "progress/session/";
const SOURCE_PREFIX: &str = "progress/source/";

pub struct ProgressStore {
    store: Arc<dyn KvStore>,
    ttl: Duration,
    /// Per-session save locks
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProgressStore {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    fn session_key(session_id: &str) -> String {
        format!("{}{}", SESSION_PREFIX, session_id)
    }

    fn source_key(resume_key: &str) -> String {
        format!("{}{}", SOURCE_PREFIX, compute_hash(resume_key.as_bytes()))
    }

    pub async fn save(&self, progress: &SessionProgress) -> Result<()> {
        let lock = self.session_lock(&progress.session_id);
        let _guard = lock.lock().await;

        let bytes = serde_json::to_vec(progress)?;
        self.store
            .set(&Self::session_key(&progress.session_id), bytes, Some(self.ttl))
            .await?;
        self.store
            .set(
                &Self::source_key(&progress.resume_key),
                progress.session_id.as_bytes().to_vec(),
                Some(self.ttl),
            )
            .await?;
        Ok(())
    }

    pub async fn load(&self, session_id: &str) -> Result<Option<SessionProgress>> {
        let Some(bytes) = self.store.get(&Self::session_key(session_id)).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(progress) => Ok(Some(progress)),
            Err(e) => {
                tracing::warn!(session_id, error = %e, "Discarding unreadable progress record");
                self.store.delete(&Self::session_key(session_id)).await?;
                Ok(None)
            }
        }
    }

    /// Progress of the session last used for `resume_key`
    pub async fn find(&self, resume_key: &str) -> Result<Option<SessionProgress>> {
        let Some(id) = self.store.get(&Self::source_key(resume_key)).await? else {
            return Ok(None);
        };
        let session_id = String::from_utf8_lossy(&id).into_owned();
        let progress = self.load(&session_id).await?;
        Ok(progress.filter(|p| p.resume_key == resume_key))
    }

    pub async fn remove(&self, progress: &SessionProgress) -> Result<()> {
        let lock = self.session_lock(&progress.session_id);
        {
            let _guard = lock.lock().await;
            self.store
                .delete(&Self::session_key(&progress.session_id))
                .await?;
            self.store
                .delete(&Self::source_key(&progress.resume_key))
                .await?;
        }
        self.locks.lock().remove(&progress.session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryKvStore;
    use crate::upload::types::{ChunkState, UploadSession, UploadStrategy, UploadTarget};

    fn progress(id: &str) -> SessionProgress {
        let target = UploadTarget {
            parent_id: "root".to_string(),
            name: "big.iso".to_string(),
            remote_path: "/big.iso".to_string(),
            size: 2_500,
            content_hash: None,
            source_key: "local:/tmp/big.iso".to_string(),
        };
        let session = UploadSession::new(
            id.to_string(),
            &target,
            target.name.clone(),
            target.remote_path.clone(),
            1_000,
            UploadStrategy::Chunked,
            "resume-key".to_string(),
            0,
        );
        SessionProgress::plan(&session)
    }

    #[test]
    fn test_plan_covers_source() {
        let progress = progress("s1");
        assert_eq!(progress.total_chunks, 3);
        assert_eq!(progress.chunks[2].offset, 2_000);
        assert_eq!(progress.chunks[2].size, 500);
        assert_eq!(progress.uploaded_count(), 0);
    }

    #[tokio::test]
    async fn test_save_find_remove() {
        let store = ProgressStore::new(Arc::new(MemoryKvStore::new(100)), Duration::from_secs(60));
        let mut progress = progress("s1");
        progress.chunks[0].state = ChunkState::Uploaded;
        store.save(&progress).await.unwrap();

        let found = store.find("resume-key").await.unwrap().unwrap();
        assert_eq!(found.session_id, "s1");
        assert_eq!(found.uploaded_count(), 1);

        store.remove(&progress).await.unwrap();
        assert!(store.find("resume-key").await.unwrap().is_none());
        assert!(store.load("s1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_expire() {
        let store = ProgressStore::new(Arc::new(MemoryKvStore::new(100)), Duration::from_secs(60));
        store.save(&progress("s1")).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.load("s1").await.unwrap().is_none());
    }
}
