//! Metadata Cache Layer
//!
//! Three independent stores:
//! - parent validity: directory id → exists (positive and negative answers)
//! - listings: (parent id, page cursor) → one page of entries with a checksum
//! - paths: normalized path → (id, is-dir, parent id)
//!
//! Mutations invalidate before the mutating call returns. When the affected
//! parent is unknown the listing and parent-validity stores are cleared.
//!
//! Every fill carries the [`Generation`] observed before its provider call.
//! Invalidation bumps the generation under a write lock, so an answer
//! fetched before a mutation is dropped instead of outliving it.

use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::RwLock;

use super::store::{KvStore, MemoryKvStore};
use crate::api::{ListPage, RemoteEntry};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::path::parent_path;

// ============================================================================
// Cached Values
// ============================================================================

/// Path resolution result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathEntry {
    pub id: String,
    pub is_dir: bool,
    pub parent_id: Option<String>,
}

impl From<&RemoteEntry> for PathEntry {
    fn from(entry: &RemoteEntry) -> Self {
        Self {
            id: entry.id.clone(),
            is_dir: entry.is_dir,
            parent_id: entry.parent_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedListing {
    entries: Vec<RemoteEntry>,
    next_page_token: Option<String>,
    entry_count: usize,
    checksum: u32,
}

fn listing_checksum(entries: &[RemoteEntry], next_page_token: Option<&str>) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for entry in entries {
        hasher.update(entry.id.as_bytes());
        hasher.update(&[0]);
        hasher.update(entry.name.as_bytes());
        hasher.update(&[entry.is_dir as u8]);
        hasher.update(&entry.size.to_le_bytes());
        if let Some(hash) = &entry.content_hash {
            hasher.update(hash.as_bytes());
        }
        hasher.update(&entry.modified_at.timestamp_millis().to_le_bytes());
    }
    if let Some(token) = next_page_token {
        hasher.update(token.as_bytes());
    }
    hasher.finalize()
}

/// A mutation the cache must forget about
#[derive(Debug, Clone)]
pub enum Mutation {
    /// File uploaded or directory created
    Created {
        parent_id: String,
        path: Option<String>,
    },
    Deleted {
        id: String,
        parent_id: Option<String>,
        path: Option<String>,
    },
    Renamed {
        id: String,
        parent_id: Option<String>,
        old_path: Option<String>,
        new_path: Option<String>,
    },
    Moved {
        id: String,
        old_parent_id: Option<String>,
        new_parent_id: String,
        old_path: Option<String>,
        new_path: Option<String>,
    },
}

/// Invalidation count observed before fetching a value to cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation(u64);

// ============================================================================
// Metadata Cache
// ============================================================================

pub struct MetadataCache {
    parents: Arc<dyn KvStore>,
    listings: Arc<dyn KvStore>,
    paths: Arc<dyn KvStore>,
    config: CacheConfig,
    generation: RwLock<u64>,
}

impl MetadataCache {
    pub fn new(
        parents: Arc<dyn KvStore>,
        listings: Arc<dyn KvStore>,
        paths: Arc<dyn KvStore>,
        config: CacheConfig,
    ) -> Self {
        Self {
            parents,
            listings,
            paths,
            config,
            generation: RwLock::new(0),
        }
    }

    pub fn in_memory(config: CacheConfig) -> Self {
        let max = config.max_entries;
        Self::new(
            Arc::new(MemoryKvStore::new(max)),
            Arc::new(MemoryKvStore::new(max)),
            Arc::new(MemoryKvStore::new(max)),
            config,
        )
    }

    /// Take before the provider call whose answer will be stored
    pub async fn generation(&self) -> Generation {
        Generation(*self.generation.read().await)
    }

    // ========================================================================
    // Parent Validity
    // ========================================================================

    pub async fn parent_valid(&self, parent_id: &str) -> Result<Option<bool>> {
        self.read(self.parents.as_ref(), "parent", parent_id).await
    }

    pub async fn set_parent_valid(&self, seen: Generation, parent_id: &str, exists: bool) -> Result<()> {
        let ttl = if exists {
            self.config.parent_valid_ttl
        } else {
            self.config.parent_invalid_ttl
        };
        self.fill(seen, self.parents.as_ref(), parent_id, &exists, ttl).await
    }

    // ========================================================================
    // Listings
    // ========================================================================

    pub async fn listing(&self, parent_id: &str, cursor: Option<&str>) -> Result<Option<ListPage>> {
        let key = listing_key(parent_id, cursor);
        let Some(cached) = self
            .read::<CachedListing>(self.listings.as_ref(), "listing", &key)
            .await?
        else {
            return Ok(None);
        };

        if !self.listing_intact(&cached) {
            tracing::warn!(parent_id, key = %key, "Evicting corrupted listing cache entry");
            self.listings.delete(&key).await?;
            return Ok(None);
        }

        Ok(Some(ListPage {
            entries: cached.entries,
            next_page_token: cached.next_page_token,
        }))
    }

    pub async fn store_listing(
        &self,
        seen: Generation,
        parent_id: &str,
        cursor: Option<&str>,
        page: &ListPage,
    ) -> Result<()> {
        let cached = CachedListing {
            entries: page.entries.clone(),
            next_page_token: page.next_page_token.clone(),
            entry_count: page.entries.len(),
            checksum: listing_checksum(&page.entries, page.next_page_token.as_deref()),
        };
        let key = listing_key(parent_id, cursor);
        self.fill(seen, self.listings.as_ref(), &key, &cached, self.config.listing_ttl)
            .await
    }

    /// Full checksum for large pages, structural check for small ones
    fn listing_intact(&self, cached: &CachedListing) -> bool {
        if cached.entry_count != cached.entries.len() {
            return false;
        }
        if cached.entries.iter().any(|e| e.id.is_empty()) {
            return false;
        }
        if cached.entries.len() >= self.config.listing_checksum_threshold {
            let actual = listing_checksum(&cached.entries, cached.next_page_token.as_deref());
            return actual == cached.checksum;
        }
        true
    }

    // ========================================================================
    // Paths
    // ========================================================================

    pub async fn path(&self, path: &str) -> Result<Option<PathEntry>> {
        self.read(self.paths.as_ref(), "path", path).await
    }

    pub async fn store_path(&self, seen: Generation, path: &str, entry: &PathEntry) -> Result<()> {
        self.fill(seen, self.paths.as_ref(), path, entry, self.config.path_ttl)
            .await
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Forget what `mutation` made stale; returns the generation later fills
    /// of the mutation's own result should carry
    pub async fn invalidate(&self, mutation: &Mutation) -> Result<Generation> {
        let mut generation = self.generation.write().await;
        *generation += 1;

        let (parents, paths, removed): (Vec<Option<&str>>, Vec<Option<&str>>, Option<&str>) =
            match mutation {
                Mutation::Created { parent_id, path } => {
                    (vec![Some(parent_id.as_str())], vec![path.as_deref()], None)
                }
                Mutation::Deleted { id, parent_id, path } => {
                    (vec![parent_id.as_deref()], vec![path.as_deref()], Some(id.as_str()))
                }
                Mutation::Renamed {
                    id,
                    parent_id,
                    old_path,
                    new_path,
                } => (
                    vec![parent_id.as_deref()],
                    vec![old_path.as_deref(), new_path.as_deref()],
                    Some(id.as_str()),
                ),
                Mutation::Moved {
                    id,
                    old_parent_id,
                    new_parent_id,
                    old_path,
                    new_path,
                } => (
                    vec![old_parent_id.as_deref(), Some(new_parent_id.as_str())],
                    vec![old_path.as_deref(), new_path.as_deref()],
                    Some(id.as_str()),
                ),
            };

        if parents.iter().any(Option::is_none) {
            tracing::debug!(?mutation, "Affected parent unknown, clearing listing caches");
            self.listings.clear().await?;
            self.parents.clear().await?;
        } else {
            for parent_id in parents.into_iter().flatten() {
                self.listings.delete_prefix(&listing_prefix(parent_id)).await?;
            }
        }

        if let Some(id) = removed {
            // The entry may itself be a directory
            self.parents.delete(id).await?;
            self.listings.delete_prefix(&listing_prefix(id)).await?;
        }

        if paths.iter().any(Option::is_none) && removed.is_some() {
            // A directory moved without a known path leaves stale descendants
            self.paths.clear().await?;
        }
        for path in paths.into_iter().flatten() {
            self.paths.delete(path).await?;
            self.paths.delete_prefix(&format!("{}/", path)).await?;
            if let Some(parent) = parent_path(path) {
                self.paths.delete(&parent).await?;
            }
        }

        tracing::debug!(?mutation, "Invalidated metadata caches");
        Ok(Generation(*generation))
    }

    pub async fn clear(&self) -> Result<()> {
        let mut generation = self.generation.write().await;
        *generation += 1;
        self.parents.clear().await?;
        self.listings.clear().await?;
        self.paths.clear().await?;
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Undecodable entries are evicted and reported as misses
    async fn read<T: DeserializeOwned>(
        &self,
        store: &dyn KvStore,
        kind: &str,
        key: &str,
    ) -> Result<Option<T>> {
        let Some(bytes) = store.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(kind, key, error = %e, "Evicting undecodable cache entry");
                store.delete(key).await?;
                Ok(None)
            }
        }
    }

    /// Store unless an invalidation ran since `seen` was taken
    async fn fill<T: Serialize>(
        &self,
        seen: Generation,
        store: &dyn KvStore,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        let current = self.generation.read().await;
        if *current != seen.0 {
            tracing::debug!(key, "Dropping cache fill that predates an invalidation");
            return Ok(());
        }
        store.set(key, bytes, Some(ttl)).await
    }
}

fn listing_prefix(parent_id: &str) -> String {
    format!("{}\n", parent_id)
}

fn listing_key(parent_id: &str, cursor: Option<&str>) -> String {
    format!("{}\n{}", parent_id, cursor.unwrap_or(""))
}
