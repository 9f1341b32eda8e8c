//! Durable key-value stores with per-entry TTL
//!
//! Values are opaque bytes; callers serialize. Expired entries are never
//! returned.

use std::num::NonZeroUsize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lru::LruCache;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::Result;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value`; `None` TTL never expires
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove every key starting with `prefix`, returning how many went
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    async fn clear(&self) -> Result<()>;
}

// ============================================================================
// In-Memory Store
// ============================================================================

struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// LRU-bounded store living in process memory
pub struct MemoryKvStore {
    entries: RwLock<LruCache<String, MemoryEntry>>,
}

impl MemoryKvStore {
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.peek(key) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }

        let mut entries = self.entries.write().await;
        if entries.peek(key).is_some_and(|e| e.is_expired(now)) {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let entry = MemoryEntry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.write().await.put(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.pop(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        Ok(doomed.len())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }
}

// ============================================================================
// SQLite Store
// ============================================================================

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS kv_entries (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    -- Unix milliseconds; NULL never expires
    expires_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_kv_entries_expires ON kv_entries(expires_at);
"#;

/// Store persisted in a SQLite database, surviving restarts
#[derive(Clone)]
pub struct SqliteKvStore {
    pool: SqlitePool,
}

impl SqliteKvStore {
    /// Connect using a `sqlite:` URL
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?;
        // Each in-memory connection is its own database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        Self::with_options(options, max_connections).await
    }

    pub async fn open(path: &Path) -> Result<Self> {
        Self::with_options(SqliteConnectOptions::new().filename(path), 5).await
    }

    async fn with_options(options: SqliteConnectOptions, max_connections: u32) -> Result<Self> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Drop every expired row
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE expires_at IS NOT NULL AND expires_at <= ?")
            .bind(now_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>, Option<i64>)> =
            sqlx::query_as("SELECT value, expires_at FROM kv_entries WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((_, Some(expires_at))) if expires_at <= now_millis() => {
                self.delete(key).await?;
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| now_millis() + ttl.as_millis() as i64);
        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE substr(key, 1, ?) = ?")
            .bind(prefix.chars().count() as i64)
            .bind(prefix)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM kv_entries")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ============================================================================
// Namespaced View
// ============================================================================

/// A key prefix over a shared store, so several caches can live in one
/// database without `clear` reaching each other
pub struct NamespacedStore {
    inner: std::sync::Arc<dyn KvStore>,
    prefix: String,
}

impl NamespacedStore {
    pub fn new(inner: std::sync::Arc<dyn KvStore>, namespace: &str) -> Self {
        Self {
            inner,
            prefix: format!("{}:", namespace),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl KvStore for NamespacedStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(&self.key(key)).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.inner.set(&self.key(key), value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(&self.key(key)).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        self.inner.delete_prefix(&self.key(prefix)).await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.delete_prefix(&self.prefix).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_memory_entries_expire() {
        let store = MemoryKvStore::new(10);
        store
            .set("a", b"1".to_vec(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        store.set("b", b"2".to_vec(), None).await.unwrap();

        assert_eq!(store.get("a").await.unwrap(), Some(b"1".to_vec()));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("b").await.unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_memory_is_bounded() {
        let store = MemoryKvStore::new(2);
        for key in ["a", "b", "c"] {
            store.set(key, key.as_bytes().to_vec(), None).await.unwrap();
        }
        assert_eq!(store.len().await, 2);
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_delete_prefix() {
        let store = MemoryKvStore::new(10);
        for key in ["p1\nx", "p1\ny", "p10\nx", "p2\nx"] {
            store.set(key, vec![0], None).await.unwrap();
        }

        assert_eq!(store.delete_prefix("p1\n").await.unwrap(), 2);
        assert!(store.get("p10\nx").await.unwrap().is_some());
        assert!(store.get("p2\nx").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_namespaces_do_not_collide() {
        let shared: std::sync::Arc<dyn KvStore> = std::sync::Arc::new(MemoryKvStore::new(10));
        let paths = NamespacedStore::new(shared.clone(), "paths");
        let listings = NamespacedStore::new(shared.clone(), "listings");

        paths.set("/a", b"path".to_vec(), None).await.unwrap();
        listings.set("/a", b"listing".to_vec(), None).await.unwrap();
        assert_eq!(paths.get("/a").await.unwrap(), Some(b"path".to_vec()));

        listings.clear().await.unwrap();
        assert_eq!(listings.get("/a").await.unwrap(), None);
        assert_eq!(paths.get("/a").await.unwrap(), Some(b"path".to_vec()));
    }

    #[tokio::test]
    async fn test_sqlite_roundtrip_and_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteKvStore::open(&dir.path().join("kv.db")).await.unwrap();

        store.set("progress/a", b"one".to_vec(), None).await.unwrap();
        store.set("progress/b", b"two".to_vec(), None).await.unwrap();
        store.set("other", b"three".to_vec(), None).await.unwrap();
        store.set("progress/a", b"uno".to_vec(), None).await.unwrap();

        assert_eq!(store.get("progress/a").await.unwrap(), Some(b"uno".to_vec()));
        assert_eq!(store.delete_prefix("progress/").await.unwrap(), 2);
        assert_eq!(store.get("progress/b").await.unwrap(), None);
        assert_eq!(store.get("other").await.unwrap(), Some(b"three".to_vec()));

        store.clear().await.unwrap();
        assert_eq!(store.get("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sqlite_expired_rows_are_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteKvStore::open(&dir.path().join("kv.db")).await.unwrap();

        store.set("gone", b"x".to_vec(), Some(Duration::ZERO)).await.unwrap();
        store.set("kept", b"y".to_vec(), Some(Duration::from_secs(3600))).await.unwrap();

        assert_eq!(store.get("gone").await.unwrap(), None);
        assert_eq!(store.get("kept").await.unwrap(), Some(b"y".to_vec()));
        assert_eq!(store.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");

        {
            let store = SqliteKvStore::open(&path).await.unwrap();
            store.set("k", b"v".to_vec(), None).await.unwrap();
            store.pool.close().await;
        }

        let store = SqliteKvStore::open(&path).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
    }
}
