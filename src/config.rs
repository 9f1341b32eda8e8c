//! Configuration management for the transfer engine
//!
//! Every knob has a default; `EngineConfig::from_env` overrides them from
//! `FERRY_*` environment variables.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::pacer::EndpointClass;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Identifier of the provider's root directory
    pub root_id: String,
    pub pacer: PacerConfig,
    pub retry: RetryConfig,
    pub chunk: ChunkConfig,
    pub concurrency: ConcurrencyConfig,
    pub cache: CacheConfig,
    pub timeouts: TimeoutConfig,
    pub completion: CompletionConfig,
    pub cross_store: CrossStoreConfig,
    /// SQLite URL for chunk progress; in-memory when unset
    pub progress_db: Option<String>,
}

/// Pacing parameters for one endpoint class
#[derive(Debug, Clone, Copy)]
pub struct PacerClassConfig {
    pub min_sleep: Duration,
    pub max_sleep: Duration,
    /// Each success shrinks the sleep by `sleep / 2^decay`
    pub decay_constant: u32,
}

impl PacerClassConfig {
    pub const fn new(min_ms: u64, max_ms: u64, decay_constant: u32) -> Self {
        Self {
            min_sleep: Duration::from_millis(min_ms),
            max_sleep: Duration::from_millis(max_ms),
            decay_constant,
        }
    }
}

impl Default for PacerClassConfig {
    fn default() -> Self {
        Self::new(1_000, 30_000, 2)
    }
}

#[derive(Debug, Clone)]
pub struct PacerConfig {
    pub classes: HashMap<EndpointClass, PacerClassConfig>,
}

impl Default for PacerConfig {
    fn default() -> Self {
        // Observed provider quotas: listing ~10/s, deletes ~1/s, chunk PUTs ~20/s
        let classes = HashMap::from([
            (EndpointClass::Listing, PacerClassConfig::new(100, 5_000, 2)),
            (EndpointClass::Metadata, PacerClassConfig::new(100, 5_000, 2)),
            (EndpointClass::Mutation, PacerClassConfig::new(1_000, 30_000, 2)),
            (EndpointClass::Session, PacerClassConfig::new(500, 15_000, 2)),
            (EndpointClass::ChunkUpload, PacerClassConfig::new(50, 10_000, 2)),
            (EndpointClass::Completion, PacerClassConfig::new(250, 10_000, 2)),
            (EndpointClass::Download, PacerClassConfig::new(50, 10_000, 2)),
        ]);
        Self { classes }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts per call, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    /// Forced minimum wait after a rate-limit signal
    pub rate_limit_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(45),
            rate_limit_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkConfig {
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    /// Used until the throughput meter has samples
    pub default_chunk_size: u64,
    /// Target wall time for one chunk at the measured throughput
    pub target_chunk_duration: Duration,
    pub max_chunks: u64,
    /// Content below this size is buffered and sent in one request
    pub single_shot_limit: u64,
    /// Seekable sources up to this size are hashed before opening a session
    pub prehash_limit: u64,
    /// User ceiling on workers per session
    pub max_workers: usize,
    /// Attempts per chunk when the provider acknowledges a different hash
    pub integrity_retries: u32,
    /// Attempts at a suffixed name before falling back to a timestamp
    pub max_name_attempts: u32,
    /// Lifetime of persisted progress records
    pub session_ttl: Duration,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: 4 * MIB,
            max_chunk_size: 128 * MIB,
            default_chunk_size: 16 * MIB,
            target_chunk_duration: Duration::from_secs(8),
            max_chunks: 10_000,
            single_shot_limit: 16 * MIB,
            prehash_limit: 20 * GIB,
            max_workers: 4,
            integrity_retries: 3,
            max_name_attempts: 10,
            session_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    pub max_concurrent_uploads: usize,
    pub max_concurrent_downloads: usize,
    /// Parallel ranged reads per download
    pub download_streams: usize,
    pub download_range_size: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: 4,
            max_concurrent_downloads: 4,
            download_streams: 4,
            download_range_size: 8 * MIB,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub parent_valid_ttl: Duration,
    /// Negative existence results expire sooner
    pub parent_invalid_ttl: Duration,
    pub listing_ttl: Duration,
    pub path_ttl: Duration,
    /// Listings with at least this many entries get a full checksum on read
    pub listing_checksum_threshold: usize,
    /// Per-store entry bound
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            parent_valid_ttl: Duration::from_secs(10 * 60),
            parent_invalid_ttl: Duration::from_secs(30),
            listing_ttl: Duration::from_secs(5 * 60),
            path_ttl: Duration::from_secs(10 * 60),
            listing_checksum_threshold: 100,
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Listing, lookups, mutations, session calls
    pub metadata: Duration,
    /// Fixed part of an upload/download call budget
    pub transfer_base: Duration,
    /// Slowest throughput tolerated before a transfer call times out
    pub min_throughput: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            metadata: Duration::from_secs(30),
            transfer_base: Duration::from_secs(60),
            min_throughput: 256 * KIB,
        }
    }
}

impl TimeoutConfig {
    /// Per-call budget for moving `bytes`
    pub fn for_transfer(&self, bytes: u64) -> Duration {
        let throughput = self.min_throughput.max(1);
        self.transfer_base + Duration::from_secs(bytes.div_ceil(throughput))
    }
}

#[derive(Debug, Clone)]
pub struct CompletionConfig {
    /// Poll interval growth per attempt (1s, 2s, 3s, ...)
    pub poll_step: Duration,
    /// Interval ceiling
    pub poll_plateau: Duration,
    pub base_polls: u32,
    /// Extra polls granted per GiB of declared size
    pub polls_per_gib: u32,
    pub max_polls: u32,
    /// Consecutive network failures tolerated while polling
    pub max_network_failures: u32,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            poll_step: Duration::from_secs(1),
            poll_plateau: Duration::from_secs(10),
            base_polls: 30,
            polls_per_gib: 10,
            max_polls: 300,
            max_network_failures: 5,
        }
    }
}

impl CompletionConfig {
    pub fn poll_delay(&self, attempt: u32) -> Duration {
        (self.poll_step * attempt.max(1)).min(self.poll_plateau)
    }

    /// Polling budget for a file of `size` bytes
    pub fn max_polls_for(&self, size: u64) -> u32 {
        let gib = u32::try_from(size.div_ceil(GIB)).unwrap_or(u32::MAX);
        self.base_polls
            .saturating_add(gib.saturating_mul(self.polls_per_gib))
            .min(self.max_polls)
    }
}

#[derive(Debug, Clone)]
pub struct CrossStoreConfig {
    /// Sources up to this size are read fully into memory
    pub memory_threshold: u64,
    /// Range-readable sources up to this size use parallel ranged reads
    pub hybrid_threshold: u64,
    pub hybrid_streams: usize,
    pub range_size: u64,
    /// Where disk-buffered copies are staged; system temp dir when unset
    pub temp_dir: Option<PathBuf>,
}

impl Default for CrossStoreConfig {
    fn default() -> Self {
        Self {
            memory_threshold: 64 * MIB,
            hybrid_threshold: GIB,
            hybrid_streams: 4,
            range_size: 8 * MIB,
            temp_dir: None,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            root_id: "root".to_string(),
            pacer: PacerConfig::default(),
            retry: RetryConfig::default(),
            chunk: ChunkConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            cache: CacheConfig::default(),
            timeouts: TimeoutConfig::default(),
            completion: CompletionConfig::default(),
            cross_store: CrossStoreConfig::default(),
            progress_db: None,
        }
    }
}

impl EngineConfig {
    /// Build a configuration from `FERRY_*` variables, keeping defaults for
    /// anything unset or unparsable
    pub fn from_env() -> Self {
        let mut config = EngineConfig::default();

        if let Ok(root_id) = env::var("FERRY_ROOT_ID") {
            config.root_id = root_id;
        }
        config.progress_db = env::var("FERRY_PROGRESS_DB").ok();

        let retry = &mut config.retry;
        retry.max_attempts = env_or("FERRY_RETRY_MAX_ATTEMPTS", retry.max_attempts);
        retry.rate_limit_delay = env_secs("FERRY_RATE_LIMIT_DELAY_SECS", retry.rate_limit_delay);

        let chunk = &mut config.chunk;
        chunk.min_chunk_size = env_or("FERRY_MIN_CHUNK_SIZE", chunk.min_chunk_size);
        chunk.max_chunk_size = env_or("FERRY_MAX_CHUNK_SIZE", chunk.max_chunk_size);
        chunk.max_chunks = env_or("FERRY_MAX_CHUNKS", chunk.max_chunks);
        chunk.single_shot_limit = env_or("FERRY_SINGLE_SHOT_LIMIT", chunk.single_shot_limit);
        chunk.max_workers = env_or("FERRY_MAX_WORKERS", chunk.max_workers);

        let concurrency = &mut config.concurrency;
        concurrency.max_concurrent_uploads =
            env_or("FERRY_MAX_UPLOADS", concurrency.max_concurrent_uploads);
        concurrency.max_concurrent_downloads =
            env_or("FERRY_MAX_DOWNLOADS", concurrency.max_concurrent_downloads);

        let cache = &mut config.cache;
        cache.listing_ttl = env_secs("FERRY_LISTING_TTL_SECS", cache.listing_ttl);
        cache.path_ttl = env_secs("FERRY_PATH_TTL_SECS", cache.path_ttl);
        cache.parent_valid_ttl = env_secs("FERRY_PARENT_TTL_SECS", cache.parent_valid_ttl);

        config.timeouts.metadata = env_secs("FERRY_METADATA_TIMEOUT_SECS", config.timeouts.metadata);
        config.cross_store.temp_dir = env::var("FERRY_TEMP_DIR").ok().map(PathBuf::from);

        config
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
