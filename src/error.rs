//! Error types for the transfer engine
//!
//! Two layers:
//! - [`ApiError`]: one failed provider call (transport failure or HTTP status)
//! - [`TransferError`]: terminal, user-visible failure of an engine operation

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Engine-wide result type
pub type Result<T> = std::result::Result<T, TransferError>;

// ============================================================================
// Error Categories
// ============================================================================

/// Terminal category of a failure, as reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// 5xx responses
    ServerOverload,
    /// Timeouts, resets, refused connections
    NetworkTimeout,
    /// 429 or provider throttling codes
    RateLimit,
    /// A presigned or session upload URL expired
    UrlExpired,
    /// 401 or credential expiry
    Auth,
    /// 403
    Permission,
    /// 404 / 410
    NotFound,
    /// 409 name collision
    Conflict,
    /// Hash or size mismatch, corrupted cache entry
    Integrity,
    /// Too many chunks, allocation denied
    ResourceExhausted,
    /// Caller cancelled the operation
    Cancelled,
    /// Anything else
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServerOverload => "server-overload",
            Self::NetworkTimeout => "network-timeout",
            Self::RateLimit => "rate-limit",
            Self::UrlExpired => "url-expired",
            Self::Auth => "auth-error",
            Self::Permission => "permission-error",
            Self::NotFound => "not-found",
            Self::Conflict => "conflict",
            Self::Integrity => "data-integrity",
            Self::ResourceExhausted => "resource-exhaustion",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Provider Call Errors
// ============================================================================

/// How a single provider call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// The call did not finish within its timeout
    Timeout,
    /// Connection refused/reset, DNS failure, broken body stream
    Network,
    /// The provider answered with a non-success status
    Http,
    /// The response could not be decoded
    Decode,
}

/// A failed call to the storage provider
#[derive(Debug, Clone)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    /// HTTP status, when the provider answered
    pub status: Option<u16>,
    /// Provider error code from the response body (e.g. `URL_EXPIRED`)
    pub code: Option<String>,
    pub message: String,
    /// `Retry-After` hint from the provider
    pub retry_after: Option<Duration>,
}

impl ApiError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Http,
            status: Some(status),
            code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Timeout,
            status: None,
            code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Network,
            status: None,
            code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Decode,
            status: None,
            code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, &self.code) {
            (Some(status), Some(code)) => write!(f, "HTTP {} [{}]: {}", status, code, self.message),
            (Some(status), None) => write!(f, "HTTP {}: {}", status, self.message),
            (None, _) => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ApiError {}

// ============================================================================
// Engine Errors
// ============================================================================

/// Terminal failure of an engine operation
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("{op} failed for {target} ({category}) after {attempts} attempt(s): {source}")]
    Api {
        op: String,
        target: String,
        category: ErrorCategory,
        attempts: u32,
        #[source]
        source: ApiError,
    },

    #[error("{op} cancelled for {target}")]
    Cancelled { op: String, target: String },

    #[error(
        "chunk {chunk_index} of session {session_id} failed ({completed}/{total} chunks uploaded): {source}"
    )]
    ChunkFailed {
        session_id: String,
        chunk_index: u64,
        completed: u64,
        total: u64,
        #[source]
        source: Box<TransferError>,
    },

    #[error("Hash mismatch for {target}: expected {expected}, got {actual}")]
    HashMismatch {
        target: String,
        expected: String,
        actual: String,
    },

    #[error("Incomplete hash coverage: {covered} of {expected} bytes")]
    IncompleteCoverage { covered: u64, expected: u64 },

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Too many chunks for {target}: {chunks} (max: {max})")]
    TooManyChunks { target: String, chunks: u64, max: u64 },

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Completion of session {session_id} still processing after {attempts} polls")]
    CompletionTimeout { session_id: String, attempts: u32 },

    #[error("Completion of session {session_id} failed: {message}")]
    CompletionFailed { session_id: String, message: String },

    #[error("Name conflict for {name} in {parent_id} after {attempts} attempts")]
    NameConflict {
        parent_id: String,
        name: String,
        attempts: u32,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Worker failed: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TransferError {
    pub fn cancelled(op: impl Into<String>, target: impl Into<String>) -> Self {
        Self::Cancelled {
            op: op.into(),
            target: target.into(),
        }
    }

    /// Category reported to callers
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Api { category, .. } => *category,
            Self::Cancelled { .. } => ErrorCategory::Cancelled,
            Self::ChunkFailed { source, .. } => source.category(),
            Self::HashMismatch { .. } | Self::IncompleteCoverage { .. } | Self::Integrity(_) => {
                ErrorCategory::Integrity
            }
            Self::TooManyChunks { .. } | Self::ResourceExhausted(_) => {
                ErrorCategory::ResourceExhausted
            }
            Self::CompletionTimeout { .. } => ErrorCategory::NetworkTimeout,
            Self::NameConflict { .. } => ErrorCategory::Conflict,
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::NotADirectory(_) | Self::InvalidArgument(_) => ErrorCategory::Unknown,
            Self::CompletionFailed { .. }
            | Self::Store(_)
            | Self::Worker(_)
            | Self::Io(_)
            | Self::Serialization(_) => ErrorCategory::Unknown,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.category() == ErrorCategory::Cancelled
    }
}

impl From<sqlx::Error> for TransferError {
    fn from(e: sqlx::Error) -> Self {
        Self::Store(e.to_string())
    }
}
