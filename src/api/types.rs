//! Provider wire types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Credentials
// ============================================================================

/// A bearer credential and its expiry
#[derive(Debug, Clone)]
pub struct Credential {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Utc::now() >= at).unwrap_or(false)
    }
}

// ============================================================================
// Entries
// ============================================================================

/// A file or directory on the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub id: String,

    #[serde(default)]
    pub parent_id: Option<String>,

    pub name: String,

    #[serde(default)]
    pub is_dir: bool,

    #[serde(default)]
    pub size: u64,

    /// SHA-256 of the content, hex encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,

    pub modified_at: DateTime<Utc>,
}

/// One page of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPage {
    pub entries: Vec<RemoteEntry>,

    /// Absent on the last page
    #[serde(default)]
    pub next_page_token: Option<String>,
}

// ============================================================================
// Upload Sessions
// ============================================================================

/// Handshake opening an upload session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub parent_id: String,
    pub name: String,
    pub size: u64,

    /// When present the provider checks for an existing copy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,

    pub chunk_size: u64,
    pub total_chunks: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,

    /// Content already stored; no bytes need to be sent
    #[serde(default)]
    pub is_duplicate: bool,

    /// The stored file, for duplicates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing: Option<RemoteEntry>,
}

/// Provider acknowledgement of one chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub chunk_index: u64,

    /// Hash of the bytes the provider received
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkList {
    pub chunks: Vec<ChunkAck>,
}

/// State of a session after finalize, or while polling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum CompletionStatus {
    /// Provider is still assembling the file
    Processing,
    Complete { file: RemoteEntry },
    Failed { error: String },
}

/// Body of provider error responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default)]
    pub code: Option<String>,
}
