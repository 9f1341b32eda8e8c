//! Storage provider interface
//!
//! - [`StorageApi`]: the provider operations the engine needs
//! - [`CredentialProvider`]: bearer credentials with expiry
//! - [`Remote`]: the single call site wrapping every provider call with
//!   pacing, timeouts, cancellation and the retry policy
//! - [`HttpStorageApi`]: JSON REST implementation over an [`HttpTransport`]

pub mod http;
#[cfg(test)]
pub mod mock;
pub mod remote;
pub mod types;

pub use http::{HttpRequest, HttpResponse, HttpStorageApi, HttpTransport, Method, ReqwestTransport};
pub use remote::{Call, Remote};
pub use types::*;

use async_trait::async_trait;

use crate::error::ApiError;

/// Result of a single provider call
pub type ApiResult<T> = std::result::Result<T, ApiError>;

// ============================================================================
// Provider Operations
// ============================================================================

#[async_trait]
pub trait StorageApi: Send + Sync {
    async fn get_entry(&self, credential: &Credential, id: &str) -> ApiResult<RemoteEntry>;

    async fn list_children(
        &self,
        credential: &Credential,
        parent_id: &str,
        page_token: Option<&str>,
    ) -> ApiResult<ListPage>;

    async fn create_dir(
        &self,
        credential: &Credential,
        parent_id: &str,
        name: &str,
    ) -> ApiResult<RemoteEntry>;

    async fn delete_entry(&self, credential: &Credential, id: &str) -> ApiResult<()>;

    async fn rename_entry(
        &self,
        credential: &Credential,
        id: &str,
        new_name: &str,
    ) -> ApiResult<RemoteEntry>;

    async fn move_entry(
        &self,
        credential: &Credential,
        id: &str,
        new_parent_id: &str,
    ) -> ApiResult<RemoteEntry>;

    async fn create_session(
        &self,
        credential: &Credential,
        request: &CreateSessionRequest,
    ) -> ApiResult<CreateSessionResponse>;

    async fn upload_chunk(
        &self,
        credential: &Credential,
        session_id: &str,
        chunk_index: u64,
        offset: u64,
        data: &[u8],
        hash: &str,
    ) -> ApiResult<ChunkAck>;

    /// Chunks the provider holds for a session
    async fn uploaded_chunks(
        &self,
        credential: &Credential,
        session_id: &str,
    ) -> ApiResult<Vec<ChunkAck>>;

    /// Send the whole content in one request
    async fn upload_single(
        &self,
        credential: &Credential,
        session_id: &str,
        data: &[u8],
        hash: &str,
    ) -> ApiResult<RemoteEntry>;

    async fn complete_session(
        &self,
        credential: &Credential,
        session_id: &str,
    ) -> ApiResult<CompletionStatus>;

    async fn session_status(
        &self,
        credential: &Credential,
        session_id: &str,
    ) -> ApiResult<CompletionStatus>;

    async fn abort_session(&self, credential: &Credential, session_id: &str) -> ApiResult<()>;

    async fn read_range(
        &self,
        credential: &Credential,
        id: &str,
        offset: u64,
        length: u64,
    ) -> ApiResult<Vec<u8>>;
}

// ============================================================================
// Credentials
// ============================================================================

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// A credential that is valid now, renewing it first if needed
    async fn ensure_valid(&self) -> ApiResult<Credential>;

    /// Renew unconditionally, after the provider rejected the current one
    async fn force_refresh(&self) -> ApiResult<Credential>;
}

/// A fixed bearer token that never expires
pub struct StaticCredentials {
    credential: Credential,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            credential: Credential::bearer(token),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn ensure_valid(&self) -> ApiResult<Credential> {
        Ok(self.credential.clone())
    }

    async fn force_refresh(&self) -> ApiResult<Credential> {
        Ok(self.credential.clone())
    }
}
