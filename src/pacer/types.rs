//! Endpoint classes and the static endpoint table

use serde::{Deserialize, Serialize};

/// A family of provider endpoints sharing one quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    Listing,
    Metadata,
    Mutation,
    Session,
    ChunkUpload,
    Completion,
    Download,
}

impl EndpointClass {
    pub const ALL: [EndpointClass; 7] = [
        EndpointClass::Listing,
        EndpointClass::Metadata,
        EndpointClass::Mutation,
        EndpointClass::Session,
        EndpointClass::ChunkUpload,
        EndpointClass::Completion,
        EndpointClass::Download,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Listing => "listing",
            Self::Metadata => "metadata",
            Self::Mutation => "mutation",
            Self::Session => "session",
            Self::ChunkUpload => "chunk_upload",
            Self::Completion => "completion",
            Self::Download => "download",
        }
    }
}

/// Provider endpoint names used at call sites
pub mod endpoint {
    pub const LIST_CHILDREN: &str = "list_children";
    pub const GET_ENTRY: &str = "get_entry";
    pub const CREATE_DIR: &str = "create_dir";
    pub const DELETE: &str = "delete";
    pub const RENAME: &str = "rename";
    pub const MOVE: &str = "move";
    pub const CREATE_SESSION: &str = "create_session";
    pub const SESSION_STATUS: &str = "session_status";
    pub const ABORT_SESSION: &str = "abort_session";
    pub const UPLOAD_CHUNK: &str = "upload_chunk";
    pub const UPLOADED_CHUNKS: &str = "uploaded_chunks";
    pub const UPLOAD_SINGLE: &str = "upload_single";
    pub const COMPLETE: &str = "complete";
    pub const POLL_STATUS: &str = "poll_status";
    pub const READ_RANGE: &str = "read_range";
}

const ENDPOINT_CLASSES: &[(&str, EndpointClass)] = &[
    (endpoint::LIST_CHILDREN, EndpointClass::Listing),
    (endpoint::GET_ENTRY, EndpointClass::Metadata),
    (endpoint::CREATE_DIR, EndpointClass::Mutation),
    (endpoint::DELETE, EndpointClass::Mutation),
    (endpoint::RENAME, EndpointClass::Mutation),
    (endpoint::MOVE, EndpointClass::Mutation),
    (endpoint::CREATE_SESSION, EndpointClass::Session),
    (endpoint::SESSION_STATUS, EndpointClass::Session),
    (endpoint::ABORT_SESSION, EndpointClass::Session),
    (endpoint::UPLOAD_CHUNK, EndpointClass::ChunkUpload),
    (endpoint::UPLOADED_CHUNKS, EndpointClass::ChunkUpload),
    (endpoint::UPLOAD_SINGLE, EndpointClass::ChunkUpload),
    (endpoint::COMPLETE, EndpointClass::Completion),
    (endpoint::POLL_STATUS, EndpointClass::Completion),
    (endpoint::READ_RANGE, EndpointClass::Download),
];

/// Look up the class of a named endpoint
pub fn known_class(endpoint: &str) -> Option<EndpointClass> {
    ENDPOINT_CLASSES
        .iter()
        .find(|(name, _)| *name == endpoint)
        .map(|(_, class)| *class)
}
