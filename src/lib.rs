//! Ferry
//!
//! A transfer engine for rate-limited, unreliable object storage APIs:
//! paced and retried provider calls, cached metadata, resumable chunked
//! uploads with integrity checks, and copies between stores.
//!
//! # Modules
//!
//! - `engine`: [`TransferEngine`], the entry point for every operation
//! - `upload`: sessions, chunk workers and completion polling
//! - `transfer`: buffering strategies for sources that cannot seek
//! - `api`: the provider interface and its HTTP client
//! - `pacer` / `retry`: call spacing per endpoint class and error handling
//! - `cache`: key-value stores and the metadata cache

pub mod api;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod hash;
pub mod pacer;
pub mod path;
pub mod retry;
pub mod source;
pub mod transfer;
pub mod upload;

pub use api::{CredentialProvider, HttpStorageApi, ReqwestTransport, StaticCredentials, StorageApi};
pub use config::EngineConfig;
pub use engine::{EngineStores, TransferEngine};
pub use error::{ApiError, ErrorCategory, Result, TransferError};
pub use source::{LocalFileSource, MemorySource, StreamSource, TransferSource};
pub use upload::TransferObject;
