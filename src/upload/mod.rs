//! Resumable chunked uploads
//!
//! Flow:
//! 1. [`SessionManager::open`] handshakes with the provider (dedup check,
//!    name collision handling) or resumes saved progress
//! 2. [`SessionManager::run`] sends the content in one request or in
//!    chunks through [`ChunkedUploader`]
//! 3. [`Finalizer`] closes the session, polling if the provider assembles
//!    asynchronously

pub mod chunked;
pub mod completion;
pub mod progress;
pub mod session;
pub mod throughput;
pub mod types;

pub use chunked::ChunkedUploader;
pub use completion::Finalizer;
pub use progress::ProgressStore;
pub use session::SessionManager;
pub use throughput::ThroughputMeter;
pub use types::*;
