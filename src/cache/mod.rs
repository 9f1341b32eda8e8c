//! Key-value stores and the metadata cache built on them

pub mod metadata;
pub mod store;

pub use metadata::{Generation, MetadataCache, Mutation, PathEntry};
pub use store::{KvStore, MemoryKvStore, NamespacedStore, SqliteKvStore};
