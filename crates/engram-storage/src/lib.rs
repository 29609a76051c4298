//! Engram Storage - low-level persistence for the memory subsystem.
//!
//! This crate provides the persistence layer for the memory store, using
//! redb as the embedded database. It exposes byte-level APIs so that the
//! typed models can live in engram-core without circular dependencies.
//!
//! # Tables
//!
//! - `memory_items` - serialized memory items by id
//! - `memory_user_index` - user_id:item_id -> item_id (user-scoped listing)
//! - `kv_entries` - TTL key-value entries (embedding cache, rate counters,
//!   episode idempotency flags)
//! - `memory_vectors` - persisted embedding vectors for the HNSW index

pub mod item;
pub mod kv;
pub mod paths;
pub mod text_index;
pub mod time_utils;
pub mod vector;

use anyhow::Result;
use redb::Database;
use std::path::Path;
use std::sync::Arc;

pub use item::ItemStore;
pub use kv::KvStore;
pub use text_index::{IndexableItem, SearchHit, TextIndex};
pub use vector::{VectorConfig, VectorStore};

/// Open (or create) the shared database at the given path.
pub fn open_database(path: &Path) -> Result<Arc<Database>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Arc::new(Database::create(path)?))
}

/// Create an in-memory database (for testing).
pub fn in_memory_database() -> Result<Arc<Database>> {
    Ok(Arc::new(
        Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?,
    ))
}
