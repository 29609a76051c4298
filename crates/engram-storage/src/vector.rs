//! Vector storage using HNSW for approximate nearest neighbor search.
//!
//! Provides low-level vector storage with persistence to redb. The HNSW
//! index is kept in memory for fast cosine search, with vectors persisted
//! to the database and the index rebuilt on load.

use anyhow::Result;
use hnsw_rs::prelude::*;
use parking_lot::RwLock;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

type VectorIndex = Hnsw<'static, f32, DistCosine>;

const VECTOR_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("memory_vectors");

/// Configuration for vector storage.
#[derive(Debug, Clone)]
pub struct VectorConfig {
    /// Vector dimension (e.g., 1536 for OpenAI text-embedding-3-small)
    pub dimension: usize,
    /// Maximum number of connections per node (16-64 typical)
    pub max_connections: usize,
    /// Search width during construction (200-800 typical)
    pub ef_construction: usize,
    /// Maximum elements to store
    pub max_elements: usize,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            dimension: 1536,
            max_connections: 16,
            ef_construction: 200,
            max_elements: 100_000,
        }
    }
}

/// Low-level vector storage with HNSW index.
pub struct VectorStore {
    db: Arc<Database>,
    config: VectorConfig,
    /// HNSW index (in-memory, rebuilt on load)
    index: RwLock<VectorIndex>,
    /// item_id -> internal vector ID
    id_map: RwLock<HashMap<String, usize>>,
    /// internal vector ID -> item_id
    reverse_map: RwLock<HashMap<usize, String>>,
    /// Next available vector ID
    next_id: RwLock<usize>,
}

impl VectorStore {
    /// Create new vector storage, loading existing vectors from DB.
    pub fn new(db: Arc<Database>, config: VectorConfig) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(VECTOR_TABLE)?;
        write_txn.commit()?;

        let hnsw: VectorIndex = Hnsw::new(
            config.max_connections,
            config.max_elements,
            16,
            config.ef_construction,
            DistCosine,
        );

        let store = Self {
            db,
            config,
            index: RwLock::new(hnsw),
            id_map: RwLock::new(HashMap::new()),
            reverse_map: RwLock::new(HashMap::new()),
            next_id: RwLock::new(0),
        };

        store.rebuild_index()?;
        Ok(store)
    }

    /// Add a vector for an item.
    pub fn add(&self, item_id: &str, vector: &[f32]) -> Result<()> {
        if vector.len() != self.config.dimension {
            anyhow::bail!(
                "Vector dimension mismatch: expected {}, got {}",
                self.config.dimension,
                vector.len()
            );
        }

        if self.id_map.read().contains_key(item_id) {
            return self.update(item_id, vector);
        }

        let vector_id = {
            let mut next = self.next_id.write();
            let id = *next;
            *next += 1;
            id
        };

        {
            let index = self.index.write();
            index.insert((vector, vector_id));
        }

        {
            let mut id_map = self.id_map.write();
            let mut reverse = self.reverse_map.write();
            id_map.insert(item_id.to_string(), vector_id);
            reverse.insert(vector_id, item_id.to_string());
        }

        self.persist_vector(item_id, vector)?;
        Ok(())
    }

    /// Update an existing vector.
    pub fn update(&self, item_id: &str, vector: &[f32]) -> Result<()> {
        self.delete(item_id)?;
        self.add(item_id, vector)
    }

    /// Delete a vector.
    pub fn delete(&self, item_id: &str) -> Result<bool> {
        let vector_id = {
            let id_map = self.id_map.read();
            match id_map.get(item_id) {
                Some(&id) => id,
                None => return Ok(false),
            }
        };

        {
            let mut id_map = self.id_map.write();
            let mut reverse = self.reverse_map.write();
            id_map.remove(item_id);
            reverse.remove(&vector_id);
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(VECTOR_TABLE)?;
            table.remove(item_id)?;
        }
        write_txn.commit()?;

        Ok(true)
    }

    /// Search for similar vectors restricted to an allowed id set.
    ///
    /// The allowed set carries the caller's ownership scope, so a result can
    /// never reference another user's item. Returns (item_id, cosine distance)
    /// pairs in ascending distance order.
    pub fn search_scoped(
        &self,
        query: &[f32],
        top_k: usize,
        ef_search: usize,
        allowed_ids: &[String],
    ) -> Result<Vec<(String, f32)>> {
        if query.len() != self.config.dimension {
            anyhow::bail!(
                "Query dimension mismatch: expected {}, got {}",
                self.config.dimension,
                query.len()
            );
        }

        let allowed_set: HashSet<&String> = allowed_ids.iter().collect();
        if allowed_set.is_empty() {
            return Ok(Vec::new());
        }

        let index = self.index.read();
        let reverse = self.reverse_map.read();
        // Search for more results than needed, then filter
        let search_k = top_k * 10; // Over-fetch to account for filtering
        let results = index.search(query, search_k, ef_search);

        Ok(results
            .into_iter()
            .filter_map(|entry| {
                let item_id = reverse.get(&entry.d_id)?;
                if allowed_set.contains(item_id) {
                    Some((item_id.clone(), entry.distance))
                } else {
                    None
                }
            })
            .take(top_k)
            .collect())
    }

    /// Check if an item has a vector.
    pub fn has_vector(&self, item_id: &str) -> bool {
        self.id_map.read().contains_key(item_id)
    }

    /// Get vector count.
    pub fn count(&self) -> usize {
        self.id_map.read().len()
    }

    fn persist_vector(&self, item_id: &str, vector: &[f32]) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(vector, bincode::config::standard())?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(VECTOR_TABLE)?;
            table.insert(item_id, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn rebuild_index(&self) -> Result<()> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(VECTOR_TABLE)?;
        let mut vectors: Vec<(String, Vec<f32>)> = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let item_id = key.value().to_string();
            let (vector, _): (Vec<f32>, usize) =
                bincode::serde::decode_from_slice(value.value(), bincode::config::standard())?;
            vectors.push((item_id, vector));
        }
        drop(read_txn);

        let mut index = self.index.write();
        let mut id_map = self.id_map.write();
        let mut reverse = self.reverse_map.write();
        let mut next_id = self.next_id.write();

        *index = Hnsw::new(
            self.config.max_connections,
            self.config.max_elements,
            16,
            self.config.ef_construction,
            DistCosine,
        );

        id_map.clear();
        reverse.clear();
        *next_id = 0;

        for (item_id, vector) in vectors {
            let vector_id = *next_id;
            *next_id += 1;
            index.insert((vector.as_slice(), vector_id));
            id_map.insert(item_id.clone(), vector_id);
            reverse.insert(vector_id, item_id);
        }

        tracing::info!("Rebuilt vector index with {} vectors", id_map.len());
        Ok(())
    }
}
