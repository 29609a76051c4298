//! Memory item storage - byte-level API for memory persistence.
//!
//! Provides low-level storage operations for memory items using the redb
//! embedded database. Items are indexed by user_id so that every read path
//! can be scoped to its owner.
//!
//! # Tables
//!
//! - `memory_items`: item_id -> item_data
//! - `memory_user_index`: user_id:item_id -> item_id (for listing by user)

use anyhow::Result;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::sync::Arc;

const ITEM_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("memory_items");

/// Index: user_id:item_id -> item_id
const USER_INDEX_TABLE: TableDefinition<&str, &str> = TableDefinition::new("memory_user_index");

/// Low-level memory item storage with byte-level API.
#[derive(Clone)]
pub struct ItemStore {
    db: Arc<Database>,
}

impl ItemStore {
    /// Create a new ItemStore instance
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(ITEM_TABLE)?;
        write_txn.open_table(USER_INDEX_TABLE)?;
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Store a raw memory item with its user index entry.
    ///
    /// Re-putting an existing item id overwrites the stored bytes, which is
    /// how state transitions (delete, supersede) are persisted.
    pub fn put_item_raw(&self, item_id: &str, user_id: &str, data: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut item_table = write_txn.open_table(ITEM_TABLE)?;
            item_table.insert(item_id, data)?;

            let mut user_index = write_txn.open_table(USER_INDEX_TABLE)?;
            let user_key = format!("{}:{}", user_id, item_id);
            user_index.insert(user_key.as_str(), item_id)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Get raw item data by ID
    pub fn get_item_raw(&self, item_id: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ITEM_TABLE)?;

        if let Some(value) = table.get(item_id)? {
            Ok(Some(value.value().to_vec()))
        } else {
            Ok(None)
        }
    }

    /// List all items for a user
    pub fn list_items_by_user_raw(&self, user_id: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        let user_index = read_txn.open_table(USER_INDEX_TABLE)?;
        let item_table = read_txn.open_table(ITEM_TABLE)?;

        let prefix = format!("{}:", user_id);
        let mut items = Vec::new();

        for entry in user_index.iter()? {
            let (key, value) = entry?;
            let key_str = key.value();

            if key_str.starts_with(&prefix) {
                let item_id = value.value();
                if let Some(item_data) = item_table.get(item_id)? {
                    items.push((item_id.to_string(), item_data.value().to_vec()));
                }
            }
        }

        Ok(items)
    }

    /// List all items across users (index rebuild path).
    pub fn list_all_raw(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        let item_table = read_txn.open_table(ITEM_TABLE)?;

        let mut items = Vec::new();
        for entry in item_table.iter()? {
            let (key, value) = entry?;
            items.push((key.value().to_string(), value.value().to_vec()));
        }

        Ok(items)
    }

    /// Count items for a user
    pub fn count_items_by_user(&self, user_id: &str) -> Result<u32> {
        let read_txn = self.db.begin_read()?;
        let user_index = read_txn.open_table(USER_INDEX_TABLE)?;

        let prefix = format!("{}:", user_id);
        let mut count = 0u32;

        for entry in user_index.iter()? {
            let (key, _) = entry?;
            if key.value().starts_with(&prefix) {
                count += 1;
            }
        }

        Ok(count)
    }
}
