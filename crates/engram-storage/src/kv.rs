//! TTL key-value store backing the shared cache concerns.
//!
//! Backs the embedding cache, rate-limit counters, and episode idempotency
//! flags. Entries carry an optional expiry timestamp; reads treat expired
//! entries as absent. Counters are incremented atomically inside a single
//! write transaction so concurrent writers cannot lose updates.

use anyhow::Result;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::time_utils;

const KV_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv_entries");

#[derive(Debug, Serialize, Deserialize)]
struct KvEntry {
    value: Vec<u8>,
    /// Unix ms after which the entry is treated as absent. None = no expiry.
    expires_at: Option<i64>,
}

impl KvEntry {
    fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now_ms)
    }
}

/// Key-value store with TTL semantics over redb.
#[derive(Clone)]
pub struct KvStore {
    db: Arc<Database>,
}

impl KvStore {
    /// Create a new KvStore instance
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(KV_TABLE)?;
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Get a value, treating expired entries as absent.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(KV_TABLE)?;

        let Some(raw) = table.get(key)? else {
            return Ok(None);
        };

        let (entry, _): (KvEntry, usize) =
            bincode::serde::decode_from_slice(raw.value(), bincode::config::standard())?;

        if entry.is_expired(time_utils::now_ms()) {
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    /// Set a value with a time-to-live.
    pub fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let entry = KvEntry {
            value: value.to_vec(),
            expires_at: Some(time_utils::now_ms() + ttl.as_millis() as i64),
        };
        self.put_entry(key, &entry)
    }

    /// Set a value without expiry.
    pub fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let entry = KvEntry {
            value: value.to_vec(),
            expires_at: None,
        };
        self.put_entry(key, &entry)
    }

    /// Atomically increment a counter, creating it with the given TTL when
    /// absent or expired. Returns the new count.
    ///
    /// The TTL is only applied on creation; subsequent increments keep the
    /// original window so the counter resets at a fixed interval.
    pub fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64> {
        let now = time_utils::now_ms();
        let write_txn = self.db.begin_write()?;
        let count = {
            let mut table = write_txn.open_table(KV_TABLE)?;

            let existing = table
                .get(key)?
                .map(|raw| {
                    bincode::serde::decode_from_slice::<KvEntry, _>(
                        raw.value(),
                        bincode::config::standard(),
                    )
                })
                .transpose()?
                .map(|(entry, _)| entry)
                .filter(|entry| !entry.is_expired(now));

            let (count, expires_at) = match existing {
                Some(entry) => {
                    let current = decode_counter(&entry.value);
                    (current + 1, entry.expires_at)
                }
                None => (1, Some(now + ttl.as_millis() as i64)),
            };

            let entry = KvEntry {
                value: count.to_le_bytes().to_vec(),
                expires_at,
            };
            let encoded = bincode::serde::encode_to_vec(&entry, bincode::config::standard())?;
            table.insert(key, encoded.as_slice())?;
            count
        };
        write_txn.commit()?;
        Ok(count)
    }

    /// Read a counter value without incrementing. Absent or expired → 0.
    pub fn counter(&self, key: &str) -> Result<u64> {
        Ok(self.get(key)?.map(|v| decode_counter(&v)).unwrap_or(0))
    }

    /// Remove a key.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(KV_TABLE)?;
            table.remove(key)?.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }

    fn put_entry(&self, key: &str, entry: &KvEntry) -> Result<()> {
        let encoded = bincode::serde::encode_to_vec(entry, bincode::config::standard())?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(KV_TABLE)?;
            table.insert(key, encoded.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

fn decode_counter(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let len = bytes.len().min(8);
    buf[..len].copy_from_slice(&bytes[..len]);
    u64::from_le_bytes(buf)
}
