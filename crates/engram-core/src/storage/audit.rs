//! Audit storage module for the append-only memory write log.

use std::sync::Arc;

use anyhow::{Context, Result};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::models::{AuditQuery, MemoryWriteEvent};

const AUDIT_TABLE: TableDefinition<&str, &str> = TableDefinition::new("memory_write_events");

/// Audit storage for persisting and querying memory write events.
///
/// Rows are append-only: there is no update or delete path.
#[derive(Clone)]
pub struct AuditStorage {
    db: Arc<Database>,
}

impl AuditStorage {
    /// Create an audit storage with an existing database.
    pub fn new(db: Arc<Database>) -> Result<Self> {
        {
            let write_txn = db.begin_write().context("Failed to begin write transaction")?;
            write_txn
                .open_table(AUDIT_TABLE)
                .context("Failed to open audit table")?;
            write_txn.commit().context("Failed to commit schema initialization")?;
        }

        Ok(Self { db })
    }

    /// Append an audit event.
    pub fn append(&self, event: &MemoryWriteEvent) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write transaction")?;
        {
            let mut table = write_txn
                .open_table(AUDIT_TABLE)
                .context("Failed to open audit table")?;

            let key = format!("{}:{}", event.memory_id, event.id);
            let value = serde_json::to_string(event).context("Failed to serialize audit event")?;
            table
                .insert(key.as_str(), value.as_str())
                .context("Failed to insert audit event")?;
        }
        write_txn.commit().context("Failed to commit audit event")?;

        Ok(())
    }

    /// Query audit events with filters, newest first.
    pub fn query(&self, query: &AuditQuery) -> Result<Vec<MemoryWriteEvent>> {
        let read_txn = self.db.begin_read().context("Failed to begin read transaction")?;
        let table = read_txn
            .open_table(AUDIT_TABLE)
            .context("Failed to open audit table")?;

        let mut events = Vec::new();
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(100);

        for entry in table.iter()? {
            let (_, value) = entry.context("Failed to read entry")?;

            if let Ok(event) = serde_json::from_str::<MemoryWriteEvent>(value.value()) {
                if let Some(ref memory_id) = query.memory_id
                    && event.memory_id != *memory_id
                {
                    continue;
                }
                if let Some(ref user_id) = query.user_id
                    && event.user_id != *user_id
                {
                    continue;
                }
                if let Some(operation) = query.operation
                    && event.operation != operation
                {
                    continue;
                }

                events.push(event);
            }
        }

        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let events: Vec<_> = events.into_iter().skip(offset).take(limit).collect();

        Ok(events)
    }

    /// Total number of audit rows.
    pub fn count(&self) -> Result<u64> {
        let read_txn = self.db.begin_read().context("Failed to begin read transaction")?;
        let table = read_txn
            .open_table(AUDIT_TABLE)
            .context("Failed to open audit table")?;

        let mut count = 0u64;
        for entry in table.iter()? {
            entry.context("Failed to read entry")?;
            count += 1;
        }
        Ok(count)
    }
}
