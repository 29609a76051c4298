//! Typed memory storage wrapper.
//!
//! Provides type-safe access to the byte-level item store. State transitions
//! (soft-delete, supersession) re-persist the full record through the same
//! put path, relying on redb statement atomicity.

use anyhow::Result;
use redb::Database;
use std::sync::Arc;

use engram_storage::ItemStore;

use crate::models::{MemoryItem, MemoryState, MemoryStats};

/// Typed memory storage wrapper around engram_storage::ItemStore.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: ItemStore,
}

impl MemoryStorage {
    /// Create a new MemoryStorage instance
    pub fn new(db: Arc<Database>) -> Result<Self> {
        Ok(Self {
            inner: ItemStore::new(db)?,
        })
    }

    /// Persist an item (insert or state-transition overwrite).
    pub fn put_item(&self, item: &MemoryItem) -> Result<()> {
        let json_bytes = serde_json::to_vec(item)?;
        self.inner.put_item_raw(&item.id, &item.user_id, &json_bytes)
    }

    /// Get an item by ID, regardless of owner. Internal use only; callers
    /// holding a user id must go through [`Self::get_item_for_user`].
    pub fn get_item(&self, item_id: &str) -> Result<Option<MemoryItem>> {
        if let Some(bytes) = self.inner.get_item_raw(item_id)? {
            let item: MemoryItem = serde_json::from_slice(&bytes)?;
            Ok(Some(item))
        } else {
            Ok(None)
        }
    }

    /// Get an item by ID, enforcing ownership. A hit owned by another user
    /// is indistinguishable from a miss.
    pub fn get_item_for_user(&self, user_id: &str, item_id: &str) -> Result<Option<MemoryItem>> {
        Ok(self
            .get_item(item_id)?
            .filter(|item| item.user_id == user_id))
    }

    /// List all items for a user, most recent first.
    pub fn list_items(&self, user_id: &str) -> Result<Vec<MemoryItem>> {
        let items = self.inner.list_items_by_user_raw(user_id)?;
        let mut result = Vec::new();
        for (_, bytes) in items {
            let item: MemoryItem = serde_json::from_slice(&bytes)?;
            result.push(item);
        }
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }

    /// List every item across users (index rebuild path).
    pub fn list_all(&self) -> Result<Vec<MemoryItem>> {
        let items = self.inner.list_all_raw()?;
        let mut result = Vec::new();
        for (_, bytes) in items {
            let item: MemoryItem = serde_json::from_slice(&bytes)?;
            result.push(item);
        }
        Ok(result)
    }

    /// List active items for a user, most recent first.
    pub fn list_active(&self, user_id: &str) -> Result<Vec<MemoryItem>> {
        let mut items = self.list_items(user_id)?;
        items.retain(|item| item.is_active());
        Ok(items)
    }

    /// Soft-delete an item. Returns the updated item, or None when the item
    /// is missing, not owned by the user, or not active.
    pub fn mark_deleted(
        &self,
        user_id: &str,
        item_id: &str,
        deleted_at: i64,
    ) -> Result<Option<MemoryItem>> {
        let Some(mut item) = self.get_item_for_user(user_id, item_id)? else {
            return Ok(None);
        };
        if !item.is_active() {
            return Ok(None);
        }

        item.state = MemoryState::Deleted { deleted_at };
        self.put_item(&item)?;
        Ok(Some(item))
    }

    /// Mark an item superseded by a new record. Returns the updated item, or
    /// None when the item is missing, not owned, or not active.
    pub fn mark_superseded(
        &self,
        user_id: &str,
        item_id: &str,
        by: &str,
        superseded_at: i64,
    ) -> Result<Option<MemoryItem>> {
        let Some(mut item) = self.get_item_for_user(user_id, item_id)? else {
            return Ok(None);
        };
        if !item.is_active() {
            return Ok(None);
        }

        item.state = MemoryState::Superseded {
            by: by.to_string(),
            superseded_at,
        };
        self.put_item(&item)?;
        Ok(Some(item))
    }

    /// Statistics about a user's memory store.
    pub fn stats(&self, user_id: &str) -> Result<MemoryStats> {
        let items = self.list_items(user_id)?;

        Ok(MemoryStats {
            user_id: user_id.to_string(),
            active_count: items.iter().filter(|item| item.is_active()).count() as u32,
            total_count: items.len() as u32,
            oldest_memory: items.iter().map(|item| item.created_at).min(),
            newest_memory: items.iter().map(|item| item.created_at).max(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MemoryCategory;
    use tempfile::tempdir;

    fn create_test_storage() -> (MemoryStorage, tempfile::TempDir) {
        let temp_dir = tempdir().unwrap();
        let db = Arc::new(Database::create(temp_dir.path().join("test.db")).unwrap());
        (MemoryStorage::new(db).unwrap(), temp_dir)
    }

    fn item(user_id: &str, content: &str) -> MemoryItem {
        MemoryItem::new(
            user_id.to_string(),
            content.to_string(),
            MemoryCategory::Fact,
            0.9,
            0.5,
        )
    }

    #[test]
    fn test_put_and_get() {
        let (storage, _tmp) = create_test_storage();
        let item = item("user-1", "uses FastAPI");
        storage.put_item(&item).unwrap();

        let loaded = storage.get_item(&item.id).unwrap().unwrap();
        assert_eq!(loaded, item);
    }

    #[test]
    fn test_ownership_enforced() {
        let (storage, _tmp) = create_test_storage();
        let item = item("user-1", "private fact");
        storage.put_item(&item).unwrap();

        assert!(storage.get_item_for_user("user-1", &item.id).unwrap().is_some());
        assert!(storage.get_item_for_user("user-2", &item.id).unwrap().is_none());
    }

    #[test]
    fn test_list_active_excludes_transitions() {
        let (storage, _tmp) = create_test_storage();
        let a = item("user-1", "keep me");
        let b = item("user-1", "delete me");
        storage.put_item(&a).unwrap();
        storage.put_item(&b).unwrap();

        storage.mark_deleted("user-1", &b.id, 100).unwrap().unwrap();

        let active = storage.list_active("user-1").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);

        // Deleted items are retained, just excluded from the active view
        assert_eq!(storage.list_items("user-1").unwrap().len(), 2);
    }

    #[test]
    fn test_mark_deleted_requires_ownership() {
        let (storage, _tmp) = create_test_storage();
        let a = item("user-1", "not yours");
        storage.put_item(&a).unwrap();

        assert!(storage.mark_deleted("user-2", &a.id, 100).unwrap().is_none());
        assert!(storage.get_item(&a.id).unwrap().unwrap().is_active());
    }

    #[test]
    fn test_mark_superseded_sets_pointer() {
        let (storage, _tmp) = create_test_storage();
        let old = item("user-1", "decided on MySQL");
        storage.put_item(&old).unwrap();

        let updated = storage
            .mark_superseded("user-1", &old.id, "mem-new", 100)
            .unwrap()
            .unwrap();
        assert_eq!(updated.superseded_by(), Some("mem-new"));

        // A second transition on the same item is refused
        assert!(
            storage
                .mark_superseded("user-1", &old.id, "mem-other", 101)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_stats() {
        let (storage, _tmp) = create_test_storage();
        let a = item("user-1", "one").with_created_at(10);
        let b = item("user-1", "two").with_created_at(20);
        storage.put_item(&a).unwrap();
        storage.put_item(&b).unwrap();
        storage.mark_deleted("user-1", &a.id, 30).unwrap();

        let stats = storage.stats("user-1").unwrap();
        assert_eq!(stats.active_count, 1);
        assert_eq!(stats.total_count, 2);
        assert_eq!(stats.oldest_memory, Some(10));
        assert_eq!(stats.newest_memory, Some(20));
    }
}
