//! Memory models for the per-user long-term store.
//!
//! A [`MemoryItem`] is one remembered fact, preference, decision, note, or
//! episode. Items are owned by exactly one user and move through a lifecycle
//! encoded as a tagged state, so a record can never be deleted and superseded
//! at the same time:
//!
//! ```text
//!            create                    supersede(new)
//!  (none) ──────────▶ Active ───────────────────────▶ Superseded { by }
//!                        │
//!                        │ delete
//!                        ▼
//!                  Deleted { deleted_at }
//! ```
//!
//! Relevance is a query-time value and lives on [`ScoredMemory`], never on
//! the stored item.

use serde::{Deserialize, Serialize};

use engram_storage::time_utils;

/// Closed set of memory categories.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    Fact,
    Preference,
    Decision,
    Note,
    Episode,
}

impl MemoryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCategory::Fact => "fact",
            MemoryCategory::Preference => "preference",
            MemoryCategory::Decision => "decision",
            MemoryCategory::Note => "note",
            MemoryCategory::Episode => "episode",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fact" => Some(MemoryCategory::Fact),
            "preference" => Some(MemoryCategory::Preference),
            "decision" => Some(MemoryCategory::Decision),
            "note" => Some(MemoryCategory::Note),
            "episode" => Some(MemoryCategory::Episode),
            _ => None,
        }
    }
}

/// Lifecycle state of a memory item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MemoryState {
    Active,
    Deleted {
        /// Unix timestamp in milliseconds when the item was soft-deleted
        deleted_at: i64,
    },
    Superseded {
        /// Id of the item that replaced this one
        by: String,
        /// Unix timestamp in milliseconds when the supersession happened
        superseded_at: i64,
    },
}

/// A single remembered item, owned by one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryItem {
    /// Unique identifier for this item
    pub id: String,

    /// Owning user; every read and write is scoped by this field
    pub user_id: String,

    /// The remembered content (text)
    pub content: String,

    /// Category of the memory
    pub category: MemoryCategory,

    /// How much this memory matters when slates compete for budget (0-1)
    pub importance: f32,

    /// Extraction confidence reported by the reasoning component (0-1)
    pub confidence: f32,

    /// Lifecycle state
    #[serde(default = "default_state")]
    pub state: MemoryState,

    /// Vector embedding for semantic search
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    /// Unix timestamp in milliseconds when this item was created
    pub created_at: i64,

    /// Conversation the memory was extracted from, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_conversation_id: Option<String>,
}

fn default_state() -> MemoryState {
    MemoryState::Active
}

impl MemoryItem {
    /// Create a new active memory item with a minted id.
    pub fn new(
        user_id: String,
        content: String,
        category: MemoryCategory,
        confidence: f32,
        importance: f32,
    ) -> Self {
        let id = format!("mem-{}", uuid::Uuid::new_v4());
        let created_at = time_utils::now_ms();

        Self {
            id,
            user_id,
            content,
            category,
            importance,
            confidence,
            state: MemoryState::Active,
            embedding: None,
            created_at,
            source_conversation_id: None,
        }
    }

    /// Create an item with a specific ID (for deserialization/testing)
    #[must_use]
    pub fn with_id(mut self, id: String) -> Self {
        self.id = id;
        self
    }

    /// Attach an embedding to this item
    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Link the source conversation
    #[must_use]
    pub fn with_source_conversation(mut self, conversation_id: String) -> Self {
        self.source_conversation_id = Some(conversation_id);
        self
    }

    /// Set the created_at timestamp
    #[must_use]
    pub fn with_created_at(mut self, timestamp: i64) -> Self {
        self.created_at = timestamp;
        self
    }

    pub fn is_active(&self) -> bool {
        self.state == MemoryState::Active
    }

    /// Id of the item that superseded this one, if any.
    pub fn superseded_by(&self) -> Option<&str> {
        match &self.state {
            MemoryState::Superseded { by, .. } => Some(by),
            _ => None,
        }
    }
}

/// Query parameters for memory retrieval.
#[derive(Debug, Clone)]
pub struct RecallQuery {
    pub user_id: String,
    pub query: String,
    pub limit: usize,
    pub category: Option<MemoryCategory>,
    /// Minimum normalized relevance (0-1) for returned items.
    pub min_score: f64,
    /// Override the configured token budget (used by internal callers).
    pub budget_override: Option<usize>,
}

impl RecallQuery {
    pub fn new(user_id: String, query: String) -> Self {
        Self {
            user_id,
            query,
            limit: 10,
            category: None,
            min_score: 0.0,
            budget_override: None,
        }
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub fn with_category(mut self, category: MemoryCategory) -> Self {
        self.category = Some(category);
        self
    }

    #[must_use]
    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = min_score;
        self
    }
}

/// A retrieved item with its query-time relevance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredMemory {
    pub item: MemoryItem,
    /// Normalized fused relevance (0-1), advisory only.
    pub relevance: f64,
}

/// Result of a retrieval operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallResult {
    /// Ranked memories that fit the token budget
    pub memories: Vec<ScoredMemory>,

    /// Tokens consumed by the returned slate
    pub token_count: usize,

    /// True iff a candidate was excluded solely by the token budget
    pub truncated: bool,

    /// Candidates above the relevance floor, before limit and budget
    pub total_available: u32,
}

impl RecallResult {
    pub fn empty() -> Self {
        Self {
            memories: Vec::new(),
            token_count: 0,
            truncated: false,
            total_available: 0,
        }
    }
}

/// Statistics about a user's memory store.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MemoryStats {
    pub user_id: String,
    pub active_count: u32,
    pub total_count: u32,
    pub oldest_memory: Option<i64>,
    pub newest_memory: Option<i64>,
}
