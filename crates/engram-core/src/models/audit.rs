//! Audit models for the append-only memory write log.

use serde::{Deserialize, Serialize};

use engram_storage::time_utils;

/// Kind of mutation an audit row records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WriteOperation {
    Create,
    Delete,
    Supersede,
    Episode,
}

/// One immutable audit row per committed mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryWriteEvent {
    /// Unique identifier for this event
    pub id: String,

    /// The memory item this event concerns
    pub memory_id: String,

    /// Owning user
    pub user_id: String,

    /// What happened
    pub operation: WriteOperation,

    /// Content snapshot before the mutation, if there was one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_before: Option<String>,

    /// Content snapshot after the mutation, if there is one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_after: Option<String>,

    /// Extraction confidence at write time
    pub confidence: f32,

    /// Where the content was extracted from (tool name, pipeline stage)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Wall-clock duration of the operation
    pub latency_ms: u64,

    /// Correlation id linking the event to the triggering request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Unix timestamp in milliseconds
    pub created_at: i64,
}

impl MemoryWriteEvent {
    pub fn new(
        memory_id: impl Into<String>,
        user_id: impl Into<String>,
        operation: WriteOperation,
        confidence: f32,
    ) -> Self {
        Self {
            id: format!("evt-{}", uuid::Uuid::new_v4()),
            memory_id: memory_id.into(),
            user_id: user_id.into(),
            operation,
            content_before: None,
            content_after: None,
            confidence,
            source: None,
            latency_ms: 0,
            correlation_id: None,
            created_at: time_utils::now_ms(),
        }
    }

    #[must_use]
    pub fn with_content_before(mut self, content: impl Into<String>) -> Self {
        self.content_before = Some(content.into());
        self
    }

    #[must_use]
    pub fn with_content_after(mut self, content: impl Into<String>) -> Self {
        self.content_after = Some(content.into());
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: Option<String>) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}

/// Filters for querying the audit log.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub memory_id: Option<String>,
    pub user_id: Option<String>,
    pub operation: Option<WriteOperation>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}
