//! Orchestration-facing memory service.
//!
//! The surface the conversation loop talks to: recall with rounded
//! relevance and human-readable annotations, confidence-gated saves that
//! run in the background, a two-phase forget flow, and supersession.
//! Infra failures never leak: retrieval degrades to absent memories and
//! writes answer with a "cannot save right now" style receipt.

use std::sync::Arc;

use anyhow::Result;
use redb::Database;
use serde::{Deserialize, Serialize};

use engram_ai::{CachedEmbedder, CompletionClient};
use engram_storage::{IndexableItem, KvStore, TextIndex, VectorConfig, VectorStore, time_utils};

use crate::config::MemoryConfig;
use crate::models::{MemoryCategory, MemoryStats, RecallQuery};
use crate::retrieval::{RetrievalEngine, TokenCounter};
use crate::storage::{AuditStorage, MemoryStorage};
use crate::write::{
    CreateMemory, DeleteOutcome, EpisodeOutcome, EpisodeRequest, SupersedeMemory,
    SupersedeOutcome, WriteJob, WritePipeline, WriteQueue,
};

/// A recalled memory as presented to the orchestration layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecalledMemory {
    pub memory_id: String,
    pub content: String,
    pub category: MemoryCategory,
    /// Relevance rounded to two decimals
    pub relevance: f64,
    /// Human-readable recency/importance annotation
    pub annotation: String,
}

/// Response to a recall request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallResponse {
    pub memories: Vec<RecalledMemory>,
    pub count: u32,
    pub truncated: bool,
    pub total_available: u32,
    /// Remaining hourly write quota for this user
    pub rate_limit_remaining: u64,
}

/// Request to save a memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveRequest {
    pub user_id: String,
    pub content: String,
    pub category: MemoryCategory,
    pub confidence: f32,
    pub importance: f32,
    #[serde(default)]
    pub source_conversation_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// Status of a save request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SaveStatus {
    /// Accepted; the write runs in the background
    Queued,
    /// Confidence between the gates; the caller must re-confirm
    ConfirmNeeded,
    /// Confidence below the keep gate; nothing was stored
    Discarded,
    Error,
}

/// Receipt for a save request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveReceipt {
    pub status: SaveStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SaveReceipt {
    fn status(status: SaveStatus) -> Self {
        Self {
            status,
            message: None,
        }
    }

    fn with_message(status: SaveStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
        }
    }
}

/// A deletion candidate shown to the user for confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgetCandidate {
    pub memory_id: String,
    pub content: String,
    pub relevance: f64,
}

/// The memory subsystem's public service.
pub struct MemoryService {
    storage: MemoryStorage,
    audit: AuditStorage,
    text_index: Arc<TextIndex>,
    engine: Arc<RetrievalEngine>,
    pipeline: Arc<WritePipeline>,
    queue: WriteQueue,
    kv: KvStore,
    config: MemoryConfig,
}

impl MemoryService {
    /// Assemble the service over a shared database and external model
    /// plumbing, and start the background write queue.
    pub fn new(
        db: Arc<Database>,
        text_index: Arc<TextIndex>,
        vector_config: VectorConfig,
        embedder: Arc<CachedEmbedder>,
        summarizer: Arc<dyn CompletionClient>,
        tokens: Arc<dyn TokenCounter>,
        config: MemoryConfig,
    ) -> Result<Self> {
        let storage = MemoryStorage::new(db.clone())?;
        let audit = AuditStorage::new(db.clone())?;
        let vectors = Arc::new(VectorStore::new(db.clone(), vector_config)?);
        let kv = KvStore::new(db)?;

        let engine = Arc::new(RetrievalEngine::new(
            storage.clone(),
            text_index.clone(),
            vectors.clone(),
            embedder.clone(),
            tokens,
            config.clone(),
        ));
        let pipeline = Arc::new(WritePipeline::new(
            storage.clone(),
            audit.clone(),
            text_index.clone(),
            vectors,
            embedder,
            kv.clone(),
            summarizer,
            engine.clone(),
            config.clone(),
        ));
        let queue = WriteQueue::start(pipeline.clone(), &config);

        Ok(Self {
            storage,
            audit,
            text_index,
            engine,
            pipeline,
            queue,
            kv,
            config,
        })
    }

    /// Assemble the service at the default on-disk locations (`~/.engram`,
    /// overridable via `ENGRAM_DIR`).
    pub fn open_default(
        vector_config: VectorConfig,
        embedder: Arc<CachedEmbedder>,
        summarizer: Arc<dyn CompletionClient>,
        tokens: Arc<dyn TokenCounter>,
        config: MemoryConfig,
    ) -> Result<Self> {
        let db = engram_storage::open_database(&engram_storage::paths::default_db_path()?)?;
        let text_index = Arc::new(TextIndex::open(&engram_storage::paths::default_index_dir()?)?);
        Self::new(
            db,
            text_index,
            vector_config,
            embedder,
            summarizer,
            tokens,
            config,
        )
    }

    // ============== Read path ==============

    /// Recall memories relevant to a query. Fails closed to an empty slate.
    pub async fn recall(
        &self,
        user_id: &str,
        query: &str,
        limit: Option<usize>,
    ) -> RecallResponse {
        let recall_query = RecallQuery::new(user_id.to_string(), query.to_string())
            .with_limit(limit.unwrap_or(self.config.default_limit))
            .with_min_score(self.config.min_relevance);

        let result = self.engine.search(&recall_query).await;
        let now = time_utils::now_ms();

        let memories: Vec<RecalledMemory> = result
            .memories
            .into_iter()
            .map(|scored| RecalledMemory {
                memory_id: scored.item.id.clone(),
                relevance: round2(scored.relevance),
                annotation: format_annotation(now, scored.item.created_at, scored.item.importance),
                category: scored.item.category,
                content: scored.item.content,
            })
            .collect();

        RecallResponse {
            count: memories.len() as u32,
            memories,
            truncated: result.truncated,
            total_available: result.total_available,
            rate_limit_remaining: self.rate_limit_remaining(user_id),
        }
    }

    /// Per-user memory statistics.
    pub fn stats(&self, user_id: &str) -> Result<MemoryStats> {
        self.storage.stats(user_id)
    }

    /// Read access to the append-only audit log.
    pub fn audit_log(&self) -> &AuditStorage {
        &self.audit
    }

    // ============== Write path ==============

    /// Save a memory, gated by confidence. Accepted writes run in the
    /// background; the receipt reflects intake, not completion.
    pub fn remember(&self, request: SaveRequest) -> SaveReceipt {
        if let Some(reason) = validate_save(&request) {
            return SaveReceipt::with_message(SaveStatus::Error, reason);
        }

        if request.confidence < self.config.confidence_discard_below {
            return SaveReceipt::with_message(SaveStatus::Discarded, "confidence too low to keep");
        }
        if request.confidence < self.config.confidence_confirm_below {
            return SaveReceipt::with_message(
                SaveStatus::ConfirmNeeded,
                "please confirm before this is saved",
            );
        }

        let job = WriteJob::Create(CreateMemory {
            user_id: request.user_id,
            content: request.content,
            category: request.category,
            confidence: request.confidence,
            importance: request.importance,
            source_conversation_id: request.source_conversation_id,
            correlation_id: request.correlation_id,
            source: Some("remember".to_string()),
        });

        match self.queue.try_enqueue(job) {
            Ok(()) => SaveReceipt::status(SaveStatus::Queued),
            Err(e) => {
                tracing::warn!(error = %e, "memory save rejected at intake");
                SaveReceipt::with_message(SaveStatus::Error, "cannot save right now")
            }
        }
    }

    /// First phase of forgetting: candidates for the user to confirm.
    pub async fn forget_candidates(&self, user_id: &str, description: &str) -> Vec<ForgetCandidate> {
        let query = self.pipeline.delete_candidates_query(user_id, description);
        let result = self.engine.search(&query).await;

        result
            .memories
            .into_iter()
            .map(|scored| ForgetCandidate {
                memory_id: scored.item.id,
                content: scored.item.content,
                relevance: round2(scored.relevance),
            })
            .collect()
    }

    /// Second phase of forgetting: soft-delete everything matching the
    /// confirmed description.
    pub async fn forget_confirmed(
        &self,
        user_id: &str,
        description: &str,
        correlation_id: Option<String>,
    ) -> DeleteOutcome {
        self.pipeline.delete(user_id, description, correlation_id).await
    }

    /// Replace a memory's content, preserving history via supersession.
    pub async fn correct(&self, request: SupersedeMemory) -> SupersedeOutcome {
        self.pipeline.supersede(request).await
    }

    /// Summarize a conversation into an episode memory (idempotent).
    pub async fn summarize_episode(&self, request: EpisodeRequest) -> EpisodeOutcome {
        self.pipeline.summarize_episode(request).await
    }

    /// Queue an episode summarization as fire-and-forget background work.
    pub fn queue_episode_summary(&self, request: EpisodeRequest) -> SaveReceipt {
        match self.queue.try_enqueue(WriteJob::Episode(request)) {
            Ok(()) => SaveReceipt::status(SaveStatus::Queued),
            Err(e) => {
                tracing::warn!(error = %e, "episode summary rejected at intake");
                SaveReceipt::with_message(SaveStatus::Error, "cannot summarize right now")
            }
        }
    }

    // ============== Maintenance ==============

    /// Rebuild the lexical index from the persisted item table. Only active
    /// items are indexed.
    pub fn rebuild_text_index(&self) -> Result<usize> {
        let items = self.storage.list_all()?;
        let indexable = items.into_iter().filter(|item| item.is_active()).map(|item| {
            IndexableItem {
                id: item.id,
                user_id: item.user_id,
                content: item.content,
                category: item.category.as_str().to_string(),
                created_at: item.created_at,
            }
        });
        let count = self.text_index.rebuild(indexable)?;
        tracing::info!(indexed = count, "rebuilt lexical memory index");
        Ok(count)
    }

    /// Close write intake and drain in-flight background writes with a
    /// bounded timeout.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }

    fn rate_limit_remaining(&self, user_id: &str) -> u64 {
        let key = format!("rate:user:{}", user_id);
        match self.kv.counter(&key) {
            Ok(used) => self.config.hourly_user_write_limit.saturating_sub(used),
            // Counter store failure fails open: report full quota
            Err(_) => self.config.hourly_user_write_limit,
        }
    }
}

fn validate_save(request: &SaveRequest) -> Option<String> {
    if request.user_id.trim().is_empty() {
        return Some("user id is required".to_string());
    }
    if request.content.trim().is_empty() {
        return Some("content must not be empty".to_string());
    }
    if !(0.0..=1.0).contains(&request.confidence) {
        return Some("confidence must be within [0, 1]".to_string());
    }
    if !(0.0..=1.0).contains(&request.importance) {
        return Some("importance must be within [0, 1]".to_string());
    }
    None
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn format_annotation(now_ms: i64, created_at: i64, importance: f32) -> String {
    let age_hours = (now_ms - created_at).max(0) / 3_600_000;

    let recency = if age_hours < 1 {
        "just now".to_string()
    } else if age_hours < 24 {
        "today".to_string()
    } else {
        let days = age_hours / 24;
        if days == 1 {
            "yesterday".to_string()
        } else if days < 7 {
            format!("{} days ago", days)
        } else if days < 35 {
            let weeks = days / 7;
            if weeks == 1 {
                "1 week ago".to_string()
            } else {
                format!("{} weeks ago", weeks)
            }
        } else {
            let months = days / 30;
            if months == 1 {
                "1 month ago".to_string()
            } else {
                format!("{} months ago", months)
            }
        }
    };

    let weight = if importance >= 0.75 {
        "high importance"
    } else if importance >= 0.4 {
        "medium importance"
    } else {
        "low importance"
    };

    format!("{}, {}", recency, weight)
}
