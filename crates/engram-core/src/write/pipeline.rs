//! Write pipeline: validation, rate limiting, deduplication, persistence.
//!
//! Every mutation follows a fixed state machine and terminates in a named
//! outcome. Policy rejections (rate limit, duplicate, threshold not met)
//! are ordinary outcomes, not errors; infra failures are caught at the
//! operation boundary and converted to an `Error` outcome so nothing raises
//! across the pipeline boundary.
//!
//! ```text
//! create:  rate_check ─▶ embed ─▶ duplicate_check ─▶ persist ─▶ audit
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use engram_ai::{CachedEmbedder, CompletionClient, EmbedOutcome};
use engram_storage::{IndexableItem, KvStore, TextIndex, VectorStore, time_utils};

use crate::config::MemoryConfig;
use crate::models::{
    MemoryCategory, MemoryItem, MemoryWriteEvent, RecallQuery, WriteOperation,
};
use crate::retrieval::RetrievalEngine;
use crate::storage::{AuditStorage, MemoryStorage};

const EPISODE_SYSTEM_PROMPT: &str = "You condense a conversation into a single short memory for a \
personal assistant. Capture what the user wanted, what was decided or produced, and any durable \
facts or preferences that surfaced. Write at most three sentences in the third person.";

/// TTL for episode idempotency flags.
const EPISODE_FLAG_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

/// Request to create a memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMemory {
    pub user_id: String,
    pub content: String,
    pub category: MemoryCategory,
    pub confidence: f32,
    pub importance: f32,
    #[serde(default)]
    pub source_conversation_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Extraction source recorded in the audit row
    #[serde(default)]
    pub source: Option<String>,
}

/// Request to supersede a memory with corrected content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupersedeMemory {
    pub user_id: String,
    pub old_id: String,
    pub new_content: String,
    pub category: MemoryCategory,
    pub confidence: f32,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// One turn of the conversation an episode summarizes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

/// Request to summarize a finished conversation into an episode memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeRequest {
    pub user_id: String,
    pub conversation_id: String,
    pub turns: Vec<ConversationTurn>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// Outcome of a create attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WriteOutcome {
    Created { memory_id: String },
    Duplicate { existing_id: String },
    RateLimited,
    Invalid { reason: String },
    Error { message: String },
}

/// Outcome of a delete-by-description attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted { memory_ids: Vec<String> },
    NotFound,
    Error { message: String },
}

/// Outcome of a supersede attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SupersedeOutcome {
    Superseded { new_id: String },
    NotFound,
    Invalid { reason: String },
    Error { message: String },
}

/// Outcome of an episode summarization attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum EpisodeOutcome {
    Summarized { memory_id: String },
    AlreadySummarized,
    ThresholdNotMet,
    Error { message: String },
}

/// Write pipeline over a user's memory store.
pub struct WritePipeline {
    storage: MemoryStorage,
    audit: AuditStorage,
    text_index: Arc<TextIndex>,
    vectors: Arc<VectorStore>,
    embedder: Arc<CachedEmbedder>,
    kv: KvStore,
    summarizer: Arc<dyn CompletionClient>,
    retrieval: Arc<RetrievalEngine>,
    config: MemoryConfig,
}

impl WritePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: MemoryStorage,
        audit: AuditStorage,
        text_index: Arc<TextIndex>,
        vectors: Arc<VectorStore>,
        embedder: Arc<CachedEmbedder>,
        kv: KvStore,
        summarizer: Arc<dyn CompletionClient>,
        retrieval: Arc<RetrievalEngine>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            storage,
            audit,
            text_index,
            vectors,
            embedder,
            kv,
            summarizer,
            retrieval,
            config,
        }
    }

    // ============== Create ==============

    /// Create a new memory: rate_check → embed → duplicate_check → persist → audit.
    pub async fn create(&self, request: CreateMemory) -> WriteOutcome {
        let started = Instant::now();

        if let Some(reason) = validate_create(&request) {
            return WriteOutcome::Invalid { reason };
        }

        if self.rate_limited(&request.user_id, request.source_conversation_id.as_deref()) {
            return WriteOutcome::RateLimited;
        }

        match self.create_checked(request, started).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "memory create failed");
                WriteOutcome::Error {
                    message: "cannot save right now".to_string(),
                }
            }
        }
    }

    async fn create_checked(
        &self,
        request: CreateMemory,
        started: Instant,
    ) -> Result<WriteOutcome> {
        let vector = match self.embedder.embed(&request.content).await {
            Ok(EmbedOutcome::Ready(vector)) => vector,
            Ok(EmbedOutcome::Unavailable) => {
                return Ok(WriteOutcome::Error {
                    message: "embedding unavailable".to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        // Duplicate check over the user's active memories only
        let active_ids: Vec<String> = self
            .storage
            .list_active(&request.user_id)?
            .iter()
            .map(|item| item.id.clone())
            .collect();
        if let Some((existing_id, distance)) = self
            .vectors
            .search_scoped(&vector, 1, self.config.ef_search, &active_ids)?
            .into_iter()
            .next()
        {
            let similarity = 1.0 - distance;
            if similarity >= self.config.duplicate_threshold {
                return Ok(WriteOutcome::Duplicate { existing_id });
            }
        }

        let mut item = MemoryItem::new(
            request.user_id.clone(),
            request.content.clone(),
            request.category,
            request.confidence,
            request.importance,
        )
        .with_embedding(vector);
        if let Some(conversation_id) = request.source_conversation_id.clone() {
            item = item.with_source_conversation(conversation_id);
        }

        self.storage.put_item(&item)?;
        self.index_item(&item)?;

        let operation = if request.category == MemoryCategory::Episode {
            WriteOperation::Episode
        } else {
            WriteOperation::Create
        };
        let event = MemoryWriteEvent::new(&item.id, &item.user_id, operation, request.confidence)
            .with_content_after(request.content)
            .with_source(request.source)
            .with_latency_ms(started.elapsed().as_millis() as u64)
            .with_correlation_id(request.correlation_id);
        self.audit.append(&event)?;

        Ok(WriteOutcome::Created { memory_id: item.id })
    }

    // ============== Delete ==============

    /// Soft-delete every active memory matching a description.
    pub async fn delete(
        &self,
        user_id: &str,
        description: &str,
        correlation_id: Option<String>,
    ) -> DeleteOutcome {
        let started = Instant::now();
        match self.delete_checked(user_id, description, correlation_id, started).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "memory delete failed");
                DeleteOutcome::Error {
                    message: "cannot delete right now".to_string(),
                }
            }
        }
    }

    async fn delete_checked(
        &self,
        user_id: &str,
        description: &str,
        correlation_id: Option<String>,
        started: Instant,
    ) -> Result<DeleteOutcome> {
        let matches = self
            .retrieval
            .search_internal(&self.delete_candidates_query(user_id, description))
            .await?;
        if matches.memories.is_empty() {
            return Ok(DeleteOutcome::NotFound);
        }

        let now = time_utils::now_ms();
        let mut deleted = Vec::new();
        for scored in matches.memories {
            let item_id = scored.item.id.clone();
            // Races with concurrent transitions resolve here: only the
            // winner sees the item as still active
            let Some(item) = self.storage.mark_deleted(user_id, &item_id, now)? else {
                continue;
            };
            self.text_index.remove_item(&item_id)?;
            self.vectors.delete(&item_id)?;

            let event =
                MemoryWriteEvent::new(&item_id, user_id, WriteOperation::Delete, item.confidence)
                    .with_content_before(item.content.clone())
                    .with_latency_ms(started.elapsed().as_millis() as u64)
                    .with_correlation_id(correlation_id.clone());
            self.audit.append(&event)?;

            deleted.push(item_id);
        }

        if deleted.is_empty() {
            return Ok(DeleteOutcome::NotFound);
        }
        Ok(DeleteOutcome::Deleted {
            memory_ids: deleted,
        })
    }

    /// Query used to find deletion candidates; also backs the confirmation
    /// flow in the service layer.
    pub(crate) fn delete_candidates_query(&self, user_id: &str, description: &str) -> RecallQuery {
        let mut query = RecallQuery::new(user_id.to_string(), description.to_string())
            .with_limit(self.config.delete_max_candidates)
            .with_min_score(self.config.delete_min_score);
        // Candidate selection is not a prompt slate; bypass the token budget
        query.budget_override = Some(usize::MAX);
        query
    }

    // ============== Supersede ==============

    /// Replace a memory's content by minting a new record and linking the
    /// old one as superseded-by it.
    pub async fn supersede(&self, request: SupersedeMemory) -> SupersedeOutcome {
        let started = Instant::now();

        if request.new_content.trim().is_empty() {
            return SupersedeOutcome::Invalid {
                reason: "content must not be empty".to_string(),
            };
        }
        if !(0.0..=1.0).contains(&request.confidence) {
            return SupersedeOutcome::Invalid {
                reason: "confidence must be within [0, 1]".to_string(),
            };
        }

        match self.supersede_checked(request, started).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "memory supersede failed");
                SupersedeOutcome::Error {
                    message: "cannot update right now".to_string(),
                }
            }
        }
    }

    async fn supersede_checked(
        &self,
        request: SupersedeMemory,
        started: Instant,
    ) -> Result<SupersedeOutcome> {
        let Some(old) = self
            .storage
            .get_item_for_user(&request.user_id, &request.old_id)?
        else {
            return Ok(SupersedeOutcome::NotFound);
        };
        if !old.is_active() {
            return Ok(SupersedeOutcome::NotFound);
        }

        let vector = match self.embedder.embed(&request.new_content).await {
            Ok(EmbedOutcome::Ready(vector)) => vector,
            Ok(EmbedOutcome::Unavailable) => {
                return Ok(SupersedeOutcome::Error {
                    message: "embedding unavailable".to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        // New record first; a fresh id is always minted so chains stay acyclic
        let new_item = MemoryItem::new(
            request.user_id.clone(),
            request.new_content.clone(),
            request.category,
            request.confidence,
            old.importance,
        )
        .with_embedding(vector);

        self.storage.put_item(&new_item)?;
        self.index_item(&new_item)?;

        self.storage.mark_superseded(
            &request.user_id,
            &old.id,
            &new_item.id,
            time_utils::now_ms(),
        )?;
        self.text_index.remove_item(&old.id)?;
        self.vectors.delete(&old.id)?;

        let event = MemoryWriteEvent::new(
            &new_item.id,
            &request.user_id,
            WriteOperation::Supersede,
            request.confidence,
        )
        .with_content_before(old.content.clone())
        .with_content_after(request.new_content)
        .with_latency_ms(started.elapsed().as_millis() as u64)
        .with_correlation_id(request.correlation_id);
        self.audit.append(&event)?;

        Ok(SupersedeOutcome::Superseded {
            new_id: new_item.id,
        })
    }

    // ============== Episode summarization ==============

    /// Summarize a conversation into an episode memory, once per conversation.
    pub async fn summarize_episode(&self, request: EpisodeRequest) -> EpisodeOutcome {
        let flag_key = format!("episode:{}", request.conversation_id);
        match self.kv.get(&flag_key) {
            Ok(Some(_)) => return EpisodeOutcome::AlreadySummarized,
            Ok(None) => {}
            Err(e) => {
                // Flag store failure fails open: a rare double summary beats
                // never summarizing
                tracing::debug!(error = %e, "idempotency flag unavailable; proceeding");
            }
        }

        let user_turns = request
            .turns
            .iter()
            .filter(|turn| turn.role == TurnRole::User)
            .count();
        if request.turns.len() < self.config.episode_min_turns
            && user_turns < self.config.episode_min_user_turns
        {
            return EpisodeOutcome::ThresholdNotMet;
        }

        let transcript = format_transcript(&request.turns);
        let summary = match self
            .summarizer
            .complete(
                EPISODE_SYSTEM_PROMPT,
                &transcript,
                self.config.episode_max_summary_tokens,
            )
            .await
        {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!(error = %e, conversation_id = %request.conversation_id, "episode summarization failed");
                return EpisodeOutcome::Error {
                    message: "cannot summarize right now".to_string(),
                };
            }
        };

        let outcome = self
            .create(CreateMemory {
                user_id: request.user_id.clone(),
                content: summary,
                category: MemoryCategory::Episode,
                confidence: 1.0,
                importance: self.config.episode_importance,
                source_conversation_id: Some(request.conversation_id.clone()),
                correlation_id: request.correlation_id,
                source: Some("episode_summarizer".to_string()),
            })
            .await;

        match outcome {
            WriteOutcome::Created { memory_id } => {
                self.set_episode_flag(&flag_key);
                EpisodeOutcome::Summarized { memory_id }
            }
            // An equivalent summary already exists; treat as done
            WriteOutcome::Duplicate { .. } => {
                self.set_episode_flag(&flag_key);
                EpisodeOutcome::AlreadySummarized
            }
            WriteOutcome::RateLimited => EpisodeOutcome::Error {
                message: "write rate limited".to_string(),
            },
            WriteOutcome::Invalid { reason } => EpisodeOutcome::Error { message: reason },
            WriteOutcome::Error { message } => EpisodeOutcome::Error { message },
        }
    }

    fn set_episode_flag(&self, flag_key: &str) {
        if let Err(e) = self.kv.set_with_ttl(flag_key, b"1", EPISODE_FLAG_TTL) {
            tracing::warn!(error = %e, "failed to set episode idempotency flag");
        }
    }

    // ============== Shared helpers ==============

    /// Check the per-user hourly and per-conversation write counters.
    /// Counter store failures fail open: the write is allowed.
    fn rate_limited(&self, user_id: &str, conversation_id: Option<&str>) -> bool {
        let user_key = format!("rate:user:{}", user_id);
        match self.kv.incr_with_expiry(&user_key, Duration::from_secs(3600)) {
            Ok(count) if count > self.config.hourly_user_write_limit => return true,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "rate counter unavailable; allowing write");
            }
        }

        if let Some(conversation_id) = conversation_id {
            let conv_key = format!("rate:conv:{}", conversation_id);
            match self
                .kv
                .incr_with_expiry(&conv_key, Duration::from_secs(24 * 3600))
            {
                Ok(count) if count > self.config.conversation_write_limit => return true,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "rate counter unavailable; allowing write");
                }
            }
        }

        false
    }

    fn index_item(&self, item: &MemoryItem) -> Result<()> {
        self.text_index.index_item(&IndexableItem {
            id: item.id.clone(),
            user_id: item.user_id.clone(),
            content: item.content.clone(),
            category: item.category.as_str().to_string(),
            created_at: item.created_at,
        })?;
        if let Some(ref vector) = item.embedding {
            self.vectors.add(&item.id, vector)?;
        }
        Ok(())
    }
}

fn validate_create(request: &CreateMemory) -> Option<String> {
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

fn format_transcript(turns: &[ConversationTurn]) -> String {
    let mut output = String::new();
    for turn in turns {
        match turn.role {
            TurnRole::User => output.push_str("User: "),
            TurnRole::Assistant => output.push_str("Assistant: "),
        }
        output.push_str(&turn.content);
        output.push_str("\n\n");
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuditQuery;
    use crate::retrieval::HeuristicTokenCounter;
    use engram_ai::{MockCompletion, MockEmbedding};
    use engram_storage::{VectorConfig, in_memory_database};

    const DIM: usize = 64;

    struct Harness {
        pipeline: WritePipeline,
        retrieval: Arc<RetrievalEngine>,
        storage: MemoryStorage,
        audit: AuditStorage,
        provider: Arc<MockEmbedding>,
        completion: Arc<MockCompletion>,
    }

    fn harness() -> Harness {
        harness_with_config(MemoryConfig::default())
    }

    fn harness_with_config(config: MemoryConfig) -> Harness {
        let db = in_memory_database().unwrap();
        let storage = MemoryStorage::new(db.clone()).unwrap();
        let audit = AuditStorage::new(db.clone()).unwrap();
        let text_index = Arc::new(TextIndex::in_memory().unwrap());
        let vectors = Arc::new(
            VectorStore::new(
                db.clone(),
                VectorConfig {
                    dimension: DIM,
                    max_connections: 8,
                    ef_construction: 100,
                    max_elements: 1000,
                },
            )
            .unwrap(),
        );
        let kv = KvStore::new(db).unwrap();
        let provider = Arc::new(MockEmbedding::new(DIM));
        let embedder = Arc::new(CachedEmbedder::new(provider.clone(), kv.clone()));
        let completion = Arc::new(MockCompletion::new(
            "The user set up a PostgreSQL-backed service.",
        ));

        let retrieval = Arc::new(RetrievalEngine::new(
            storage.clone(),
            text_index.clone(),
            vectors.clone(),
            embedder.clone(),
            Arc::new(HeuristicTokenCounter),
            config.clone(),
        ));

        let pipeline = WritePipeline::new(
            storage.clone(),
            audit.clone(),
            text_index,
            vectors,
            embedder,
            kv,
            completion.clone(),
            retrieval.clone(),
            config,
        );

        Harness {
            pipeline,
            retrieval,
            storage,
            audit,
            provider,
            completion,
        }
    }

    fn create_request(user_id: &str, content: &str) -> CreateMemory {
        CreateMemory {
            user_id: user_id.to_string(),
            content: content.to_string(),
            category: MemoryCategory::Fact,
            confidence: 0.9,
            importance: 0.5,
            source_conversation_id: None,
            correlation_id: None,
            source: None,
        }
    }

    fn turns(total: usize, user: usize) -> Vec<ConversationTurn> {
        let mut turns = Vec::new();
        for i in 0..total {
            turns.push(ConversationTurn {
                role: if i < user {
                    TurnRole::User
                } else {
                    TurnRole::Assistant
                },
                content: format!("turn {}", i),
            });
        }
        turns
    }

    #[tokio::test]
    async fn test_create_persists_and_audits() {
        let h = harness();

        let outcome = h.pipeline.create(create_request("user-1", "uses FastAPI")).await;
        let WriteOutcome::Created { memory_id } = outcome else {
            panic!("expected created, got {:?}", outcome);
        };

        let item = h.storage.get_item(&memory_id).unwrap().unwrap();
        assert!(item.is_active());
        assert!(item.embedding.is_some());

        let events = h
            .audit
            .query(&AuditQuery {
                memory_id: Some(memory_id),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, WriteOperation::Create);
        assert_eq!(events[0].content_after.as_deref(), Some("uses FastAPI"));
    }

    #[tokio::test]
    async fn test_duplicate_idempotence() {
        let h = harness();

        let first = h
            .pipeline
            .create(create_request("user-1", "prefers dark mode"))
            .await;
        let WriteOutcome::Created { memory_id } = first else {
            panic!("expected created");
        };

        let second = h
            .pipeline
            .create(create_request("user-1", "prefers dark mode"))
            .await;
        assert_eq!(
            second,
            WriteOutcome::Duplicate {
                existing_id: memory_id.clone()
            }
        );

        // Exactly one active item
        let active = h.storage.list_active("user-1").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, memory_id);
    }

    #[tokio::test]
    async fn test_duplicates_do_not_cross_users() {
        let h = harness();

        let first = h
            .pipeline
            .create(create_request("user-1", "prefers dark mode"))
            .await;
        assert!(matches!(first, WriteOutcome::Created { .. }));

        // Identical content for another user is not a duplicate
        let second = h
            .pipeline
            .create(create_request("user-2", "prefers dark mode"))
            .await;
        assert!(matches!(second, WriteOutcome::Created { .. }));
    }

    #[tokio::test]
    async fn test_validation_rejects_before_side_effects() {
        let h = harness();

        let mut request = create_request("user-1", "  ");
        let outcome = h.pipeline.create(request.clone()).await;
        assert!(matches!(outcome, WriteOutcome::Invalid { .. }));

        request.content = "fine".to_string();
        request.confidence = 1.5;
        let outcome = h.pipeline.create(request).await;
        assert!(matches!(outcome, WriteOutcome::Invalid { .. }));

        assert_eq!(h.audit.count().unwrap(), 0);
        assert!(h.storage.list_items("user-1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_per_user() {
        let mut config = MemoryConfig::default();
        config.hourly_user_write_limit = 2;
        let h = harness_with_config(config);

        for i in 0..2 {
            let outcome = h
                .pipeline
                .create(create_request("user-1", &format!("fact number {}", i)))
                .await;
            assert!(matches!(outcome, WriteOutcome::Created { .. }));
        }

        let outcome = h.pipeline.create(create_request("user-1", "one too many")).await;
        assert_eq!(outcome, WriteOutcome::RateLimited);

        // Other users are unaffected
        let outcome = h.pipeline.create(create_request("user-2", "still fine")).await;
        assert!(matches!(outcome, WriteOutcome::Created { .. }));
    }

    #[tokio::test]
    async fn test_embedding_outage_surfaces_error() {
        let h = harness();
        h.provider.set_failing(true);

        let outcome = h.pipeline.create(create_request("user-1", "anything")).await;
        assert!(matches!(outcome, WriteOutcome::Error { .. }));
        assert!(h.storage.list_items("user-1").unwrap().is_empty());
        assert_eq!(h.audit.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_soft_deletes_and_audits() {
        let h = harness();

        let outcome = h
            .pipeline
            .create(create_request("user-1", "temporary note about staging server"))
            .await;
        let WriteOutcome::Created { memory_id } = outcome else {
            panic!("expected created");
        };

        let deleted = h
            .pipeline
            .delete("user-1", "staging server note", None)
            .await;
        assert_eq!(
            deleted,
            DeleteOutcome::Deleted {
                memory_ids: vec![memory_id.clone()]
            }
        );

        // Retained for audit, excluded from retrieval
        let item = h.storage.get_item(&memory_id).unwrap().unwrap();
        assert!(!item.is_active());

        let result = h
            .retrieval
            .search(&RecallQuery::new(
                "user-1".to_string(),
                "staging server".to_string(),
            ))
            .await;
        assert!(result.memories.is_empty());

        let events = h
            .audit
            .query(&AuditQuery {
                memory_id: Some(memory_id),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(events.len(), 2); // create + delete
    }

    #[tokio::test]
    async fn test_delete_not_found() {
        let h = harness();
        let outcome = h.pipeline.delete("user-1", "nothing like this", None).await;
        assert_eq!(outcome, DeleteOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_supersede_chain() {
        let h = harness();

        let outcome = h
            .pipeline
            .create(create_request("user-1", "decided on MySQL"))
            .await;
        let WriteOutcome::Created { memory_id: old_id } = outcome else {
            panic!("expected created");
        };

        let outcome = h
            .pipeline
            .supersede(SupersedeMemory {
                user_id: "user-1".to_string(),
                old_id: old_id.clone(),
                new_content: "decided on PostgreSQL".to_string(),
                category: MemoryCategory::Decision,
                confidence: 0.95,
                correlation_id: None,
            })
            .await;
        let SupersedeOutcome::Superseded { new_id } = outcome else {
            panic!("expected superseded, got {:?}", outcome);
        };
        assert_ne!(new_id, old_id);

        let old = h.storage.get_item(&old_id).unwrap().unwrap();
        assert_eq!(old.superseded_by(), Some(new_id.as_str()));

        // Retrieval returns the replacement, never the superseded record
        let result = h
            .retrieval
            .search(&RecallQuery::new("user-1".to_string(), "decided".to_string()))
            .await;
        assert!(result.memories.iter().any(|scored| scored.item.id == new_id));
        assert!(result.memories.iter().all(|scored| scored.item.id != old_id));

        let events = h
            .audit
            .query(&AuditQuery {
                memory_id: Some(new_id),
                ..Default::default()
            })
            .unwrap();
        let supersede_event = events
            .iter()
            .find(|event| event.operation == WriteOperation::Supersede)
            .unwrap();
        assert_eq!(
            supersede_event.content_before.as_deref(),
            Some("decided on MySQL")
        );
        assert_eq!(
            supersede_event.content_after.as_deref(),
            Some("decided on PostgreSQL")
        );
    }

    #[tokio::test]
    async fn test_supersede_not_owned_is_not_found() {
        let h = harness();

        let outcome = h
            .pipeline
            .create(create_request("user-1", "private decision"))
            .await;
        let WriteOutcome::Created { memory_id } = outcome else {
            panic!("expected created");
        };

        let outcome = h
            .pipeline
            .supersede(SupersedeMemory {
                user_id: "user-2".to_string(),
                old_id: memory_id.clone(),
                new_content: "hijacked".to_string(),
                category: MemoryCategory::Decision,
                confidence: 0.9,
                correlation_id: None,
            })
            .await;
        assert_eq!(outcome, SupersedeOutcome::NotFound);
        assert!(h.storage.get_item(&memory_id).unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn test_episode_threshold_not_met() {
        let h = harness();

        let outcome = h
            .pipeline
            .summarize_episode(EpisodeRequest {
                user_id: "user-1".to_string(),
                conversation_id: "conv-1".to_string(),
                turns: turns(3, 1),
                correlation_id: None,
            })
            .await;
        assert_eq!(outcome, EpisodeOutcome::ThresholdNotMet);
        assert_eq!(h.completion.call_count(), 0);
    }

    #[tokio::test]
    async fn test_episode_user_turns_suffice() {
        let h = harness();

        // Below the raw-turn threshold but at the user-turn threshold
        let outcome = h
            .pipeline
            .summarize_episode(EpisodeRequest {
                user_id: "user-1".to_string(),
                conversation_id: "conv-1".to_string(),
                turns: turns(6, 5),
                correlation_id: None,
            })
            .await;
        assert!(matches!(outcome, EpisodeOutcome::Summarized { .. }));
    }

    #[tokio::test]
    async fn test_episode_idempotency() {
        let h = harness();

        let request = EpisodeRequest {
            user_id: "user-1".to_string(),
            conversation_id: "conv-1".to_string(),
            turns: turns(12, 6),
            correlation_id: None,
        };

        let first = h.pipeline.summarize_episode(request.clone()).await;
        let EpisodeOutcome::Summarized { memory_id } = first else {
            panic!("expected summarized, got {:?}", first);
        };

        let second = h.pipeline.summarize_episode(request).await;
        assert_eq!(second, EpisodeOutcome::AlreadySummarized);
        assert_eq!(h.completion.call_count(), 1);

        let item = h.storage.get_item(&memory_id).unwrap().unwrap();
        assert_eq!(item.category, MemoryCategory::Episode);
        assert_eq!(item.source_conversation_id.as_deref(), Some("conv-1"));
    }

    #[tokio::test]
    async fn test_episode_summarizer_outage() {
        let h = harness();
        h.completion.set_failing(true);

        let outcome = h
            .pipeline
            .summarize_episode(EpisodeRequest {
                user_id: "user-1".to_string(),
                conversation_id: "conv-1".to_string(),
                turns: turns(12, 6),
                correlation_id: None,
            })
            .await;
        assert!(matches!(outcome, EpisodeOutcome::Error { .. }));

        // No flag was set; a later retry may succeed
        h.completion.set_failing(false);
        let outcome = h
            .pipeline
            .summarize_episode(EpisodeRequest {
                user_id: "user-1".to_string(),
                conversation_id: "conv-1".to_string(),
                turns: turns(12, 6),
                correlation_id: None,
            })
            .await;
        assert!(matches!(outcome, EpisodeOutcome::Summarized { .. }));
    }
}
