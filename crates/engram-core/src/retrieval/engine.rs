//! Retrieval engine fusing lexical and vector search.
//!
//! Runs both searches over the caller's user scope, fuses the rankings with
//! Reciprocal Rank Fusion, and trims the slate to the token budget. The
//! public entry point fails closed: any underlying search failure yields an
//! empty result rather than a partial or fabricated context.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use sha2::{Digest, Sha256};

use engram_ai::{CachedEmbedder, EmbedOutcome};
use engram_storage::{TextIndex, VectorStore};

use crate::config::MemoryConfig;
use crate::models::{MemoryItem, RecallQuery, RecallResult, ScoredMemory};
use crate::retrieval::{TokenCounter, budget};
use crate::storage::MemoryStorage;

/// Retrieval engine over one user's active memories.
pub struct RetrievalEngine {
    storage: MemoryStorage,
    text_index: Arc<TextIndex>,
    vectors: Arc<VectorStore>,
    embedder: Arc<CachedEmbedder>,
    tokens: Arc<dyn TokenCounter>,
    config: MemoryConfig,
}

impl RetrievalEngine {
    pub fn new(
        storage: MemoryStorage,
        text_index: Arc<TextIndex>,
        vectors: Arc<VectorStore>,
        embedder: Arc<CachedEmbedder>,
        tokens: Arc<dyn TokenCounter>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            storage,
            text_index,
            vectors,
            embedder,
            tokens,
            config,
        }
    }

    /// Search a user's memories. Fails closed: infra errors are logged with
    /// a content hash of the query (never the raw text) and produce an
    /// empty result.
    pub async fn search(&self, query: &RecallQuery) -> RecallResult {
        match self.search_internal(query).await {
            Ok(result) => result,
            Err(e) => {
                let query_hash = hex::encode(Sha256::digest(query.query.as_bytes()));
                tracing::warn!(
                    user_id = %query.user_id,
                    query_hash = %query_hash,
                    error = %e,
                    "retrieval failed closed"
                );
                RecallResult::empty()
            }
        }
    }

    /// Fallible search used by internal callers that need to distinguish an
    /// infra failure from a genuinely empty result.
    pub(crate) async fn search_internal(&self, query: &RecallQuery) -> Result<RecallResult> {
        let trimmed = query.query.trim();
        if trimmed.is_empty() {
            return Ok(RecallResult::empty());
        }

        // Candidate scope: the user's active items, optionally one category.
        // Both search legs are restricted to this set, so results can never
        // cross owners or surface deleted/superseded items.
        let mut candidates: HashMap<String, MemoryItem> = self
            .storage
            .list_active(&query.user_id)?
            .into_iter()
            .filter(|item| query.category.is_none_or(|c| item.category == c))
            .map(|item| (item.id.clone(), item))
            .collect();
        let allowed_ids: Vec<String> = candidates.keys().cloned().collect();

        let fetch_limit = query.limit.saturating_mul(2).max(1);
        let category = query.category.map(|c| c.as_str());

        let lexical_ids: Vec<String> = self
            .text_index
            .search(trimmed, &query.user_id, category, fetch_limit)?
            .into_iter()
            .map(|hit| hit.item_id)
            .collect();

        let vector_ids: Vec<String> = match self.embedder.embed(trimmed).await {
            Ok(EmbedOutcome::Ready(vector)) => self
                .vectors
                .search_scoped(&vector, fetch_limit, self.config.ef_search, &allowed_ids)?
                .into_iter()
                .map(|(id, _)| id)
                .collect(),
            // Degrade to lexical-only, never fail
            Ok(EmbedOutcome::Unavailable) => Vec::new(),
            Err(e) => {
                tracing::debug!(error = %e, "query embedding rejected; lexical-only");
                Vec::new()
            }
        };

        let fused = rrf_fuse(&lexical_ids, &vector_ids, self.config.rrf_k);

        let mut ranked: Vec<ScoredMemory> = Vec::new();
        for (id, score) in fused {
            let relevance = (score * self.config.rrf_k).min(1.0);
            if relevance < query.min_score {
                continue;
            }
            // Stale index entries (item no longer in the active scope) are dropped
            let Some(item) = candidates.remove(&id) else {
                continue;
            };
            ranked.push(ScoredMemory { item, relevance });
        }

        let total_available = ranked.len() as u32;
        ranked.truncate(query.limit);

        let budget = query.budget_override.unwrap_or(self.config.token_budget);
        let outcome = budget::enforce(ranked, budget, self.tokens.as_ref());

        Ok(RecallResult {
            memories: outcome.kept,
            token_count: outcome.token_count,
            truncated: outcome.truncated,
            total_available,
        })
    }
}

/// Reciprocal Rank Fusion over two 1-indexed rankings.
///
/// Each appearance contributes `1/(k + rank)`; items in both lists
/// accumulate both terms. Order is descending fused score with a stable
/// tie-break on first appearance.
fn rrf_fuse(lexical: &[String], vector: &[String], k: f64) -> Vec<(String, f64)> {
    let mut order: Vec<String> = Vec::new();
    let mut scores: HashMap<String, f64> = HashMap::new();

    for list in [lexical, vector] {
        for (i, id) in list.iter().enumerate() {
            let rank = (i + 1) as f64;
            let entry = scores.entry(id.clone()).or_insert_with(|| {
                order.push(id.clone());
                0.0
            });
            *entry += 1.0 / (k + rank);
        }
    }

    let mut fused: Vec<(String, f64)> = order
        .into_iter()
        .map(|id| {
            let score = scores[&id];
            (id, score)
        })
        .collect();

    // Stable sort: ties keep first-appearance order
    fused.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MemoryCategory;
    use crate::retrieval::HeuristicTokenCounter;
    use engram_ai::{EmbeddingProvider, MockEmbedding};
    use engram_storage::{KvStore, VectorConfig, in_memory_database};

    const DIM: usize = 64;

    struct Harness {
        engine: RetrievalEngine,
        storage: MemoryStorage,
        text_index: Arc<TextIndex>,
        vectors: Arc<VectorStore>,
        provider: Arc<MockEmbedding>,
    }

    fn harness() -> Harness {
        let db = in_memory_database().unwrap();
        let storage = MemoryStorage::new(db.clone()).unwrap();
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
        let provider = Arc::new(MockEmbedding::new(DIM));
        let embedder = Arc::new(CachedEmbedder::new(
            provider.clone(),
            KvStore::new(db).unwrap(),
        ));

        let engine = RetrievalEngine::new(
            storage.clone(),
            text_index.clone(),
            vectors.clone(),
            embedder,
            Arc::new(HeuristicTokenCounter),
            MemoryConfig::default(),
        );

        Harness {
            engine,
            storage,
            text_index,
            vectors,
            provider,
        }
    }

    impl Harness {
        async fn seed(&self, user_id: &str, content: &str, category: MemoryCategory) -> String {
            let vector = self.provider.embed(content).await.unwrap();
            let item = MemoryItem::new(
                user_id.to_string(),
                content.to_string(),
                category,
                0.9,
                0.5,
            )
            .with_embedding(vector.clone());

            self.storage.put_item(&item).unwrap();
            self.text_index
                .index_item(&engram_storage::IndexableItem {
                    id: item.id.clone(),
                    user_id: user_id.to_string(),
                    content: content.to_string(),
                    category: category.as_str().to_string(),
                    created_at: item.created_at,
                })
                .unwrap();
            self.vectors.add(&item.id, &vector).unwrap();
            item.id
        }
    }

    #[test]
    fn test_rrf_both_lists_outscores_single() {
        let a = vec!["x".to_string(), "shared".to_string()];
        let b = vec!["y".to_string(), "shared".to_string()];

        let fused = rrf_fuse(&a, &b, 60.0);
        let score = |id: &str| fused.iter().find(|(i, _)| i == id).unwrap().1;

        // "shared" appears at rank 2 in both lists and must outscore any
        // item appearing at rank 2 in only one list
        assert!(score("shared") > score("x").max(score("y")));
        assert_eq!(fused[0].0, "shared");
    }

    #[test]
    fn test_rrf_tie_break_is_stable() {
        let a = vec!["first".to_string()];
        let b = vec!["second".to_string()];

        // Equal ranks in disjoint lists tie; the lexical item appeared first
        let fused = rrf_fuse(&a, &b, 60.0);
        assert_eq!(fused[0].0, "first");
        assert_eq!(fused[1].0, "second");
        assert_eq!(fused[0].1, fused[1].1);
    }

    #[test]
    fn test_rrf_rank_one_normalizes_near_one() {
        let a = vec!["top".to_string()];
        let fused = rrf_fuse(&a, &a, 60.0);
        let normalized = (fused[0].1 * 60.0).min(1.0);
        assert_eq!(normalized, 1.0);
    }

    #[tokio::test]
    async fn test_empty_query_is_empty_result() {
        let h = harness();
        h.seed("user-1", "prefers dark mode", MemoryCategory::Preference)
            .await;

        let result = h
            .engine
            .search(&RecallQuery::new("user-1".to_string(), "   ".to_string()))
            .await;
        assert!(result.memories.is_empty());
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_scenario_database_choice_ranks_first() {
        let h = harness();
        h.seed("user-1", "prefers dark mode", MemoryCategory::Preference)
            .await;
        h.seed("user-1", "uses FastAPI", MemoryCategory::Fact).await;
        let decision = h
            .seed(
                "user-1",
                "decided on PostgreSQL as the database choice",
                MemoryCategory::Decision,
            )
            .await;

        // Overlapping content for another user must not leak in
        h.seed(
            "user-2",
            "decided on PostgreSQL as the database choice",
            MemoryCategory::Decision,
        )
        .await;

        let result = h
            .engine
            .search(&RecallQuery::new(
                "user-1".to_string(),
                "database choice".to_string(),
            ))
            .await;

        assert!(!result.memories.is_empty());
        assert_eq!(result.memories[0].item.id, decision);
        assert!(!result.truncated, "ample budget must not truncate");
        assert!(
            result
                .memories
                .iter()
                .all(|scored| scored.item.user_id == "user-1")
        );
    }

    #[tokio::test]
    async fn test_embedding_outage_degrades_to_lexical() {
        let h = harness();
        h.seed("user-1", "decided on PostgreSQL", MemoryCategory::Decision)
            .await;

        h.provider.set_failing(true);
        let result = h
            .engine
            .search(&RecallQuery::new(
                "user-1".to_string(),
                "postgresql".to_string(),
            ))
            .await;

        assert_eq!(result.memories.len(), 1);
        assert!(!result.truncated, "truncated must reflect budget only");
    }

    #[tokio::test]
    async fn test_budget_truncation() {
        let h = harness();
        for i in 0..6 {
            h.seed(
                "user-1",
                &format!("database note number {} with plenty of extra words", i),
                MemoryCategory::Note,
            )
            .await;
        }

        let query = RecallQuery::new("user-1".to_string(), "database note".to_string());
        let mut query = query;
        query.budget_override = Some(15);

        let result = h.engine.search(&query).await;
        assert!(result.truncated);
        assert!(result.token_count <= 15);
        assert!((result.memories.len() as u32) < result.total_available);
    }

    #[tokio::test]
    async fn test_category_filter() {
        let h = harness();
        h.seed("user-1", "postgres keeps the data", MemoryCategory::Fact)
            .await;
        let decision = h
            .seed("user-1", "postgres is the decision", MemoryCategory::Decision)
            .await;

        let result = h
            .engine
            .search(
                &RecallQuery::new("user-1".to_string(), "postgres".to_string())
                    .with_category(MemoryCategory::Decision),
            )
            .await;

        assert_eq!(result.memories.len(), 1);
        assert_eq!(result.memories[0].item.id, decision);
    }

    #[tokio::test]
    async fn test_min_score_filters() {
        let h = harness();
        h.seed("user-1", "barely related words", MemoryCategory::Note)
            .await;

        let result = h
            .engine
            .search(
                &RecallQuery::new("user-1".to_string(), "barely related".to_string())
                    .with_min_score(1.1),
            )
            .await;
        assert!(result.memories.is_empty());
        assert_eq!(result.total_available, 0);
    }
}
