//! Configuration for the memory subsystem.
//!
//! Every tunable the retrieval and write paths depend on lives here so that
//! deployments can adjust them without code changes. Defaults match the
//! values the system was tuned with.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// RRF rank constant: fused score terms are 1/(k + rank).
    pub rrf_k: f64,
    /// Cosine similarity at or above which a new write is a duplicate.
    pub duplicate_threshold: f32,
    /// Token budget for a retrieval result slate.
    pub token_budget: usize,
    /// Default result limit when the caller does not pass one.
    pub default_limit: usize,
    /// Minimum normalized relevance for retrieval results.
    pub min_relevance: f64,
    /// Relevance floor when retrieving deletion candidates by description.
    pub delete_min_score: f64,
    /// Maximum deletion candidates considered per request.
    pub delete_max_candidates: usize,
    /// Writes below this confidence are discarded.
    pub confidence_discard_below: f32,
    /// Writes below this confidence (and above the discard gate) need
    /// re-confirmation before they are accepted.
    pub confidence_confirm_below: f32,
    /// Maximum writes per source conversation.
    pub conversation_write_limit: u64,
    /// Maximum writes per user per hour.
    pub hourly_user_write_limit: u64,
    /// Minimum raw turn count before an episode summary is generated.
    pub episode_min_turns: usize,
    /// Minimum user turn count; either turn threshold suffices.
    pub episode_min_user_turns: usize,
    /// Token bound for generated episode summaries.
    pub episode_max_summary_tokens: u32,
    /// Importance assigned to generated episode memories.
    pub episode_importance: f32,
    /// HNSW search width.
    pub ef_search: usize,
    /// Bounded background write queue depth.
    pub queue_depth: usize,
    /// Seconds to wait for in-flight background writes on shutdown.
    pub drain_timeout_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            duplicate_threshold: 0.92,
            token_budget: 2_000,
            default_limit: 10,
            min_relevance: 0.0,
            delete_min_score: 0.5,
            delete_max_candidates: 10,
            confidence_discard_below: 0.5,
            confidence_confirm_below: 0.7,
            conversation_write_limit: 20,
            hourly_user_write_limit: 60,
            episode_min_turns: 10,
            episode_min_user_turns: 5,
            episode_max_summary_tokens: 256,
            episode_importance: 0.6,
            ef_search: 100,
            queue_depth: 64,
            drain_timeout_secs: 5,
        }
    }
}

impl MemoryConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}
