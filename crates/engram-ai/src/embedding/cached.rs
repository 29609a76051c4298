//! Content-addressed embedding cache over the shared KV store.
//!
//! Identical text embeds once: the cache key is a SHA-256 over model and
//! (truncated) text. Provider failure degrades to [`EmbedOutcome::Unavailable`]
//! so callers can fall back to lexical-only retrieval; cache failure degrades
//! to always-miss. Neither failure mode reaches callers as an error.

use std::sync::Arc;
use std::time::Duration;

use engram_storage::KvStore;
use sha2::{Digest, Sha256};

use crate::embedding::EmbeddingProvider;
use crate::error::{AiError, Result};

/// Outcome of an embedding attempt.
///
/// `Unavailable` is a distinct state, not an empty vector and not an error:
/// it means the model could not be reached and vector search must be skipped.
#[derive(Debug, Clone, PartialEq)]
pub enum EmbedOutcome {
    Ready(Vec<f32>),
    Unavailable,
}

impl EmbedOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, EmbedOutcome::Ready(_))
    }
}

/// Configuration for the cached embedder.
#[derive(Debug, Clone)]
pub struct EmbedCacheConfig {
    /// Cache entry TTL (default: 7 days).
    pub ttl: Duration,
    /// Texts longer than this are truncated before hashing and embedding.
    pub max_text_chars: usize,
}

impl Default for EmbedCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(7 * 24 * 3600),
            max_text_chars: 8_000,
        }
    }
}

/// Embedding provider wrapper with content-addressed caching.
pub struct CachedEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
    cache: KvStore,
    config: EmbedCacheConfig,
}

impl CachedEmbedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, cache: KvStore) -> Self {
        Self::with_config(provider, cache, EmbedCacheConfig::default())
    }

    pub fn with_config(
        provider: Arc<dyn EmbeddingProvider>,
        cache: KvStore,
        config: EmbedCacheConfig,
    ) -> Self {
        Self {
            provider,
            cache,
            config,
        }
    }

    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// Embed a text, consulting the cache first.
    pub async fn embed(&self, text: &str) -> Result<EmbedOutcome> {
        let normalized = self.provider.normalize_text(text);
        if normalized.is_empty() {
            return Err(AiError::InvalidInput(
                "cannot embed empty text".to_string(),
            ));
        }

        let truncated: String = normalized.chars().take(self.config.max_text_chars).collect();
        let key = self.cache_key(&truncated);

        if let Some(vector) = self.cache_get(&key) {
            return Ok(EmbedOutcome::Ready(vector));
        }

        match self.provider.embed(&truncated).await {
            Ok(vector) => {
                self.cache_put(&key, &vector);
                Ok(EmbedOutcome::Ready(vector))
            }
            Err(e) => {
                tracing::warn!(model = self.provider.model_name(), error = %e, "embedding unavailable");
                Ok(EmbedOutcome::Unavailable)
            }
        }
    }

    fn cache_key(&self, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.provider.model_name().as_bytes());
        hasher.update(b":");
        hasher.update(text.as_bytes());
        format!("embed:{}", hex::encode(hasher.finalize()))
    }

    fn cache_get(&self, key: &str) -> Option<Vec<f32>> {
        match self.cache.get(key) {
            Ok(Some(bytes)) => {
                match bincode::serde::decode_from_slice::<Vec<f32>, _>(
                    &bytes,
                    bincode::config::standard(),
                ) {
                    Ok((vector, _)) => Some(vector),
                    Err(e) => {
                        tracing::debug!(error = %e, "discarding undecodable cache entry");
                        None
                    }
                }
            }
            Ok(None) => None,
            Err(e) => {
                // Cache unavailability degrades to always-miss
                tracing::debug!(error = %e, "embedding cache read failed");
                None
            }
        }
    }

    fn cache_put(&self, key: &str, vector: &[f32]) {
        let Ok(bytes) = bincode::serde::encode_to_vec(vector, bincode::config::standard()) else {
            return;
        };
        if let Err(e) = self.cache.set_with_ttl(key, &bytes, self.config.ttl) {
            tracing::debug!(error = %e, "embedding cache write failed");
        }
    }
}
