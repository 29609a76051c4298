//! Deterministic mock embedding provider for tests.
//!
//! Produces hashed bag-of-words vectors: texts sharing words land close in
//! cosine space, identical texts embed identically. A failure switch lets
//! tests exercise the unavailable path.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::embedding::EmbeddingProvider;
use crate::error::{AiError, Result};

pub struct MockEmbedding {
    dimension: usize,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl MockEmbedding {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    /// Toggle provider failure to simulate an outage.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of embed calls that reached the provider.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for word in text.to_lowercase().split_whitespace() {
            let mut hash = 0usize;
            for byte in word.bytes() {
                hash = hash.wrapping_mul(31).wrapping_add(byte as usize);
            }
            vector[hash % self.dimension] += 1.0;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(AiError::Embedding("mock provider offline".to_string()));
        }
        Ok(self.vectorize(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "mock-embedding"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_identical_texts_embed_identically() {
        let provider = MockEmbedding::new(16);
        let a = provider.embed("decided on PostgreSQL").await.unwrap();
        let b = provider.embed("decided on PostgreSQL").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_shared_words_are_closer() {
        let provider = MockEmbedding::new(64);
        let a = provider.embed("database choice postgres").await.unwrap();
        let b = provider.embed("database choice sqlite").await.unwrap();
        let c = provider.embed("favorite color green").await.unwrap();

        let ab: f32 = a.iter().zip(&b).map(|(x, y)| x * y).sum();
        let ac: f32 = a.iter().zip(&c).map(|(x, y)| x * y).sum();
        assert!(ab > ac);
    }
}
