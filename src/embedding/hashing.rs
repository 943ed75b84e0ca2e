//! Feature-hashing text embedder.
//!
//! Maps lowercase alphanumeric tokens onto a fixed number of signed buckets
//! and normalizes the result. Texts sharing words land close together under
//! cosine similarity. It needs no model files, which makes it the default for
//! the admin CLI.

use std::hash::BuildHasher;

use ahash::RandomState;
use async_trait::async_trait;

use crate::embedding::EmbeddingGenerator;
use crate::error::{MemoryError, Result};
use crate::semantic::Vector;

const SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    hasher: RandomState,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        HashingEmbedder {
            dimension,
            hasher: RandomState::with_seeds(SEEDS[0], SEEDS[1], SEEDS[2], SEEDS[3]),
        }
    }

    /// Embed synchronously.
    pub fn embed_text(&self, text: &str) -> Result<Vector> {
        if self.dimension == 0 {
            return Err(MemoryError::invalid_config("embedding dimension must be > 0"));
        }

        let mut data = vec![0.0f32; self.dimension];
        let mut tokens = 0usize;
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
        {
            let hash = self.hasher.hash_one(token.to_lowercase());
            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            data[bucket] += sign;
            tokens += 1;
        }

        if tokens == 0 {
            return Err(MemoryError::validation("text has no tokens to embed"));
        }

        Ok(Vector::new(data).normalized())
    }
}

#[async_trait]
impl EmbeddingGenerator for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vector> {
        self.embed_text(text)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "HashingEmbedder"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::DistanceMetric;

    #[test]
    fn test_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed_text("The quick brown fox").unwrap();
        let b = embedder.embed_text("the QUICK brown fox").unwrap();

        assert_eq!(a, b);
        assert_eq!(a.dimension(), 64);
        assert!((a.norm() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_shared_words_are_closer() {
        let embedder = HashingEmbedder::new(256);
        let base = embedder.embed_text("rust memory store").unwrap();
        let near = embedder.embed_text("rust memory index").unwrap();
        let far = embedder.embed_text("banana smoothie recipe").unwrap();

        let metric = DistanceMetric::Cosine;
        let near_sim = metric.similarity(&base.data, &near.data).unwrap();
        let far_sim = metric.similarity(&base.data, &far.data).unwrap();
        assert!(near_sim > far_sim);
    }

    #[tokio::test]
    async fn test_empty_text_fails() {
        let embedder = HashingEmbedder::new(8);
        assert!(embedder.embed("  ,;  ").await.is_err());
        assert!(HashingEmbedder::new(0).embed_text("x").is_err());
    }
}
