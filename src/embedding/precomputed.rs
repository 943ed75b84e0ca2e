//! Embedder backed by a table of pre-computed vectors.
//!
//! Useful when vectors are computed externally and only a known set of texts
//! ever needs embedding, and in tests that need deterministic similarities.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::embedding::EmbeddingGenerator;
use crate::error::{MemoryError, Result};
use crate::semantic::Vector;

/// Looks texts up in a table; unknown texts fail.
#[derive(Debug, Default)]
pub struct PrecomputedEmbedder {
    dimension: usize,
    table: RwLock<HashMap<String, Vector>>,
}

impl PrecomputedEmbedder {
    pub fn new(dimension: usize) -> Self {
        PrecomputedEmbedder {
            dimension,
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Register the vector returned for `text`.
    pub fn insert(&self, text: impl Into<String>, vector: impl Into<Vector>) -> Result<()> {
        let vector = vector.into();
        vector.validate(self.dimension)?;
        self.table.write().insert(text.into(), vector);
        Ok(())
    }

    pub fn with(self, text: impl Into<String>, vector: impl Into<Vector>) -> Result<Self> {
        self.insert(text, vector)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }
}

#[async_trait]
impl EmbeddingGenerator for PrecomputedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vector> {
        self.table
            .read()
            .get(text)
            .cloned()
            .ok_or_else(|| MemoryError::other(format!("no pre-computed vector for {text:?}")))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "PrecomputedEmbedder"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup() {
        let embedder = PrecomputedEmbedder::new(2)
            .with("cat", vec![1.0, 0.0])
            .unwrap()
            .with("dog", vec![0.9, 0.1])
            .unwrap();

        assert_eq!(embedder.len(), 2);
        assert_eq!(embedder.embed("cat").await.unwrap().data, vec![1.0, 0.0]);
        assert!(embedder.embed("fish").await.is_err());

        let batch = embedder.embed_batch(&["dog", "cat"]).await.unwrap();
        assert_eq!(batch[0].data, vec![0.9, 0.1]);
    }

    #[test]
    fn test_rejects_wrong_dimension() {
        let embedder = PrecomputedEmbedder::new(3);
        assert!(embedder.insert("x", vec![1.0]).is_err());
        assert!(embedder.is_empty());
    }
}
