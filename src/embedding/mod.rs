//! Embedding generation seam.
//!
//! The coordinator never computes embeddings itself. Callers hand it an
//! [`EmbeddingGenerator`]; when none is configured, or when it fails, entries
//! are stored without a vector and stay structured-only until repaired.
//!
//! # Example
//!
//! ```
//! use async_trait::async_trait;
//! use hybrid_memory::embedding::EmbeddingGenerator;
//! use hybrid_memory::error::Result;
//! use hybrid_memory::semantic::Vector;
//!
//! #[derive(Debug)]
//! struct ConstantEmbedder;
//!
//! #[async_trait]
//! impl EmbeddingGenerator for ConstantEmbedder {
//!     async fn embed(&self, _text: &str) -> Result<Vector> {
//!         Ok(Vector::new(vec![1.0, 0.0, 0.0]))
//!     }
//!
//!     fn dimension(&self) -> usize {
//!         3
//!     }
//!
//!     fn name(&self) -> &str {
//!         "constant"
//!     }
//! }
//! ```

use std::fmt::Debug;

use async_trait::async_trait;

use crate::error::Result;
use crate::semantic::Vector;

pub mod hashing;
pub mod precomputed;

pub use hashing::HashingEmbedder;
pub use precomputed::PrecomputedEmbedder;

/// Produces a vector from text.
///
/// Implementations must be `Send + Sync`; the coordinator calls them from
/// concurrent tasks.
#[async_trait]
pub trait EmbeddingGenerator: Send + Sync + Debug {
    /// Generate an embedding for `text`.
    async fn embed(&self, text: &str) -> Result<Vector>;

    /// Generate embeddings for multiple inputs.
    ///
    /// The default implementation calls `embed` sequentially.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vector>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// Dimension of every vector this generator produces.
    fn dimension(&self) -> usize;

    /// Get the name of this generator.
    fn name(&self) -> &str;
}
