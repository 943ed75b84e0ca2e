//! Distance metrics for vector similarity calculation.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};

/// Distance metrics for vector similarity calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Cosine distance (1 - cosine similarity)
    #[default]
    Cosine,
    /// Euclidean (L2) distance
    Euclidean,
    /// Dot product similarity (higher is more similar)
    DotProduct,
    /// Angular distance
    Angular,
}

impl DistanceMetric {
    /// Calculate the distance between two vectors using this metric.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        if a.len() != b.len() {
            return Err(MemoryError::validation(
                "Vector dimensions must match for distance calculation",
            ));
        }

        let result = match self {
            DistanceMetric::Cosine => {
                let (dot_product, norm_a, norm_b) = dot_and_norms(a, b);

                if norm_a == 0.0 || norm_b == 0.0 {
                    1.0 // Maximum distance for zero vectors
                } else {
                    1.0 - (dot_product / (norm_a * norm_b))
                }
            }
            DistanceMetric::Euclidean => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y).powi(2))
                .sum::<f32>()
                .sqrt(),
            DistanceMetric::DotProduct => -a.iter().zip(b.iter()).map(|(x, y)| x * y).sum::<f32>(),
            DistanceMetric::Angular => {
                let (dot_product, norm_a, norm_b) = dot_and_norms(a, b);

                if norm_a == 0.0 || norm_b == 0.0 {
                    std::f32::consts::PI
                } else {
                    let cosine = (dot_product / (norm_a * norm_b)).clamp(-1.0, 1.0);
                    cosine.acos()
                }
            }
        };

        Ok(result)
    }

    /// Calculate similarity (0-1, higher is more similar) between two vectors.
    pub fn similarity(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        let distance = self.distance(a, b)?;
        Ok(self.similarity_from_distance(distance))
    }

    /// Map a distance produced by this metric onto `[0, 1]`.
    pub fn similarity_from_distance(&self, distance: f32) -> f32 {
        let similarity = match self {
            DistanceMetric::Cosine => 1.0 - distance,
            DistanceMetric::Euclidean => (-distance).exp(),
            DistanceMetric::DotProduct => -distance,
            DistanceMetric::Angular => 1.0 - (distance / std::f32::consts::PI),
        };

        similarity.clamp(0.0, 1.0)
    }

    /// Get the name of this distance metric.
    pub fn name(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::DotProduct => "dot_product",
            DistanceMetric::Angular => "angular",
        }
    }

    /// Parse a distance metric from a string.
    pub fn parse_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "euclidean" | "l2" => Ok(DistanceMetric::Euclidean),
            "dot_product" | "dot" => Ok(DistanceMetric::DotProduct),
            "angular" => Ok(DistanceMetric::Angular),
            _ => Err(MemoryError::invalid_config(format!(
                "Unknown distance metric: {s}"
            ))),
        }
    }

    /// Calculate similarities between a query vector and multiple vectors in parallel.
    pub fn batch_similarity_parallel(&self, query: &[f32], vectors: &[&[f32]]) -> Result<Vec<f32>> {
        if vectors.is_empty() {
            return Ok(Vec::new());
        }

        if vectors.len() < 100 {
            return vectors
                .iter()
                .map(|v| self.similarity(query, v))
                .collect::<Result<Vec<_>>>();
        }

        vectors
            .par_iter()
            .map(|v| self.similarity(query, v))
            .collect::<Result<Vec<_>>>()
    }
}

fn dot_and_norms(a: &[f32], b: &[f32]) -> (f32, f32, f32) {
    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    (dot_product, norm_a, norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_range() {
        let metric = DistanceMetric::Cosine;
        let same = metric.similarity(&[1.0, 0.0], &[2.0, 0.0]).unwrap();
        let orthogonal = metric.similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap();
        let opposite = metric.similarity(&[1.0, 0.0], &[-1.0, 0.0]).unwrap();

        assert!((same - 1.0).abs() < 1e-6);
        assert!(orthogonal.abs() < 1e-6);
        assert_eq!(opposite, 0.0);
    }

    #[test]
    fn test_euclidean_similarity_decreases_with_distance() {
        let metric = DistanceMetric::Euclidean;
        let near = metric.similarity(&[0.0, 0.0], &[0.1, 0.0]).unwrap();
        let far = metric.similarity(&[0.0, 0.0], &[3.0, 0.0]).unwrap();
        assert!(near > far);
        assert_eq!(metric.similarity(&[1.0], &[1.0]).unwrap(), 1.0);
    }

    #[test]
    fn test_dimension_mismatch() {
        assert!(DistanceMetric::Cosine.distance(&[1.0], &[1.0, 2.0]).is_err());
    }

    #[test]
    fn test_parse_str() {
        assert_eq!(DistanceMetric::parse_str("L2").unwrap(), DistanceMetric::Euclidean);
        assert_eq!(DistanceMetric::parse_str("dot").unwrap(), DistanceMetric::DotProduct);
        assert!(DistanceMetric::parse_str("hamming").is_err());
    }

    #[test]
    fn test_batch_matches_single() {
        let metric = DistanceMetric::Angular;
        let query = [1.0, 1.0];
        let a = [1.0, 0.0];
        let b = [0.0, 2.0];
        let batch = metric.batch_similarity_parallel(&query, &[&a, &b]).unwrap();
        assert_eq!(batch[0], metric.similarity(&query, &a).unwrap());
        assert_eq!(batch[1], metric.similarity(&query, &b).unwrap());
    }
}
