//! Sanity checks on vectors returned by an embedding service

use crate::config::BatchConfig;
use crate::error::{HypnosError, Result};

/// Shape and magnitude a usable vector must have
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorBounds {
    pub dimension: usize,
    pub min_magnitude: f32,
    pub max_magnitude: f32,
}

impl From<&BatchConfig> for VectorBounds {
    fn from(config: &BatchConfig) -> Self {
        Self {
            dimension: config.embedding_dimension,
            min_magnitude: config.min_magnitude,
            max_magnitude: config.max_magnitude,
        }
    }
}

/// Reject vectors with the wrong dimension, non-finite components, or an L2
/// norm outside the plausible band (all-zero or exploded output).
///
/// Non-finite components are data corruption; the other failures are
/// validation errors.
pub fn validate_vector(vector: &[f32], bounds: &VectorBounds) -> Result<()> {
    if vector.len() != bounds.dimension {
        return Err(HypnosError::Validation(format!(
            "expected {} dimensions, got {}",
            bounds.dimension,
            vector.len()
        )));
    }

    if let Some(pos) = vector.iter().position(|v| !v.is_finite()) {
        return Err(HypnosError::DataCorruption(format!(
            "non-finite component {} at index {}",
            vector[pos], pos
        )));
    }

    let magnitude = vector.iter().map(|v| (*v as f64) * (*v as f64)).sum::<f64>().sqrt();
    if magnitude < bounds.min_magnitude as f64 || magnitude > bounds.max_magnitude as f64 {
        return Err(HypnosError::Validation(format!(
            "magnitude {:.4} outside [{}, {}]",
            magnitude, bounds.min_magnitude, bounds.max_magnitude
        )));
    }

    Ok(())
}
