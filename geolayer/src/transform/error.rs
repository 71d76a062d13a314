//! Error types for coordinate transformation.

use thiserror::Error;

/// Errors produced while resolving or evaluating a transform.
///
/// Errors are `Clone` so batch results and coalesced waiters can share them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformError {
    /// The CRS code is not known to the dictionary.
    #[error("CRS {0} not found")]
    CrsNotFound(u32),

    /// No chain of steps connects the two systems.
    #[error("no transform path from CRS {source_code} to CRS {target_code}")]
    NoTransformPath { source_code: u32, target_code: u32 },

    /// The point lies outside the coverage of a shift grid.
    #[error("point ({lon:.6}, {lat:.6}) is outside grid '{grid}'")]
    OutOfGridBounds { grid: String, lon: f64, lat: f64 },

    /// Non-finite input or a point outside a projection's domain.
    #[error("invalid coordinate: {0}")]
    InvalidCoordinate(String),
}
