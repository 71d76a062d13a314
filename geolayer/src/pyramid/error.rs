//! Error types for pyramid building.

use serde::Serialize;
use thiserror::Error;

use crate::store::{LevelDescriptor, StoreError, TileKey};

/// A target tile that could not be built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedTile {
    pub target: TileKey,
    /// Source tiles whose failure made the target unbuildable.
    pub sources: Vec<TileKey>,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum PyramidError {
    /// The level was written, but some target tiles are missing.
    #[error("level {} completed with {} failed tiles", .descriptor.index, .failed.len())]
    Partial {
        descriptor: Box<LevelDescriptor>,
        failed: Vec<FailedTile>,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid target level: {0}")]
    InvalidTarget(String),
}
