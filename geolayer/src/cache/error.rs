//! Error types for the tile cache hierarchy.

use thiserror::Error;

use crate::store::TileKey;

#[derive(Debug, Error)]
pub enum CacheError {
    /// A key is authoritative in more than one tier. Always a bug.
    #[error("tile {key} is resident in both hot and warm tiers")]
    CacheConsistency { key: TileKey },

    #[error("warm tier I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("warm tier serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for CacheError {
    fn from(e: bincode::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}
