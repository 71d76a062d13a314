//! Error types for the tiled raster store.

use thiserror::Error;

use super::tile::TileKey;

/// Errors produced by the raster store.
///
/// `Format` and `Index` are fatal and only returned from `open`. `Io` and
/// `Decode` are scoped to a single tile. The enum is `Clone` so a coalesced
/// read can hand the same outcome to every waiter.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// Unrecognised signature, version, offset width, compression or layout.
    #[error("unsupported container format: {0}")]
    Format(String),

    /// Inconsistent or cyclic level index.
    #[error("corrupt level index: {0}")]
    Index(String),

    /// Read failure, including timeouts after retries.
    #[error("I/O error: {0}")]
    Io(String),

    /// The tile's payload could not be decoded.
    #[error("failed to decode tile {key}: {reason}")]
    Decode { key: TileKey, reason: String },

    #[error("tile {x},{y} is outside level {level} ({tiles_across}x{tiles_down} tiles)")]
    TileOutOfRange {
        level: u32,
        x: u32,
        y: u32,
        tiles_across: u32,
        tiles_down: u32,
    },

    #[error("level {level} does not exist ({levels} levels)")]
    LevelOutOfRange { level: u32, levels: usize },

    /// The requested pixel rectangle is empty or extends past the level.
    #[error("region {0} is outside the level bounds")]
    RegionOutOfRange(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl StoreError {
    /// True for errors scoped to one tile; a region read turns these into holes.
    pub fn is_tile_scoped(&self) -> bool {
        matches!(self, StoreError::Decode { .. } | StoreError::Io(_))
    }
}
