//! Slippy-map tile types and errors.

use std::fmt;

use thiserror::Error;

/// Largest supported zoom level.
pub const MAX_ZOOM: u8 = 24;

/// Latitude limits of the Web Mercator square.
pub const MAX_LAT: f64 = 85.051_128_779_806_59;
pub const MIN_LAT: f64 = -85.051_128_779_806_59;

pub const MIN_LON: f64 = -180.0;
pub const MAX_LON: f64 = 180.0;

/// Errors for slippy-map coordinate conversion.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoordError {
    #[error("invalid latitude: {0}")]
    InvalidLatitude(f64),

    #[error("invalid longitude: {0}")]
    InvalidLongitude(f64),

    #[error("invalid zoom level: {0} (max 24)")]
    InvalidZoom(u8),

    #[error("tile {x}/{y} is outside zoom level {z}")]
    InvalidTile { z: u8, x: u32, y: u32 },
}

/// A Web Mercator tile address (`z/x/y`, origin at the north-west corner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlippyTile {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl SlippyTile {
    /// Validates that the indices fit the zoom level.
    pub fn new(z: u8, x: u32, y: u32) -> Result<Self, CoordError> {
        if z > MAX_ZOOM {
            return Err(CoordError::InvalidZoom(z));
        }
        let n = 1u64 << z;
        if x as u64 >= n || y as u64 >= n {
            return Err(CoordError::InvalidTile { z, x, y });
        }
        Ok(Self { z, x, y })
    }

    /// Number of tiles along each axis at this zoom.
    pub fn tiles_per_axis(&self) -> u64 {
        1u64 << self.z
    }
}

impl fmt::Display for SlippyTile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}
