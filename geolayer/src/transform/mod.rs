//! Coordinate transformation between geographic, projected and pixel space.
//!
//! The [`TransformEngine`] resolves CRS codes through a [`CrsLookup`],
//! builds a [`TransformPath`] for each (source, target) pair and caches it.
//! Paths are immutable and can be evaluated concurrently from any thread.
//!
//! # Path construction
//!
//! ```text
//! source ──► inverse projection ──► datum shift ──► forward projection ──► target
//!                                    │
//!                                    ├─ registered grid between the two datums (preferred)
//!                                    └─ source → WGS 84 → target (Helmert / Molodensky)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use geolayer::transform::{BuiltinCrsDictionary, Coordinate, TransformEngine};
//!
//! let engine = TransformEngine::new(Arc::new(BuiltinCrsDictionary::new()));
//! let path = engine.create_transform(4326, 27700)?;
//! let bng = engine.transform(&path, Coordinate::new(-0.1276, 51.5072))?;
//! ```

mod crs;
mod datum;
mod engine;
mod error;
mod grid;
mod path;
mod projection;
mod types;

pub use crs::{
    BuiltinCrsDictionary, Crs, CrsLookup, DatumShift, Ellipsoid, HelmertParams,
    MolodenskyParams, Projection, TransverseMercatorParams, WEB_MERCATOR, WGS84,
};
pub use engine::{BatchTransform, TransformEngine, DEFAULT_DENSIFY_POINTS, PARALLEL_BATCH_THRESHOLD};
pub use error::TransformError;
pub use grid::ShiftGrid;
pub use path::{ProjectionStep, TransformPath, TransformStep};
pub use projection::{TransverseMercator, WEB_MERCATOR_MAX_LAT};
pub use types::{BoundingBox, Coordinate, GeoPoint, TransformedPoint};

/// Pixel-to-world mapping for one raster level (north-up or rotated).
///
/// `world_x = a * col + b * row + c`, `world_y = d * col + e * row + f`,
/// with `(col, row)` measured from the top-left pixel corner.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GeoTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl GeoTransform {
    /// North-up transform from an origin and pixel size.
    pub fn north_up(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            a: pixel_width,
            b: 0.0,
            c: origin_x,
            d: 0.0,
            e: -pixel_height.abs(),
            f: origin_y,
        }
    }

    /// Identity transform: world units are pixels, y grows downwards.
    pub fn identity() -> Self {
        Self {
            a: 1.0,
            b: 0.0,
            c: 0.0,
            d: 0.0,
            e: 1.0,
            f: 0.0,
        }
    }

    pub fn pixel_to_world(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.a * col + self.b * row + self.c,
            self.d * col + self.e * row + self.f,
        )
    }

    /// Inverse mapping. Returns `None` for a degenerate transform.
    pub fn world_to_pixel(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let det = self.a * self.e - self.b * self.d;
        if det.abs() < f64::EPSILON * (self.a.abs() + self.e.abs()).max(1e-300) {
            return None;
        }
        let dx = x - self.c;
        let dy = y - self.f;
        Some((
            (self.e * dx - self.b * dy) / det,
            (-self.d * dx + self.a * dy) / det,
        ))
    }

    /// Ground size of one pixel along x and y (absolute values).
    pub fn pixel_size(&self) -> (f64, f64) {
        (
            (self.a * self.a + self.d * self.d).sqrt(),
            (self.b * self.b + self.e * self.e).sqrt(),
        )
    }

    /// The transform of a level `factor_x`/`factor_y` times coarser.
    pub fn scaled(&self, factor_x: f64, factor_y: f64) -> Self {
        Self {
            a: self.a * factor_x,
            b: self.b * factor_y,
            c: self.c,
            d: self.d * factor_x,
            e: self.e * factor_y,
            f: self.f,
        }
    }

    /// World extent of a `width` x `height` raster.
    pub fn bounds(&self, crs: u32, width: u64, height: u64) -> BoundingBox {
        let corners = [
            self.pixel_to_world(0.0, 0.0),
            self.pixel_to_world(width as f64, 0.0),
            self.pixel_to_world(0.0, height as f64),
            self.pixel_to_world(width as f64, height as f64),
        ];
        let mut bbox = BoundingBox::new(crs, f64::MAX, f64::MAX, f64::MIN, f64::MIN);
        for (x, y) in corners {
            bbox.min_x = bbox.min_x.min(x);
            bbox.min_y = bbox.min_y.min(y);
            bbox.max_x = bbox.max_x.max(x);
            bbox.max_y = bbox.max_y.max(y);
        }
        bbox
    }
}
