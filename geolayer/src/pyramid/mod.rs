//! Pyramid builder.
//!
//! Produces successively reduced levels of a raster. Each target tile is
//! computed from the minimal source window its kernel needs, so a level of
//! any size is built with bounded memory.
//!
//! # Example
//!
//! ```ignore
//! use geolayer::pyramid::{build_pyramid, Kernel, PyramidOptions};
//!
//! let report = build_pyramid("ortho.tif", PyramidOptions::default().with_kernel(Kernel::Lanczos(3))).await?;
//! if !report.is_complete() {
//!     println!("{}", report.to_json()?);
//! }
//! ```

mod builder;
mod error;
mod kernel;

pub use builder::{
    build_level, build_pyramid, BuiltLevel, PyramidOptions, PyramidReport, DEFAULT_MIN_LEVEL_SIZE,
};
pub use error::{FailedTile, PyramidError};
pub use kernel::{
    axis_contributions, resample, span, Contribution, Kernel, HIGH_QUALITY_LANCZOS_LOBES,
};
