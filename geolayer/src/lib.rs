//! GeoLayer - tiled multi-resolution georeferenced rasters.
//!
//! The crate reads tiled raster containers locally or over HTTP range
//! requests, builds their reduced-resolution levels, and serves viewport
//! requests through a two-tier tile cache with predictive prefetch.
//!
//! ```text
//! ViewportRequest ──► loader ──► transform (CRS → level, pixel window)
//!                        │
//!                        ├──► cache (Hot ⇄ Warm) ──► prefetch requests
//!                        └──► store (coalesced range reads, decode)
//!
//! pyramid: store level N ──resample──► level N+1 appended to the container
//! ```
//!
//! # Modules
//!
//! - [`transform`] - CRS dictionary, transform paths, bounds densification
//! - [`coord`] - slippy-map tile addressing
//! - [`store`] - container format, range sources, tile reads and writes
//! - [`pyramid`] - level construction
//! - [`cache`] - tile cache hierarchy and access prediction
//! - [`loader`] - progressive viewport loading and prefetch execution
//! - [`executor`] - priority limiters, retry policy, priority queue
//! - [`config`], [`logging`], [`app`] - configuration and lifecycle

pub mod app;
pub mod cache;
pub mod config;
pub mod coord;
pub mod executor;
pub mod loader;
pub mod logging;
pub mod pyramid;
pub mod store;
pub mod transform;
