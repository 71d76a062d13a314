//! Application bootstrap and lifecycle management.
//!
//! [`GeoLayerApp`] opens a dataset and wires the components together in
//! dependency order:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         GeoLayerApp                          │
//! │                                                              │
//! │  1. RangeSource (file / HTTP) ──► RasterHandle               │
//! │  2. CacheHierarchy ─────────────► tier worker                │
//! │                     └─ prefetch channel ─┐                   │
//! │  3. ProgressiveLoader ◄──────────────────┘ run_prefetch      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The [`ingest`] functions create new datasets from images.

mod bootstrap;
mod config;
mod error;
pub mod ingest;

pub use bootstrap::GeoLayerApp;
pub use config::AppConfig;
pub use error::AppError;
