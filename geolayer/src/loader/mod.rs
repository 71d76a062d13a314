//! Progressive loader.
//!
//! Turns a geographic request into ranked tile loads: the transform engine
//! picks the level and pixel window, the cache hierarchy answers what it
//! can, and the store fetches the rest. Each load runs under a generation
//! token; starting a new load supersedes the previous one.
//!
//! # Example
//!
//! ```ignore
//! use geolayer::loader::{LoaderOptions, ProgressiveLoader, ViewportRequest};
//!
//! let loader = Arc::new(ProgressiveLoader::new(handle, cache, engine, LoaderOptions::default()));
//! tokio::spawn(Arc::clone(&loader).run_prefetch(prefetch_rx, shutdown.clone()));
//!
//! let load = loader.load(ViewportRequest::new(bounds, 0.5)).await?;
//! let image = load.composite();
//! ```

mod error;
mod plan;
mod progressive;

pub use error::LoaderError;
pub use plan::{pixel_rect, plan_request, rank_tiles, select_level, LoadPlan, ViewportRequest};
pub use progressive::{
    LoadHole, LoaderOptions, LoaderStats, ProgressiveLoader, ViewportLoad,
    DEFAULT_FRESH_PROBABILITY, DEFAULT_LOAD_CONCURRENCY, DEFAULT_PREFETCH_BATCH,
    DEFAULT_PREFETCH_PACING_MS,
};
