//! Tile cache hierarchy.
//!
//! Two tiers of decoded tiles: a byte-bounded in-memory LRU (Hot) and a
//! byte-bounded on-disk store (Warm). A tile is authoritative in at most one
//! tier at a time. Placement follows the predicted access probability, and
//! each put may emit prefetch requests for related tiles.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use geolayer::cache::{CacheConfig, CacheHierarchy, NeighborhoodPredictor};
//!
//! let (cache, mut prefetch_rx) =
//!     CacheHierarchy::start(CacheConfig::default(), "ortho", Arc::new(NeighborhoodPredictor::new())).await?;
//! cache.put(key, tile, 0.9).await?;
//! if let Some(tile) = cache.get(key).await {
//!     // ...
//! }
//! ```

mod error;
mod hierarchy;
mod hot;
mod predictor;
mod types;
mod warm;

pub use error::CacheError;
pub use hierarchy::CacheHierarchy;
pub use hot::{HotEviction, HotTier};
pub use predictor::{AccessPredictor, DisabledPredictor, NeighborhoodPredictor, HISTORY_CAPACITY};
pub use types::{
    default_warm_directory, AccessPrediction, CacheConfig, CacheStats, EntryMeta, KeyState,
    PrefetchRequest, Tier, DEFAULT_HOT_CAPACITY_BYTES, DEFAULT_HOT_THRESHOLD,
    DEFAULT_MAX_FAILED_STATES, DEFAULT_MAX_PREFETCH_CANDIDATES, DEFAULT_PREFETCH_QUEUE_CAPACITY, DEFAULT_WARM_CAPACITY_BYTES,
    DEFAULT_WARM_THRESHOLD, SHARD_COUNT,
};
pub use warm::{namespace as warm_namespace, WarmTier};
