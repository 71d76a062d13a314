//! Shared cache types: configuration, key states, predictions and stats.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::store::{Tile, TileKey};

/// Default hot tier budget (512 MiB).
pub const DEFAULT_HOT_CAPACITY_BYTES: u64 = 512 * 1024 * 1024;

/// Default warm tier budget (4 GiB).
pub const DEFAULT_WARM_CAPACITY_BYTES: u64 = 4 * 1024 * 1024 * 1024;

pub const DEFAULT_HOT_THRESHOLD: f64 = 0.7;
pub const DEFAULT_WARM_THRESHOLD: f64 = 0.3;
pub const DEFAULT_MAX_PREFETCH_CANDIDATES: usize = 8;

/// Capacity of the prefetch request channel. Requests beyond it are dropped.
pub const DEFAULT_PREFETCH_QUEUE_CAPACITY: usize = 256;

/// Failed keys remembered before the oldest failure reverts to `Unrequested`.
pub const DEFAULT_MAX_FAILED_STATES: usize = 4096;

/// Number of key shard locks.
pub const SHARD_COUNT: usize = 64;

/// Cache hierarchy configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub hot_capacity_bytes: u64,
    pub warm_capacity_bytes: u64,
    /// Parent of the per-dataset warm directories.
    pub warm_directory: PathBuf,
    pub hot_threshold: f64,
    pub warm_threshold: f64,
    pub prefetch_enabled: bool,
    pub max_prefetch_candidates: usize,
    pub prefetch_queue_capacity: usize,
    pub max_failed_states: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hot_capacity_bytes: DEFAULT_HOT_CAPACITY_BYTES,
            warm_capacity_bytes: DEFAULT_WARM_CAPACITY_BYTES,
            warm_directory: default_warm_directory(),
            hot_threshold: DEFAULT_HOT_THRESHOLD,
            warm_threshold: DEFAULT_WARM_THRESHOLD,
            prefetch_enabled: true,
            max_prefetch_candidates: DEFAULT_MAX_PREFETCH_CANDIDATES,
            prefetch_queue_capacity: DEFAULT_PREFETCH_QUEUE_CAPACITY,
            max_failed_states: DEFAULT_MAX_FAILED_STATES,
        }
    }
}

impl CacheConfig {
    pub fn with_hot_capacity(mut self, bytes: u64) -> Self {
        self.hot_capacity_bytes = bytes;
        self
    }

    pub fn with_warm_capacity(mut self, bytes: u64) -> Self {
        self.warm_capacity_bytes = bytes;
        self
    }

    pub fn with_warm_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.warm_directory = dir.into();
        self
    }

    pub fn with_thresholds(mut self, hot: f64, warm: f64) -> Self {
        self.hot_threshold = hot;
        self.warm_threshold = warm;
        self
    }

    pub fn with_prefetch(mut self, enabled: bool, max_candidates: usize) -> Self {
        self.prefetch_enabled = enabled;
        self.max_prefetch_candidates = max_candidates;
        self
    }

    pub fn with_prefetch_queue_capacity(mut self, capacity: usize) -> Self {
        self.prefetch_queue_capacity = capacity.max(1);
        self
    }

    pub fn with_max_failed_states(mut self, max: usize) -> Self {
        self.max_failed_states = max.max(1);
        self
    }

    /// Tier a tile put with `probability` lands in. Ties are inclusive.
    pub fn placement(&self, probability: f64) -> Option<Tier> {
        if probability >= self.hot_threshold {
            Some(Tier::Hot)
        } else if probability >= self.warm_threshold {
            Some(Tier::Warm)
        } else {
            None
        }
    }
}

/// `dirs::cache_dir()/geolayer`, or the temp directory when the platform
/// has no cache directory.
pub fn default_warm_directory() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("geolayer")
}

/// Cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Hot,
    Warm,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Hot => write!(f, "hot"),
            Tier::Warm => write!(f, "warm"),
        }
    }
}

/// Lifecycle of one key.
///
/// ```text
/// Unrequested ──► Queued ──► Loading ──┬──► Loaded(Hot) ◄──► Loaded(Warm)
///                                      └──► Failed
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KeyState {
    #[default]
    Unrequested,
    Queued,
    Loading,
    Loaded(Tier),
    Failed(String),
}

impl KeyState {
    /// True when nothing needs to be scheduled for this key.
    pub fn is_settled(&self) -> bool {
        matches!(self, KeyState::Queued | KeyState::Loading | KeyState::Loaded(_))
    }
}

/// Per-entry bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMeta {
    pub access_count: u64,
    pub byte_size: u64,
}

/// A key the predictor expects to be requested soon. Advisory only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccessPrediction {
    pub key: TileKey,
    pub probability: f64,
}

/// A prefetch request emitted after a put.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrefetchRequest {
    pub key: TileKey,
    pub probability: f64,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hot_hits: u64,
    pub warm_hits: u64,
    pub misses: u64,
    pub promotions: u64,
    pub demotions: u64,
    /// Hot entries dropped without demotion.
    pub hot_evictions: u64,
    pub warm_evictions: u64,
    pub prefetch_sent: u64,
    pub prefetch_dropped: u64,
    pub hot_bytes: u64,
    pub hot_entries: u64,
    pub warm_bytes: u64,
    pub warm_entries: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hot_hits + self.warm_hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hot_hits + self.warm_hits) as f64 / total as f64
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hot {} entries / {} bytes, warm {} entries / {} bytes, hit rate {:.1}%",
            self.hot_entries,
            self.hot_bytes,
            self.warm_entries,
            self.warm_bytes,
            self.hit_rate() * 100.0
        )
    }
}

/// Work for the tier worker.
pub(crate) enum TierMessage {
    /// Write an evicted hot entry to the warm tier.
    Demote {
        key: TileKey,
        tile: Arc<Tile>,
        access_count: u64,
    },
    /// Remove a warm file whose index entry is gone.
    Delete {
        key: TileKey,
        path: PathBuf,
        evicted: bool,
    },
    /// Acknowledge once every earlier message is applied.
    Flush(oneshot::Sender<()>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placement_ties_are_inclusive() {
        let config = CacheConfig::default();
        assert_eq!(config.placement(0.7), Some(Tier::Hot));
        assert_eq!(config.placement(0.69), Some(Tier::Warm));
        assert_eq!(config.placement(0.3), Some(Tier::Warm));
        assert_eq!(config.placement(0.29), None);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hot_hits: 3,
            warm_hits: 1,
            misses: 4,
            ..Default::default()
        };
        assert_eq!(stats.hit_rate(), 0.5);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
