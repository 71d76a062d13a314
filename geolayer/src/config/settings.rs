//! Runtime settings assembled from a [`ConfigFile`] and builder overrides.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::file::{ConfigFile, DEFAULT_TILE_SIZE};
use crate::cache::CacheConfig;
use crate::executor::{PriorityLimiter, RetryPolicy};
use crate::loader::LoaderOptions;
use crate::pyramid::{Kernel, PyramidOptions};
use crate::store::{HttpSourceConfig, StoreOptions};

/// Settings for every component, in their own units.
#[derive(Debug, Clone)]
pub struct GeoLayerConfig {
    pub tile_size: u32,
    pub min_level_size: u64,
    pub kernel: Kernel,
    pub decode_concurrency: usize,
    pub network_concurrency: usize,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub cache: CacheConfig,
    pub loader: LoaderOptions,
}

impl Default for GeoLayerConfig {
    fn default() -> Self {
        Self::from_config_file(&ConfigFile::default())
    }
}

impl GeoLayerConfig {
    pub fn from_config_file(file: &ConfigFile) -> Self {
        let cache = CacheConfig::default()
            .with_hot_capacity(file.general.max_hot_cache_bytes)
            .with_warm_capacity(file.general.max_warm_cache_bytes)
            .with_warm_directory(file.general.warm_cache_directory.clone())
            .with_thresholds(file.cache.hot_threshold, file.cache.warm_threshold)
            .with_prefetch(file.prefetch.enabled, file.prefetch.max_candidates);

        Self {
            tile_size: file.general.tile_size,
            min_level_size: file.general.min_level_size,
            kernel: file.resampling.kernel(),
            decode_concurrency: file.concurrency.decode,
            network_concurrency: file.concurrency.network,
            timeout: Duration::from_secs(file.network.timeout_secs),
            max_attempts: file.network.max_attempts,
            cache,
            loader: LoaderOptions::default(),
        }
    }

    pub fn with_tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = if tile_size == 0 { DEFAULT_TILE_SIZE } else { tile_size };
        self
    }

    pub fn with_kernel(mut self, kernel: Kernel) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn with_concurrency(mut self, decode: usize, network: usize) -> Self {
        self.decode_concurrency = decode.max(1);
        self.network_concurrency = network.max(1);
        self
    }

    pub fn with_network(mut self, timeout: Duration, max_attempts: u32) -> Self {
        self.timeout = timeout;
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_warm_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache = self.cache.with_warm_directory(dir);
        self
    }

    pub fn with_prefetch(mut self, enabled: bool) -> Self {
        let max = self.cache.max_prefetch_candidates;
        self.cache = self.cache.with_prefetch(enabled, max);
        self
    }

    pub fn with_loader(mut self, loader: LoaderOptions) -> Self {
        self.loader = loader;
        self
    }

    /// Store options with fresh limiters sized from these settings.
    ///
    /// Each call creates new limiters; share the result between handles
    /// that should compete for the same permits.
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions::default()
            .with_io_limiter(Arc::new(PriorityLimiter::with_total(
                self.network_concurrency,
                "store-io",
            )))
            .with_decode_limiter(Arc::new(PriorityLimiter::with_total(
                self.decode_concurrency,
                "store-decode",
            )))
    }

    pub fn pyramid_options(&self, store: StoreOptions) -> PyramidOptions {
        PyramidOptions::default()
            .with_kernel(self.kernel)
            .with_min_level_size(self.min_level_size)
            .with_concurrency(self.decode_concurrency)
            .with_store_options(store)
    }

    pub fn http_config(&self) -> HttpSourceConfig {
        HttpSourceConfig::default()
            .with_timeout(self.timeout)
            .with_retry(RetryPolicy::exponential(self.max_attempts))
    }

    pub fn cache_config(&self) -> CacheConfig {
        self.cache.clone()
    }

    pub fn loader_options(&self) -> LoaderOptions {
        self.loader.clone()
    }
}
