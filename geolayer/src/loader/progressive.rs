//! Progressive viewport loading and prefetch execution.
//!
//! ```text
//! load(request)
//!   ├─ plan: bounds → dataset CRS → level → pixel window → ranked tiles
//!   ├─ new generation (previous token cancelled)
//!   ├─ cache.get for every tile
//!   └─ misses: Store read (coalesced) ──┬─ generation current → cache.put
//!                                       └─ superseded        → cache.put_sunk (Warm only)
//! ```
//!
//! Prefetch requests emitted by the cache are drained by [`ProgressiveLoader::run_prefetch`]
//! at low priority, in probability order, paced between batches.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::plan::{plan_request, LoadPlan, ViewportRequest};
use super::LoaderError;
use crate::cache::{CacheHierarchy, PrefetchRequest};
use crate::executor::{Priority, PriorityQueue, RequestPriority};
use crate::store::{
    Compositor, LevelDescriptor, PixelBuffer, PixelRect, RasterHandle, StoreError, Tile, TileKey,
};
use crate::transform::{TransformEngine, DEFAULT_DENSIFY_POINTS};

/// Probability used when caching tiles a caller asked for.
pub const DEFAULT_FRESH_PROBABILITY: f64 = 0.9;

/// Prefetch requests started per batch.
pub const DEFAULT_PREFETCH_BATCH: usize = 8;

/// Pause between prefetch batches.
pub const DEFAULT_PREFETCH_PACING_MS: u64 = 50;

/// Concurrent cache-miss fetches per load.
pub const DEFAULT_LOAD_CONCURRENCY: usize = 8;

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub densify: usize,
    pub concurrency: usize,
    pub fresh_probability: f64,
    pub prefetch_batch: usize,
    pub prefetch_pacing: Duration,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            densify: DEFAULT_DENSIFY_POINTS,
            concurrency: DEFAULT_LOAD_CONCURRENCY,
            fresh_probability: DEFAULT_FRESH_PROBABILITY,
            prefetch_batch: DEFAULT_PREFETCH_BATCH,
            prefetch_pacing: Duration::from_millis(DEFAULT_PREFETCH_PACING_MS),
        }
    }
}

impl LoaderOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_prefetch_batch(mut self, batch: usize) -> Self {
        self.prefetch_batch = batch.max(1);
        self
    }

    pub fn with_prefetch_pacing(mut self, pacing: Duration) -> Self {
        self.prefetch_pacing = pacing;
        self
    }
}

/// A tile that could not be loaded.
#[derive(Debug, Clone)]
pub struct LoadHole {
    pub key: TileKey,
    pub error: StoreError,
}

/// Result of one viewport load.
#[derive(Debug, Clone)]
pub struct ViewportLoad {
    pub generation: u64,
    pub level: Arc<LevelDescriptor>,
    pub rect: PixelRect,
    /// Loaded tiles, in priority order.
    pub tiles: Vec<Arc<Tile>>,
    pub holes: Vec<LoadHole>,
    /// Tiles not returned because the load was superseded.
    pub skipped: Vec<TileKey>,
    pub cache_hits: usize,
    pub fetched: usize,
    /// True when a newer load superseded this one before it finished.
    pub stale: bool,
}

impl ViewportLoad {
    pub fn is_complete(&self) -> bool {
        self.holes.is_empty() && self.skipped.is_empty()
    }

    /// Assembles the loaded tiles into a buffer covering `rect`. Holes and
    /// skipped tiles stay zero.
    pub fn composite(&self) -> PixelBuffer {
        let mut compositor = Compositor::new(self.rect, &self.level);
        for tile in &self.tiles {
            compositor.place(&self.level, tile.key, &tile.pixels);
        }
        compositor.finish()
    }
}

/// Counters for loads and prefetch.
#[derive(Debug, Default)]
struct LoaderCounters {
    loads: AtomicU64,
    cache_hits: AtomicU64,
    fetched: AtomicU64,
    stale_results: AtomicU64,
    prefetched: AtomicU64,
    prefetch_failed: AtomicU64,
}

/// Point-in-time loader statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderStats {
    pub loads: u64,
    pub cache_hits: u64,
    pub fetched: u64,
    pub stale_results: u64,
    pub prefetched: u64,
    pub prefetch_failed: u64,
}

struct Generation {
    id: u64,
    token: CancellationToken,
}

enum FetchOutcome {
    Loaded(Arc<Tile>),
    Stale,
    Skipped,
    Failed(StoreError),
}

/// Drives cache lookups and Store reads for viewport requests.
pub struct ProgressiveLoader {
    handle: RasterHandle,
    cache: Arc<CacheHierarchy>,
    engine: Arc<TransformEngine>,
    options: LoaderOptions,
    current: Mutex<Generation>,
    counters: LoaderCounters,
}

impl ProgressiveLoader {
    pub fn new(
        handle: RasterHandle,
        cache: Arc<CacheHierarchy>,
        engine: Arc<TransformEngine>,
        options: LoaderOptions,
    ) -> Self {
        Self {
            handle,
            cache,
            engine,
            options,
            current: Mutex::new(Generation {
                id: 0,
                token: CancellationToken::new(),
            }),
            counters: LoaderCounters::default(),
        }
    }

    pub fn handle(&self) -> &RasterHandle {
        &self.handle
    }

    pub fn cache(&self) -> &Arc<CacheHierarchy> {
        &self.cache
    }

    pub fn current_generation(&self) -> u64 {
        self.current.lock().id
    }

    /// Resolves a request without loading anything.
    pub fn plan(&self, request: &ViewportRequest) -> Result<LoadPlan, LoaderError> {
        plan_request(&self.handle, &self.engine, request, self.options.densify)
    }

    fn begin_generation(&self) -> (u64, CancellationToken) {
        let mut current = self.current.lock();
        current.token.cancel();
        current.id += 1;
        current.token = CancellationToken::new();
        (current.id, current.token.clone())
    }

    /// Marks the in-flight load stale. Queued fetches are skipped and
    /// completed ones go to the warm tier only.
    pub fn cancel_outstanding(&self) {
        let current = self.current.lock();
        current.token.cancel();
        debug!(generation = current.id, "Outstanding load cancelled");
    }

    /// Loads every tile of `request`, superseding any earlier load.
    pub async fn load(&self, request: ViewportRequest) -> Result<ViewportLoad, LoaderError> {
        let start = Instant::now();
        let plan = self.plan(&request)?;
        let (generation, token) = self.begin_generation();
        let level = self.handle.level_shared(plan.level)?;
        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        debug!(
            generation,
            level = plan.level,
            rect = %plan.rect,
            tiles = plan.tiles.len(),
            "Loading viewport"
        );

        let mut loaded: Vec<(usize, Arc<Tile>)> = Vec::with_capacity(plan.tiles.len());
        let mut misses = Vec::new();
        for (rank, key) in plan.tiles.iter().copied().enumerate() {
            match self.cache.get(key).await {
                Some(tile) => loaded.push((rank, tile)),
                None => misses.push((rank, key)),
            }
        }
        let cache_hits = loaded.len();

        let outcomes: Vec<(usize, TileKey, FetchOutcome)> = stream::iter(misses)
            .map(|(rank, key)| {
                let token = token.clone();
                async move { (rank, key, self.fetch(key, &token).await) }
            })
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;

        let mut holes = Vec::new();
        let mut skipped = Vec::new();
        let mut fetched = 0;
        for (rank, key, outcome) in outcomes {
            match outcome {
                FetchOutcome::Loaded(tile) => {
                    fetched += 1;
                    loaded.push((rank, tile));
                }
                FetchOutcome::Stale | FetchOutcome::Skipped => skipped.push(key),
                FetchOutcome::Failed(error) => holes.push(LoadHole { key, error }),
            }
        }
        loaded.sort_by_key(|(rank, _)| *rank);
        holes.sort_by_key(|h| h.key);
        skipped.sort();

        let stale = token.is_cancelled();
        self.counters
            .cache_hits
            .fetch_add(cache_hits as u64, Ordering::Relaxed);
        self.counters.fetched.fetch_add(fetched as u64, Ordering::Relaxed);

        info!(
            generation,
            level = plan.level,
            tiles = plan.tiles.len(),
            cache_hits,
            fetched,
            holes = holes.len(),
            skipped = skipped.len(),
            stale,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Viewport loaded"
        );

        Ok(ViewportLoad {
            generation,
            level,
            rect: plan.rect,
            tiles: loaded.into_iter().map(|(_, t)| t).collect(),
            holes,
            skipped,
            cache_hits,
            fetched,
            stale,
        })
    }

    async fn fetch(&self, key: TileKey, token: &CancellationToken) -> FetchOutcome {
        if token.is_cancelled() {
            self.cache.mark_abandoned(key);
            return FetchOutcome::Skipped;
        }
        self.cache.mark_loading(key);

        match self
            .handle
            .read_tile_with_priority(key, RequestPriority::High)
            .await
        {
            Ok(tile) if token.is_cancelled() => {
                self.counters.stale_results.fetch_add(1, Ordering::Relaxed);
                trace!(tile = %key, "Stale result sunk to warm tier");
                if let Err(e) = self.cache.put_sunk(key, tile).await {
                    warn!(tile = %key, error = %e, "Failed to sink stale tile");
                }
                FetchOutcome::Stale
            }
            Ok(tile) => {
                if let Err(e) = self
                    .cache
                    .put(key, Arc::clone(&tile), self.options.fresh_probability)
                    .await
                {
                    warn!(tile = %key, error = %e, "Failed to cache tile");
                }
                FetchOutcome::Loaded(tile)
            }
            Err(e) => {
                warn!(tile = %key, error = %e, "Tile load failed");
                self.cache.mark_failed(key, e.to_string());
                FetchOutcome::Failed(e)
            }
        }
    }

    fn in_range(&self, key: TileKey) -> bool {
        self.handle
            .level(key.level)
            .ok()
            .and_then(|l| l.tile_index(key.x, key.y))
            .is_some()
    }

    async fn prefetch_one(&self, request: PrefetchRequest) {
        let key = request.key;
        if !self.in_range(key) || self.cache.tier_of(key).is_some() {
            self.cache.mark_abandoned(key);
            return;
        }
        if !self.cache.mark_loading(key) {
            return;
        }
        match self
            .handle
            .read_tile_with_priority(key, RequestPriority::Low)
            .await
        {
            Ok(tile) => {
                self.counters.prefetched.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self
                    .cache
                    .put_prefetched(key, tile, request.probability)
                    .await
                {
                    warn!(tile = %key, error = %e, "Failed to cache prefetched tile");
                }
            }
            Err(e) => {
                self.counters.prefetch_failed.fetch_add(1, Ordering::Relaxed);
                debug!(tile = %key, error = %e, "Prefetch failed");
                self.cache.mark_failed(key, e.to_string());
            }
        }
    }

    /// Executes prefetch requests until `shutdown` fires or the channel
    /// closes. Requests are served most probable first, in batches separated
    /// by the pacing delay.
    pub async fn run_prefetch(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<PrefetchRequest>,
        shutdown: CancellationToken,
    ) {
        let mut queue: PriorityQueue<PrefetchRequest> = PriorityQueue::new();
        info!(
            batch = self.options.prefetch_batch,
            pacing_ms = self.options.prefetch_pacing.as_millis() as u64,
            "Prefetch executor started"
        );

        loop {
            if queue.is_empty() {
                let request = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    request = rx.recv() => request,
                };
                match request {
                    Some(r) => queue.push(r, Priority::for_prediction(r.probability)),
                    None => break,
                }
            }
            while let Ok(r) = rx.try_recv() {
                queue.push(r, Priority::for_prediction(r.probability));
            }

            let batch: Vec<PrefetchRequest> = (0..self.options.prefetch_batch.max(1))
                .map_while(|_| queue.pop().map(|q| q.item))
                .collect();
            trace!(batch = batch.len(), queued = queue.len(), "Prefetch batch");
            stream::iter(batch)
                .for_each_concurrent(None, |r| self.prefetch_one(r))
                .await;

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.options.prefetch_pacing) => {}
            }
        }

        // Requests that will never run must not stay `Queued`.
        rx.close();
        while let Ok(r) = rx.try_recv() {
            queue.push(r, Priority::PREFETCH);
        }
        let abandoned = queue.len();
        while let Some(q) = queue.pop() {
            self.cache.mark_abandoned(q.item.key);
        }

        let stats = self.stats();
        info!(
            prefetched = stats.prefetched,
            failed = stats.prefetch_failed,
            abandoned,
            "Prefetch executor stopped"
        );
    }

    pub fn stats(&self) -> LoaderStats {
        let c = &self.counters;
        LoaderStats {
            loads: c.loads.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            fetched: c.fetched.load(Ordering::Relaxed),
            stale_results: c.stale_results.load(Ordering::Relaxed),
            prefetched: c.prefetched.load(Ordering::Relaxed),
            prefetch_failed: c.prefetch_failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use bytes::Bytes;
    use futures::future::BoxFuture;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::cache::{CacheConfig, DisabledPredictor, KeyState, NeighborhoodPredictor, Tier};
    use crate::store::{
        Compression, Georeference, LevelSpec, MemorySource, PixelLayout, RangeSource,
        RasterWriter, StoreOptions,
    };
    use crate::transform::{BoundingBox, BuiltinCrsDictionary, GeoTransform, WEB_MERCATOR};

    /// Holds reads once armed until a permit is added.
    #[derive(Debug)]
    struct GatedSource {
        inner: MemorySource,
        gate: Semaphore,
        armed: AtomicBool,
    }

    impl RangeSource for GatedSource {
        fn len(&self) -> u64 {
            self.inner.len()
        }

        fn read_range(&self, offset: u64, length: u64) -> BoxFuture<'_, Result<Bytes, StoreError>> {
            Box::pin(async move {
                if self.armed.load(Ordering::SeqCst) {
                    let _permit = self
                        .gate
                        .acquire()
                        .await
                        .map_err(|e| StoreError::Io(e.to_string()))?;
                }
                self.inner.read_range(offset, length).await
            })
        }

        fn describe(&self) -> String {
            self.inner.describe()
        }
    }

    /// Level 0: 256x256 at 10 m, 64 px tiles. Level 1: 128x128 at 20 m.
    fn container(corrupt: Option<(u32, u32)>) -> Vec<u8> {
        let mut image = PixelBuffer::zeroed(256, 256, PixelLayout::gray8());
        for y in 0..256 {
            for x in 0..256 {
                image.set_sample(x, y, 0, ((x / 64) * 40 + (y / 64) * 10) as f64);
            }
        }
        let geo = Georeference::projected(GeoTransform::north_up(0.0, 2560.0, 10.0, 10.0), WEB_MERCATOR);
        let mut fine = LevelSpec::from_image(&image, 64, 64, Compression::Deflate, Some(geo)).unwrap();
        if let Some((x, y)) = corrupt {
            fine.set_raw_tile(x, y, b"not a tile".to_vec());
        }
        let coarse = LevelSpec::from_image(
            &PixelBuffer::zeroed(128, 128, PixelLayout::gray8()),
            64,
            64,
            Compression::Deflate,
            None,
        )
        .unwrap();
        RasterWriter::default().build(&[fine, coarse]).unwrap().bytes
    }

    fn engine() -> Arc<TransformEngine> {
        Arc::new(TransformEngine::new(Arc::new(BuiltinCrsDictionary::new())))
    }

    fn request(min_x: f64, min_y: f64, max_x: f64, max_y: f64, resolution: f64) -> ViewportRequest {
        ViewportRequest::new(
            BoundingBox::new(WEB_MERCATOR, min_x, min_y, max_x, max_y),
            resolution,
        )
    }

    struct Fixture {
        loader: Arc<ProgressiveLoader>,
        cache: Arc<CacheHierarchy>,
        prefetch_rx: mpsc::Receiver<PrefetchRequest>,
        _dir: tempfile::TempDir,
    }

    async fn fixture_with(source: Arc<dyn RangeSource>, prefetch: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::default()
            .with_warm_directory(dir.path())
            .with_hot_capacity(1 << 20)
            .with_warm_capacity(1 << 20)
            .with_prefetch(prefetch, 8);
        let predictor: Arc<dyn crate::cache::AccessPredictor> = if prefetch {
            Arc::new(NeighborhoodPredictor::new())
        } else {
            Arc::new(DisabledPredictor)
        };
        let (cache, prefetch_rx) = CacheHierarchy::start(config, "loader-test", predictor)
            .await
            .unwrap();
        let cache = Arc::new(cache);
        let handle = RasterHandle::open(source, StoreOptions::default()).await.unwrap();
        let options = LoaderOptions::default().with_prefetch_pacing(Duration::from_millis(1));
        Fixture {
            loader: Arc::new(ProgressiveLoader::new(handle, Arc::clone(&cache), engine(), options)),
            cache,
            prefetch_rx,
            _dir: dir,
        }
    }

    async fn fixture(corrupt: Option<(u32, u32)>, prefetch: bool) -> Fixture {
        fixture_with(Arc::new(MemorySource::new("viewport", container(corrupt))), prefetch).await
    }

    #[tokio::test]
    async fn test_plan_selects_level_and_ranks_tiles() {
        let f = fixture(None, false).await;

        let plan = f.loader.plan(&request(0.0, 1280.0, 640.0, 2560.0, 10.0)).unwrap();
        assert_eq!(plan.level, 0);
        assert_eq!(plan.rect, PixelRect::new(0, 0, 64, 128));
        assert_eq!(plan.tiles, vec![TileKey::new(0, 0, 0), TileKey::new(0, 0, 1)]);

        let plan = f.loader.plan(&request(0.0, 1280.0, 640.0, 2560.0, 25.0)).unwrap();
        assert_eq!(plan.level, 1);
        assert_eq!(plan.tiles, vec![TileKey::new(1, 0, 0)]);

        // Nothing is fine enough: use the finest level.
        let plan = f.loader.plan(&request(0.0, 1280.0, 640.0, 2560.0, 5.0)).unwrap();
        assert_eq!(plan.level, 0);
    }

    #[tokio::test]
    async fn test_plan_ranks_nearest_tiles_first() {
        let f = fixture(None, false).await;
        // Centre of the dataset, slightly towards tile (2, 2).
        let plan = f.loader.plan(&request(700.0, 600.0, 1900.0, 1800.0, 10.0)).unwrap();
        assert_eq!(plan.tiles.len(), 6);
        assert_eq!(plan.tiles[0], TileKey::new(0, 2, 2));
    }

    #[tokio::test]
    async fn test_plan_from_geographic_bounds() {
        let f = fixture(None, false).await;
        let bounds = BoundingBox::new(4326, 0.0, 0.012, 0.005, 0.0229);
        let plan = f.loader.plan(&ViewportRequest::new(bounds, 10.0)).unwrap();
        assert_eq!(plan.level, 0);
        assert!(plan.tiles.contains(&TileKey::new(0, 0, 0)));
        assert!(plan.dataset_bounds.min_x.abs() < 1.0);
    }

    #[tokio::test]
    async fn test_plan_rejects_bad_requests() {
        let f = fixture(None, false).await;
        assert!(matches!(
            f.loader.plan(&request(5000.0, 5000.0, 6000.0, 6000.0, 10.0)),
            Err(LoaderError::OutsideDataset { level: 0, .. })
        ));
        assert!(matches!(
            f.loader.plan(&request(0.0, 0.0, 100.0, 100.0, 0.0)),
            Err(LoaderError::InvalidRequest(_))
        ));
        assert!(matches!(
            f.loader.plan(&request(100.0, 0.0, 0.0, 100.0, 10.0)),
            Err(LoaderError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_second_load_is_served_from_cache() {
        let f = fixture(None, false).await;
        let req = request(0.0, 1280.0, 1280.0, 2560.0, 10.0);

        let first = f.loader.load(req).await.unwrap();
        assert_eq!(first.generation, 1);
        assert_eq!((first.cache_hits, first.fetched), (0, 4));
        assert!(first.is_complete());
        assert!(!first.stale);

        let second = f.loader.load(req).await.unwrap();
        assert_eq!(second.generation, 2);
        assert_eq!((second.cache_hits, second.fetched), (4, 0));
        assert_eq!(f.cache.tier_of(TileKey::new(0, 1, 1)), Some(Tier::Hot));

        let region = f.loader.handle().read_region(0, second.rect).await.unwrap();
        assert_eq!(second.composite(), region.pixels);
        assert_eq!(f.loader.stats().loads, 2);
    }

    #[tokio::test]
    async fn test_failed_tile_becomes_hole() {
        let f = fixture(Some((1, 0)), false).await;
        let load = f.loader.load(request(0.0, 1920.0, 1280.0, 2560.0, 10.0)).await.unwrap();

        assert_eq!(load.tiles.len(), 1);
        assert_eq!(load.holes.len(), 1);
        assert_eq!(load.holes[0].key, TileKey::new(0, 1, 0));
        assert!(matches!(load.holes[0].error, StoreError::Decode { .. }));
        assert!(matches!(f.cache.state(TileKey::new(0, 1, 0)), KeyState::Failed(_)));

        let composite = load.composite();
        assert_eq!(composite.sample(100, 10, 0), 0.0);
        assert_eq!(composite.sample(10, 10, 0), 0.0);
        assert_eq!(composite.width(), 128);
    }

    #[tokio::test]
    async fn test_superseded_fetch_is_sunk_to_warm() {
        let source = Arc::new(GatedSource {
            inner: MemorySource::new("gated", container(None)),
            gate: Semaphore::new(0),
            armed: AtomicBool::new(false),
        });
        let f = fixture_with(source.clone(), false).await;
        source.armed.store(true, Ordering::SeqCst);

        let key = TileKey::new(0, 0, 0);
        let loader = Arc::clone(&f.loader);
        let task = tokio::spawn(async move {
            loader.load(request(0.0, 1920.0, 640.0, 2560.0, 10.0)).await
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while f.cache.state(key) != KeyState::Loading {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        f.loader.cancel_outstanding();
        source.gate.add_permits(1);

        let load = task.await.unwrap().unwrap();
        assert!(load.stale);
        assert!(load.tiles.is_empty());
        assert_eq!(load.skipped, vec![key]);

        f.cache.flush().await;
        assert_eq!(f.cache.tier_of(key), Some(Tier::Warm));
        assert_eq!(f.loader.stats().stale_results, 1);
    }

    #[tokio::test]
    async fn test_prefetch_executor_fills_cache() {
        let f = fixture(None, true).await;
        f.loader.load(request(0.0, 1920.0, 640.0, 2560.0, 10.0)).await.unwrap();

        let shutdown = CancellationToken::new();
        let executor = tokio::spawn(Arc::clone(&f.loader).run_prefetch(f.prefetch_rx, shutdown.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while f.loader.stats().prefetched < 4 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
        shutdown.cancel();
        executor.await.unwrap();

        f.cache.flush().await;
        assert_eq!(f.cache.tier_of(TileKey::new(0, 1, 0)), Some(Tier::Warm));
        assert_eq!(f.cache.tier_of(TileKey::new(1, 0, 0)), Some(Tier::Warm));
        assert_eq!(f.cache.state(TileKey::new(0, 1, 1)), KeyState::Loaded(Tier::Warm));
    }

    #[tokio::test]
    async fn test_stopped_executor_releases_queued_keys() {
        let f = fixture(None, true).await;
        f.loader.load(request(0.0, 1920.0, 640.0, 2560.0, 10.0)).await.unwrap();
        let (_, queued) = f.cache.pending_state_count();
        assert!(queued > 0);

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        Arc::clone(&f.loader).run_prefetch(f.prefetch_rx, shutdown).await;

        assert_eq!(f.cache.pending_state_count(), (0, 0));
        assert_eq!(f.cache.state(TileKey::new(0, 1, 0)), KeyState::Unrequested);
        assert_eq!(f.loader.stats().prefetched, 0);
    }
}
