//! Open raster handles and coalesced tile reads.
//!
//! A [`RasterHandle`] is created once per container. Opening parses the
//! header and the full level chain; afterwards the index is immutable and
//! shared without locks. Tile reads go through three stages:
//!
//! ```text
//! read_tile ──► coalescer ──► I/O limiter ──► RangeSource ──► decode limiter ──► codec
//!                  │                                              (blocking pool)
//!                  └─ same key in flight: wait for the leader's result
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::coalesce::{CoalesceResult, RequestCoalescer};
use super::codec;
use super::format::{parse_container, ContainerInfo, LevelDescriptor};
use super::http::HttpSourceConfig;
use super::source::{open_source, RangeSource};
use super::tile::{PixelBuffer, Tile, TileKey};
use super::StoreError;
use crate::executor::{PriorityLimiter, RequestPriority, DEFAULT_NETWORK_CONCURRENCY};

/// Decode retries before a tile is reported as corrupt.
pub const DEFAULT_DECODE_RETRIES: u32 = 2;

/// Regions covering more tiles than this are read strip by strip.
pub const DEFAULT_STREAM_THRESHOLD_TILES: usize = 100;

/// Concurrent tile reads per region.
pub const DEFAULT_REGION_CONCURRENCY: usize = 8;

type TileResult = Result<Arc<Tile>, StoreError>;

/// Tuning for a [`RasterHandle`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub io_limiter: Arc<PriorityLimiter>,
    pub decode_limiter: Arc<PriorityLimiter>,
    pub decode_retries: u32,
    pub stream_threshold_tiles: usize,
    pub region_concurrency: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            io_limiter: Arc::new(PriorityLimiter::with_total(
                DEFAULT_NETWORK_CONCURRENCY,
                "store-io",
            )),
            decode_limiter: Arc::new(PriorityLimiter::for_cpu("store-decode")),
            decode_retries: DEFAULT_DECODE_RETRIES,
            stream_threshold_tiles: DEFAULT_STREAM_THRESHOLD_TILES,
            region_concurrency: DEFAULT_REGION_CONCURRENCY,
        }
    }
}

impl StoreOptions {
    pub fn with_io_limiter(mut self, limiter: Arc<PriorityLimiter>) -> Self {
        self.io_limiter = limiter;
        self
    }

    pub fn with_decode_limiter(mut self, limiter: Arc<PriorityLimiter>) -> Self {
        self.decode_limiter = limiter;
        self
    }

    pub fn with_decode_retries(mut self, retries: u32) -> Self {
        self.decode_retries = retries;
        self
    }

    pub fn with_stream_threshold(mut self, tiles: usize) -> Self {
        self.stream_threshold_tiles = tiles.max(1);
        self
    }

    pub fn with_region_concurrency(mut self, concurrency: usize) -> Self {
        self.region_concurrency = concurrency.max(1);
        self
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Physical I/O counters for one handle.
#[derive(Debug, Default)]
pub struct IoStats {
    tile_reads: AtomicU64,
    bytes_read: AtomicU64,
    coalesced_reads: AtomicU64,
    decode_retries: AtomicU64,
}

/// Point-in-time copy of [`IoStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoStatsSnapshot {
    pub tile_reads: u64,
    pub bytes_read: u64,
    pub coalesced_reads: u64,
    pub decode_retries: u64,
}

impl IoStats {
    fn record_read(&self, bytes: usize) {
        self.tile_reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IoStatsSnapshot {
        IoStatsSnapshot {
            tile_reads: self.tile_reads.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            coalesced_reads: self.coalesced_reads.load(Ordering::Relaxed),
            decode_retries: self.decode_retries.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tile reader
// =============================================================================

/// Format-resolved payload access: offset width and byte order are fixed
/// at open.
#[derive(Debug, Clone)]
pub struct TileReader {
    source: Arc<dyn RangeSource>,
    info: ContainerInfo,
}

impl TileReader {
    pub fn new(source: Arc<dyn RangeSource>, info: ContainerInfo) -> Self {
        Self { source, info }
    }

    pub fn info(&self) -> ContainerInfo {
        self.info
    }

    /// Compressed payload of tile `index`. Sparse tiles yield empty bytes
    /// without touching the source.
    pub async fn read_tile_bytes(
        &self,
        level: &LevelDescriptor,
        index: usize,
    ) -> Result<Bytes, StoreError> {
        let (offset, len) = match (level.tile_offsets.get(index), level.tile_byte_counts.get(index)) {
            (Some(o), Some(l)) => (*o, *l),
            _ => {
                return Err(StoreError::Index(format!(
                    "level {} has no table entry {}",
                    level.index, index
                )))
            }
        };
        if len == 0 {
            return Ok(Bytes::new());
        }
        self.source.read_range(offset, len).await
    }
}

// =============================================================================
// Handle
// =============================================================================

struct HandleInner {
    dataset_id: String,
    reader: TileReader,
    levels: Vec<Arc<LevelDescriptor>>,
    coalescer: RequestCoalescer<TileKey, TileResult>,
    options: StoreOptions,
    stats: IoStats,
}

/// A cheaply clonable handle to an open raster container.
#[derive(Clone)]
pub struct RasterHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for RasterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RasterHandle")
            .field("dataset_id", &self.inner.dataset_id)
            .field("levels", &self.inner.levels.len())
            .finish()
    }
}

impl RasterHandle {
    /// Parses the container and builds the immutable level index.
    pub async fn open(
        source: Arc<dyn RangeSource>,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        let (info, levels) = parse_container(source.as_ref()).await?;
        let dataset_id = source.describe();
        info!(
            dataset = %dataset_id,
            levels = levels.len(),
            width = levels[0].width,
            height = levels[0].height,
            crs = levels[0].crs,
            variant = ?info.variant,
            "Opened raster"
        );

        Ok(Self {
            inner: Arc::new(HandleInner {
                dataset_id,
                reader: TileReader::new(source, info),
                levels: levels.into_iter().map(Arc::new).collect(),
                coalescer: RequestCoalescer::new(),
                options,
                stats: IoStats::default(),
            }),
        })
    }

    /// Opens a local path or an `http(s)://` URL.
    pub async fn open_location(
        location: &str,
        options: StoreOptions,
        http: &HttpSourceConfig,
    ) -> Result<Self, StoreError> {
        let source = open_source(location, http).await?;
        Self::open(source, options).await
    }

    pub fn dataset_id(&self) -> &str {
        &self.inner.dataset_id
    }

    pub fn container_info(&self) -> ContainerInfo {
        self.inner.reader.info()
    }

    pub fn levels(&self) -> impl Iterator<Item = &LevelDescriptor> {
        self.inner.levels.iter().map(|l| l.as_ref())
    }

    pub fn level_count(&self) -> usize {
        self.inner.levels.len()
    }

    pub fn level(&self, level: u32) -> Result<&LevelDescriptor, StoreError> {
        self.level_ref(level).map(|l| l.as_ref())
    }

    /// Shared handle to a level descriptor, for callers that outlive a borrow.
    pub fn level_shared(&self, level: u32) -> Result<Arc<LevelDescriptor>, StoreError> {
        self.level_ref(level).map(Arc::clone)
    }

    fn level_ref(&self, level: u32) -> Result<&Arc<LevelDescriptor>, StoreError> {
        self.inner
            .levels
            .get(level as usize)
            .ok_or(StoreError::LevelOutOfRange {
                level,
                levels: self.inner.levels.len(),
            })
    }

    pub fn options(&self) -> &StoreOptions {
        &self.inner.options
    }

    pub fn io_stats(&self) -> IoStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Reads and decodes one tile at foreground priority.
    pub async fn read_tile(&self, level: u32, x: u32, y: u32) -> TileResult {
        self.read_tile_with_priority(TileKey::new(level, x, y), RequestPriority::High)
            .await
    }

    /// Reads and decodes one tile. Concurrent calls for the same key share
    /// one physical read and observe the same result.
    pub async fn read_tile_with_priority(
        &self,
        key: TileKey,
        priority: RequestPriority,
    ) -> TileResult {
        let level = self.level_shared(key.level)?;
        let index = level
            .tile_index(key.x, key.y)
            .ok_or(StoreError::TileOutOfRange {
                level: key.level,
                x: key.x,
                y: key.y,
                tiles_across: level.tiles_across(),
                tiles_down: level.tiles_down(),
            })?;

        match self.inner.coalescer.register(key) {
            CoalesceResult::Coalesced(mut rx) => {
                self.inner.stats.coalesced_reads.fetch_add(1, Ordering::Relaxed);
                debug!(tile = %key, "Tile read coalesced");
                rx.recv().await.unwrap_or_else(|_| {
                    Err(StoreError::Io(format!("read of tile {} was abandoned", key)))
                })
            }
            CoalesceResult::Leader => {
                // The read runs in its own task so waiters are notified even
                // if this caller is dropped.
                let inner = Arc::clone(&self.inner);
                let task = tokio::spawn(async move {
                    let result = inner.load_tile(&level, key, index, priority).await;
                    inner.coalescer.complete(&key, result.clone());
                    result
                });
                match task.await {
                    Ok(result) => result,
                    Err(e) => {
                        self.inner.coalescer.cancel(&key);
                        Err(StoreError::Io(format!("read task for {} failed: {}", key, e)))
                    }
                }
            }
        }
    }
}

impl HandleInner {
    async fn load_tile(
        &self,
        level: &Arc<LevelDescriptor>,
        key: TileKey,
        index: usize,
        priority: RequestPriority,
    ) -> TileResult {
        if level.is_sparse(index) {
            let pixels = PixelBuffer::zeroed(level.tile_width, level.tile_height, level.layout);
            return Ok(Arc::new(Tile::new(key, pixels)));
        }

        let order = self.reader.info().byte_order;
        let mut attempt = 0;
        loop {
            let payload = {
                let _permit = self
                    .options
                    .io_limiter
                    .acquire(priority)
                    .await
                    .ok_or_else(|| StoreError::Io("I/O limiter closed".to_string()))?;
                self.reader.read_tile_bytes(level, index).await?
            };
            self.stats.record_read(payload.len());

            let _permit = self
                .options
                .decode_limiter
                .acquire(priority)
                .await
                .ok_or_else(|| StoreError::Io("decode limiter closed".to_string()))?;
            let lvl = Arc::clone(level);
            let decoded =
                tokio::task::spawn_blocking(move || codec::decode_tile(&lvl, key, &payload, order))
                    .await
                    .map_err(|e| StoreError::Io(format!("decode task failed: {}", e)))?;

            match decoded {
                Ok(pixels) => return Ok(Arc::new(Tile::new(key, pixels))),
                Err(e @ StoreError::Decode { .. }) if attempt < self.options.decode_retries => {
                    attempt += 1;
                    self.stats.decode_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(tile = %key, attempt, error = %e, "Tile decode failed, re-reading");
                }
                Err(e) => {
                    warn!(dataset = %self.dataset_id, tile = %key, error = %e, "Tile read failed");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::format::Compression;
    use crate::store::source::MemorySource;
    use crate::store::tile::PixelLayout;
    use crate::store::writer::{LevelSpec, RasterWriter};

    async fn handle_with(levels: &[LevelSpec]) -> RasterHandle {
        let written = RasterWriter::default().build(levels).unwrap();
        let source = Arc::new(MemorySource::new("test", written.bytes));
        RasterHandle::open(source, StoreOptions::default()).await.unwrap()
    }

    fn checker(width: u32, height: u32) -> PixelBuffer {
        let mut buf = PixelBuffer::zeroed(width, height, PixelLayout::gray8());
        for y in 0..height {
            for x in 0..width {
                buf.set_sample(x, y, 0, ((x / 8 + y / 8) % 2 * 200) as f64);
            }
        }
        buf
    }

    #[tokio::test]
    async fn test_read_tile_round_trip() {
        let image = checker(64, 64);
        let spec = LevelSpec::from_image(&image, 32, 32, Compression::Deflate, None).unwrap();
        let handle = handle_with(&[spec]).await;

        let tile = handle.read_tile(0, 1, 1).await.unwrap();
        assert_eq!(tile.pixels.sample(0, 0, 0), image.sample(32, 32, 0));
        assert_eq!(handle.io_stats().tile_reads, 1);
    }

    #[tokio::test]
    async fn test_out_of_range_errors() {
        let spec = LevelSpec::from_image(&checker(64, 64), 32, 32, Compression::None, None).unwrap();
        let handle = handle_with(&[spec]).await;

        assert!(matches!(
            handle.read_tile(0, 2, 0).await,
            Err(StoreError::TileOutOfRange { tiles_across: 2, .. })
        ));
        assert!(matches!(
            handle.read_tile(3, 0, 0).await,
            Err(StoreError::LevelOutOfRange { level: 3, levels: 1 })
        ));
    }

    #[tokio::test]
    async fn test_sparse_tile_needs_no_io() {
        let mut spec =
            LevelSpec::from_image(&checker(64, 64), 32, 32, Compression::Deflate, None).unwrap();
        spec.set_raw_tile(1, 0, Vec::new());
        let handle = handle_with(&[spec]).await;

        let tile = handle.read_tile(0, 1, 0).await.unwrap();
        assert!(tile.pixels.data().iter().all(|b| *b == 0));
        assert_eq!(handle.io_stats().tile_reads, 0);
    }

    #[tokio::test]
    async fn test_corrupt_tile_is_retried_then_reported() {
        let mut spec =
            LevelSpec::from_image(&checker(64, 64), 32, 32, Compression::Deflate, None).unwrap();
        spec.set_raw_tile(0, 1, b"definitely not deflate".to_vec());
        let handle = handle_with(&[spec]).await;

        let err = handle.read_tile(0, 0, 1).await.unwrap_err();
        assert!(matches!(err, StoreError::Decode { .. }));
        let stats = handle.io_stats();
        assert_eq!(stats.tile_reads, 1 + DEFAULT_DECODE_RETRIES as u64);
        assert_eq!(stats.decode_retries, DEFAULT_DECODE_RETRIES as u64);
    }
}
