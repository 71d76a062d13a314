//! Overview level construction.
//!
//! Every target tile is an independent unit of work:
//!
//! ```text
//! target tile ──► contributions (kernel support x reduction factor, clamped)
//!             ──► minimal source window ──► Store region read
//!             ──► separable resample (blocking pool) ──► encode ──► sink
//! ```
//!
//! The source window is dropped as soon as its tile is encoded, so memory
//! use is bounded by the concurrency limit rather than the level size.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::{FailedTile, PyramidError};
use super::kernel::{axis_contributions, resample, span, Contribution, Kernel};
use crate::executor::RequestPriority;
use crate::store::{
    encode_tile, FileLevelAppender, FileSource, LevelDescriptor, LevelSink, LevelTemplate,
    PixelRect, RasterHandle, StoreError, StoreOptions, TileKey, MAX_LEVELS,
};

/// Default shorter side below which no further level is built.
pub const DEFAULT_MIN_LEVEL_SIZE: u64 = 256;

/// Options for [`build_pyramid`].
#[derive(Debug, Clone)]
pub struct PyramidOptions {
    pub kernel: Kernel,
    pub min_level_size: u64,
    /// Target tiles built concurrently.
    pub concurrency: usize,
    pub store: StoreOptions,
}

impl Default for PyramidOptions {
    fn default() -> Self {
        Self {
            kernel: Kernel::default(),
            min_level_size: DEFAULT_MIN_LEVEL_SIZE,
            concurrency: std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4),
            store: StoreOptions::default(),
        }
    }
}

impl PyramidOptions {
    pub fn with_kernel(mut self, kernel: Kernel) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn with_min_level_size(mut self, size: u64) -> Self {
        self.min_level_size = size.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_store_options(mut self, store: StoreOptions) -> Self {
        self.store = store;
        self
    }
}

/// Per-tile work description.
struct TilePlan {
    key: TileKey,
    window: PixelRect,
    cols: Vec<Contribution>,
    rows: Vec<Contribution>,
}

fn plan_tile(
    source: &LevelDescriptor,
    template: &LevelTemplate,
    kernel: Kernel,
    key: TileKey,
) -> TilePlan {
    let tw = template.tile_width as u64;
    let th = template.tile_height as u64;
    let u0 = key.x as u64 * tw;
    let v0 = key.y as u64 * th;
    let cols = axis_contributions(kernel, source.width, template.width, u0..(u0 + tw).min(template.width));
    let rows = axis_contributions(kernel, source.height, template.height, v0..(v0 + th).min(template.height));
    let cs = span(&cols);
    let rs = span(&rows);
    TilePlan {
        key,
        window: PixelRect::new(
            cs.start as u64,
            rs.start as u64,
            cs.len() as u32,
            rs.len() as u32,
        ),
        cols,
        rows,
    }
}

/// Builds one tile. The outer error is fatal, the inner one scoped to the tile.
async fn build_tile(
    handle: RasterHandle,
    source_level: u32,
    template: Arc<LevelTemplate>,
    order: crate::store::ByteOrder,
    plan: TilePlan,
) -> Result<(TileKey, Result<Vec<u8>, FailedTile>), PyramidError> {
    let region = handle
        .read_region_with_priority(source_level, plan.window, RequestPriority::High)
        .await?;

    if !region.holes.is_empty() {
        let reason = region.holes[0].error.to_string();
        return Ok((
            plan.key,
            Err(FailedTile {
                target: plan.key,
                sources: region.holes.iter().map(|h| h.key).collect(),
                reason,
            }),
        ));
    }

    let _permit = handle
        .options()
        .decode_limiter
        .acquire(RequestPriority::High)
        .await
        .ok_or_else(|| StoreError::Io("decode limiter closed".to_string()))?;

    let key = plan.key;
    let payload = tokio::task::spawn_blocking(move || {
        let out = resample(
            &region.pixels,
            plan.window.x as usize,
            plan.window.y as usize,
            &plan.cols,
            &plan.rows,
            template.tile_width,
            template.tile_height,
        );
        drop(region);
        encode_tile(template.compression, template.predictor, &out, order)
    })
    .await
    .map_err(|e| StoreError::Io(format!("resample task failed: {}", e)))??;

    Ok((key, Ok(payload)))
}

/// Builds a reduced level from `source_level` and writes it into `sink`.
///
/// The sink's template fixes the target size, tiling and encoding. Tiles
/// whose source window contains an unreadable tile are skipped and reported
/// through [`PyramidError::Partial`]; all other tiles are still written.
pub async fn build_level(
    handle: &RasterHandle,
    source_level: u32,
    kernel: Kernel,
    sink: &mut dyn LevelSink,
    concurrency: usize,
) -> Result<LevelDescriptor, PyramidError> {
    let source = handle.level(source_level)?.clone();
    let template = Arc::new(sink.template().clone());
    if template.width == 0
        || template.height == 0
        || template.width > source.width
        || template.height > source.height
    {
        return Err(PyramidError::InvalidTarget(format!(
            "{}x{} is not a reduction of level {} ({}x{})",
            template.width, template.height, source_level, source.width, source.height
        )));
    }
    if template.layout != source.layout {
        return Err(PyramidError::InvalidTarget(format!(
            "target layout {:?} differs from source {:?}",
            template.layout, source.layout
        )));
    }

    let start = Instant::now();
    let order = sink.byte_order();
    let target_level = sink.level_index();
    let keys: Vec<TileKey> = (0..template.tiles_down())
        .flat_map(|y| (0..template.tiles_across()).map(move |x| TileKey::new(target_level, x, y)))
        .collect();
    let total = keys.len();
    debug!(
        source_level,
        width = template.width,
        height = template.height,
        tiles = total,
        kernel = %kernel,
        "Building level"
    );

    let mut results = stream::iter(keys)
        .map(|key| {
            let plan = plan_tile(&source, &template, kernel, key);
            build_tile(
                handle.clone(),
                source_level,
                Arc::clone(&template),
                order,
                plan,
            )
        })
        .buffer_unordered(concurrency.max(1));

    let mut failed = Vec::new();
    while let Some(result) = results.next().await {
        let (key, outcome) = result?;
        match outcome {
            Ok(payload) => sink.write_tile(key.x, key.y, payload).await?,
            Err(failure) => {
                warn!(
                    tile = %key,
                    sources = failure.sources.len(),
                    reason = %failure.reason,
                    "Target tile skipped"
                );
                failed.push(failure);
            }
        }
    }
    drop(results);

    let mut descriptor = sink.finish().await?;
    finish_descriptor(&mut descriptor, &source);

    info!(
        level = descriptor.index,
        width = descriptor.width,
        height = descriptor.height,
        tiles = total,
        failed = failed.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Built pyramid level"
    );

    if failed.is_empty() {
        Ok(descriptor)
    } else {
        failed.sort_by_key(|f: &FailedTile| f.target);
        Err(PyramidError::Partial {
            descriptor: Box::new(descriptor),
            failed,
        })
    }
}

fn finish_descriptor(descriptor: &mut LevelDescriptor, source: &LevelDescriptor) {
    let fx = source.width as f64 / descriptor.width as f64;
    let fy = source.height as f64 / descriptor.height as f64;
    descriptor.geo_transform = source.geo_transform.scaled(fx, fy);
    descriptor.crs = source.crs;
}

// =============================================================================
// Whole pyramid
// =============================================================================

/// One level produced by [`build_pyramid`].
#[derive(Debug, Clone, Serialize)]
pub struct BuiltLevel {
    pub index: u32,
    pub width: u64,
    pub height: u64,
    pub tiles: usize,
    pub failed_tiles: usize,
}

/// Summary of a [`build_pyramid`] run.
#[derive(Debug, Clone, Serialize)]
pub struct PyramidReport {
    pub source: String,
    pub kernel: String,
    pub levels: Vec<BuiltLevel>,
    pub failed_tiles: Vec<FailedTile>,
    pub elapsed_ms: u64,
}

impl PyramidReport {
    pub fn is_complete(&self) -> bool {
        self.failed_tiles.is_empty()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Appends halved levels to a local container until the shorter side of
/// the coarsest level drops below `min_level_size`.
pub async fn build_pyramid(
    path: impl AsRef<Path>,
    options: PyramidOptions,
) -> Result<PyramidReport, PyramidError> {
    let path = path.as_ref();
    let start = Instant::now();
    let mut report = PyramidReport {
        source: path.display().to_string(),
        kernel: options.kernel.to_string(),
        levels: Vec::new(),
        failed_tiles: Vec::new(),
        elapsed_ms: 0,
    };

    loop {
        let source = Arc::new(FileSource::open(path).await?);
        let handle = RasterHandle::open(source, options.store.clone()).await?;
        let coarsest_index = (handle.level_count() - 1) as u32;
        let coarsest = handle.level(coarsest_index)?;

        let (w, h) = (coarsest.width, coarsest.height);
        let (nw, nh) = (w.div_ceil(2), h.div_ceil(2));
        if w.min(h) < options.min_level_size || (nw, nh) == (w, h) {
            break;
        }
        if handle.level_count() >= MAX_LEVELS {
            warn!(path = %path.display(), "Level cap reached, stopping");
            break;
        }

        let template = LevelTemplate::like(coarsest, nw, nh);
        let tiles = template.tile_count();
        let mut appender = FileLevelAppender::open(path, template).await?;
        let (descriptor, failed) = match build_level(
            &handle,
            coarsest_index,
            options.kernel,
            &mut appender,
            options.concurrency,
        )
        .await
        {
            Ok(descriptor) => (descriptor, Vec::new()),
            Err(PyramidError::Partial { descriptor, failed }) => (*descriptor, failed),
            Err(e) => return Err(e),
        };

        report.levels.push(BuiltLevel {
            index: descriptor.index,
            width: descriptor.width,
            height: descriptor.height,
            tiles,
            failed_tiles: failed.len(),
        });
        report.failed_tiles.extend(failed);
    }

    report.elapsed_ms = start.elapsed().as_millis() as u64;
    info!(
        path = %path.display(),
        levels_built = report.levels.len(),
        failed_tiles = report.failed_tiles.len(),
        elapsed_ms = report.elapsed_ms,
        "Pyramid build complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        decode_tile, ByteOrder, Compression, Georeference, LevelSpec, MemoryLevelSink, MemorySource,
        PixelBuffer, PixelLayout, RasterWriter,
    };
    use crate::transform::GeoTransform;

    fn ramp(width: u32, height: u32) -> PixelBuffer {
        let mut buf = PixelBuffer::zeroed(width, height, PixelLayout::gray8());
        for y in 0..height {
            for x in 0..width {
                buf.set_sample(x, y, 0, ((x + y) % 256) as f64);
            }
        }
        buf
    }

    async fn handle_for(spec: LevelSpec) -> RasterHandle {
        let written = RasterWriter::default().build(&[spec]).unwrap();
        let source = Arc::new(MemorySource::new("pyramid-test", written.bytes));
        RasterHandle::open(source, StoreOptions::default()).await.unwrap()
    }

    fn half_of(handle: &RasterHandle) -> MemoryLevelSink {
        let fine = handle.level(0).unwrap();
        let template = LevelTemplate::like(fine, fine.width / 2, fine.height / 2);
        MemoryLevelSink::new(template, 1, ByteOrder::Little)
    }

    #[tokio::test]
    async fn test_box_halving_averages_blocks() {
        let gt = GeoTransform::north_up(500_000.0, 4_000_000.0, 1.0, 1.0);
        let spec = LevelSpec::from_image(
            &ramp(64, 64),
            32,
            32,
            Compression::Deflate,
            Some(Georeference::projected(gt, 32633)),
        )
        .unwrap();
        let handle = handle_for(spec).await;

        let mut sink = half_of(&handle);
        let descriptor = build_level(&handle, 0, Kernel::Box, &mut sink, 2).await.unwrap();
        assert_eq!((descriptor.width, descriptor.height), (32, 32));
        assert_eq!(descriptor.crs, 32633);
        assert_eq!(descriptor.pixel_size(), 2.0);

        let key = TileKey::new(1, 0, 0);
        let tile = decode_tile(&descriptor, key, sink.tile(0, 0).unwrap(), ByteOrder::Little).unwrap();
        for (u, v) in [(0u32, 0u32), (5, 9), (31, 31)] {
            assert_eq!(tile.sample(u, v, 0), (2 * u + 2 * v + 1) as f64);
        }
    }

    #[tokio::test]
    async fn test_rebuild_is_byte_identical() {
        let spec = LevelSpec::from_image(&ramp(96, 80), 32, 32, Compression::Deflate, None).unwrap();
        let handle = handle_for(spec).await;

        let mut first = half_of(&handle);
        let mut second = half_of(&handle);
        build_level(&handle, 0, Kernel::Lanczos(3), &mut first, 4).await.unwrap();
        build_level(&handle, 0, Kernel::Lanczos(3), &mut second, 1).await.unwrap();
        assert_eq!(first.tiles(), second.tiles());
        assert_eq!(first.tiles().len(), 4);
    }

    #[tokio::test]
    async fn test_corrupt_source_tile_fails_only_its_targets() {
        let mut spec =
            LevelSpec::from_image(&ramp(128, 128), 32, 32, Compression::Deflate, None).unwrap();
        spec.set_raw_tile(3, 3, b"garbage".to_vec());
        let handle = handle_for(spec).await;

        let mut sink = half_of(&handle);
        let err = build_level(&handle, 0, Kernel::Bilinear, &mut sink, 4).await.unwrap_err();
        match err {
            PyramidError::Partial { descriptor, failed } => {
                assert_eq!(descriptor.index, 1);
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].target, TileKey::new(1, 1, 1));
                assert_eq!(failed[0].sources, vec![TileKey::new(0, 3, 3)]);
            }
            other => panic!("expected partial level, got {:?}", other),
        }
        assert_eq!(sink.tiles().len(), 3);
        assert!(sink.tile(1, 1).is_none());
    }

    #[tokio::test]
    async fn test_target_must_be_a_reduction() {
        let spec = LevelSpec::from_image(&ramp(64, 64), 32, 32, Compression::None, None).unwrap();
        let handle = handle_for(spec).await;
        let template = LevelTemplate::like(handle.level(0).unwrap(), 128, 64);
        let mut sink = MemoryLevelSink::new(template, 1, ByteOrder::Little);
        assert!(matches!(
            build_level(&handle, 0, Kernel::Box, &mut sink, 1).await,
            Err(PyramidError::InvalidTarget(_))
        ));
    }

    #[tokio::test]
    async fn test_build_pyramid_appends_until_min_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ortho.tif");
        let spec = LevelSpec::from_image(&ramp(128, 128), 32, 32, Compression::Deflate, None).unwrap();
        RasterWriter::default().write_to(&path, &[spec]).await.unwrap();

        let options = PyramidOptions::default()
            .with_kernel(Kernel::Box)
            .with_min_level_size(32)
            .with_concurrency(2);
        let report = build_pyramid(&path, options).await.unwrap();
        assert!(report.is_complete());
        let widths: Vec<u64> = report.levels.iter().map(|l| l.width).collect();
        assert_eq!(widths, vec![64, 32, 16]);

        let source = Arc::new(FileSource::open(&path).await.unwrap());
        let handle = RasterHandle::open(source, StoreOptions::default()).await.unwrap();
        assert_eq!(handle.level_count(), 4);
        let tile = handle.read_tile(3, 0, 0).await.unwrap();
        assert_eq!(tile.pixels.width(), 32);
        assert!(report.to_json().unwrap().contains("\"kernel\": \"box\""));
    }
}
