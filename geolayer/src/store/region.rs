//! Region reads: covering tiles, concurrent fetch, composite and crop.
//!
//! Tiles that fail to decode or read become zero-filled holes listed in the
//! result; only fatal errors (bad level, out-of-range rectangle) fail the
//! whole call. Large regions are assembled one strip (one row of tiles) at
//! a time so only a strip's worth of decoded tiles is alive at once.

use std::fmt;

use futures::stream::{self, BoxStream, StreamExt};
use tracing::{debug, warn};

use super::format::LevelDescriptor;
use super::handle::RasterHandle;
use super::tile::{PixelBuffer, TileKey};
use super::StoreError;
use crate::executor::RequestPriority;

/// A pixel rectangle within one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelRect {
    pub x: u64,
    pub y: u64,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn new(x: u64, y: u64, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> u64 {
        self.x + self.width as u64
    }

    pub fn bottom(&self) -> u64 {
        self.y + self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Overlap with another rectangle, if any.
    pub fn intersect(&self, other: &PixelRect) -> Option<PixelRect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        (x1 > x0 && y1 > y0).then(|| PixelRect::new(x0, y0, (x1 - x0) as u32, (y1 - y0) as u32))
    }

    /// Inclusive tile index ranges covering the rectangle.
    pub fn tile_span(&self, level: &LevelDescriptor) -> (std::ops::RangeInclusive<u32>, std::ops::RangeInclusive<u32>) {
        let tw = level.tile_width as u64;
        let th = level.tile_height as u64;
        (
            (self.x / tw) as u32..=((self.right() - 1) / tw) as u32,
            (self.y / th) as u32..=((self.bottom() - 1) / th) as u32,
        )
    }
}

impl fmt::Display for PixelRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// A tile that could not be composited.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionHole {
    pub key: TileKey,
    /// Affected area in the output buffer's coordinates.
    pub rect: PixelRect,
    pub error: StoreError,
}

/// Result of a region read.
#[derive(Debug, Clone)]
pub struct RegionRead {
    pub rect: PixelRect,
    pub pixels: PixelBuffer,
    pub holes: Vec<RegionHole>,
    /// Tiles successfully composited.
    pub tiles_read: usize,
}

impl RegionRead {
    pub fn is_complete(&self) -> bool {
        self.holes.is_empty()
    }
}

/// One strip of a streamed region: a full-width band of the output.
#[derive(Debug, Clone)]
pub struct RegionStrip {
    /// Row of the band's first line within the region.
    pub row_offset: u32,
    pub pixels: PixelBuffer,
    pub holes: Vec<RegionHole>,
    pub tiles_read: usize,
}

/// Copies tile intersections into an output window.
#[derive(Debug)]
pub struct Compositor {
    window: PixelRect,
    out: PixelBuffer,
    pixels_written: u64,
}

impl Compositor {
    pub fn new(window: PixelRect, level: &LevelDescriptor) -> Self {
        Self {
            window,
            out: PixelBuffer::zeroed(window.width, window.height, level.layout),
            pixels_written: 0,
        }
    }

    /// Level-space rectangle a tile covers.
    fn tile_rect(level: &LevelDescriptor, key: TileKey) -> PixelRect {
        PixelRect::new(
            key.x as u64 * level.tile_width as u64,
            key.y as u64 * level.tile_height as u64,
            level.tile_width,
            level.tile_height,
        )
    }

    /// Output-space rectangle of the tile's overlap with the window.
    pub fn overlap(&self, level: &LevelDescriptor, key: TileKey) -> Option<PixelRect> {
        Self::tile_rect(level, key).intersect(&self.window).map(|r| {
            PixelRect::new(r.x - self.window.x, r.y - self.window.y, r.width, r.height)
        })
    }

    pub fn place(&mut self, level: &LevelDescriptor, key: TileKey, tile: &PixelBuffer) {
        let origin = Self::tile_rect(level, key);
        let Some(overlap) = origin.intersect(&self.window) else {
            return;
        };
        let bpp = self.out.layout().bytes_per_pixel();
        let src_col = (overlap.x - origin.x) as usize * bpp;
        let dst_col = (overlap.x - self.window.x) as usize * bpp;
        let len = overlap.width as usize * bpp;
        let out_row_bytes = self.out.row_bytes();

        for r in 0..overlap.height as u64 {
            let src_row = (overlap.y + r - origin.y) as u32;
            let dst_row = (overlap.y + r - self.window.y) as usize;
            let src = &tile.row(src_row)[src_col..src_col + len];
            let start = dst_row * out_row_bytes + dst_col;
            self.out.data_mut()[start..start + len].copy_from_slice(src);
        }
        self.pixels_written += overlap.width as u64 * overlap.height as u64;
    }

    pub fn pixels_written(&self) -> u64 {
        self.pixels_written
    }

    pub fn finish(self) -> PixelBuffer {
        self.out
    }
}

fn validate(level: &LevelDescriptor, rect: &PixelRect) -> Result<(), StoreError> {
    if rect.is_empty() || rect.right() > level.width || rect.bottom() > level.height {
        return Err(StoreError::RegionOutOfRange(format!(
            "{} on level {} ({}x{})",
            rect, level.index, level.width, level.height
        )));
    }
    Ok(())
}

impl RasterHandle {
    /// Reads an arbitrary pixel rectangle of one level.
    pub async fn read_region(&self, level: u32, rect: PixelRect) -> Result<RegionRead, StoreError> {
        self.read_region_with_priority(level, rect, RequestPriority::High)
            .await
    }

    pub async fn read_region_with_priority(
        &self,
        level: u32,
        rect: PixelRect,
        priority: RequestPriority,
    ) -> Result<RegionRead, StoreError> {
        let descriptor = self.level(level)?;
        validate(descriptor, &rect)?;
        let (xs, ys) = rect.tile_span(descriptor);
        let tiles = xs.clone().count() * ys.clone().count();

        if tiles <= self.options().stream_threshold_tiles {
            let strip = self.read_window(level, rect, priority).await?;
            return Ok(RegionRead {
                rect,
                pixels: strip.pixels,
                holes: strip.holes,
                tiles_read: strip.tiles_read,
            });
        }

        debug!(level, %rect, tiles, "Reading large region strip by strip");
        let mut out = PixelBuffer::zeroed(rect.width, rect.height, descriptor.layout);
        let mut holes = Vec::new();
        let mut tiles_read = 0;
        let mut strips = self.strips(level, rect, priority);
        while let Some(strip) = strips.next().await {
            let strip = strip?;
            let rb = out.row_bytes();
            let start = strip.row_offset as usize * rb;
            let len = strip.pixels.data().len();
            out.data_mut()[start..start + len].copy_from_slice(strip.pixels.data());
            holes.extend(strip.holes);
            tiles_read += strip.tiles_read;
        }

        Ok(RegionRead {
            rect,
            pixels: out,
            holes,
            tiles_read,
        })
    }

    /// Streams a region as full-width strips, one row of tiles each.
    pub fn region_strips(
        &self,
        level: u32,
        rect: PixelRect,
    ) -> Result<BoxStream<'static, Result<RegionStrip, StoreError>>, StoreError> {
        validate(self.level(level)?, &rect)?;
        Ok(self.strips(level, rect, RequestPriority::High))
    }

    fn strips(
        &self,
        level: u32,
        rect: PixelRect,
        priority: RequestPriority,
    ) -> BoxStream<'static, Result<RegionStrip, StoreError>> {
        let handle = self.clone();
        let bands: Vec<PixelRect> = match self.level(level) {
            Ok(descriptor) => {
                let th = descriptor.tile_height as u64;
                rect.tile_span(descriptor)
                    .1
                    .filter_map(|ty| {
                        let band = PixelRect::new(rect.x, ty as u64 * th, rect.width, th as u32);
                        band.intersect(&rect)
                    })
                    .collect()
            }
            Err(_) => Vec::new(),
        };

        stream::iter(bands)
            .then(move |band| {
                let handle = handle.clone();
                async move {
                    let mut strip = handle.read_window(level, band, priority).await?;
                    strip.row_offset = (band.y - rect.y) as u32;
                    for hole in &mut strip.holes {
                        hole.rect.y += strip.row_offset as u64;
                    }
                    Ok(strip)
                }
            })
            .boxed()
    }

    /// Reads and composites one window with bounded concurrency.
    async fn read_window(
        &self,
        level: u32,
        window: PixelRect,
        priority: RequestPriority,
    ) -> Result<RegionStrip, StoreError> {
        let descriptor = self.level(level)?;
        let (xs, ys) = window.tile_span(descriptor);
        let keys: Vec<TileKey> = ys
            .flat_map(|y| xs.clone().map(move |x| TileKey::new(level, x, y)))
            .collect();

        let mut compositor = Compositor::new(window, descriptor);
        let mut holes = Vec::new();
        let mut tiles_read = 0;

        let mut results = stream::iter(keys)
            .map(|key| {
                let handle = self.clone();
                async move { (key, handle.read_tile_with_priority(key, priority).await) }
            })
            .buffer_unordered(self.options().region_concurrency);

        while let Some((key, result)) = results.next().await {
            match result {
                Ok(tile) => {
                    compositor.place(descriptor, key, &tile.pixels);
                    tiles_read += 1;
                }
                Err(e) if e.is_tile_scoped() => {
                    warn!(tile = %key, error = %e, "Region tile left as hole");
                    if let Some(rect) = compositor.overlap(descriptor, key) {
                        holes.push(RegionHole { key, rect, error: e });
                    }
                }
                Err(e) => return Err(e),
            }
        }
        holes.sort_by_key(|h| h.key);

        Ok(RegionStrip {
            row_offset: 0,
            pixels: compositor.finish(),
            holes,
            tiles_read,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::format::Compression;
    use crate::store::handle::StoreOptions;
    use crate::store::source::MemorySource;
    use crate::store::tile::PixelLayout;
    use crate::store::writer::{LevelSpec, RasterWriter};
    use std::sync::Arc;

    fn numbered(width: u32, height: u32) -> PixelBuffer {
        let mut buf = PixelBuffer::zeroed(width, height, PixelLayout::gray8());
        for y in 0..height {
            for x in 0..width {
                buf.set_sample(x, y, 0, ((x * 7 + y * 13) % 251) as f64);
            }
        }
        buf
    }

    async fn open(image: &PixelBuffer, tile: u32, options: StoreOptions) -> RasterHandle {
        let spec = LevelSpec::from_image(image, tile, tile, Compression::Deflate, None).unwrap();
        let written = RasterWriter::default().build(&[spec]).unwrap();
        RasterHandle::open(Arc::new(MemorySource::new("region", written.bytes)), options)
            .await
            .unwrap()
    }

    #[test]
    fn test_intersect() {
        let a = PixelRect::new(0, 0, 10, 10);
        assert_eq!(a.intersect(&PixelRect::new(5, 8, 10, 10)), Some(PixelRect::new(5, 8, 5, 2)));
        // Touching edges do not overlap.
        assert!(a.intersect(&PixelRect::new(10, 0, 4, 4)).is_none());
    }

    #[tokio::test]
    async fn test_region_matches_source_pixels() {
        let image = numbered(100, 90);
        let handle = open(&image, 32, StoreOptions::default()).await;
        let rect = PixelRect::new(17, 29, 60, 50);

        let region = handle.read_region(0, rect).await.unwrap();
        assert!(region.is_complete());
        assert_eq!(region.tiles_read, 9);
        for y in 0..rect.height {
            for x in 0..rect.width {
                assert_eq!(
                    region.pixels.sample(x, y, 0),
                    image.sample(x + 17, y + 29, 0),
                    "pixel ({}, {})",
                    x,
                    y
                );
            }
        }
    }

    #[tokio::test]
    async fn test_streamed_region_equals_direct_read() {
        let image = numbered(128, 128);
        let direct = open(&image, 16, StoreOptions::default()).await;
        let streamed = open(&image, 16, StoreOptions::default().with_stream_threshold(4)).await;
        let rect = PixelRect::new(5, 3, 120, 120);

        let a = direct.read_region(0, rect).await.unwrap();
        let b = streamed.read_region(0, rect).await.unwrap();
        assert_eq!(a.pixels, b.pixels);
        assert_eq!(a.tiles_read, b.tiles_read);
    }

    #[tokio::test]
    async fn test_region_strips_cover_rect_once() {
        let image = numbered(64, 64);
        let handle = open(&image, 16, StoreOptions::default()).await;
        let rect = PixelRect::new(0, 10, 64, 40);

        let mut strips = handle.region_strips(0, rect).unwrap();
        let mut rows = 0;
        while let Some(strip) = strips.next().await {
            let strip = strip.unwrap();
            assert_eq!(strip.row_offset, rows);
            rows += strip.pixels.height();
        }
        assert_eq!(rows, 40);
    }

    #[tokio::test]
    async fn test_region_out_of_bounds_is_fatal() {
        let handle = open(&numbered(64, 64), 16, StoreOptions::default()).await;
        assert!(matches!(
            handle.read_region(0, PixelRect::new(60, 0, 8, 8)).await,
            Err(StoreError::RegionOutOfRange(_))
        ));
        assert!(matches!(
            handle.read_region(0, PixelRect::new(0, 0, 0, 8)).await,
            Err(StoreError::RegionOutOfRange(_))
        ));
    }

    #[test]
    fn test_compositor_counts_each_pixel_once() {
        let spec = LevelSpec::from_image(&numbered(64, 64), 32, 32, Compression::None, None).unwrap();
        let template = spec.template.clone();
        let level = LevelDescriptor {
            index: 0,
            width: template.width,
            height: template.height,
            tile_width: 32,
            tile_height: 32,
            layout: template.layout,
            compression: template.compression,
            predictor: template.predictor,
            geo_transform: crate::transform::GeoTransform::identity(),
            crs: 0,
            tile_offsets: vec![0; 4],
            tile_byte_counts: vec![0; 4],
            jpeg_tables: None,
            ifd_offset: 0,
            next_pointer_pos: 0,
        };
        let window = PixelRect::new(10, 10, 40, 40);
        let mut c = Compositor::new(window, &level);
        let tile = PixelBuffer::zeroed(32, 32, PixelLayout::gray8());
        for y in 0..2 {
            for x in 0..2 {
                c.place(&level, TileKey::new(0, x, y), &tile);
            }
        }
        assert_eq!(c.pixels_written(), 40 * 40);
    }
}
