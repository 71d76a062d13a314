//! Integration tests for the tiled raster store.
//!
//! Run with: `cargo test --test store_integration`

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::{join_all, BoxFuture};

use geolayer::store::{
    Compression, LevelSpec, MemorySource, PixelBuffer, PixelLayout, PixelRect, RangeSource,
    RasterHandle, RasterWriter, StoreError, StoreOptions, TileKey,
};

// ============================================================================
// Helper Functions
// ============================================================================

fn blank_level(size: u32, tile: u32) -> LevelSpec {
    LevelSpec::from_image(
        &PixelBuffer::zeroed(size, size, PixelLayout::gray8()),
        tile,
        tile,
        Compression::Deflate,
        None,
    )
    .unwrap()
}

async fn open(bytes: Vec<u8>) -> Result<RasterHandle, StoreError> {
    let source = Arc::new(MemorySource::new("integration", bytes));
    RasterHandle::open(source, StoreOptions::default()).await
}

/// A source whose reads take a while, so concurrent callers overlap.
#[derive(Debug)]
struct SlowSource {
    inner: MemorySource,
    delay: Duration,
}

impl RangeSource for SlowSource {
    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn read_range(&self, offset: u64, length: u64) -> BoxFuture<'_, Result<Bytes, StoreError>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            self.inner.read_range(offset, length).await
        })
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}

fn put_u32_le(bytes: &mut [u8], pos: usize, value: u32) {
    bytes[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
}

// ============================================================================
// Integration Tests
// ============================================================================

/// Two levels of 512 px tiles; a 1024² region at level 0 touches exactly
/// four tiles.
#[tokio::test]
async fn test_region_reads_exactly_covering_tiles() {
    let written = RasterWriter::default()
        .build(&[blank_level(4096, 512), blank_level(2048, 512)])
        .unwrap();
    let handle = open(written.bytes).await.unwrap();
    assert_eq!(handle.level_count(), 2);
    assert_eq!(handle.level(1).unwrap().width, 2048);

    let region = handle
        .read_region(0, PixelRect::new(0, 0, 1024, 1024))
        .await
        .unwrap();

    assert_eq!(region.tiles_read, 4);
    assert!(region.holes.is_empty());
    assert_eq!(handle.io_stats().tile_reads, 4);
    assert_eq!((region.pixels.width(), region.pixels.height()), (1024, 1024));
}

/// A corrupt tile inside a 3×3 region becomes one hole; the other eight
/// tiles are composited.
#[tokio::test]
async fn test_corrupt_tile_becomes_single_hole() {
    let mut image = PixelBuffer::zeroed(256, 256, PixelLayout::gray8());
    for y in 0..256 {
        for x in 0..256 {
            image.set_sample(x, y, 0, 200.0);
        }
    }
    let mut level2 =
        LevelSpec::from_image(&image, 32, 32, Compression::Deflate, None).unwrap();
    level2.set_raw_tile(5, 7, vec![0xde, 0xad, 0xbe, 0xef]);

    let written = RasterWriter::default()
        .build(&[blank_level(1024, 32), blank_level(512, 32), level2])
        .unwrap();
    let handle = open(written.bytes).await.unwrap();

    let region = handle
        .read_region(2, PixelRect::new(128, 160, 96, 96))
        .await
        .unwrap();

    assert_eq!(region.tiles_read, 8);
    assert_eq!(region.holes.len(), 1);
    let hole = &region.holes[0];
    assert_eq!(hole.key, TileKey::new(2, 5, 7));
    assert!(matches!(hole.error, StoreError::Decode { .. }));

    // Tile (5, 7) covers region pixels x 32..64, y 64..96.
    assert_eq!(hole.rect, PixelRect::new(32, 64, 32, 32));
    assert_eq!(region.pixels.sample(40, 70, 0), 0.0);
    assert_eq!(region.pixels.sample(10, 10, 0), 200.0);
    assert_eq!(region.pixels.sample(90, 90, 0), 200.0);
}

/// Concurrent reads of one tile share a single physical read.
#[tokio::test]
async fn test_concurrent_reads_coalesce() {
    let written = RasterWriter::default()
        .build(&[blank_level(256, 64)])
        .unwrap();
    let source = Arc::new(SlowSource {
        inner: MemorySource::new("slow", written.bytes),
        delay: Duration::from_millis(20),
    });
    let handle = RasterHandle::open(source, StoreOptions::default()).await.unwrap();

    let reads = (0..16).map(|_| handle.read_tile(0, 1, 2));
    let results = join_all(reads).await;

    assert!(results.iter().all(|r| r.is_ok()));
    let first = results[0].as_ref().unwrap();
    assert!(results
        .iter()
        .all(|r| Arc::ptr_eq(r.as_ref().unwrap(), first)));

    let stats = handle.io_stats();
    assert_eq!(stats.tile_reads, 1);
    assert_eq!(stats.coalesced_reads, 15);
}

/// A level chain that points back at an earlier level fails at open.
#[tokio::test]
async fn test_level_chain_cycle_is_index_error() {
    let written = RasterWriter::default()
        .build(&[blank_level(128, 32), blank_level(64, 32)])
        .unwrap();
    let mut bytes = written.bytes.clone();
    put_u32_le(
        &mut bytes,
        written.next_pointer_positions[1] as usize,
        written.ifd_offsets[0] as u32,
    );

    let err = open(bytes).await.unwrap_err();
    assert!(matches!(err, StoreError::Index(_)), "got {err:?}");
}

/// Tile tables shorter than the tile grid fail at open.
#[tokio::test]
async fn test_tile_count_mismatch_is_index_error() {
    let written = RasterWriter::default()
        .build(&[blank_level(128, 32)])
        .unwrap();
    let mut bytes = written.bytes.clone();

    // Classic little-endian IFD: u16 entry count, then 12-byte entries.
    let ifd = written.ifd_offsets[0] as usize;
    let entries = u16::from_le_bytes([bytes[ifd], bytes[ifd + 1]]) as usize;
    let byte_counts = (0..entries)
        .map(|i| ifd + 2 + i * 12)
        .find(|&pos| u16::from_le_bytes([bytes[pos], bytes[pos + 1]]) == 325)
        .unwrap();
    let count = u32::from_le_bytes(bytes[byte_counts + 4..byte_counts + 8].try_into().unwrap());
    assert_eq!(count, 16);
    put_u32_le(&mut bytes, byte_counts + 4, count - 1);

    let err = open(bytes).await.unwrap_err();
    assert!(matches!(err, StoreError::Index(_)), "got {err:?}");
}

/// Reads past the tile grid are rejected without I/O.
#[tokio::test]
async fn test_out_of_range_tile() {
    let written = RasterWriter::default()
        .build(&[blank_level(128, 32)])
        .unwrap();
    let handle = open(written.bytes).await.unwrap();

    let err = handle.read_tile(0, 4, 0).await.unwrap_err();
    assert!(matches!(err, StoreError::TileOutOfRange { .. }));
    assert_eq!(handle.io_stats().tile_reads, 0);
}
