//! Tiled raster store.
//!
//! Random, tile-addressable access into TIFF-structured containers that may
//! be far larger than memory, read from local files or over HTTP range
//! requests.
//!
//! # Example
//!
//! ```ignore
//! use geolayer::store::{PixelRect, RasterHandle, StoreOptions};
//!
//! let handle = RasterHandle::open_location("ortho.tif", StoreOptions::default(), &Default::default()).await?;
//! let tile = handle.read_tile(0, 3, 7).await?;
//! let region = handle.read_region(1, PixelRect::new(0, 0, 1024, 1024)).await?;
//! for hole in &region.holes {
//!     tracing::warn!(tile = %hole.key, "missing");
//! }
//! ```

mod codec;
mod coalesce;
mod error;
mod format;
mod handle;
mod http;
mod region;
mod source;
mod tile;
mod writer;

pub use codec::{decode_tile, encode_tile, DEFLATE_LEVEL, JPEG_QUALITY};
pub use coalesce::{CoalesceResult, RequestCoalescer};
pub use error::StoreError;
pub use format::{
    parse_container, parse_header, ByteOrder, Compression, ContainerInfo, ContainerVariant,
    LevelDescriptor, Predictor, MAX_LEVELS,
};
pub use handle::{
    IoStats, IoStatsSnapshot, RasterHandle, StoreOptions, TileReader, DEFAULT_DECODE_RETRIES,
    DEFAULT_REGION_CONCURRENCY, DEFAULT_STREAM_THRESHOLD_TILES,
};
pub use http::{HttpRangeSource, HttpSourceConfig, DEFAULT_MAX_ATTEMPTS, DEFAULT_TIMEOUT_SECS};
pub use region::{Compositor, PixelRect, RegionHole, RegionRead, RegionStrip};
pub use source::{open_source, FileSource, MemorySource, RangeSource};
pub use tile::{PixelBuffer, PixelLayout, SampleFormat, Tile, TileAddress, TileKey};
pub use writer::{
    FileLevelAppender, Georeference, LevelSink, LevelSpec, LevelTemplate, MemoryLevelSink,
    ModelType, RasterWriter, WrittenContainer,
};
