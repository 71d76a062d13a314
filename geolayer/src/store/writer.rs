//! Container writing.
//!
//! [`RasterWriter`] serialises a full container in memory. Levels built
//! later by the pyramid builder are written through a [`LevelSink`]:
//! [`FileLevelAppender`] appends tiles and a new IFD to an existing local
//! file and links it into the chain; [`MemoryLevelSink`] keeps the encoded
//! tiles in memory.
//!
//! Every IFD is laid out as:
//!
//! ```text
//! <entry count> <entries sorted by tag> <next IFD pointer> <out-of-line values>
//! ```

use std::collections::BTreeMap;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::codec::encode_tile;
use super::format::{
    field_type, parse_container, tags, ByteOrder, Compression, ContainerVariant,
    LevelDescriptor, Predictor,
};
use super::source::FileSource;
use super::tile::{PixelBuffer, PixelLayout};
use super::StoreError;
use crate::transform::GeoTransform;

// =============================================================================
// Level description
// =============================================================================

/// How a CRS code is recorded in the geo key directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    Projected,
    Geographic,
}

/// Georeferencing written with a level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Georeference {
    pub transform: GeoTransform,
    pub crs: u32,
    pub model: ModelType,
}

impl Georeference {
    pub fn projected(transform: GeoTransform, crs: u32) -> Self {
        Self {
            transform,
            crs,
            model: ModelType::Projected,
        }
    }

    pub fn geographic(transform: GeoTransform, crs: u32) -> Self {
        Self {
            transform,
            crs,
            model: ModelType::Geographic,
        }
    }
}

/// Everything about a level except its tile payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelTemplate {
    pub width: u64,
    pub height: u64,
    pub tile_width: u32,
    pub tile_height: u32,
    pub layout: PixelLayout,
    pub compression: Compression,
    pub predictor: Predictor,
    pub geo: Option<Georeference>,
}

impl LevelTemplate {
    /// A level of `width` x `height` encoded like `source`. Georeferencing
    /// is left to inheritance from the finest level.
    pub fn like(source: &LevelDescriptor, width: u64, height: u64) -> Self {
        Self {
            width,
            height,
            tile_width: source.tile_width,
            tile_height: source.tile_height,
            layout: source.layout,
            compression: source.compression,
            predictor: source.predictor,
            geo: None,
        }
    }

    pub fn tiles_across(&self) -> u32 {
        self.width.div_ceil(self.tile_width as u64) as u32
    }

    pub fn tiles_down(&self) -> u32 {
        self.height.div_ceil(self.tile_height as u64) as u32
    }

    pub fn tile_count(&self) -> usize {
        self.tiles_across() as usize * self.tiles_down() as usize
    }

    fn descriptor(
        &self,
        index: u32,
        tile_offsets: Vec<u64>,
        tile_byte_counts: Vec<u64>,
        ifd_offset: u64,
        next_pointer_pos: u64,
    ) -> LevelDescriptor {
        LevelDescriptor {
            index,
            width: self.width,
            height: self.height,
            tile_width: self.tile_width,
            tile_height: self.tile_height,
            layout: self.layout,
            compression: self.compression,
            predictor: self.predictor,
            geo_transform: self
                .geo
                .map(|g| g.transform)
                .unwrap_or_else(GeoTransform::identity),
            crs: self.geo.map(|g| g.crs).unwrap_or(0),
            tile_offsets,
            tile_byte_counts,
            jpeg_tables: None,
            ifd_offset,
            next_pointer_pos,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TilePayload {
    Pixels(PixelBuffer),
    /// Stored verbatim; empty means sparse.
    Raw(Vec<u8>),
}

/// A level ready to be serialised by [`RasterWriter`].
#[derive(Debug, Clone, PartialEq)]
pub struct LevelSpec {
    pub template: LevelTemplate,
    tiles: Vec<TilePayload>,
}

impl LevelSpec {
    /// Cuts `image` into tiles, zero-padding the right and bottom edges.
    pub fn from_image(
        image: &PixelBuffer,
        tile_width: u32,
        tile_height: u32,
        compression: Compression,
        geo: Option<Georeference>,
    ) -> Result<Self, StoreError> {
        if tile_width == 0 || tile_height == 0 {
            return Err(StoreError::Format("tile size must be non-zero".to_string()));
        }
        let template = LevelTemplate {
            width: image.width() as u64,
            height: image.height() as u64,
            tile_width,
            tile_height,
            layout: image.layout(),
            compression,
            predictor: Predictor::None,
            geo,
        };

        let bpp = image.layout().bytes_per_pixel();
        let mut tiles = Vec::with_capacity(template.tile_count());
        for ty in 0..template.tiles_down() {
            for tx in 0..template.tiles_across() {
                let mut tile = PixelBuffer::zeroed(tile_width, tile_height, image.layout());
                let x0 = tx * tile_width;
                let y0 = ty * tile_height;
                let cols = tile_width.min(image.width() - x0) as usize;
                let rows = tile_height.min(image.height() - y0);
                let tile_row_bytes = tile.row_bytes();
                for r in 0..rows {
                    let src = &image.row(y0 + r)[x0 as usize * bpp..(x0 as usize + cols) * bpp];
                    let start = r as usize * tile_row_bytes;
                    tile.data_mut()[start..start + src.len()].copy_from_slice(src);
                }
                tiles.push(TilePayload::Pixels(tile));
            }
        }
        Ok(Self { template, tiles })
    }

    pub fn with_predictor(mut self, predictor: Predictor) -> Self {
        self.template.predictor = predictor;
        self
    }

    /// Replaces the stored payload of tile (x, y). An empty payload makes
    /// the tile sparse.
    pub fn set_raw_tile(&mut self, x: u32, y: u32, payload: Vec<u8>) {
        let across = self.template.tiles_across();
        if x < across && y < self.template.tiles_down() {
            self.tiles[(y * across + x) as usize] = TilePayload::Raw(payload);
        }
    }
}

// =============================================================================
// IFD encoding
// =============================================================================

#[derive(Debug, Clone)]
enum Value {
    Shorts(Vec<u16>),
    Longs(Vec<u32>),
    Long8s(Vec<u64>),
    Doubles(Vec<f64>),
}

impl Value {
    fn field_type(&self) -> u16 {
        match self {
            Value::Shorts(_) => field_type::SHORT,
            Value::Longs(_) => field_type::LONG,
            Value::Long8s(_) => field_type::LONG8,
            Value::Doubles(_) => field_type::DOUBLE,
        }
    }

    fn count(&self) -> u64 {
        match self {
            Value::Shorts(v) => v.len() as u64,
            Value::Longs(v) => v.len() as u64,
            Value::Long8s(v) => v.len() as u64,
            Value::Doubles(v) => v.len() as u64,
        }
    }

    fn to_bytes(&self, order: ByteOrder) -> Vec<u8> {
        match self {
            Value::Shorts(v) => v.iter().flat_map(|x| order.put_u16(*x)).collect(),
            Value::Longs(v) => v.iter().flat_map(|x| order.put_u32(*x)).collect(),
            Value::Long8s(v) => v.iter().flat_map(|x| order.put_u64(*x)).collect(),
            Value::Doubles(v) => v.iter().flat_map(|x| order.put_u64(x.to_bits())).collect(),
        }
    }
}

/// Integers as LONG when they fit, otherwise LONG8 (64-bit containers only).
fn uint_value(values: &[u64], variant: ContainerVariant) -> Result<Value, StoreError> {
    if values.iter().all(|v| *v <= u32::MAX as u64) {
        Ok(Value::Longs(values.iter().map(|v| *v as u32).collect()))
    } else if variant == ContainerVariant::Big {
        Ok(Value::Long8s(values.to_vec()))
    } else {
        Err(StoreError::Format(
            "value exceeds the classic container's 4 GiB limit".to_string(),
        ))
    }
}

fn level_entries(
    template: &LevelTemplate,
    offsets: &[u64],
    counts: &[u64],
    variant: ContainerVariant,
) -> Result<Vec<(u16, Value)>, StoreError> {
    let spp = template.layout.samples_per_pixel;
    let format = template.layout.sample_format;
    let mut entries = vec![
        (tags::IMAGE_WIDTH, uint_value(&[template.width], variant)?),
        (tags::IMAGE_LENGTH, uint_value(&[template.height], variant)?),
        (tags::BITS_PER_SAMPLE, Value::Shorts(vec![format.bits(); spp as usize])),
        (tags::COMPRESSION, Value::Shorts(vec![template.compression.code()])),
        (
            tags::PHOTOMETRIC_INTERPRETATION,
            Value::Shorts(vec![if spp >= 3 { 2 } else { 1 }]),
        ),
        (tags::SAMPLES_PER_PIXEL, Value::Shorts(vec![spp])),
        (tags::PLANAR_CONFIGURATION, Value::Shorts(vec![1])),
        (tags::TILE_WIDTH, Value::Longs(vec![template.tile_width])),
        (tags::TILE_LENGTH, Value::Longs(vec![template.tile_height])),
        (tags::TILE_OFFSETS, uint_value(offsets, variant)?),
        (tags::TILE_BYTE_COUNTS, uint_value(counts, variant)?),
        (tags::SAMPLE_FORMAT, Value::Shorts(vec![format.format_code(); spp as usize])),
    ];
    if template.predictor == Predictor::Horizontal {
        entries.push((tags::PREDICTOR, Value::Shorts(vec![2])));
    }

    if let Some(geo) = template.geo {
        let t = geo.transform;
        if t.b == 0.0 && t.d == 0.0 {
            entries.push((tags::MODEL_PIXEL_SCALE, Value::Doubles(vec![t.a, -t.e, 0.0])));
            entries.push((
                tags::MODEL_TIEPOINT,
                Value::Doubles(vec![0.0, 0.0, 0.0, t.c, t.f, 0.0]),
            ));
        } else {
            entries.push((
                tags::MODEL_TRANSFORMATION,
                Value::Doubles(vec![
                    t.a, t.b, 0.0, t.c, t.d, t.e, 0.0, t.f, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0,
                ]),
            ));
        }
        let (model, crs_key) = match geo.model {
            ModelType::Projected => (1, tags::GEO_KEY_PROJECTED_TYPE),
            ModelType::Geographic => (2, tags::GEO_KEY_GEOGRAPHIC_TYPE),
        };
        let crs = u16::try_from(geo.crs).map_err(|_| {
            StoreError::Format(format!("CRS code {} does not fit a geo key", geo.crs))
        })?;
        entries.push((
            tags::GEO_KEY_DIRECTORY,
            Value::Shorts(vec![
                1, 1, 0, 2,
                tags::GEO_KEY_MODEL_TYPE, 0, 1, model,
                crs_key, 0, 1, crs,
            ]),
        ));
    }

    entries.sort_by_key(|(tag, _)| *tag);
    Ok(entries)
}

struct EncodedIfd {
    bytes: Vec<u8>,
    next_pointer_pos: u64,
}

/// Serialises an IFD whose first byte will sit at `at`.
fn encode_ifd(
    entries: &[(u16, Value)],
    at: u64,
    order: ByteOrder,
    variant: ContainerVariant,
) -> Result<EncodedIfd, StoreError> {
    let n = entries.len() as u64;
    let next_pointer_pos = at + variant.count_size() + n * variant.entry_size();
    let external_base = next_pointer_pos + variant.offset_size();

    let mut head = Vec::with_capacity((external_base - at) as usize);
    let mut external: Vec<u8> = Vec::new();
    match variant {
        ContainerVariant::Classic => head.extend_from_slice(&order.put_u16(n as u16)),
        ContainerVariant::Big => head.extend_from_slice(&order.put_u64(n)),
    }

    for (tag, value) in entries {
        let data = value.to_bytes(order);
        head.extend_from_slice(&order.put_u16(*tag));
        head.extend_from_slice(&order.put_u16(value.field_type()));
        match variant {
            ContainerVariant::Classic => {
                head.extend_from_slice(&order.put_u32(value.count() as u32))
            }
            ContainerVariant::Big => head.extend_from_slice(&order.put_u64(value.count())),
        }

        let slot = variant.offset_size() as usize;
        if data.len() <= slot {
            let mut inline = data;
            inline.resize(slot, 0);
            head.extend_from_slice(&inline);
        } else {
            if external.len() % 2 == 1 {
                external.push(0);
            }
            let offset = external_base + external.len() as u64;
            put_offset(&mut head, offset, order, variant)?;
            external.extend_from_slice(&data);
        }
    }
    put_offset(&mut head, 0, order, variant)?;

    head.extend_from_slice(&external);
    if (at + head.len() as u64) > variant.max_offset() {
        return Err(StoreError::Format(
            "IFD lies beyond the container's addressable range".to_string(),
        ));
    }
    Ok(EncodedIfd {
        bytes: head,
        next_pointer_pos,
    })
}

fn put_offset(
    out: &mut Vec<u8>,
    offset: u64,
    order: ByteOrder,
    variant: ContainerVariant,
) -> Result<(), StoreError> {
    if offset > variant.max_offset() {
        return Err(StoreError::Format(format!(
            "offset {} exceeds the classic container's 4 GiB limit",
            offset
        )));
    }
    match variant {
        ContainerVariant::Classic => out.extend_from_slice(&order.put_u32(offset as u32)),
        ContainerVariant::Big => out.extend_from_slice(&order.put_u64(offset)),
    }
    Ok(())
}

fn offset_bytes(offset: u64, order: ByteOrder, variant: ContainerVariant) -> Result<Vec<u8>, StoreError> {
    let mut out = Vec::with_capacity(8);
    put_offset(&mut out, offset, order, variant)?;
    Ok(out)
}

// =============================================================================
// Whole-container writer
// =============================================================================

/// A serialised container.
#[derive(Debug, Clone)]
pub struct WrittenContainer {
    pub bytes: Vec<u8>,
    pub ifd_offsets: Vec<u64>,
    /// Where each level's next-IFD pointer lives.
    pub next_pointer_positions: Vec<u64>,
}

/// Serialises levels into a complete container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterWriter {
    pub byte_order: ByteOrder,
    pub variant: ContainerVariant,
}

impl Default for RasterWriter {
    fn default() -> Self {
        Self::new(ByteOrder::Little, ContainerVariant::Classic)
    }
}

impl RasterWriter {
    pub fn new(byte_order: ByteOrder, variant: ContainerVariant) -> Self {
        Self { byte_order, variant }
    }

    fn header(&self) -> Vec<u8> {
        let order = self.byte_order;
        let mut out = match order {
            ByteOrder::Little => b"II".to_vec(),
            ByteOrder::Big => b"MM".to_vec(),
        };
        match self.variant {
            ContainerVariant::Classic => {
                out.extend_from_slice(&order.put_u16(42));
                out.extend_from_slice(&order.put_u32(0));
            }
            ContainerVariant::Big => {
                out.extend_from_slice(&order.put_u16(43));
                out.extend_from_slice(&order.put_u16(8));
                out.extend_from_slice(&order.put_u16(0));
                out.extend_from_slice(&order.put_u64(0));
            }
        }
        out
    }

    /// Serialises `levels`, finest first.
    pub fn build(&self, levels: &[LevelSpec]) -> Result<WrittenContainer, StoreError> {
        if levels.is_empty() {
            return Err(StoreError::Format("a container needs at least one level".to_string()));
        }
        let order = self.byte_order;
        let variant = self.variant;

        let mut out = self.header();
        let mut pointer_pos = variant.header_size() - variant.offset_size();
        let mut ifd_offsets = Vec::with_capacity(levels.len());
        let mut next_pointer_positions = Vec::with_capacity(levels.len());

        for level in levels {
            let template = &level.template;
            let mut offsets = Vec::with_capacity(level.tiles.len());
            let mut counts = Vec::with_capacity(level.tiles.len());
            for tile in &level.tiles {
                let payload = match tile {
                    TilePayload::Pixels(pixels) => {
                        encode_tile(template.compression, template.predictor, pixels, order)?
                    }
                    TilePayload::Raw(raw) => raw.clone(),
                };
                if payload.is_empty() {
                    offsets.push(0);
                    counts.push(0);
                } else {
                    offsets.push(out.len() as u64);
                    counts.push(payload.len() as u64);
                    out.extend_from_slice(&payload);
                }
            }
            if out.len() % 2 == 1 {
                out.push(0);
            }

            let ifd_offset = out.len() as u64;
            let entries = level_entries(template, &offsets, &counts, variant)?;
            let ifd = encode_ifd(&entries, ifd_offset, order, variant)?;
            out.extend_from_slice(&ifd.bytes);

            let link = offset_bytes(ifd_offset, order, variant)?;
            let p = pointer_pos as usize;
            out[p..p + link.len()].copy_from_slice(&link);
            pointer_pos = ifd.next_pointer_pos;

            ifd_offsets.push(ifd_offset);
            next_pointer_positions.push(ifd.next_pointer_pos);
        }

        Ok(WrittenContainer {
            bytes: out,
            ifd_offsets,
            next_pointer_positions,
        })
    }

    /// Serialises `levels` and writes them to `path`.
    pub async fn write_to(
        &self,
        path: impl AsRef<Path>,
        levels: &[LevelSpec],
    ) -> Result<WrittenContainer, StoreError> {
        let written = self.build(levels)?;
        tokio::fs::write(path.as_ref(), &written.bytes).await?;
        debug!(
            path = %path.as_ref().display(),
            bytes = written.bytes.len(),
            levels = levels.len(),
            "Wrote raster container"
        );
        Ok(written)
    }
}

// =============================================================================
// Level sinks
// =============================================================================

/// Destination for the tiles of one newly built level.
pub trait LevelSink: Send {
    /// Byte order payloads must be encoded in.
    fn byte_order(&self) -> ByteOrder;

    fn template(&self) -> &LevelTemplate;

    /// Index the level will have in its container.
    fn level_index(&self) -> u32;

    fn write_tile(&mut self, x: u32, y: u32, payload: Vec<u8>) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Completes the level and returns its descriptor.
    fn finish(&mut self) -> BoxFuture<'_, Result<LevelDescriptor, StoreError>>;
}

fn tile_slot(template: &LevelTemplate, x: u32, y: u32) -> Result<usize, StoreError> {
    if x >= template.tiles_across() || y >= template.tiles_down() {
        return Err(StoreError::TileOutOfRange {
            level: 0,
            x,
            y,
            tiles_across: template.tiles_across(),
            tiles_down: template.tiles_down(),
        });
    }
    Ok(y as usize * template.tiles_across() as usize + x as usize)
}

/// Keeps encoded tiles in memory.
#[derive(Debug)]
pub struct MemoryLevelSink {
    template: LevelTemplate,
    index: u32,
    byte_order: ByteOrder,
    tiles: BTreeMap<(u32, u32), Vec<u8>>,
}

impl MemoryLevelSink {
    pub fn new(template: LevelTemplate, index: u32, byte_order: ByteOrder) -> Self {
        Self {
            template,
            index,
            byte_order,
            tiles: BTreeMap::new(),
        }
    }

    /// Encoded payload of tile (x, y), if written.
    pub fn tile(&self, x: u32, y: u32) -> Option<&[u8]> {
        self.tiles.get(&(x, y)).map(|t| t.as_slice())
    }

    /// Payloads keyed by `(x, y)`.
    pub fn tiles(&self) -> &BTreeMap<(u32, u32), Vec<u8>> {
        &self.tiles
    }
}

impl LevelSink for MemoryLevelSink {
    fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    fn template(&self) -> &LevelTemplate {
        &self.template
    }

    fn level_index(&self) -> u32 {
        self.index
    }

    fn write_tile(&mut self, x: u32, y: u32, payload: Vec<u8>) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            tile_slot(&self.template, x, y)?;
            self.tiles.insert((x, y), payload);
            Ok(())
        })
    }

    fn finish(&mut self) -> BoxFuture<'_, Result<LevelDescriptor, StoreError>> {
        Box::pin(async move {
            let count = self.template.tile_count();
            let mut offsets = vec![0; count];
            let mut counts = vec![0; count];
            let mut cursor = 0u64;
            for ((x, y), payload) in &self.tiles {
                let slot = tile_slot(&self.template, *x, *y)?;
                if !payload.is_empty() {
                    offsets[slot] = cursor;
                    counts[slot] = payload.len() as u64;
                    cursor += payload.len() as u64;
                }
            }
            Ok(self.template.descriptor(self.index, offsets, counts, 0, 0))
        })
    }
}

/// Appends one level to an existing local container.
///
/// Tiles are appended at the end of the file as they arrive; `finish`
/// writes the IFD and patches the previous last level's next pointer.
pub struct FileLevelAppender {
    path: PathBuf,
    file: Arc<Mutex<std::fs::File>>,
    template: LevelTemplate,
    index: u32,
    byte_order: ByteOrder,
    variant: ContainerVariant,
    link_pos: u64,
    end: u64,
    offsets: Vec<u64>,
    counts: Vec<u64>,
}

impl std::fmt::Debug for FileLevelAppender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLevelAppender")
            .field("path", &self.path)
            .field("index", &self.index)
            .field("end", &self.end)
            .finish()
    }
}

impl FileLevelAppender {
    /// Opens `path` and prepares to append a level described by `template`.
    pub async fn open(path: impl AsRef<Path>, template: LevelTemplate) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let source = FileSource::open(&path).await?;
        let (info, levels) = parse_container(&source).await?;
        drop(source);

        let last = levels
            .last()
            .ok_or_else(|| StoreError::Index("container has no levels".to_string()))?;
        debug!(
            path = %path.display(),
            last_level = last.index,
            last_ifd = last.ifd_offset,
            "Appending level after last IFD"
        );

        let opened = path.clone();
        let (file, end) = tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new().read(true).write(true).open(&opened)?;
            let end = file.metadata()?.len();
            Ok::<_, std::io::Error>((file, end))
        })
        .await
        .map_err(|e| StoreError::Io(format!("open task failed: {}", e)))??;

        let count = template.tile_count();
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
            index: last.index + 1,
            byte_order: info.byte_order,
            variant: info.variant,
            link_pos: last.next_pointer_pos,
            end,
            offsets: vec![0; count],
            counts: vec![0; count],
            template,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_at(&self, offset: u64, bytes: Vec<u8>) -> Result<(), StoreError> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || {
            let mut guard = file.lock();
            guard.seek(SeekFrom::Start(offset))?;
            guard.write_all(&bytes)?;
            Ok::<_, std::io::Error>(())
        })
        .await
        .map_err(|e| StoreError::Io(format!("write task failed: {}", e)))?
        .map_err(StoreError::from)
    }
}

impl LevelSink for FileLevelAppender {
    fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    fn template(&self) -> &LevelTemplate {
        &self.template
    }

    fn level_index(&self) -> u32 {
        self.index
    }

    fn write_tile(&mut self, x: u32, y: u32, payload: Vec<u8>) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let slot = tile_slot(&self.template, x, y)?;
            if payload.is_empty() {
                return Ok(());
            }
            let offset = self.end + self.end % 2;
            let len = payload.len() as u64;
            if offset + len > self.variant.max_offset() {
                return Err(StoreError::Format(
                    "appending would exceed the classic container's 4 GiB limit".to_string(),
                ));
            }
            let mut bytes = Vec::with_capacity(payload.len() + 1);
            if offset != self.end {
                bytes.push(0);
            }
            bytes.extend_from_slice(&payload);
            self.write_at(self.end, bytes).await?;

            self.offsets[slot] = offset;
            self.counts[slot] = len;
            self.end = offset + len;
            Ok(())
        })
    }

    fn finish(&mut self) -> BoxFuture<'_, Result<LevelDescriptor, StoreError>> {
        Box::pin(async move {
            let ifd_offset = self.end + self.end % 2;
            let entries = level_entries(&self.template, &self.offsets, &self.counts, self.variant)?;
            let ifd = encode_ifd(&entries, ifd_offset, self.byte_order, self.variant)?;

            let mut bytes = Vec::with_capacity(ifd.bytes.len() + 1);
            if ifd_offset != self.end {
                bytes.push(0);
            }
            bytes.extend_from_slice(&ifd.bytes);
            self.write_at(self.end, bytes).await?;

            // Linking last keeps the chain valid if anything above failed.
            let link = offset_bytes(ifd_offset, self.byte_order, self.variant)?;
            self.write_at(self.link_pos, link).await?;

            let file = Arc::clone(&self.file);
            tokio::task::spawn_blocking(move || file.lock().sync_all())
                .await
                .map_err(|e| StoreError::Io(format!("sync task failed: {}", e)))??;

            self.end = ifd_offset + ifd.bytes.len() as u64;
            let previous_link = self.link_pos;
            self.link_pos = ifd.next_pointer_pos;
            info!(
                path = %self.path.display(),
                level = self.index,
                width = self.template.width,
                height = self.template.height,
                ifd_offset,
                previous_link,
                "Appended pyramid level"
            );

            Ok(self.template.descriptor(
                self.index,
                self.offsets.clone(),
                self.counts.clone(),
                ifd_offset,
                ifd.next_pointer_pos,
            ))
        })
    }
}
