//! Container header and level index parsing.
//!
//! The container is TIFF-structured. A header selects byte order and offset
//! width (classic 32-bit or 64-bit), then a chain of image file directories
//! (IFDs) describes the levels from finest to coarsest.
//!
//! ```text
//! classic:  "II" 42 <u32 first IFD>        entry = tag u16, type u16, count u32, value u32
//! 64-bit:   "II" 43 8 0 <u64 first IFD>    entry = tag u16, type u16, count u64, value u64
//! ```

use std::collections::HashSet;

use bytes::Bytes;
use tracing::{debug, warn};

use super::source::RangeSource;
use super::tile::{PixelLayout, SampleFormat, TileKey};
use super::StoreError;
use crate::transform::GeoTransform;

/// Hard cap on the number of levels in one container.
pub const MAX_LEVELS: usize = 256;

// =============================================================================
// Tags
// =============================================================================

pub(crate) mod tags {
    pub const IMAGE_WIDTH: u16 = 256;
    pub const IMAGE_LENGTH: u16 = 257;
    pub const BITS_PER_SAMPLE: u16 = 258;
    pub const COMPRESSION: u16 = 259;
    pub const PHOTOMETRIC_INTERPRETATION: u16 = 262;
    pub const SAMPLES_PER_PIXEL: u16 = 277;
    pub const PLANAR_CONFIGURATION: u16 = 284;
    pub const PREDICTOR: u16 = 317;
    pub const TILE_WIDTH: u16 = 322;
    pub const TILE_LENGTH: u16 = 323;
    pub const TILE_OFFSETS: u16 = 324;
    pub const TILE_BYTE_COUNTS: u16 = 325;
    pub const SAMPLE_FORMAT: u16 = 339;
    pub const JPEG_TABLES: u16 = 347;
    pub const MODEL_PIXEL_SCALE: u16 = 33550;
    pub const MODEL_TIEPOINT: u16 = 33922;
    pub const MODEL_TRANSFORMATION: u16 = 34264;
    pub const GEO_KEY_DIRECTORY: u16 = 34735;

    pub const GEO_KEY_MODEL_TYPE: u16 = 1024;
    pub const GEO_KEY_GEOGRAPHIC_TYPE: u16 = 2048;
    pub const GEO_KEY_PROJECTED_TYPE: u16 = 3072;
}

/// Field type codes.
pub(crate) mod field_type {
    pub const BYTE: u16 = 1;
    pub const SHORT: u16 = 3;
    pub const LONG: u16 = 4;
    pub const UNDEFINED: u16 = 7;
    pub const FLOAT: u16 = 11;
    pub const DOUBLE: u16 = 12;
    pub const IFD: u16 = 13;
    pub const LONG8: u16 = 16;
    pub const IFD8: u16 = 18;

    /// Size in bytes of one value, or `None` for unknown types.
    pub fn size(t: u16) -> Option<u64> {
        match t {
            1 | 2 | 6 | 7 => Some(1),
            3 | 8 => Some(2),
            4 | 9 | 11 | 13 => Some(4),
            5 | 10 | 12 | 16 | 17 | 18 => Some(8),
            _ => None,
        }
    }
}

// =============================================================================
// Header
// =============================================================================

/// Byte order of every multi-byte value in the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn u16(&self, b: &[u8]) -> u16 {
        let a = [b[0], b[1]];
        match self {
            ByteOrder::Little => u16::from_le_bytes(a),
            ByteOrder::Big => u16::from_be_bytes(a),
        }
    }

    pub fn u32(&self, b: &[u8]) -> u32 {
        let a = [b[0], b[1], b[2], b[3]];
        match self {
            ByteOrder::Little => u32::from_le_bytes(a),
            ByteOrder::Big => u32::from_be_bytes(a),
        }
    }

    pub fn u64(&self, b: &[u8]) -> u64 {
        let mut a = [0u8; 8];
        a.copy_from_slice(&b[..8]);
        match self {
            ByteOrder::Little => u64::from_le_bytes(a),
            ByteOrder::Big => u64::from_be_bytes(a),
        }
    }

    pub fn f32(&self, b: &[u8]) -> f32 {
        f32::from_bits(self.u32(b))
    }

    pub fn f64(&self, b: &[u8]) -> f64 {
        f64::from_bits(self.u64(b))
    }

    pub fn put_u16(&self, v: u16) -> [u8; 2] {
        match self {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        }
    }

    pub fn put_u32(&self, v: u32) -> [u8; 4] {
        match self {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        }
    }

    pub fn put_u64(&self, v: u64) -> [u8; 8] {
        match self {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        }
    }
}

/// Offset width of the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerVariant {
    /// Version 42, 4-byte offsets.
    Classic,
    /// Version 43, 8-byte offsets.
    Big,
}

impl ContainerVariant {
    pub fn offset_size(&self) -> u64 {
        match self {
            ContainerVariant::Classic => 4,
            ContainerVariant::Big => 8,
        }
    }

    /// Bytes used by the entry count at the start of an IFD.
    pub fn count_size(&self) -> u64 {
        match self {
            ContainerVariant::Classic => 2,
            ContainerVariant::Big => 8,
        }
    }

    pub fn entry_size(&self) -> u64 {
        match self {
            ContainerVariant::Classic => 12,
            ContainerVariant::Big => 20,
        }
    }

    pub fn header_size(&self) -> u64 {
        match self {
            ContainerVariant::Classic => 8,
            ContainerVariant::Big => 16,
        }
    }

    /// Largest offset the variant can address.
    pub fn max_offset(&self) -> u64 {
        match self {
            ContainerVariant::Classic => u32::MAX as u64,
            ContainerVariant::Big => u64::MAX,
        }
    }
}

/// Parsed container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerInfo {
    pub byte_order: ByteOrder,
    pub variant: ContainerVariant,
    pub first_ifd: u64,
}

/// Parses the fixed-size header.
pub fn parse_header(bytes: &[u8]) -> Result<ContainerInfo, StoreError> {
    if bytes.len() < 8 {
        return Err(StoreError::Format("file too short for a header".to_string()));
    }
    let byte_order = match &bytes[0..2] {
        b"II" => ByteOrder::Little,
        b"MM" => ByteOrder::Big,
        other => {
            return Err(StoreError::Format(format!(
                "unrecognised byte-order signature {:02x}{:02x}",
                other[0], other[1]
            )))
        }
    };

    match byte_order.u16(&bytes[2..4]) {
        42 => Ok(ContainerInfo {
            byte_order,
            variant: ContainerVariant::Classic,
            first_ifd: byte_order.u32(&bytes[4..8]) as u64,
        }),
        43 => {
            if bytes.len() < 16 {
                return Err(StoreError::Format("truncated 64-bit header".to_string()));
            }
            let offset_size = byte_order.u16(&bytes[4..6]);
            if offset_size != 8 || byte_order.u16(&bytes[6..8]) != 0 {
                return Err(StoreError::Format(format!(
                    "unsupported offset width {}",
                    offset_size
                )));
            }
            Ok(ContainerInfo {
                byte_order,
                variant: ContainerVariant::Big,
                first_ifd: byte_order.u64(&bytes[8..16]),
            })
        }
        version => Err(StoreError::Format(format!("unsupported version {}", version))),
    }
}

// =============================================================================
// Level descriptors
// =============================================================================

/// Compression schemes understood by the codec layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    None,
    Deflate,
    Jpeg,
}

impl Compression {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(Compression::None),
            8 | 32946 => Some(Compression::Deflate),
            7 => Some(Compression::Jpeg),
            _ => None,
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Compression::None => 1,
            Compression::Deflate => 8,
            Compression::Jpeg => 7,
        }
    }
}

/// Horizontal differencing applied before compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predictor {
    None,
    Horizontal,
}

/// One resolution level of the pyramid.
///
/// The tile tables are indexed `y * tiles_across + x` and are immutable
/// after open.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelDescriptor {
    pub index: u32,
    pub width: u64,
    pub height: u64,
    pub tile_width: u32,
    pub tile_height: u32,
    pub layout: PixelLayout,
    pub compression: Compression,
    pub predictor: Predictor,
    pub geo_transform: GeoTransform,
    /// CRS code, or 0 when the container carries no georeferencing.
    pub crs: u32,
    pub tile_offsets: Vec<u64>,
    pub tile_byte_counts: Vec<u64>,
    pub jpeg_tables: Option<Bytes>,
    pub(crate) ifd_offset: u64,
    pub(crate) next_pointer_pos: u64,
}

impl LevelDescriptor {
    pub fn tiles_across(&self) -> u32 {
        self.width.div_ceil(self.tile_width as u64) as u32
    }

    pub fn tiles_down(&self) -> u32 {
        self.height.div_ceil(self.tile_height as u64) as u32
    }

    pub fn tile_count(&self) -> usize {
        self.tiles_across() as usize * self.tiles_down() as usize
    }

    /// Table index of tile (x, y), or `None` if outside the grid.
    pub fn tile_index(&self, x: u32, y: u32) -> Option<usize> {
        (x < self.tiles_across() && y < self.tiles_down())
            .then(|| y as usize * self.tiles_across() as usize + x as usize)
    }

    pub fn key(&self, x: u32, y: u32) -> TileKey {
        TileKey::new(self.index, x, y)
    }

    /// Decoded size of one full tile in bytes.
    pub fn tile_bytes(&self) -> usize {
        self.tile_width as usize * self.tile_height as usize * self.layout.bytes_per_pixel()
    }

    /// Ground size of a pixel along x in CRS units.
    pub fn pixel_size(&self) -> f64 {
        self.geo_transform.pixel_size().0
    }

    /// True when the payload of tile `index` is absent (sparse).
    pub fn is_sparse(&self, index: usize) -> bool {
        self.tile_byte_counts.get(index).copied() == Some(0)
    }
}

// =============================================================================
// IFD parsing
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct RawEntry {
    tag: u16,
    field_type: u16,
    count: u64,
    /// Inline value bytes (left-aligned), valid when the payload fits.
    inline: [u8; 8],
    offset: u64,
}

struct IfdParser<'a> {
    source: &'a dyn RangeSource,
    info: ContainerInfo,
}

impl<'a> IfdParser<'a> {
    async fn read(&self, offset: u64, len: u64) -> Result<Bytes, StoreError> {
        let total = self.source.len();
        if offset.checked_add(len).map_or(true, |end| end > total) {
            return Err(StoreError::Index(format!(
                "range {}+{} exceeds container length {}",
                offset, len, total
            )));
        }
        self.source.read_range(offset, len).await
    }

    /// Reads an IFD's entries. Returns the entries, the position of the
    /// next-IFD pointer and its value.
    async fn read_entries(
        &self,
        ifd_offset: u64,
    ) -> Result<(Vec<RawEntry>, u64, u64), StoreError> {
        let v = self.info.variant;
        let order = self.info.byte_order;
        let count_bytes = self.read(ifd_offset, v.count_size()).await?;
        let count = match v {
            ContainerVariant::Classic => order.u16(&count_bytes) as u64,
            ContainerVariant::Big => order.u64(&count_bytes),
        };
        if count == 0 || count > 4096 {
            return Err(StoreError::Index(format!(
                "IFD at {} has implausible entry count {}",
                ifd_offset, count
            )));
        }

        let entries_len = count * v.entry_size();
        let next_pointer_pos = ifd_offset + v.count_size() + entries_len;
        let raw = self
            .read(ifd_offset + v.count_size(), entries_len + v.offset_size())
            .await?;

        let mut entries = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let e = &raw[i * v.entry_size() as usize..(i + 1) * v.entry_size() as usize];
            let tag = order.u16(&e[0..2]);
            let field_type = order.u16(&e[2..4]);
            let (count, value) = match v {
                ContainerVariant::Classic => (order.u32(&e[4..8]) as u64, &e[8..12]),
                ContainerVariant::Big => (order.u64(&e[4..12]), &e[12..20]),
            };
            let mut inline = [0u8; 8];
            inline[..value.len()].copy_from_slice(value);
            let offset = match v {
                ContainerVariant::Classic => order.u32(value) as u64,
                ContainerVariant::Big => order.u64(value),
            };
            entries.push(RawEntry {
                tag,
                field_type,
                count,
                inline,
                offset,
            });
        }
        let tail = &raw[entries_len as usize..];
        let next_offset = match v {
            ContainerVariant::Classic => order.u32(tail) as u64,
            ContainerVariant::Big => order.u64(tail),
        };
        Ok((entries, next_pointer_pos, next_offset))
    }

    /// Raw value bytes of an entry, inline or fetched.
    async fn value_bytes(&self, entry: &RawEntry) -> Result<Bytes, StoreError> {
        let size = field_type::size(entry.field_type).ok_or_else(|| {
            StoreError::Format(format!(
                "tag {} has unknown field type {}",
                entry.tag, entry.field_type
            ))
        })?;
        let len = size.checked_mul(entry.count).ok_or_else(|| {
            StoreError::Index(format!("tag {} value size overflows", entry.tag))
        })?;
        if len <= self.info.variant.offset_size() {
            Ok(Bytes::copy_from_slice(&entry.inline[..len as usize]))
        } else {
            self.read(entry.offset, len).await
        }
    }

    async fn uints(&self, entry: &RawEntry) -> Result<Vec<u64>, StoreError> {
        let order = self.info.byte_order;
        let bytes = self.value_bytes(entry).await?;
        let values = match entry.field_type {
            field_type::BYTE | field_type::UNDEFINED => bytes.iter().map(|b| *b as u64).collect(),
            field_type::SHORT => bytes.chunks_exact(2).map(|c| order.u16(c) as u64).collect(),
            field_type::LONG | field_type::IFD => {
                bytes.chunks_exact(4).map(|c| order.u32(c) as u64).collect()
            }
            field_type::LONG8 | field_type::IFD8 => {
                bytes.chunks_exact(8).map(|c| order.u64(c)).collect()
            }
            other => {
                return Err(StoreError::Format(format!(
                    "tag {} has non-integer type {}",
                    entry.tag, other
                )))
            }
        };
        Ok(values)
    }

    async fn doubles(&self, entry: &RawEntry) -> Result<Vec<f64>, StoreError> {
        let order = self.info.byte_order;
        let bytes = self.value_bytes(entry).await?;
        match entry.field_type {
            field_type::DOUBLE => Ok(bytes.chunks_exact(8).map(|c| order.f64(c)).collect()),
            field_type::FLOAT => Ok(bytes.chunks_exact(4).map(|c| order.f32(c) as f64).collect()),
            other => Err(StoreError::Format(format!(
                "tag {} has non-float type {}",
                entry.tag, other
            ))),
        }
    }
}

fn find(entries: &[RawEntry], tag: u16) -> Option<&RawEntry> {
    entries.iter().find(|e| e.tag == tag)
}

/// Georeferencing read from one IFD.
#[derive(Debug, Clone, Copy, Default)]
struct GeoInfo {
    transform: Option<GeoTransform>,
    crs: Option<u32>,
}

/// Reads the container header and the full level chain.
pub async fn parse_container(
    source: &dyn RangeSource,
) -> Result<(ContainerInfo, Vec<LevelDescriptor>), StoreError> {
    let head_len = source.len().min(16);
    let head = source.read_range(0, head_len).await?;
    let info = parse_header(&head)?;
    let parser = IfdParser { source, info };

    let mut levels: Vec<LevelDescriptor> = Vec::new();
    let mut base_geo: Option<(GeoTransform, u32, u64)> = None;
    let mut visited = HashSet::new();
    let mut offset = info.first_ifd;

    while offset != 0 {
        if !visited.insert(offset) {
            return Err(StoreError::Index(format!(
                "level chain revisits IFD offset {}",
                offset
            )));
        }
        if levels.len() >= MAX_LEVELS {
            return Err(StoreError::Index(format!(
                "level chain exceeds {} levels",
                MAX_LEVELS
            )));
        }

        let (entries, next_pointer_pos, next_offset) = parser.read_entries(offset).await?;
        let (mut level, geo) =
            parse_level(&parser, &entries, levels.len() as u32, offset, next_pointer_pos).await?;

        // Levels without georeferencing inherit level 0's, scaled.
        match (base_geo, geo.transform) {
            (None, t) => {
                let transform = t.unwrap_or_else(GeoTransform::identity);
                let crs = geo.crs.unwrap_or(0);
                level.geo_transform = transform;
                level.crs = crs;
                base_geo = Some((transform, crs, level.width));
            }
            (Some((_, base_crs, _)), Some(t)) => {
                level.geo_transform = t;
                level.crs = geo.crs.unwrap_or(base_crs);
            }
            (Some((base, base_crs, base_width)), None) => {
                let factor = base_width as f64 / level.width as f64;
                level.geo_transform = base.scaled(factor, factor);
                level.crs = base_crs;
            }
        }

        offset = next_offset;

        debug!(
            level = level.index,
            width = level.width,
            height = level.height,
            tile_width = level.tile_width,
            tile_height = level.tile_height,
            tiles = level.tile_count(),
            compression = ?level.compression,
            "Parsed level descriptor"
        );
        levels.push(level);
    }

    if levels.is_empty() {
        return Err(StoreError::Index("container has no levels".to_string()));
    }
    Ok((info, levels))
}

async fn required_uint(
    parser: &IfdParser<'_>,
    entries: &[RawEntry],
    tag: u16,
) -> Result<u64, StoreError> {
    let entry = find(entries, tag)
        .ok_or_else(|| StoreError::Format(format!("missing required tag {}", tag)))?;
    parser
        .uints(entry)
        .await?
        .first()
        .copied()
        .ok_or_else(|| StoreError::Format(format!("tag {} has no value", tag)))
}

async fn optional_uint(
    parser: &IfdParser<'_>,
    entries: &[RawEntry],
    tag: u16,
    default: u64,
) -> Result<u64, StoreError> {
    match find(entries, tag) {
        Some(entry) => Ok(parser.uints(entry).await?.first().copied().unwrap_or(default)),
        None => Ok(default),
    }
}

async fn parse_level(
    parser: &IfdParser<'_>,
    entries: &[RawEntry],
    index: u32,
    ifd_offset: u64,
    next_pointer_pos: u64,
) -> Result<(LevelDescriptor, GeoInfo), StoreError> {
    let width = required_uint(parser, entries, tags::IMAGE_WIDTH).await?;
    let height = required_uint(parser, entries, tags::IMAGE_LENGTH).await?;
    if width == 0 || height == 0 {
        return Err(StoreError::Format(format!("level {} has zero size", index)));
    }

    let (tile_width, tile_height) = match (
        find(entries, tags::TILE_WIDTH),
        find(entries, tags::TILE_LENGTH),
    ) {
        (Some(_), Some(_)) => (
            required_uint(parser, entries, tags::TILE_WIDTH).await?,
            required_uint(parser, entries, tags::TILE_LENGTH).await?,
        ),
        _ => {
            return Err(StoreError::Format(format!(
                "level {} is not tiled",
                index
            )))
        }
    };
    if tile_width == 0 || tile_height == 0 || tile_width > u32::MAX as u64 || tile_height > u32::MAX as u64 {
        return Err(StoreError::Format(format!(
            "level {} has invalid tile size {}x{}",
            index, tile_width, tile_height
        )));
    }

    let compression_code = optional_uint(parser, entries, tags::COMPRESSION, 1).await? as u16;
    let compression = Compression::from_code(compression_code).ok_or_else(|| {
        StoreError::Format(format!("unsupported compression {}", compression_code))
    })?;

    let samples_per_pixel = optional_uint(parser, entries, tags::SAMPLES_PER_PIXEL, 1).await?;
    if !(1..=4).contains(&samples_per_pixel) {
        return Err(StoreError::Format(format!(
            "unsupported samples per pixel {}",
            samples_per_pixel
        )));
    }

    let bits = match find(entries, tags::BITS_PER_SAMPLE) {
        Some(entry) => parser.uints(entry).await?,
        None => vec![1],
    };
    let bits_per_sample = bits.first().copied().unwrap_or(1);
    if bits.iter().any(|b| *b != bits_per_sample) {
        return Err(StoreError::Format("mixed bits per sample".to_string()));
    }
    let sample_code = optional_uint(parser, entries, tags::SAMPLE_FORMAT, 1).await?;
    let sample_format = match (bits_per_sample, sample_code) {
        (8, 1) => SampleFormat::U8,
        (16, 1) => SampleFormat::U16,
        (32, 3) => SampleFormat::F32,
        (b, s) => {
            return Err(StoreError::Format(format!(
                "unsupported sample layout: {} bits, format {}",
                b, s
            )))
        }
    };

    if optional_uint(parser, entries, tags::PLANAR_CONFIGURATION, 1).await? != 1 {
        return Err(StoreError::Format(
            "planar sample layout is not supported".to_string(),
        ));
    }

    let predictor = match optional_uint(parser, entries, tags::PREDICTOR, 1).await? {
        1 => Predictor::None,
        2 if sample_format != SampleFormat::F32 => Predictor::Horizontal,
        p => {
            return Err(StoreError::Format(format!(
                "unsupported predictor {} for {:?}",
                p, sample_format
            )))
        }
    };

    if compression == Compression::Jpeg
        && (sample_format != SampleFormat::U8 || !(samples_per_pixel == 1 || samples_per_pixel == 3))
    {
        return Err(StoreError::Format(
            "JPEG tiles must be 8-bit gray or RGB".to_string(),
        ));
    }

    let offsets_entry = find(entries, tags::TILE_OFFSETS)
        .ok_or_else(|| StoreError::Index(format!("level {} has no tile offsets", index)))?;
    let counts_entry = find(entries, tags::TILE_BYTE_COUNTS)
        .ok_or_else(|| StoreError::Index(format!("level {} has no tile byte counts", index)))?;
    let tile_offsets = parser.uints(offsets_entry).await?;
    let tile_byte_counts = parser.uints(counts_entry).await?;

    let jpeg_tables = match find(entries, tags::JPEG_TABLES) {
        Some(entry) => Some(parser.value_bytes(entry).await?),
        None => None,
    };

    let geo = parse_geo(parser, entries).await?;

    let level = LevelDescriptor {
        index,
        width,
        height,
        tile_width: tile_width as u32,
        tile_height: tile_height as u32,
        layout: PixelLayout::new(samples_per_pixel as u16, sample_format),
        compression,
        predictor,
        geo_transform: GeoTransform::identity(),
        crs: 0,
        tile_offsets,
        tile_byte_counts,
        jpeg_tables,
        ifd_offset,
        next_pointer_pos,
    };
    validate_tables(&level, parser.source.len())?;
    Ok((level, geo))
}

fn validate_tables(level: &LevelDescriptor, container_len: u64) -> Result<(), StoreError> {
    let expected = level.tile_count();
    if level.tile_offsets.len() != expected || level.tile_byte_counts.len() != expected {
        return Err(StoreError::Index(format!(
            "level {}: {} offsets and {} byte counts for {} tiles",
            level.index,
            level.tile_offsets.len(),
            level.tile_byte_counts.len(),
            expected
        )));
    }
    for (i, (off, len)) in level
        .tile_offsets
        .iter()
        .zip(&level.tile_byte_counts)
        .enumerate()
    {
        if *len == 0 {
            continue;
        }
        if off.checked_add(*len).map_or(true, |end| end > container_len) {
            return Err(StoreError::Index(format!(
                "level {} tile {} spans {}+{} beyond container length {}",
                level.index, i, off, len, container_len
            )));
        }
    }
    Ok(())
}

async fn parse_geo(parser: &IfdParser<'_>, entries: &[RawEntry]) -> Result<GeoInfo, StoreError> {
    let mut geo = GeoInfo::default();

    if let Some(entry) = find(entries, tags::MODEL_TRANSFORMATION) {
        let m = parser.doubles(entry).await?;
        if m.len() >= 8 {
            geo.transform = Some(GeoTransform {
                a: m[0],
                b: m[1],
                c: m[3],
                d: m[4],
                e: m[5],
                f: m[7],
            });
        }
    } else if let (Some(scale), Some(tie)) = (
        find(entries, tags::MODEL_PIXEL_SCALE),
        find(entries, tags::MODEL_TIEPOINT),
    ) {
        let s = parser.doubles(scale).await?;
        let t = parser.doubles(tie).await?;
        if s.len() >= 2 && t.len() >= 6 {
            geo.transform = Some(GeoTransform {
                a: s[0],
                b: 0.0,
                c: t[3] - t[0] * s[0],
                d: 0.0,
                e: -s[1],
                f: t[4] + t[1] * s[1],
            });
        } else {
            warn!("Ignoring malformed pixel scale / tiepoint tags");
        }
    }

    if let Some(entry) = find(entries, tags::GEO_KEY_DIRECTORY) {
        let keys = parser.uints(entry).await?;
        if keys.len() >= 4 {
            let n = keys[3] as usize;
            let mut projected = None;
            let mut geographic = None;
            for k in 0..n {
                let base = 4 + k * 4;
                if base + 3 >= keys.len() {
                    break;
                }
                let (id, location, value) = (keys[base], keys[base + 1], keys[base + 3]);
                if location != 0 {
                    continue;
                }
                match id as u16 {
                    tags::GEO_KEY_PROJECTED_TYPE => projected = Some(value as u32),
                    tags::GEO_KEY_GEOGRAPHIC_TYPE => geographic = Some(value as u32),
                    _ => {}
                }
            }
            geo.crs = projected.or(geographic);
        }
    }

    Ok(geo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classic_header() {
        let mut b = b"II".to_vec();
        b.extend_from_slice(&42u16.to_le_bytes());
        b.extend_from_slice(&8u32.to_le_bytes());
        let info = parse_header(&b).unwrap();
        assert_eq!(info.byte_order, ByteOrder::Little);
        assert_eq!(info.variant, ContainerVariant::Classic);
        assert_eq!(info.first_ifd, 8);
    }

    #[test]
    fn test_big_header_big_endian() {
        let mut b = b"MM".to_vec();
        b.extend_from_slice(&43u16.to_be_bytes());
        b.extend_from_slice(&8u16.to_be_bytes());
        b.extend_from_slice(&0u16.to_be_bytes());
        b.extend_from_slice(&16u64.to_be_bytes());
        let info = parse_header(&b).unwrap();
        assert_eq!(info.byte_order, ByteOrder::Big);
        assert_eq!(info.variant, ContainerVariant::Big);
        assert_eq!(info.first_ifd, 16);
    }

    #[test]
    fn test_bad_signature() {
        let err = parse_header(b"XX*\0\x08\0\0\0").unwrap_err();
        assert!(matches!(err, StoreError::Format(_)));
    }

    #[test]
    fn test_bad_version() {
        let mut b = b"II".to_vec();
        b.extend_from_slice(&44u16.to_le_bytes());
        b.extend_from_slice(&8u32.to_le_bytes());
        assert!(matches!(parse_header(&b), Err(StoreError::Format(_))));
    }

    #[test]
    fn test_bad_offset_width() {
        let mut b = b"II".to_vec();
        b.extend_from_slice(&43u16.to_le_bytes());
        b.extend_from_slice(&4u16.to_le_bytes());
        b.extend_from_slice(&0u16.to_le_bytes());
        b.extend_from_slice(&16u64.to_le_bytes());
        assert!(matches!(parse_header(&b), Err(StoreError::Format(_))));
    }

    #[test]
    fn test_compression_codes() {
        assert_eq!(Compression::from_code(32946), Some(Compression::Deflate));
        assert_eq!(Compression::from_code(5), None);
        assert_eq!(Compression::Jpeg.code(), 7);
    }
}
