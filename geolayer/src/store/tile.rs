//! Tile identity and decoded pixel buffers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::coord::SlippyTile;

/// Identifies a tile inside one raster: pyramid level plus tile indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileKey {
    pub level: u32,
    pub x: u32,
    pub y: u32,
}

impl TileKey {
    pub fn new(level: u32, x: u32, y: u32) -> Self {
        Self { level, x, y }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.level, self.x, self.y)
    }
}

/// External tile address: dataset plus level and tile indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileAddress {
    pub dataset: String,
    pub level: u32,
    pub x: u32,
    pub y: u32,
}

impl TileAddress {
    /// Maps a slippy-map tile onto a Web Mercator dataset (`level = z`).
    pub fn from_slippy(dataset: impl Into<String>, tile: SlippyTile) -> Self {
        Self {
            dataset: dataset.into(),
            level: tile.z as u32,
            x: tile.x,
            y: tile.y,
        }
    }

    pub fn key(&self) -> TileKey {
        TileKey::new(self.level, self.x, self.y)
    }
}

/// Numeric type of one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    U8,
    U16,
    F32,
}

impl SampleFormat {
    pub fn bytes(&self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::U16 => 2,
            SampleFormat::F32 => 4,
        }
    }

    pub fn bits(&self) -> u16 {
        (self.bytes() * 8) as u16
    }

    /// Value of the container's SampleFormat tag.
    pub fn format_code(&self) -> u16 {
        match self {
            SampleFormat::U8 | SampleFormat::U16 => 1,
            SampleFormat::F32 => 3,
        }
    }
}

/// Interleaved sample layout of a pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelLayout {
    pub samples_per_pixel: u16,
    pub sample_format: SampleFormat,
}

impl PixelLayout {
    pub fn new(samples_per_pixel: u16, sample_format: SampleFormat) -> Self {
        Self {
            samples_per_pixel,
            sample_format,
        }
    }

    pub fn gray8() -> Self {
        Self::new(1, SampleFormat::U8)
    }

    pub fn rgb8() -> Self {
        Self::new(3, SampleFormat::U8)
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.samples_per_pixel as usize * self.sample_format.bytes()
    }
}

/// Row-major, pixel-interleaved buffer. Multi-byte samples are little-endian.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    layout: PixelLayout,
    data: Vec<u8>,
}

impl PixelBuffer {
    /// A zero-filled buffer.
    pub fn zeroed(width: u32, height: u32, layout: PixelLayout) -> Self {
        let len = width as usize * height as usize * layout.bytes_per_pixel();
        Self {
            width,
            height,
            layout,
            data: vec![0; len],
        }
    }

    /// Wraps existing bytes. Returns `None` if the length does not match.
    pub fn from_raw(width: u32, height: u32, layout: PixelLayout, data: Vec<u8>) -> Option<Self> {
        if data.len() != width as usize * height as usize * layout.bytes_per_pixel() {
            return None;
        }
        Some(Self {
            width,
            height,
            layout,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }

    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.layout.bytes_per_pixel()
    }

    /// Bytes of row `y`.
    pub fn row(&self, y: u32) -> &[u8] {
        let rb = self.row_bytes();
        let start = y as usize * rb;
        &self.data[start..start + rb]
    }

    /// Sample `s` of pixel (x, y) widened to `f64`.
    pub fn sample(&self, x: u32, y: u32, s: usize) -> f64 {
        let bps = self.layout.sample_format.bytes();
        let off = (y as usize * self.width as usize + x as usize) * self.layout.bytes_per_pixel()
            + s * bps;
        read_sample(&self.data[off..off + bps], self.layout.sample_format)
    }

    /// Sets sample `s` of pixel (x, y), rounding and clamping integers.
    pub fn set_sample(&mut self, x: u32, y: u32, s: usize, value: f64) {
        let bps = self.layout.sample_format.bytes();
        let off = (y as usize * self.width as usize + x as usize) * self.layout.bytes_per_pixel()
            + s * bps;
        write_sample(&mut self.data[off..off + bps], self.layout.sample_format, value);
    }
}

pub(crate) fn read_sample(bytes: &[u8], format: SampleFormat) -> f64 {
    match format {
        SampleFormat::U8 => bytes[0] as f64,
        SampleFormat::U16 => u16::from_le_bytes([bytes[0], bytes[1]]) as f64,
        SampleFormat::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
    }
}

pub(crate) fn write_sample(out: &mut [u8], format: SampleFormat, value: f64) {
    match format {
        SampleFormat::U8 => out[0] = value.round().clamp(0.0, u8::MAX as f64) as u8,
        SampleFormat::U16 => out.copy_from_slice(
            &(value.round().clamp(0.0, u16::MAX as f64) as u16).to_le_bytes(),
        ),
        SampleFormat::F32 => out.copy_from_slice(&(value as f32).to_le_bytes()),
    }
}

/// A decoded tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tile {
    pub key: TileKey,
    pub pixels: PixelBuffer,
}

impl Tile {
    pub fn new(key: TileKey, pixels: PixelBuffer) -> Self {
        Self { key, pixels }
    }

    /// Decoded size in bytes, used for cache budgets.
    pub fn byte_size(&self) -> usize {
        self.pixels.data().len()
    }
}
