//! Tile payload codecs.
//!
//! Decoded buffers are always little-endian and pixel-interleaved,
//! regardless of the container's byte order.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageFormat};

use super::format::{ByteOrder, Compression, LevelDescriptor, Predictor};
use super::tile::{PixelBuffer, PixelLayout, SampleFormat, TileKey};
use super::StoreError;

/// JPEG quality used when encoding.
pub const JPEG_QUALITY: u8 = 90;

/// Deflate level used when encoding. Fixed so output is reproducible.
pub const DEFLATE_LEVEL: u32 = 6;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Decodes one tile payload into a full-size tile buffer.
///
/// An empty payload is a sparse tile and decodes to zeros.
pub fn decode_tile(
    level: &LevelDescriptor,
    key: TileKey,
    payload: &[u8],
    order: ByteOrder,
) -> Result<PixelBuffer, StoreError> {
    let (w, h) = (level.tile_width, level.tile_height);
    if payload.is_empty() {
        return Ok(PixelBuffer::zeroed(w, h, level.layout));
    }

    let decode_err = |reason: String| StoreError::Decode { key, reason };

    let mut data = match level.compression {
        Compression::None => payload.to_vec(),
        Compression::Deflate => {
            // One byte past a full tile is enough to detect an oversized stream.
            let limit = level.tile_bytes() as u64 + 1;
            let mut out = Vec::with_capacity(level.tile_bytes());
            ZlibDecoder::new(payload)
                .take(limit)
                .read_to_end(&mut out)
                .map_err(|e| decode_err(format!("deflate: {}", e)))?;
            if out.len() > level.tile_bytes() {
                return Err(decode_err(format!(
                    "deflate stream exceeds tile size of {} bytes",
                    level.tile_bytes()
                )));
            }
            out
        }
        Compression::Jpeg => {
            return decode_jpeg(level, payload).map_err(decode_err);
        }
    };

    if data.len() != level.tile_bytes() {
        return Err(decode_err(format!(
            "decoded {} bytes, expected {}",
            data.len(),
            level.tile_bytes()
        )));
    }

    to_little_endian(&mut data, level.layout.sample_format, order);
    if level.predictor == Predictor::Horizontal {
        undo_horizontal_predictor(&mut data, w, level.layout);
    }

    PixelBuffer::from_raw(w, h, level.layout, data)
        .ok_or_else(|| decode_err("buffer size mismatch".to_string()))
}

fn decode_jpeg(level: &LevelDescriptor, payload: &[u8]) -> Result<PixelBuffer, String> {
    let stream = match &level.jpeg_tables {
        Some(tables) if tables.len() > 4 && payload.len() > 2 => {
            // Shared tables: drop their EOI and the tile's SOI, then join.
            let mut joined = Vec::with_capacity(tables.len() + payload.len());
            joined.extend_from_slice(&tables[..tables.len() - 2]);
            joined.extend_from_slice(&payload[2..]);
            joined
        }
        _ => payload.to_vec(),
    };
    if !stream.starts_with(&JPEG_SOI) {
        return Err("missing JPEG start-of-image marker".to_string());
    }

    let image = image::load_from_memory_with_format(&stream, ImageFormat::Jpeg)
        .map_err(|e| format!("jpeg: {}", e))?;
    if image.width() != level.tile_width || image.height() != level.tile_height {
        return Err(format!(
            "jpeg is {}x{}, expected {}x{}",
            image.width(),
            image.height(),
            level.tile_width,
            level.tile_height
        ));
    }
    let raw = match level.layout.samples_per_pixel {
        1 => image.to_luma8().into_raw(),
        _ => image.to_rgb8().into_raw(),
    };
    PixelBuffer::from_raw(level.tile_width, level.tile_height, level.layout, raw)
        .ok_or_else(|| "jpeg buffer size mismatch".to_string())
}

/// Encodes a full-size tile buffer for storage.
pub fn encode_tile(
    compression: Compression,
    predictor: Predictor,
    pixels: &PixelBuffer,
    order: ByteOrder,
) -> Result<Vec<u8>, StoreError> {
    let layout = pixels.layout();
    match compression {
        Compression::Jpeg => {
            let color = match (layout.samples_per_pixel, layout.sample_format) {
                (1, SampleFormat::U8) => ExtendedColorType::L8,
                (3, SampleFormat::U8) => ExtendedColorType::Rgb8,
                _ => {
                    return Err(StoreError::Format(
                        "JPEG tiles must be 8-bit gray or RGB".to_string(),
                    ))
                }
            };
            let mut out = Vec::new();
            JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
                .encode(pixels.data(), pixels.width(), pixels.height(), color)
                .map_err(|e| StoreError::Format(format!("jpeg encode: {}", e)))?;
            if !out.ends_with(&JPEG_EOI) {
                return Err(StoreError::Format("jpeg encoder emitted no EOI".to_string()));
            }
            Ok(out)
        }
        Compression::None | Compression::Deflate => {
            let mut data = pixels.data().to_vec();
            if predictor == Predictor::Horizontal {
                apply_horizontal_predictor(&mut data, pixels.width(), layout);
            }
            to_little_endian(&mut data, layout.sample_format, order);
            if compression == Compression::None {
                return Ok(data);
            }
            let mut encoder =
                ZlibEncoder::new(Vec::new(), flate2::Compression::new(DEFLATE_LEVEL));
            encoder.write_all(&data)?;
            Ok(encoder.finish()?)
        }
    }
}

/// Swaps sample bytes between big-endian and little-endian in place.
/// The swap is its own inverse, so it serves both directions.
fn to_little_endian(data: &mut [u8], format: SampleFormat, order: ByteOrder) {
    if order == ByteOrder::Little {
        return;
    }
    let width = format.bytes();
    if width > 1 {
        for sample in data.chunks_exact_mut(width) {
            sample.reverse();
        }
    }
}

fn undo_horizontal_predictor(data: &mut [u8], width: u32, layout: PixelLayout) {
    let spp = layout.samples_per_pixel as usize;
    let row_bytes = width as usize * layout.bytes_per_pixel();
    for row in data.chunks_exact_mut(row_bytes) {
        match layout.sample_format {
            SampleFormat::U8 => {
                for i in spp..row.len() {
                    row[i] = row[i].wrapping_add(row[i - spp]);
                }
            }
            SampleFormat::U16 => {
                let step = spp * 2;
                for i in (step..row.len()).step_by(2) {
                    let prev = u16::from_le_bytes([row[i - step], row[i - step + 1]]);
                    let cur = u16::from_le_bytes([row[i], row[i + 1]]);
                    row[i..i + 2].copy_from_slice(&cur.wrapping_add(prev).to_le_bytes());
                }
            }
            SampleFormat::F32 => {}
        }
    }
}

fn apply_horizontal_predictor(data: &mut [u8], width: u32, layout: PixelLayout) {
    let spp = layout.samples_per_pixel as usize;
    let row_bytes = width as usize * layout.bytes_per_pixel();
    for row in data.chunks_exact_mut(row_bytes) {
        match layout.sample_format {
            SampleFormat::U8 => {
                for i in (spp..row.len()).rev() {
                    row[i] = row[i].wrapping_sub(row[i - spp]);
                }
            }
            SampleFormat::U16 => {
                let step = spp * 2;
                for i in (step..row.len()).step_by(2).rev() {
                    let prev = u16::from_le_bytes([row[i - step], row[i - step + 1]]);
                    let cur = u16::from_le_bytes([row[i], row[i + 1]]);
                    row[i..i + 2].copy_from_slice(&cur.wrapping_sub(prev).to_le_bytes());
                }
            }
            SampleFormat::F32 => {}
        }
    }
}
