//! Dataset creation from a decoded image.
//!
//! The image becomes level 0 of a new container, tiled at the configured
//! size, and the pyramid builder then appends the reduced levels.

use std::path::Path;

use image::{ColorType, DynamicImage};
use tracing::info;

use super::AppError;
use crate::config::GeoLayerConfig;
use crate::pyramid::{build_pyramid, PyramidReport};
use crate::store::{Compression, Georeference, LevelSpec, PixelBuffer, PixelLayout, RasterWriter, SampleFormat};

/// Decodes PNG, JPEG or any other format the `image` crate recognises.
///
/// 8-bit gray, 16-bit gray, RGB and RGBA keep their layout; everything
/// else is converted to RGB or RGBA 8-bit.
pub fn decode_image(bytes: &[u8]) -> Result<PixelBuffer, AppError> {
    let image = image::load_from_memory(bytes).map_err(|e| AppError::Ingest(e.to_string()))?;
    let (width, height) = (image.width(), image.height());

    let (layout, data) = match image.color() {
        ColorType::L8 => (PixelLayout::gray8(), image.into_luma8().into_raw()),
        ColorType::L16 => {
            let samples = image.into_luma16().into_raw();
            let data = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
            (PixelLayout::new(1, SampleFormat::U16), data)
        }
        color if color.has_alpha() => (PixelLayout::new(4, SampleFormat::U8), image.into_rgba8().into_raw()),
        _ => (PixelLayout::rgb8(), DynamicImage::into_rgb8(image).into_raw()),
    };

    PixelBuffer::from_raw(width, height, layout, data)
        .ok_or_else(|| AppError::Ingest("decoded buffer has unexpected length".to_string()))
}

/// Reads and decodes an image file on a blocking thread.
pub async fn read_image(path: impl AsRef<Path>) -> Result<PixelBuffer, AppError> {
    let path = path.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || {
        let bytes = std::fs::read(&path)
            .map_err(|e| AppError::Ingest(format!("{}: {}", path.display(), e)))?;
        decode_image(&bytes)
    })
    .await
    .map_err(|e| AppError::Ingest(e.to_string()))?
}

/// Writes `image` as a new container at `output` and builds its pyramid.
pub async fn create_dataset(
    image: PixelBuffer,
    georeference: Option<Georeference>,
    output: impl AsRef<Path>,
    settings: &GeoLayerConfig,
) -> Result<PyramidReport, AppError> {
    let output = output.as_ref().to_path_buf();
    let tile_size = settings.tile_size;
    info!(
        output = %output.display(),
        width = image.width(),
        height = image.height(),
        tile_size,
        "Creating dataset"
    );

    let target = output.clone();
    tokio::task::spawn_blocking(move || {
        let spec = LevelSpec::from_image(&image, tile_size, tile_size, Compression::Deflate, georeference)?;
        let written = RasterWriter::default().build(&[spec])?;
        std::fs::write(&target, &written.bytes)
            .map_err(|e| AppError::Ingest(format!("{}: {}", target.display(), e)))
    })
    .await
    .map_err(|e| AppError::Ingest(e.to_string()))??;

    let options = settings.pyramid_options(settings.store_options());
    Ok(build_pyramid(&output, options).await?)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;

    use image::{ImageFormat, Rgb, RgbImage};

    use super::*;
    use crate::store::{FileSource, RasterHandle, StoreOptions};
    use crate::transform::GeoTransform;

    #[test]
    fn test_decode_png_keeps_rgb() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 3, Rgb([10, 20, 30])));
        let mut png = Vec::new();
        img.write_to(&mut Cursor::new(&mut png), ImageFormat::Png).unwrap();

        let buffer = decode_image(&png).unwrap();
        assert_eq!((buffer.width(), buffer.height()), (4, 3));
        assert_eq!(buffer.layout(), PixelLayout::rgb8());
        assert_eq!(buffer.sample(3, 2, 2), 30.0);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_image(b"definitely not an image"), Err(AppError::Ingest(_))));
    }

    #[tokio::test]
    async fn test_create_dataset_builds_pyramid() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("ramp.tif");

        let mut image = PixelBuffer::zeroed(300, 200, PixelLayout::gray8());
        for y in 0..200 {
            for x in 0..300 {
                image.set_sample(x, y, 0, ((x + y) % 256) as f64);
            }
        }
        let geo = Georeference::projected(GeoTransform::north_up(500_000.0, 4_000_000.0, 2.0, 2.0), 32633);
        let mut settings = GeoLayerConfig::default().with_tile_size(64);
        settings.min_level_size = 64;

        let report = create_dataset(image, Some(geo), &output, &settings).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.levels.len(), 2);

        let source = Arc::new(FileSource::open(&output).await.unwrap());
        let handle = RasterHandle::open(source, StoreOptions::default()).await.unwrap();
        assert_eq!(handle.level_count(), 3);
        let level1 = handle.level(1).unwrap();
        assert_eq!((level1.width, level1.height), (150, 100));
        assert_eq!(level1.tile_width, 64);
        assert_eq!(handle.level(0).unwrap().crs, 32633);
    }
}
