//! Viewport planning: level selection, pixel window and tile ranking.

use crate::store::{LevelDescriptor, PixelRect, RasterHandle, TileKey};
use crate::transform::{BoundingBox, TransformEngine};

use super::LoaderError;

/// A geographic request: an extent plus the wanted ground resolution, in
/// units of the dataset CRS per pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportRequest {
    pub bounds: BoundingBox,
    pub resolution: f64,
}

impl ViewportRequest {
    pub fn new(bounds: BoundingBox, resolution: f64) -> Self {
        Self { bounds, resolution }
    }
}

/// What a request resolves to.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadPlan {
    pub level: u32,
    /// Request extent in the dataset CRS.
    pub dataset_bounds: BoundingBox,
    pub rect: PixelRect,
    /// Tiles covering `rect`, nearest to its centre first.
    pub tiles: Vec<TileKey>,
}

/// Coarsest level whose pixel size does not exceed `resolution`; the finest
/// level when none is fine enough.
pub fn select_level<'a>(levels: impl Iterator<Item = &'a LevelDescriptor>, resolution: f64) -> u32 {
    let tolerance = resolution * 1e-9;
    levels
        .filter(|l| l.pixel_size() <= resolution + tolerance)
        .map(|l| l.index)
        .max()
        .unwrap_or(0)
}

/// Pixel window of `bounds` (already in the level's CRS), clamped to the
/// level extent. `None` when they do not overlap.
pub fn pixel_rect(level: &LevelDescriptor, bounds: &BoundingBox) -> Option<PixelRect> {
    let corners = [
        (bounds.min_x, bounds.min_y),
        (bounds.min_x, bounds.max_y),
        (bounds.max_x, bounds.min_y),
        (bounds.max_x, bounds.max_y),
    ];
    let (mut c0, mut r0, mut c1, mut r1) = (f64::MAX, f64::MAX, f64::MIN, f64::MIN);
    for (x, y) in corners {
        let (c, r) = level.geo_transform.world_to_pixel(x, y)?;
        c0 = c0.min(c);
        r0 = r0.min(r);
        c1 = c1.max(c);
        r1 = r1.max(r);
    }

    let clamp = |v: f64, max: u64| v.clamp(0.0, max as f64);
    let x0 = clamp(c0.floor(), level.width) as u64;
    let y0 = clamp(r0.floor(), level.height) as u64;
    let x1 = clamp(c1.ceil(), level.width) as u64;
    let y1 = clamp(r1.ceil(), level.height) as u64;
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(PixelRect::new(
        x0,
        y0,
        (x1 - x0).min(u32::MAX as u64) as u32,
        (y1 - y0).min(u32::MAX as u64) as u32,
    ))
}

/// Tiles intersecting `rect`, ordered by distance from the rect centre.
pub fn rank_tiles(level: &LevelDescriptor, rect: &PixelRect) -> Vec<TileKey> {
    let (xs, ys) = rect.tile_span(level);
    let cx = rect.x as f64 + rect.width as f64 / 2.0;
    let cy = rect.y as f64 + rect.height as f64 / 2.0;
    let tw = level.tile_width as f64;
    let th = level.tile_height as f64;

    let mut ranked: Vec<(f64, TileKey)> = ys
        .flat_map(|y| xs.clone().map(move |x| (x, y)))
        .map(|(x, y)| {
            let dx = (x as f64 + 0.5) * tw - cx;
            let dy = (y as f64 + 0.5) * th - cy;
            (dx * dx + dy * dy, TileKey::new(level.index, x, y))
        })
        .collect();
    ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    ranked.into_iter().map(|(_, key)| key).collect()
}

/// Resolves `request` against an open raster.
pub fn plan_request(
    handle: &RasterHandle,
    engine: &TransformEngine,
    request: &ViewportRequest,
    densify: usize,
) -> Result<LoadPlan, LoaderError> {
    if !request.resolution.is_finite() || request.resolution <= 0.0 {
        return Err(LoaderError::InvalidRequest(format!(
            "resolution must be positive, got {}",
            request.resolution
        )));
    }
    if !request.bounds.is_valid() {
        return Err(LoaderError::InvalidRequest(format!(
            "degenerate bounds {:?}",
            request.bounds
        )));
    }

    let dataset_crs = handle.level(0)?.crs;
    let dataset_bounds = engine.transform_bounds(&request.bounds, dataset_crs, densify)?;
    let level_index = select_level(handle.levels(), request.resolution);
    let level = handle.level(level_index)?;
    let rect = pixel_rect(level, &dataset_bounds).ok_or(LoaderError::OutsideDataset {
        bounds: request.bounds,
        level: level_index,
    })?;

    Ok(LoadPlan {
        level: level_index,
        dataset_bounds,
        rect,
        tiles: rank_tiles(level, &rect),
    })
}
