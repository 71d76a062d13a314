//! Slippy-map coordinate conversion.
//!
//! Converts between geographic coordinates (latitude/longitude) and Web
//! Mercator `z/x/y` tile addresses used by web map clients.

mod types;

pub use types::{CoordError, SlippyTile, MAX_LAT, MAX_LON, MAX_ZOOM, MIN_LAT, MIN_LON};

use std::f64::consts::PI;

use crate::transform::BoundingBox;

/// Converts geographic coordinates to the tile containing them.
///
/// # Arguments
///
/// * `lat` - Latitude in degrees (-85.05112878 to 85.05112878)
/// * `lon` - Longitude in degrees (-180.0 to 180.0)
/// * `zoom` - Zoom level (0 to 24)
#[inline]
pub fn to_tile_coords(lat: f64, lon: f64, zoom: u8) -> Result<SlippyTile, CoordError> {
    if !(MIN_LAT..=MAX_LAT).contains(&lat) {
        return Err(CoordError::InvalidLatitude(lat));
    }
    if !(MIN_LON..=MAX_LON).contains(&lon) {
        return Err(CoordError::InvalidLongitude(lon));
    }
    if zoom > MAX_ZOOM {
        return Err(CoordError::InvalidZoom(zoom));
    }

    let n = (1u64 << zoom) as f64;
    let max_index = (1u64 << zoom) - 1;

    let x = (((lon + 180.0) / 360.0 * n) as u64).min(max_index) as u32;

    let lat_rad = lat * PI / 180.0;
    let y = (((1.0 - lat_rad.tan().asinh() / PI) / 2.0 * n) as u64).min(max_index) as u32;

    Ok(SlippyTile { z: zoom, x, y })
}

/// Latitude of the northern edge of tile row `y` (fractional rows allowed).
fn row_to_lat(y: f64, n: f64) -> f64 {
    (PI * (1.0 - 2.0 * y / n)).sinh().atan().to_degrees()
}

/// Returns the north-west corner of a tile as `(lat, lon)`.
#[inline]
pub fn tile_to_lat_lon(tile: &SlippyTile) -> (f64, f64) {
    let n = tile.tiles_per_axis() as f64;
    let lon = tile.x as f64 / n * 360.0 - 180.0;
    (row_to_lat(tile.y as f64, n), lon)
}

/// Geographic extent of a tile (EPSG:4326, x = longitude).
pub fn tile_bounds(tile: &SlippyTile) -> BoundingBox {
    let n = tile.tiles_per_axis() as f64;
    let west = tile.x as f64 / n * 360.0 - 180.0;
    let east = (tile.x as f64 + 1.0) / n * 360.0 - 180.0;
    let north = row_to_lat(tile.y as f64, n);
    let south = row_to_lat(tile.y as f64 + 1.0, n);
    BoundingBox::new(crate::transform::WGS84, west, south, east, north)
}

/// Centre of a tile in Mercator space, returned as `(lat, lon)`.
///
/// The centre is taken halfway between the tile's edges in projected space,
/// so it always falls strictly inside the tile.
pub fn tile_center(tile: &SlippyTile) -> (f64, f64) {
    let n = tile.tiles_per_axis() as f64;
    let lon = (tile.x as f64 + 0.5) / n * 360.0 - 180.0;
    (row_to_lat(tile.y as f64 + 0.5, n), lon)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_york_city_at_zoom_16() {
        let tile = to_tile_coords(40.7128, -74.0060, 16).unwrap();
        assert_eq!(tile.y, 24640);
        assert_eq!(tile.x, 19295);
        assert_eq!(tile.z, 16);
    }

    #[test]
    fn test_valencia_coast_at_zoom_10() {
        let tile = to_tile_coords(40.5, -0.2, 10).unwrap();
        assert_eq!(tile, SlippyTile { z: 10, x: 511, y: 385 });
    }

    #[test]
    fn test_center_round_trip() {
        let tile = SlippyTile::new(10, 511, 385).unwrap();
        let bounds = tile_bounds(&tile);
        assert!(bounds.min_x < -0.2 && bounds.max_x > -0.2);
        assert!(bounds.min_y < 40.5 && bounds.max_y > 40.5);

        let (lat, lon) = tile_center(&tile);
        assert_eq!(to_tile_coords(lat, lon, 10).unwrap(), tile);
    }

    #[test]
    fn test_invalid_latitude() {
        let result = to_tile_coords(90.0, 0.0, 10);
        assert!(matches!(result, Err(CoordError::InvalidLatitude(_))));
    }

    #[test]
    fn test_invalid_zoom() {
        assert!(matches!(
            to_tile_coords(0.0, 0.0, 30),
            Err(CoordError::InvalidZoom(30))
        ));
    }

    #[test]
    fn test_antimeridian_clamps_to_last_column() {
        let tile = to_tile_coords(0.0, 180.0, 3).unwrap();
        assert_eq!(tile.x, 7);
    }

    #[test]
    fn test_tile_validation() {
        assert!(SlippyTile::new(2, 3, 3).is_ok());
        assert!(matches!(
            SlippyTile::new(2, 4, 0),
            Err(CoordError::InvalidTile { .. })
        ));
    }

    #[test]
    fn test_tile_to_lat_lon_at_equator() {
        let tile = SlippyTile { z: 10, x: 512, y: 512 };
        let (lat, lon) = tile_to_lat_lon(&tile);
        assert!(lat.abs() < 1e-9);
        assert!(lon.abs() < 1e-9);
    }

    #[test]
    fn test_display() {
        assert_eq!(SlippyTile { z: 3, x: 1, y: 2 }.to_string(), "3/1/2");
    }
}
