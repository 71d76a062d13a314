//! Datum shift grids.
//!
//! A grid stores longitude/latitude offsets (degrees) on a regular lattice
//! and maps points from its source datum to its target datum by bilinear
//! interpolation. Points outside the lattice are rejected, never
//! extrapolated.

use super::types::Coordinate;
use super::TransformError;

/// Iterations for the inverse (target to source) lookup.
const INVERSE_ITERATIONS: usize = 10;

/// A regular lattice of horizontal datum offsets.
#[derive(Debug, Clone, PartialEq)]
pub struct ShiftGrid {
    name: String,
    source_crs: u32,
    target_crs: u32,
    west: f64,
    south: f64,
    lon_step: f64,
    lat_step: f64,
    cols: usize,
    rows: usize,
    /// Row-major from the south-west node, `rows * cols` values each.
    dlon: Vec<f64>,
    dlat: Vec<f64>,
    accuracy_m: f64,
}

impl ShiftGrid {
    /// Creates a grid.
    ///
    /// `dlon`/`dlat` hold `rows * cols` offsets in degrees, row-major from the
    /// south-west node. Returns `None` if the dimensions do not match or the
    /// lattice has fewer than two nodes along an axis.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        source_crs: u32,
        target_crs: u32,
        west: f64,
        south: f64,
        lon_step: f64,
        lat_step: f64,
        cols: usize,
        rows: usize,
        dlon: Vec<f64>,
        dlat: Vec<f64>,
        accuracy_m: f64,
    ) -> Option<Self> {
        if cols < 2
            || rows < 2
            || dlon.len() != cols * rows
            || dlat.len() != cols * rows
            || lon_step <= 0.0
            || lat_step <= 0.0
        {
            return None;
        }
        Some(Self {
            name: name.into(),
            source_crs,
            target_crs,
            west,
            south,
            lon_step,
            lat_step,
            cols,
            rows,
            dlon,
            dlat,
            accuracy_m,
        })
    }

    /// A grid with the same offset at every node.
    #[allow(clippy::too_many_arguments)]
    pub fn uniform(
        name: impl Into<String>,
        source_crs: u32,
        target_crs: u32,
        west: f64,
        south: f64,
        east: f64,
        north: f64,
        dlon: f64,
        dlat: f64,
        accuracy_m: f64,
    ) -> Option<Self> {
        Self::new(
            name,
            source_crs,
            target_crs,
            west,
            south,
            east - west,
            north - south,
            2,
            2,
            vec![dlon; 4],
            vec![dlat; 4],
            accuracy_m,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_crs(&self) -> u32 {
        self.source_crs
    }

    pub fn target_crs(&self) -> u32 {
        self.target_crs
    }

    pub fn accuracy_m(&self) -> f64 {
        self.accuracy_m
    }

    fn east(&self) -> f64 {
        self.west + self.lon_step * (self.cols - 1) as f64
    }

    fn north(&self) -> f64 {
        self.south + self.lat_step * (self.rows - 1) as f64
    }

    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        lon >= self.west && lon <= self.east() && lat >= self.south && lat <= self.north()
    }

    fn out_of_bounds(&self, lon: f64, lat: f64) -> TransformError {
        TransformError::OutOfGridBounds {
            grid: self.name.clone(),
            lon,
            lat,
        }
    }

    /// Bilinearly interpolated (dlon, dlat) at a point.
    pub fn shift_at(&self, lon: f64, lat: f64) -> Result<(f64, f64), TransformError> {
        if !self.contains(lon, lat) {
            return Err(self.out_of_bounds(lon, lat));
        }

        let fx = (lon - self.west) / self.lon_step;
        let fy = (lat - self.south) / self.lat_step;
        let col = (fx.floor() as usize).min(self.cols - 2);
        let row = (fy.floor() as usize).min(self.rows - 2);
        let tx = fx - col as f64;
        let ty = fy - row as f64;

        let idx = |r: usize, c: usize| r * self.cols + c;
        let interp = |v: &[f64]| {
            let v00 = v[idx(row, col)];
            let v10 = v[idx(row, col + 1)];
            let v01 = v[idx(row + 1, col)];
            let v11 = v[idx(row + 1, col + 1)];
            let south = v00 + (v10 - v00) * tx;
            let north = v01 + (v11 - v01) * tx;
            south + (north - south) * ty
        };

        Ok((interp(&self.dlon), interp(&self.dlat)))
    }

    /// Applies the grid in its forward direction (source to target datum).
    pub fn forward(&self, c: Coordinate) -> Result<Coordinate, TransformError> {
        let (dlon, dlat) = self.shift_at(c.x, c.y)?;
        Ok(Coordinate::with_height(c.x + dlon, c.y + dlat, c.z))
    }

    /// Applies the grid backwards (target to source datum).
    pub fn inverse(&self, c: Coordinate) -> Result<Coordinate, TransformError> {
        let mut guess = c;
        for _ in 0..INVERSE_ITERATIONS {
            let (dlon, dlat) = self
                .shift_at(guess.x, guess.y)
                .map_err(|_| self.out_of_bounds(c.x, c.y))?;
            guess = Coordinate::with_height(c.x - dlon, c.y - dlat, c.z);
        }
        // The recovered source point must itself be covered.
        if !self.contains(guess.x, guess.y) {
            return Err(self.out_of_bounds(c.x, c.y));
        }
        Ok(guess)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_grid() -> ShiftGrid {
        // 3x3 nodes over [0,2]x[50,52] with offsets growing eastwards.
        let dlon = vec![0.001, 0.002, 0.003, 0.001, 0.002, 0.003, 0.001, 0.002, 0.003];
        let dlat = vec![0.0005; 9];
        ShiftGrid::new("test", 4230, 4326, 0.0, 50.0, 1.0, 1.0, 3, 3, dlon, dlat, 0.5).unwrap()
    }

    #[test]
    fn test_bilinear_midpoint() {
        let grid = sample_grid();
        let (dlon, dlat) = grid.shift_at(0.5, 50.5).unwrap();
        assert!((dlon - 0.0015).abs() < 1e-15);
        assert!((dlat - 0.0005).abs() < 1e-15);
    }

    #[test]
    fn test_nodes_exact() {
        let grid = sample_grid();
        let (dlon, _) = grid.shift_at(2.0, 52.0).unwrap();
        assert!((dlon - 0.003).abs() < 1e-15);
    }

    #[test]
    fn test_outside_is_error() {
        let grid = sample_grid();
        let err = grid.shift_at(2.5, 51.0).unwrap_err();
        assert!(matches!(err, TransformError::OutOfGridBounds { .. }));
        assert!(grid.forward(Coordinate::new(-0.1, 51.0)).is_err());
    }

    #[test]
    fn test_inverse_round_trip() {
        let grid = sample_grid();
        let c = Coordinate::new(1.3, 51.7);
        let shifted = grid.forward(c).unwrap();
        let back = grid.inverse(shifted).unwrap();
        assert!((back.x - c.x).abs() < 1e-12);
        assert!((back.y - c.y).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_bad_dimensions() {
        assert!(ShiftGrid::new("bad", 1, 2, 0.0, 0.0, 1.0, 1.0, 2, 2, vec![0.0; 3], vec![0.0; 4], 1.0)
            .is_none());
    }
}
