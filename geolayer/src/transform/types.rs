//! Coordinate value types shared by the transform engine and its callers.

use serde::{Deserialize, Serialize};

use super::TransformError;

/// A position in some CRS.
///
/// Geographic systems store longitude in `x` and latitude in `y`, both in
/// degrees. Projected systems store easting/northing in metres. `z` is the
/// ellipsoidal height in metres and is carried through every step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Coordinate {
    /// Creates a 2D coordinate with zero height.
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, z: 0.0 }
    }

    /// Creates a coordinate with an explicit height.
    pub fn with_height(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Returns an error if any component is NaN or infinite.
    pub fn ensure_finite(&self) -> Result<(), TransformError> {
        if self.x.is_finite() && self.y.is_finite() && self.z.is_finite() {
            Ok(())
        } else {
            Err(TransformError::InvalidCoordinate(format!(
                "non-finite component in ({}, {}, {})",
                self.x, self.y, self.z
            )))
        }
    }
}

/// A point in a named CRS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub crs: u32,
    pub coord: Coordinate,
}

impl GeoPoint {
    pub fn new(crs: u32, x: f64, y: f64) -> Self {
        Self {
            crs,
            coord: Coordinate::new(x, y),
        }
    }
}

/// An axis-aligned extent in a named CRS.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub crs: u32,
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(crs: u32, min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            crs,
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> Coordinate {
        Coordinate::new(
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }

    /// True when the extent has positive area and finite corners.
    pub fn is_valid(&self) -> bool {
        [self.min_x, self.min_y, self.max_x, self.max_y]
            .iter()
            .all(|v| v.is_finite())
            && self.max_x > self.min_x
            && self.max_y > self.min_y
    }

    /// Samples `per_edge` points along each edge (corners included).
    pub fn densify(&self, per_edge: usize) -> Vec<Coordinate> {
        let n = per_edge.max(2);
        let mut points = Vec::with_capacity(n * 4);
        for i in 0..n {
            let t = i as f64 / (n - 1) as f64;
            let x = self.min_x + t * self.width();
            let y = self.min_y + t * self.height();
            points.push(Coordinate::new(x, self.min_y));
            points.push(Coordinate::new(x, self.max_y));
            points.push(Coordinate::new(self.min_x, y));
            points.push(Coordinate::new(self.max_x, y));
        }
        points
    }
}

/// The result of transforming a single point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformedPoint {
    pub coord: Coordinate,
    /// Estimated positional error of the result in metres.
    pub error_m: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_finite_rejects_nan() {
        assert!(Coordinate::new(f64::NAN, 0.0).ensure_finite().is_err());
        assert!(Coordinate::new(1.0, 2.0).ensure_finite().is_ok());
    }

    #[test]
    fn test_densify_includes_corners() {
        let bbox = BoundingBox::new(4326, 0.0, 0.0, 10.0, 5.0);
        let pts = bbox.densify(5);
        assert_eq!(pts.len(), 20);
        assert!(pts.contains(&Coordinate::new(0.0, 0.0)));
        assert!(pts.contains(&Coordinate::new(10.0, 5.0)));
    }

    #[test]
    fn test_bbox_validity() {
        assert!(BoundingBox::new(4326, 0.0, 0.0, 1.0, 1.0).is_valid());
        assert!(!BoundingBox::new(4326, 1.0, 0.0, 1.0, 1.0).is_valid());
    }
}
