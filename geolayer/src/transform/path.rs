//! Transform paths: ordered chains of steps between two systems.

use std::sync::Arc;

use super::crs::{Ellipsoid, HelmertParams, MolodenskyParams, Projection};
use super::datum;
use super::grid::ShiftGrid;
use super::projection::{web_mercator_forward, web_mercator_inverse, TransverseMercator};
use super::types::{Coordinate, TransformedPoint};
use super::TransformError;

/// Accuracy attributed to pure projection arithmetic.
const PROJECTION_ERROR_M: f64 = 0.001;

/// One operation in a transform path.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformStep {
    /// Projected metres to geographic degrees.
    InverseProjection(ProjectionStep),
    /// Geographic degrees to projected metres.
    ForwardProjection(ProjectionStep),
    Helmert {
        params: HelmertParams,
        local: Ellipsoid,
        /// `false` maps local to WGS 84.
        inverse: bool,
    },
    Molodensky {
        params: MolodenskyParams,
        local: Ellipsoid,
        inverse: bool,
    },
    GridShift {
        grid: Arc<ShiftGrid>,
        inverse: bool,
    },
}

/// A projection bound to its ellipsoid with any series precomputed.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionStep {
    WebMercator(Ellipsoid),
    TransverseMercator(TransverseMercator),
}

impl ProjectionStep {
    /// Returns `None` for geographic systems, which need no projection step.
    pub fn for_projection(projection: &Projection, ellipsoid: &Ellipsoid) -> Option<Self> {
        match projection {
            Projection::Geographic => None,
            Projection::WebMercator => Some(Self::WebMercator(*ellipsoid)),
            Projection::TransverseMercator(params) => Some(Self::TransverseMercator(
                TransverseMercator::new(ellipsoid, *params),
            )),
        }
    }
}

impl TransformStep {
    /// Estimated error contributed by this step, in metres.
    pub fn error_m(&self) -> f64 {
        match self {
            Self::InverseProjection(_) | Self::ForwardProjection(_) => PROJECTION_ERROR_M,
            Self::Helmert { params, .. } => params.accuracy_m,
            Self::Molodensky { params, .. } => params.accuracy_m,
            Self::GridShift { grid, .. } => grid.accuracy_m(),
        }
    }

    pub fn apply(&self, c: Coordinate) -> Result<Coordinate, TransformError> {
        match self {
            Self::InverseProjection(ProjectionStep::WebMercator(e)) => {
                let (lon, lat) = web_mercator_inverse(e, c.x, c.y);
                Ok(Coordinate::with_height(lon, lat, c.z))
            }
            Self::InverseProjection(ProjectionStep::TransverseMercator(tm)) => {
                let (lon, lat) = tm.inverse(c.x, c.y)?;
                Ok(Coordinate::with_height(lon, lat, c.z))
            }
            Self::ForwardProjection(ProjectionStep::WebMercator(e)) => {
                let (x, y) = web_mercator_forward(e, c.x, c.y);
                Ok(Coordinate::with_height(x, y, c.z))
            }
            Self::ForwardProjection(ProjectionStep::TransverseMercator(tm)) => {
                let (x, y) = tm.forward(c.x, c.y)?;
                Ok(Coordinate::with_height(x, y, c.z))
            }
            Self::Helmert {
                params,
                local,
                inverse,
            } => Ok(datum::helmert(params, local, *inverse, c)),
            Self::Molodensky {
                params,
                local,
                inverse,
            } => Ok(datum::molodensky(params, local, *inverse, c)),
            Self::GridShift { grid, inverse } => {
                if *inverse {
                    grid.inverse(c)
                } else {
                    grid.forward(c)
                }
            }
        }
    }
}

/// A resolved chain of steps from one CRS to another.
///
/// Paths are immutable and shared between threads via `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformPath {
    source: u32,
    target: u32,
    source_geographic: bool,
    steps: Vec<TransformStep>,
    error_m: f64,
}

impl TransformPath {
    pub(crate) fn new(
        source: u32,
        target: u32,
        source_geographic: bool,
        steps: Vec<TransformStep>,
        datum_error_m: f64,
    ) -> Self {
        let error_m = steps.iter().map(TransformStep::error_m).sum::<f64>() + datum_error_m;
        Self {
            source,
            target,
            source_geographic,
            steps,
            error_m,
        }
    }

    pub fn source(&self) -> u32 {
        self.source
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    pub fn steps(&self) -> &[TransformStep] {
        &self.steps
    }

    /// Sum of the accuracies of every step.
    pub fn error_m(&self) -> f64 {
        self.error_m
    }

    /// True when the path has no steps (same datum, same projection).
    pub fn is_identity(&self) -> bool {
        self.steps.is_empty()
    }

    /// Evaluates the path for one point.
    pub fn apply(&self, c: Coordinate) -> Result<TransformedPoint, TransformError> {
        c.ensure_finite()?;
        if self.source_geographic && c.y.abs() > 90.0 {
            return Err(TransformError::InvalidCoordinate(format!(
                "latitude {} out of range",
                c.y
            )));
        }

        let mut current = c;
        for step in &self.steps {
            current = step.apply(current)?;
        }
        current.ensure_finite()?;

        Ok(TransformedPoint {
            coord: current,
            error_m: self.error_m,
        })
    }
}
