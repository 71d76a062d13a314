//! The transform engine: CRS registry, path cache and batch evaluation.

use std::sync::Arc;

use dashmap::DashMap;
use rayon::prelude::*;
use tracing::{debug, trace};

use super::crs::{Crs, CrsLookup, DatumShift, WGS84};
use super::grid::ShiftGrid;
use super::path::{ProjectionStep, TransformPath, TransformStep};
use super::types::{BoundingBox, Coordinate, TransformedPoint};
use super::TransformError;

/// Batches larger than this are evaluated on the rayon pool.
pub const PARALLEL_BATCH_THRESHOLD: usize = 1024;

/// Default number of samples per edge when transforming bounds.
pub const DEFAULT_DENSIFY_POINTS: usize = 21;

/// Result of a batch transform.
///
/// `results[i]` corresponds to input point `i`.
#[derive(Debug, Clone)]
pub struct BatchTransform {
    pub results: Vec<Result<TransformedPoint, TransformError>>,
}

impl BatchTransform {
    /// Indices and errors of the points that failed.
    pub fn failures(&self) -> Vec<(usize, &TransformError)> {
        self.results
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().err().map(|e| (i, e)))
            .collect()
    }

    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.results.iter().all(Result::is_ok)
    }
}

/// Resolves CRS codes and builds, caches and evaluates transform paths.
///
/// Create one engine per process and share it behind an `Arc`. CRS
/// definitions are loaded on first use and never change afterwards.
pub struct TransformEngine {
    dictionary: Arc<dyn CrsLookup>,
    crs_cache: DashMap<u32, Arc<Crs>>,
    grids: DashMap<(u32, u32), Arc<ShiftGrid>>,
    paths: DashMap<(u32, u32), Arc<TransformPath>>,
}

impl std::fmt::Debug for TransformEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformEngine")
            .field("loaded_crs", &self.crs_cache.len())
            .field("grids", &self.grids.len())
            .field("cached_paths", &self.paths.len())
            .finish()
    }
}

impl TransformEngine {
    pub fn new(dictionary: Arc<dyn CrsLookup>) -> Self {
        Self {
            dictionary,
            crs_cache: DashMap::new(),
            grids: DashMap::new(),
            paths: DashMap::new(),
        }
    }

    /// Registers a shift grid between two geographic systems.
    ///
    /// Cached paths touching either datum are dropped so the grid is picked
    /// up by subsequent `create_transform` calls.
    pub fn register_grid(&self, grid: ShiftGrid) {
        let key = (grid.source_crs(), grid.target_crs());
        debug!(grid = grid.name(), source = key.0, target = key.1, "Registered shift grid");
        self.grids.insert(key, Arc::new(grid));
        self.paths.clear();
    }

    /// Returns the definition for a code, loading it on first use.
    pub fn crs(&self, code: u32) -> Result<Arc<Crs>, TransformError> {
        if let Some(crs) = self.crs_cache.get(&code) {
            return Ok(crs.value().clone());
        }
        let crs = self
            .dictionary
            .lookup(code)
            .ok_or(TransformError::CrsNotFound(code))?;
        let entry = self.crs_cache.entry(code).or_insert_with(|| Arc::new(crs));
        Ok(entry.value().clone())
    }

    /// Resolves (and caches) the path from `source` to `target`.
    pub fn create_transform(
        &self,
        source: u32,
        target: u32,
    ) -> Result<Arc<TransformPath>, TransformError> {
        if let Some(path) = self.paths.get(&(source, target)) {
            return Ok(path.value().clone());
        }

        let src = self.crs(source)?;
        let tgt = self.crs(target)?;
        let path = Arc::new(self.build_path(&src, &tgt)?);
        debug!(
            source,
            target,
            steps = path.steps().len(),
            error_m = path.error_m(),
            "Built transform path"
        );

        let entry = self.paths.entry((source, target)).or_insert(path);
        Ok(entry.value().clone())
    }

    fn build_path(&self, src: &Crs, tgt: &Crs) -> Result<TransformPath, TransformError> {
        let mut steps = Vec::new();
        let mut datum_error_m = 0.0;

        if let Some(p) = ProjectionStep::for_projection(&src.projection, &src.ellipsoid) {
            steps.push(TransformStep::InverseProjection(p));
        }

        if src.base_geographic != tgt.base_geographic {
            if let Some(grid) = self.grids.get(&(src.base_geographic, tgt.base_geographic)) {
                steps.push(TransformStep::GridShift {
                    grid: grid.value().clone(),
                    inverse: false,
                });
            } else if let Some(grid) = self.grids.get(&(tgt.base_geographic, src.base_geographic))
            {
                steps.push(TransformStep::GridShift {
                    grid: grid.value().clone(),
                    inverse: true,
                });
            } else {
                let no_path = || TransformError::NoTransformPath {
                    source_code: src.code,
                    target_code: tgt.code,
                };
                datum_error_m += push_datum_step(&mut steps, src, false).ok_or_else(no_path)?;
                datum_error_m += push_datum_step(&mut steps, tgt, true).ok_or_else(no_path)?;
            }
        }

        if let Some(p) = ProjectionStep::for_projection(&tgt.projection, &tgt.ellipsoid) {
            steps.push(TransformStep::ForwardProjection(p));
        }

        Ok(TransformPath::new(
            src.code,
            tgt.code,
            src.is_geographic(),
            steps,
            datum_error_m,
        ))
    }

    /// Transforms one point. Pure and thread-safe.
    pub fn transform(
        &self,
        path: &TransformPath,
        point: Coordinate,
    ) -> Result<TransformedPoint, TransformError> {
        path.apply(point)
    }

    /// Transforms many points, preserving input order.
    ///
    /// Individual failures do not abort the batch; they are reported in place.
    pub fn transform_batch(&self, path: &TransformPath, points: &[Coordinate]) -> BatchTransform {
        let results: Vec<_> = if points.len() > PARALLEL_BATCH_THRESHOLD {
            points.par_iter().map(|p| path.apply(*p)).collect()
        } else {
            points.iter().map(|p| path.apply(*p)).collect()
        };

        let batch = BatchTransform { results };
        let failed = batch.results.len() - batch.success_count();
        if failed > 0 {
            trace!(
                source = path.source(),
                target = path.target(),
                total = points.len(),
                failed,
                "Batch transform completed with failures"
            );
        }
        batch
    }

    /// Transforms an extent by sampling its edges.
    ///
    /// Samples that fail are skipped; the call fails only if every sample
    /// fails, returning the first error.
    pub fn transform_bounds(
        &self,
        bounds: &BoundingBox,
        target: u32,
        densify: usize,
    ) -> Result<BoundingBox, TransformError> {
        if bounds.crs == target {
            return Ok(*bounds);
        }
        let path = self.create_transform(bounds.crs, target)?;
        let batch = self.transform_batch(&path, &bounds.densify(densify));

        let mut out = BoundingBox::new(target, f64::MAX, f64::MAX, f64::MIN, f64::MIN);
        let mut first_error = None;
        let mut any = false;
        for r in batch.results {
            match r {
                Ok(p) => {
                    any = true;
                    out.min_x = out.min_x.min(p.coord.x);
                    out.min_y = out.min_y.min(p.coord.y);
                    out.max_x = out.max_x.max(p.coord.x);
                    out.max_y = out.max_y.max(p.coord.y);
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if any {
            Ok(out)
        } else {
            Err(first_error.unwrap_or_else(|| {
                TransformError::InvalidCoordinate("empty bounds".to_string())
            }))
        }
    }
}

/// Appends the datum step for `crs` and returns its accuracy, or `None` when
/// the datum has no known relation to WGS 84.
fn push_datum_step(steps: &mut Vec<TransformStep>, crs: &Crs, towards_local: bool) -> Option<f64> {
    match crs.datum {
        DatumShift::Wgs84 => Some(0.0),
        DatumShift::Equivalent { accuracy_m } => Some(accuracy_m),
        DatumShift::Helmert(params) => {
            steps.push(TransformStep::Helmert {
                params,
                local: crs.ellipsoid,
                inverse: towards_local,
            });
            Some(0.0)
        }
        DatumShift::Molodensky(params) => {
            steps.push(TransformStep::Molodensky {
                params,
                local: crs.ellipsoid,
                inverse: towards_local,
            });
            Some(0.0)
        }
        DatumShift::Unknown if crs.base_geographic == WGS84 => Some(0.0),
        DatumShift::Unknown => None,
    }
}
