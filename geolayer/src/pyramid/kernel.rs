//! Resampling kernels and separable resampling.
//!
//! Resampling runs as two passes, horizontal then vertical, accumulating in
//! `f64` in row-major order with normalised weights. The order of every sum
//! is fixed, so identical inputs always produce identical output bytes.

use std::f64::consts::PI;
use std::fmt;
use std::ops::Range;

use crate::store::{PixelBuffer, PixelLayout};

/// Lobes used when `quality = high`.
pub const HIGH_QUALITY_LANCZOS_LOBES: u32 = 3;

/// Reconstruction filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Kernel {
    /// Area average.
    Box,
    /// Triangle filter.
    #[default]
    Bilinear,
    /// Windowed sinc with `n` lobes.
    Lanczos(u32),
}

impl Kernel {
    /// Kernel for a configured name and quality. `quality = high` selects
    /// Lanczos-3 regardless of name.
    pub fn from_config(name: &str, quality: &str) -> Option<Self> {
        if quality.eq_ignore_ascii_case("high") {
            return Some(Kernel::Lanczos(HIGH_QUALITY_LANCZOS_LOBES));
        }
        match name.to_ascii_lowercase().as_str() {
            "box" | "average" => Some(Kernel::Box),
            "bilinear" | "triangle" => Some(Kernel::Bilinear),
            "lanczos" | "lanczos3" => Some(Kernel::Lanczos(3)),
            "lanczos2" => Some(Kernel::Lanczos(2)),
            _ => None,
        }
    }

    /// Support radius in output-pixel units.
    pub fn support(&self) -> f64 {
        match self {
            Kernel::Box => 0.5,
            Kernel::Bilinear => 1.0,
            Kernel::Lanczos(n) => (*n).max(1) as f64,
        }
    }

    /// Weight at distance `t`, in output-pixel units.
    pub fn weight(&self, t: f64) -> f64 {
        match self {
            Kernel::Box => {
                if (-0.5..0.5).contains(&t) {
                    1.0
                } else {
                    0.0
                }
            }
            Kernel::Bilinear => (1.0 - t.abs()).max(0.0),
            Kernel::Lanczos(n) => {
                let n = (*n).max(1) as f64;
                if t.abs() >= n {
                    0.0
                } else {
                    sinc(t) * sinc(t / n)
                }
            }
        }
    }

    /// Support radius in source pixels for a reduction by `scale`.
    pub fn source_radius(&self, scale: f64) -> f64 {
        self.support() * scale.max(1.0)
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kernel::Box => write!(f, "box"),
            Kernel::Bilinear => write!(f, "bilinear"),
            Kernel::Lanczos(n) => write!(f, "lanczos{}", n),
        }
    }
}

fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else {
        let px = PI * x;
        px.sin() / px
    }
}

/// Weights of one output sample over a contiguous run of source samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Contribution {
    /// First source index (absolute, already clamped to the axis).
    pub start: usize,
    pub weights: Vec<f64>,
}

impl Contribution {
    pub fn end(&self) -> usize {
        self.start + self.weights.len()
    }
}

/// Contributions along one axis for output indices `outputs`, mapping an
/// axis of `src_len` samples onto `dst_len`. Samples past the border are
/// clamped to the edge.
pub fn axis_contributions(
    kernel: Kernel,
    src_len: u64,
    dst_len: u64,
    outputs: Range<u64>,
) -> Vec<Contribution> {
    let scale = src_len as f64 / dst_len as f64;
    let filter_scale = scale.max(1.0);
    let radius = kernel.source_radius(scale);
    let last = src_len.saturating_sub(1) as i64;

    outputs
        .map(|u| {
            let center = (u as f64 + 0.5) * scale - 0.5;
            let raw_lo = (center - radius).floor() as i64;
            let raw_hi = (center + radius).ceil() as i64;
            let mut lo = raw_lo.clamp(0, last);
            let mut hi = raw_hi.clamp(0, last);

            let mut weights = vec![0.0; (hi - lo + 1) as usize];
            for i in raw_lo..=raw_hi {
                let w = kernel.weight((i as f64 - center) / filter_scale);
                if w != 0.0 {
                    weights[(i.clamp(0, last) - lo) as usize] += w;
                }
            }
            if let (Some(first), Some(end)) = (
                weights.iter().position(|w| *w != 0.0),
                weights.iter().rposition(|w| *w != 0.0),
            ) {
                weights = weights[first..=end].to_vec();
                lo += first as i64;
                hi = lo + end as i64 - first as i64;
            }

            let sum: f64 = weights.iter().sum();
            if sum.abs() > f64::EPSILON {
                for w in &mut weights {
                    *w /= sum;
                }
            } else {
                // Degenerate support: nearest sample.
                weights.iter_mut().for_each(|w| *w = 0.0);
                let nearest = (center.round() as i64).clamp(lo, hi);
                weights[(nearest - lo) as usize] = 1.0;
            }

            Contribution {
                start: lo as usize,
                weights,
            }
        })
        .collect()
}

/// Source span covered by a set of contributions.
pub fn span(contributions: &[Contribution]) -> Range<usize> {
    let start = contributions.iter().map(|c| c.start).min().unwrap_or(0);
    let end = contributions.iter().map(|c| c.end()).max().unwrap_or(0);
    start..end
}

/// Resamples `window` into an `out_width` x `out_height` buffer.
///
/// `window` holds source samples starting at absolute column `col_origin`
/// and row `row_origin`; contributions index absolute source positions.
/// Output cells beyond `cols.len()` / `rows.len()` stay zero.
pub fn resample(
    window: &PixelBuffer,
    col_origin: usize,
    row_origin: usize,
    cols: &[Contribution],
    rows: &[Contribution],
    out_width: u32,
    out_height: u32,
) -> PixelBuffer {
    let layout: PixelLayout = window.layout();
    let spp = layout.samples_per_pixel as usize;
    let in_h = window.height() as usize;

    // Horizontal pass: every window row, output columns.
    let mid_w = cols.len();
    let mut mid = vec![0.0f64; in_h * mid_w * spp];
    for y in 0..in_h {
        for (ox, c) in cols.iter().enumerate() {
            for s in 0..spp {
                let mut acc = 0.0;
                for (k, w) in c.weights.iter().enumerate() {
                    let x = c.start + k - col_origin;
                    acc += w * window.sample(x as u32, y as u32, s);
                }
                mid[(y * mid_w + ox) * spp + s] = acc;
            }
        }
    }

    // Vertical pass.
    let mut out = PixelBuffer::zeroed(out_width, out_height, layout);
    for (oy, r) in rows.iter().enumerate() {
        for ox in 0..mid_w {
            for s in 0..spp {
                let mut acc = 0.0;
                for (k, w) in r.weights.iter().enumerate() {
                    let y = r.start + k - row_origin;
                    acc += w * mid[(y * mid_w + ox) * spp + s];
                }
                out.set_sample(ox as u32, oy as u32, s, acc);
            }
        }
    }
    out
}
