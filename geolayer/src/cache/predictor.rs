//! Access prediction for prefetch and promotion.
//!
//! [`NeighborhoodPredictor`] scores candidates around the tile just stored:
//!
//! ```text
//!   0.4  0.6  0.4        edge neighbours      0.6
//!   0.6   *   0.6        diagonal neighbours  0.4
//!   0.4  0.6  0.4        parent (coarser)     0.3
//! ```
//!
//! plus a frequency boost (`0.3 * hits / max_hits` over recent history) and
//! a motion boost (`0.2`) for candidates in the direction of travel between
//! the last two accesses on the same level.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use super::types::AccessPrediction;
use crate::store::TileKey;

/// Number of recent accesses remembered.
pub const HISTORY_CAPACITY: usize = 256;

const EDGE_SCORE: f64 = 0.6;
const DIAGONAL_SCORE: f64 = 0.4;
const PARENT_SCORE: f64 = 0.3;
const FREQUENCY_BOOST: f64 = 0.3;
const MOTION_BOOST: f64 = 0.2;

/// Strategy deciding which tiles are likely to be requested next.
pub trait AccessPredictor: Send + Sync {
    /// Records that `key` was requested.
    fn record_access(&self, key: TileKey);

    /// Likelihood that `key` is requested again soon, in `[0, 1]`.
    fn probability(&self, key: TileKey) -> f64;

    /// Up to `limit` related keys, most likely first.
    fn predict(&self, key: TileKey, limit: usize) -> Vec<AccessPrediction>;

    fn name(&self) -> &'static str;
}

/// Predicts nothing. Used when prefetch is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledPredictor;

impl AccessPredictor for DisabledPredictor {
    fn record_access(&self, _key: TileKey) {}

    fn probability(&self, _key: TileKey) -> f64 {
        0.0
    }

    fn predict(&self, _key: TileKey, _limit: usize) -> Vec<AccessPrediction> {
        Vec::new()
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

#[derive(Default)]
struct History {
    recent: VecDeque<TileKey>,
    counts: HashMap<TileKey, u32>,
}

impl History {
    fn push(&mut self, key: TileKey) {
        if self.recent.len() == HISTORY_CAPACITY {
            if let Some(old) = self.recent.pop_front() {
                if let Some(count) = self.counts.get_mut(&old) {
                    *count -= 1;
                    if *count == 0 {
                        self.counts.remove(&old);
                    }
                }
            }
        }
        self.recent.push_back(key);
        *self.counts.entry(key).or_insert(0) += 1;
    }

    fn count(&self, key: &TileKey) -> u32 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// Unit step between the last two accesses when both are on `level`.
    fn motion(&self, level: u32) -> Option<(i64, i64)> {
        let mut it = self.recent.iter().rev();
        let last = it.next()?;
        let prev = it.next()?;
        if last.level != level || prev.level != level {
            return None;
        }
        let dx = (last.x as i64 - prev.x as i64).signum();
        let dy = (last.y as i64 - prev.y as i64).signum();
        if dx == 0 && dy == 0 {
            None
        } else {
            Some((dx, dy))
        }
    }
}

/// Spatial neighbourhood plus temporal frequency predictor.
#[derive(Default)]
pub struct NeighborhoodPredictor {
    history: Mutex<History>,
}

impl NeighborhoodPredictor {
    pub fn new() -> Self {
        Self::default()
    }
}

fn offset(key: TileKey, dx: i64, dy: i64) -> Option<TileKey> {
    let x = u32::try_from(key.x as i64 + dx).ok()?;
    let y = u32::try_from(key.y as i64 + dy).ok()?;
    Some(TileKey::new(key.level, x, y))
}

fn is_adjacent(a: TileKey, b: TileKey) -> bool {
    a.level == b.level && a.x.abs_diff(b.x) <= 1 && a.y.abs_diff(b.y) <= 1
}

impl AccessPredictor for NeighborhoodPredictor {
    fn record_access(&self, key: TileKey) {
        self.history.lock().push(key);
    }

    fn probability(&self, key: TileKey) -> f64 {
        let history = self.history.lock();
        let mut p = history.count(&key) as f64 / 4.0;
        if history.recent.back().is_some_and(|last| is_adjacent(*last, key)) {
            p += 0.4;
        }
        p.clamp(0.0, 1.0)
    }

    fn predict(&self, key: TileKey, limit: usize) -> Vec<AccessPrediction> {
        if limit == 0 {
            return Vec::new();
        }
        let history = self.history.lock();
        let max_count = history.counts.values().copied().max().unwrap_or(0);
        let motion = history.motion(key.level);

        let mut candidates: Vec<(TileKey, f64, (i64, i64))> = Vec::with_capacity(9);
        for dy in -1..=1i64 {
            for dx in -1..=1i64 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let base = if dx == 0 || dy == 0 {
                    EDGE_SCORE
                } else {
                    DIAGONAL_SCORE
                };
                if let Some(k) = offset(key, dx, dy) {
                    candidates.push((k, base, (dx, dy)));
                }
            }
        }
        candidates.push((
            TileKey::new(key.level + 1, key.x / 2, key.y / 2),
            PARENT_SCORE,
            (0, 0),
        ));

        let mut predictions: Vec<AccessPrediction> = candidates
            .into_iter()
            .map(|(k, base, (dx, dy))| {
                let mut score = base;
                if max_count > 0 {
                    score += FREQUENCY_BOOST * history.count(&k) as f64 / max_count as f64;
                }
                if let Some((mx, my)) = motion {
                    if dx * mx + dy * my > 0 {
                        score += MOTION_BOOST;
                    }
                }
                AccessPrediction {
                    key: k,
                    probability: score.min(1.0),
                }
            })
            .collect();

        predictions.sort_by(|a, b| {
            b.probability
                .total_cmp(&a.probability)
                .then_with(|| a.key.cmp(&b.key))
        });
        predictions.truncate(limit);
        predictions
    }

    fn name(&self) -> &'static str {
        "neighborhood"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edges_rank_above_diagonals_and_parent() {
        let p = NeighborhoodPredictor::new();
        let out = p.predict(TileKey::new(3, 10, 10), 9);
        assert_eq!(out.len(), 9);
        assert!(out[..4].iter().all(|a| a.probability == EDGE_SCORE));
        assert!(out[4..8].iter().all(|a| a.probability == DIAGONAL_SCORE));
        assert_eq!(out[8].key, TileKey::new(4, 5, 5));
    }

    #[test]
    fn test_grid_origin_has_no_negative_neighbours() {
        let p = NeighborhoodPredictor::new();
        let out = p.predict(TileKey::new(0, 0, 0), 16);
        // Three in-grid neighbours plus the parent.
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_motion_boosts_direction_of_travel() {
        let p = NeighborhoodPredictor::new();
        p.record_access(TileKey::new(0, 4, 5));
        p.record_access(TileKey::new(0, 5, 5));
        let out = p.predict(TileKey::new(0, 5, 5), 9);
        let score = |x, y| {
            out.iter()
                .find(|a| a.key == TileKey::new(0, x, y))
                .map(|a| a.probability)
                .unwrap()
        };
        assert!((score(6, 5) - (EDGE_SCORE + MOTION_BOOST)).abs() < 1e-12);
        assert_eq!(score(5, 6), EDGE_SCORE);
        assert!(score(6, 6) > score(4, 6));
    }

    #[test]
    fn test_frequency_boost() {
        let p = NeighborhoodPredictor::new();
        for _ in 0..3 {
            p.record_access(TileKey::new(0, 7, 8));
        }
        p.record_access(TileKey::new(5, 20, 20));
        let out = p.predict(TileKey::new(0, 7, 7), 1);
        assert_eq!(out[0].key, TileKey::new(0, 7, 8));
        assert!((out[0].probability - (EDGE_SCORE + FREQUENCY_BOOST)).abs() < 1e-12);
    }

    #[test]
    fn test_probability_grows_with_repeat_access() {
        let p = NeighborhoodPredictor::new();
        let key = TileKey::new(1, 1, 1);
        assert_eq!(p.probability(key), 0.0);
        p.record_access(key);
        assert!((p.probability(key) - 0.65).abs() < 1e-12);
        p.record_access(key);
        assert!(p.probability(key) >= 0.7);
    }

    #[test]
    fn test_history_is_bounded() {
        let p = NeighborhoodPredictor::new();
        let key = TileKey::new(0, 0, 0);
        p.record_access(key);
        for i in 0..HISTORY_CAPACITY as u32 {
            p.record_access(TileKey::new(5, i + 10, 0));
        }
        assert_eq!(p.history.lock().count(&key), 0);
        assert_eq!(p.history.lock().recent.len(), HISTORY_CAPACITY);
    }

    #[test]
    fn test_disabled_predicts_nothing() {
        let p = DisabledPredictor;
        p.record_access(TileKey::new(0, 1, 1));
        assert!(p.predict(TileKey::new(0, 1, 1), 8).is_empty());
        assert_eq!(p.probability(TileKey::new(0, 1, 1)), 0.0);
    }
}
