//! Backoff for range reads and scheduling priority for tile work.
//!
//! ```ignore
//! use geolayer::executor::{Priority, RetryPolicy};
//!
//! // Up to four attempts: waits 100ms, 200ms, 400ms between them
//! let backoff = RetryPolicy::exponential(4);
//!
//! // A likely prefetch still ranks below a viewport tile
//! assert!(Priority::for_prediction(0.9) < Priority::VIEWPORT);
//! ```

use std::fmt;
use std::time::Duration;

// =============================================================================
// Backoff Defaults
// =============================================================================

/// Wait before the second attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Upper bound on any single wait.
pub const DEFAULT_DELAY_CAP: Duration = Duration::from_secs(30);

/// How transient range-read failures are retried.
///
/// Waits double after every failed attempt, capped at `cap`. `attempts`
/// counts the first try, so `attempts == 1` never retries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    base: Duration,
    cap: Duration,
}

impl RetryPolicy {
    /// Doubling backoff from [`DEFAULT_BASE_DELAY`] with `attempts` tries.
    pub fn exponential(attempts: u32) -> Self {
        Self::with_delays(attempts, DEFAULT_BASE_DELAY, DEFAULT_DELAY_CAP)
    }

    /// Single attempt, failures surface immediately.
    pub fn none() -> Self {
        Self::exponential(1)
    }

    pub fn with_delays(attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base,
            cap,
        }
    }

    /// Wait after failed attempt `attempt` (1-based), or `None` once the
    /// attempts are spent.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.attempts {
            return None;
        }
        let shift = attempt.saturating_sub(1).min(31);
        let delay = self.base.saturating_mul(1u32 << shift);
        Some(delay.min(self.cap))
    }

    pub fn max_attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

// =============================================================================
// Priority
// =============================================================================

/// Priority of tiles inside the requested viewport.
pub const PRIORITY_VIEWPORT: i32 = 100;

/// Floor for speculative prefetch.
pub const PRIORITY_PREFETCH: i32 = 0;

/// Queue priority. Higher is served first, FIFO among equals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Priority(pub i32);

impl Priority {
    pub const VIEWPORT: Priority = Priority(PRIORITY_VIEWPORT);
    pub const PREFETCH: Priority = Priority(PRIORITY_PREFETCH);

    /// Prefetch priority scaled by predicted access probability. Always in
    /// `[PREFETCH, VIEWPORT)`.
    pub fn for_prediction(probability: f64) -> Self {
        let p = if probability.is_nan() {
            0.0
        } else {
            probability.clamp(0.0, 1.0)
        };
        let span = (PRIORITY_VIEWPORT - PRIORITY_PREFETCH - 1) as f64;
        Self(PRIORITY_PREFETCH + (p * span) as i32)
    }

    pub fn value(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::VIEWPORT => f.write_str("viewport"),
            Self(v) => write!(f, "prefetch+{}", v - PRIORITY_PREFETCH),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_attempt_never_waits() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.delay_for_attempt(1), None);
        assert_eq!(RetryPolicy::exponential(0).max_attempts(), 1);
    }

    #[test]
    fn waits_double_until_attempts_run_out() {
        let policy = RetryPolicy::exponential(4);
        let waits: Vec<_> = (1..=4).map(|a| policy.delay_for_attempt(a)).collect();
        assert_eq!(
            waits,
            vec![
                Some(Duration::from_millis(100)),
                Some(Duration::from_millis(200)),
                Some(Duration::from_millis(400)),
                None,
            ]
        );
    }

    #[test]
    fn waits_are_capped() {
        let policy =
            RetryPolicy::with_delays(40, Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(6), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_for_attempt(39), Some(Duration::from_secs(5)));
    }

    #[test]
    fn prediction_priority_stays_below_viewport() {
        assert_eq!(Priority::for_prediction(0.0), Priority::PREFETCH);
        assert_eq!(Priority::for_prediction(f64::NAN), Priority::PREFETCH);
        assert!(Priority::for_prediction(1.0) < Priority::VIEWPORT);
        assert!(Priority::for_prediction(0.8) > Priority::for_prediction(0.3));
        assert_eq!(Priority::for_prediction(7.0), Priority::for_prediction(1.0));
    }

    #[test]
    fn display_names_the_band() {
        assert_eq!(Priority::VIEWPORT.to_string(), "viewport");
        assert_eq!(Priority::for_prediction(0.5).to_string(), "prefetch+49");
    }
}
