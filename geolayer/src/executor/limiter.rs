//! Priority-aware concurrency limiter.
//!
//! Two instances bound the crate's resource use: one sized to the CPU for
//! decode/resample work and one for concurrent network range requests.
//! Foreground requests are never starved by prefetch, and prefetch always
//! keeps a guaranteed minimum.
//!
//! # Design
//!
//! ```text
//! Total Permits: 10
//! ├── Priority Pool: 4 (40%) - foreground only
//! ├── Shared Pool:   4 (40%) - foreground and prefetch
//! └── Prefetch Pool: 2 (20%) - prefetch only (guaranteed minimum)
//!
//! Foreground: priority + shared, waits on priority pool
//! Prefetch:   prefetch + shared, waits on prefetch pool
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default percentage of permits reserved for foreground requests.
pub const DEFAULT_PRIORITY_RESERVE_PERCENT: usize = 40;

/// Default percentage of permits reserved for prefetch requests.
pub const DEFAULT_PREFETCH_RESERVE_PERCENT: usize = 20;

/// Default number of concurrent network requests.
pub const DEFAULT_NETWORK_CONCURRENCY: usize = 4;

/// Priority level for requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPriority {
    /// A caller is waiting on the result.
    High,
    /// Background prefetch.
    Low,
}

/// Three-pool semaphore limiter.
#[derive(Debug)]
pub struct PriorityLimiter {
    priority_semaphore: Arc<Semaphore>,
    shared_semaphore: Arc<Semaphore>,
    prefetch_semaphore: Arc<Semaphore>,
    priority_permits: usize,
    shared_permits: usize,
    prefetch_permits: usize,
    high_priority_in_flight: Arc<AtomicUsize>,
    low_priority_in_flight: Arc<AtomicUsize>,
    label: String,
}

impl PriorityLimiter {
    /// Creates a limiter with `total_permits` split across the three pools.
    ///
    /// Every pool gets at least one permit, so the effective total is at
    /// least three.
    pub fn new(
        total_permits: usize,
        priority_reserve_percent: usize,
        prefetch_reserve_percent: usize,
        label: impl Into<String>,
    ) -> Self {
        let total = total_permits.max(3);
        let priority_percent = priority_reserve_percent.min(100);
        let prefetch_percent = prefetch_reserve_percent.min(100 - priority_percent);

        let mut priority_permits = ((total * priority_percent) / 100).max(1);
        let mut prefetch_permits = ((total * prefetch_percent) / 100).max(1);
        if priority_permits + prefetch_permits >= total {
            // Leave room for at least one shared permit.
            let excess = priority_permits + prefetch_permits + 1 - total;
            let from_priority = excess.min(priority_permits - 1);
            priority_permits -= from_priority;
            prefetch_permits -= (excess - from_priority).min(prefetch_permits - 1);
        }
        let shared_permits = total
            .saturating_sub(priority_permits + prefetch_permits)
            .max(1);

        let label: String = label.into();
        tracing::info!(
            total = priority_permits + shared_permits + prefetch_permits,
            priority = priority_permits,
            shared = shared_permits,
            prefetch = prefetch_permits,
            label = %label,
            "Created concurrency limiter with three pools"
        );

        Self {
            priority_semaphore: Arc::new(Semaphore::new(priority_permits)),
            shared_semaphore: Arc::new(Semaphore::new(shared_permits)),
            prefetch_semaphore: Arc::new(Semaphore::new(prefetch_permits)),
            priority_permits,
            shared_permits,
            prefetch_permits,
            high_priority_in_flight: Arc::new(AtomicUsize::new(0)),
            low_priority_in_flight: Arc::new(AtomicUsize::new(0)),
            label,
        }
    }

    /// Limiter with `total` permits and the default reserves.
    pub fn with_total(total: usize, label: impl Into<String>) -> Self {
        Self::new(
            total,
            DEFAULT_PRIORITY_RESERVE_PERCENT,
            DEFAULT_PREFETCH_RESERVE_PERCENT,
            label,
        )
    }

    /// Limiter for CPU-bound work sized to the available parallelism.
    pub fn for_cpu(label: impl Into<String>) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4);
        Self::with_total(cpus, label)
    }

    /// Acquires a permit, waiting if necessary.
    ///
    /// Returns `None` only if the limiter's semaphores were closed.
    pub async fn acquire(&self, priority: RequestPriority) -> Option<LimiterPermit> {
        let (own, in_flight) = match priority {
            RequestPriority::High => (&self.priority_semaphore, &self.high_priority_in_flight),
            RequestPriority::Low => (&self.prefetch_semaphore, &self.low_priority_in_flight),
        };

        // Fast paths: dedicated pool, then shared pool.
        let permit = match Arc::clone(own).try_acquire_owned() {
            Ok(p) => p,
            Err(_) => match Arc::clone(&self.shared_semaphore).try_acquire_owned() {
                Ok(p) => p,
                Err(_) => Arc::clone(own).acquire_owned().await.ok()?,
            },
        };

        in_flight.fetch_add(1, Ordering::Relaxed);
        Some(LimiterPermit {
            _permit: permit,
            in_flight: Arc::clone(in_flight),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn total_permits(&self) -> usize {
        self.priority_permits + self.shared_permits + self.prefetch_permits
    }

    pub fn priority_permits(&self) -> usize {
        self.priority_permits
    }

    pub fn shared_permits(&self) -> usize {
        self.shared_permits
    }

    pub fn prefetch_permits(&self) -> usize {
        self.prefetch_permits
    }

    pub fn high_priority_in_flight(&self) -> usize {
        self.high_priority_in_flight.load(Ordering::Relaxed)
    }

    pub fn low_priority_in_flight(&self) -> usize {
        self.low_priority_in_flight.load(Ordering::Relaxed)
    }
}

/// A permit from a [`PriorityLimiter`], released on drop.
#[derive(Debug)]
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pool_split() {
        let limiter = PriorityLimiter::new(20, 40, 20, "test");
        assert_eq!(limiter.total_permits(), 20);
        assert_eq!(limiter.priority_permits(), 8);
        assert_eq!(limiter.prefetch_permits(), 4);
        assert_eq!(limiter.shared_permits(), 8);
    }

    #[test]
    fn test_small_limiter_keeps_every_pool() {
        let limiter = PriorityLimiter::new(1, 40, 20, "tiny");
        assert!(limiter.priority_permits() >= 1);
        assert!(limiter.shared_permits() >= 1);
        assert!(limiter.prefetch_permits() >= 1);
        assert_eq!(limiter.total_permits(), 3);
    }

    #[test]
    fn test_reserves_leave_shared_pool() {
        let limiter = PriorityLimiter::new(5, 60, 40, "test");
        assert!(limiter.shared_permits() >= 1);
        assert_eq!(limiter.total_permits(), 5);
    }

    #[tokio::test]
    async fn test_in_flight_tracking() {
        let limiter = PriorityLimiter::new(10, 40, 20, "test");
        let a = limiter.acquire(RequestPriority::High).await.unwrap();
        let b = limiter.acquire(RequestPriority::Low).await.unwrap();
        assert_eq!(limiter.high_priority_in_flight(), 1);
        assert_eq!(limiter.low_priority_in_flight(), 1);
        drop(a);
        drop(b);
        assert_eq!(limiter.high_priority_in_flight(), 0);
        assert_eq!(limiter.low_priority_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_prefetch_cannot_starve_foreground() {
        let limiter = PriorityLimiter::new(10, 40, 20, "test");
        let mut low = Vec::new();
        for _ in 0..(limiter.prefetch_permits() + limiter.shared_permits()) {
            low.push(limiter.acquire(RequestPriority::Low).await.unwrap());
        }

        // Foreground still gets a permit immediately from its own pool.
        let high = tokio::time::timeout(
            Duration::from_millis(100),
            limiter.acquire(RequestPriority::High),
        )
        .await
        .expect("foreground should not wait");
        assert!(high.is_some());
    }
}
