//! Scheduling primitives shared by the store, the pyramid builder and the
//! loader: retry/priority policies, a priority queue and concurrency limiters.

mod limiter;
mod policy;
mod queue;

pub use limiter::{
    LimiterPermit, PriorityLimiter, RequestPriority, DEFAULT_NETWORK_CONCURRENCY,
    DEFAULT_PREFETCH_RESERVE_PERCENT, DEFAULT_PRIORITY_RESERVE_PERCENT,
};
pub use policy::{
    Priority, RetryPolicy, DEFAULT_BASE_DELAY, DEFAULT_DELAY_CAP, PRIORITY_PREFETCH,
    PRIORITY_VIEWPORT,
};
pub use queue::{PriorityQueue, QueuedItem};
