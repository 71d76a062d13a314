//! Priority queue for tile work.
//!
//! Items are ordered by priority (higher values first), then by enqueue
//! order (FIFO within the same priority level).
//!
//! # Example
//!
//! ```ignore
//! use geolayer::executor::{PriorityQueue, Priority};
//!
//! let mut queue = PriorityQueue::new();
//! queue.push(prefetch_key, Priority::PREFETCH);
//! queue.push(viewport_key, Priority::VIEWPORT);
//!
//! assert_eq!(queue.pop().unwrap().priority, Priority::VIEWPORT);
//! ```

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use super::policy::Priority;

/// An item waiting in a [`PriorityQueue`].
#[derive(Debug)]
pub struct QueuedItem<T> {
    pub item: T,
    pub priority: Priority,
    /// Sequence number for FIFO ordering within a priority level.
    sequence: u64,
    pub enqueued_at: Instant,
}

impl<T> QueuedItem<T> {
    /// How long the item has been waiting.
    pub fn wait_time(&self) -> std::time::Duration {
        self.enqueued_at.elapsed()
    }
}

// Ordering for BinaryHeap: higher priority first, then lower sequence first
impl<T> PartialEq for QueuedItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl<T> Eq for QueuedItem<T> {}

impl<T> PartialOrd for QueuedItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for QueuedItem<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            other_ordering => other_ordering,
        }
    }
}

/// Max-priority queue with FIFO tie-breaking.
///
/// Not thread-safe; callers wrap it in a mutex when sharing.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    heap: BinaryHeap<QueuedItem<T>>,
    next_sequence: u64,
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_sequence: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            next_sequence: 0,
        }
    }

    pub fn push(&mut self, item: T, priority: Priority) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(QueuedItem {
            item,
            priority,
            sequence,
            enqueued_at: Instant::now(),
        });
    }

    /// Removes and returns the highest-priority item.
    pub fn pop(&mut self) -> Option<QueuedItem<T>> {
        self.heap.pop()
    }

    pub fn peek(&self) -> Option<&QueuedItem<T>> {
        self.heap.peek()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Keeps only the items for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        self.heap.retain(|queued| keep(&queued.item));
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewport_before_likely_before_unlikely() {
        let mut queue = PriorityQueue::new();
        queue.push("unlikely", Priority::for_prediction(0.1));
        queue.push("likely", Priority::for_prediction(0.9));
        queue.push("viewport", Priority::VIEWPORT);

        assert_eq!(queue.pop().unwrap().item, "viewport");
        assert_eq!(queue.pop().unwrap().item, "likely");
        assert_eq!(queue.pop().unwrap().item, "unlikely");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn fifo_among_equal_priorities() {
        let mut queue = PriorityQueue::new();
        for i in 0..5 {
            queue.push(i, Priority::PREFETCH);
        }
        let order: Vec<_> = std::iter::from_fn(|| queue.pop().map(|q| q.item)).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn retain_drops_filtered_items() {
        let mut queue = PriorityQueue::new();
        for i in 0..10 {
            queue.push(i, Priority(i));
        }
        queue.retain(|i| i % 2 == 0);
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.peek().unwrap().item, 8);
    }
}
