//! Request coalescing for in-flight tile reads.
//!
//! The first caller for a key becomes the leader and performs the work;
//! concurrent callers for the same key subscribe to a broadcast channel and
//! receive the leader's result.

use std::hash::Hash;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;

/// Outcome of registering interest in a key.
pub enum CoalesceResult<V> {
    /// No read in flight: the caller must do the work and call `complete`.
    Leader,
    /// A read is already in flight; wait on the receiver.
    Coalesced(broadcast::Receiver<V>),
}

/// Deduplicates concurrent work per key.
pub struct RequestCoalescer<K, V> {
    in_flight: DashMap<K, broadcast::Sender<V>>,
}

impl<K, V> Default for RequestCoalescer<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            in_flight: DashMap::new(),
        }
    }
}

impl<K, V> RequestCoalescer<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: K) -> CoalesceResult<V> {
        match self.in_flight.entry(key) {
            Entry::Occupied(entry) => CoalesceResult::Coalesced(entry.get().subscribe()),
            Entry::Vacant(entry) => {
                let (tx, _) = broadcast::channel(1);
                entry.insert(tx);
                CoalesceResult::Leader
            }
        }
    }

    /// Publishes the leader's result and clears the key.
    pub fn complete(&self, key: &K, value: V) {
        if let Some((_, tx)) = self.in_flight.remove(key) {
            // No receivers is fine.
            let _ = tx.send(value);
        }
    }

    /// Drops the key without a result; waiters see a closed channel.
    pub fn cancel(&self, key: &K) {
        self.in_flight.remove(key);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_caller_is_coalesced() {
        let c: RequestCoalescer<u32, u64> = RequestCoalescer::new();
        assert!(matches!(c.register(1), CoalesceResult::Leader));
        let mut rx = match c.register(1) {
            CoalesceResult::Coalesced(rx) => rx,
            CoalesceResult::Leader => panic!("expected coalesced"),
        };
        c.complete(&1, 42);
        assert_eq!(rx.recv().await.unwrap(), 42);
        assert_eq!(c.in_flight(), 0);
        assert!(matches!(c.register(1), CoalesceResult::Leader));
    }

    #[tokio::test]
    async fn test_cancel_closes_waiters() {
        let c: RequestCoalescer<u32, u64> = RequestCoalescer::new();
        let _ = c.register(7);
        let mut rx = match c.register(7) {
            CoalesceResult::Coalesced(rx) => rx,
            CoalesceResult::Leader => panic!("expected coalesced"),
        };
        c.cancel(&7);
        assert!(rx.recv().await.is_err());
    }
}
