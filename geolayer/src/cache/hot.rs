//! Hot tier: decoded tiles in memory, byte-bounded LRU.
//!
//! Recency is a monotonically increasing tick; the tick → key map gives the
//! least recently used entry in `O(log n)`. Evicted entries are handed back
//! to the caller, which decides whether they are demoted or dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use super::types::EntryMeta;
use crate::store::{Tile, TileKey};

/// An entry removed from the hot tier to make room.
#[derive(Debug, Clone)]
pub struct HotEviction {
    pub key: TileKey,
    pub tile: Arc<Tile>,
    pub meta: EntryMeta,
}

struct HotEntry {
    tile: Arc<Tile>,
    meta: EntryMeta,
    tick: u64,
}

#[derive(Default)]
struct HotInner {
    entries: HashMap<TileKey, HotEntry>,
    recency: BTreeMap<u64, TileKey>,
    next_tick: u64,
    bytes: u64,
}

impl HotInner {
    fn touch(&mut self, key: TileKey) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        self.recency.insert(tick, key);
        tick
    }

    fn take(&mut self, key: &TileKey) -> Option<HotEntry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        self.bytes -= entry.meta.byte_size;
        Some(entry)
    }
}

/// Byte-bounded LRU of decoded tiles.
pub struct HotTier {
    capacity: u64,
    inner: Mutex<HotInner>,
}

impl HotTier {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity: capacity_bytes,
            inner: Mutex::new(HotInner::default()),
        }
    }

    /// Looks up `key`, marking it most recently used and counting the access.
    pub fn get(&self, key: &TileKey) -> Option<Arc<Tile>> {
        let mut inner = self.inner.lock();
        let old_tick = inner.entries.get(key)?.tick;
        inner.recency.remove(&old_tick);
        let tick = inner.touch(*key);
        let entry = inner.entries.get_mut(key)?;
        entry.tick = tick;
        entry.meta.access_count += 1;
        Some(Arc::clone(&entry.tile))
    }

    /// Inserts or replaces `key`, then evicts least recently used entries
    /// until the tier fits its budget. The new entry itself is evicted when
    /// it alone exceeds the budget.
    pub fn insert(&self, key: TileKey, tile: Arc<Tile>, access_count: u64) -> Vec<HotEviction> {
        let byte_size = tile.byte_size() as u64;
        let mut inner = self.inner.lock();
        inner.take(&key);

        let tick = inner.touch(key);
        inner.bytes += byte_size;
        inner.entries.insert(
            key,
            HotEntry {
                tile,
                meta: EntryMeta {
                    access_count,
                    byte_size,
                },
                tick,
            },
        );

        let mut evicted = Vec::new();
        while inner.bytes > self.capacity {
            let Some((_, victim)) = inner.recency.pop_first() else {
                break;
            };
            if let Some(entry) = inner.entries.remove(&victim) {
                inner.bytes -= entry.meta.byte_size;
                evicted.push(HotEviction {
                    key: victim,
                    tile: entry.tile,
                    meta: entry.meta,
                });
            }
        }
        evicted
    }

    /// Removes `key`, returning its tile and bookkeeping.
    pub fn remove(&self, key: &TileKey) -> Option<(Arc<Tile>, EntryMeta)> {
        self.inner.lock().take(key).map(|e| (e.tile, e.meta))
    }

    pub fn contains(&self, key: &TileKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    pub fn meta(&self, key: &TileKey) -> Option<EntryMeta> {
        self.inner.lock().entries.get(key).map(|e| e.meta)
    }

    /// Keys from least to most recently used.
    pub fn keys(&self) -> Vec<TileKey> {
        self.inner.lock().recency.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> u64 {
        self.inner.lock().bytes
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{PixelBuffer, PixelLayout};

    fn tile(x: u32) -> Arc<Tile> {
        Arc::new(Tile::new(
            TileKey::new(0, x, 0),
            PixelBuffer::zeroed(8, 8, PixelLayout::gray8()),
        ))
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let hot = HotTier::new(64 * 3);
        for x in 0..3 {
            assert!(hot.insert(TileKey::new(0, x, 0), tile(x), 1).is_empty());
        }
        hot.get(&TileKey::new(0, 0, 0));

        let evicted = hot.insert(TileKey::new(0, 3, 0), tile(3), 1);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, TileKey::new(0, 1, 0));
        assert_eq!(hot.bytes(), 64 * 3);
        assert_eq!(
            hot.keys(),
            vec![
                TileKey::new(0, 2, 0),
                TileKey::new(0, 0, 0),
                TileKey::new(0, 3, 0)
            ]
        );
    }

    #[test]
    fn test_get_counts_accesses() {
        let hot = HotTier::new(1024);
        let key = TileKey::new(1, 2, 3);
        hot.insert(key, tile(2), 1);
        hot.get(&key);
        hot.get(&key);
        assert_eq!(hot.meta(&key).map(|m| m.access_count), Some(3));
    }

    #[test]
    fn test_replace_keeps_byte_accounting() {
        let hot = HotTier::new(1024);
        let key = TileKey::new(0, 0, 0);
        hot.insert(key, tile(0), 1);
        hot.insert(key, tile(0), 1);
        assert_eq!(hot.len(), 1);
        assert_eq!(hot.bytes(), 64);
        assert!(hot.remove(&key).is_some());
        assert_eq!(hot.bytes(), 0);
        assert!(hot.is_empty());
    }

    #[test]
    fn test_oversized_entry_is_evicted_immediately() {
        let hot = HotTier::new(32);
        let evicted = hot.insert(TileKey::new(0, 0, 0), tile(0), 1);
        assert_eq!(evicted.len(), 1);
        assert!(hot.is_empty());
    }
}
