//! Warm tier: serialised tiles on local disk.
//!
//! Each dataset gets its own directory named by a SHA-256 prefix of its id.
//! A weighted `moka` index tracks resident files and enforces the byte
//! budget; files are never deleted inline. The index's eviction listener
//! posts a [`TierMessage::Delete`] to the tier worker instead.
//!
//! File names carry a generation number, so a deletion queued for an old
//! entry can never remove the file of a newer entry for the same key.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::types::{EntryMeta, TierMessage};
use super::CacheError;
use crate::store::{Tile, TileKey};

#[derive(Debug, Clone)]
struct WarmSlot {
    path: PathBuf,
    meta: EntryMeta,
}

/// Byte-bounded on-disk tile store.
pub struct WarmTier {
    dir: PathBuf,
    index: Cache<TileKey, WarmSlot>,
    generation: AtomicU64,
    capacity: u64,
}

/// Directory name for a dataset's warm files.
pub fn namespace(dataset_id: &str) -> String {
    let digest = Sha256::digest(dataset_id.as_bytes());
    format!("{:x}", digest)[..16].to_string()
}

impl WarmTier {
    /// Opens the warm directory for `dataset_id` under `base`.
    ///
    /// The index lives in memory, so files left by an earlier process are
    /// removed.
    pub(crate) async fn open(
        base: &Path,
        dataset_id: &str,
        capacity_bytes: u64,
        events: mpsc::UnboundedSender<TierMessage>,
    ) -> Result<Self, CacheError> {
        let dir = base.join(namespace(dataset_id));
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        tokio::fs::create_dir_all(&dir).await?;
        debug!(dataset = dataset_id, dir = %dir.display(), capacity_bytes, "Warm tier opened");

        let index = Cache::builder()
            .weigher(|_key: &TileKey, slot: &WarmSlot| -> u32 {
                slot.meta.byte_size.min(u32::MAX as u64) as u32
            })
            .max_capacity(capacity_bytes)
            .eviction_policy(EvictionPolicy::lru())
            .eviction_listener(move |key: Arc<TileKey>, slot: WarmSlot, cause: RemovalCause| {
                let _ = events.send(TierMessage::Delete {
                    key: *key,
                    path: slot.path,
                    evicted: cause.was_evicted(),
                });
            })
            .build();

        Ok(Self {
            dir,
            index,
            generation: AtomicU64::new(0),
            capacity: capacity_bytes,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, key: TileKey) -> PathBuf {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        self.dir
            .join(format!("{}_{}_{}_{}.bin", key.level, key.x, key.y, generation))
    }

    /// Writes `tile` and indexes it. Returns the stored size.
    pub async fn insert(
        &self,
        key: TileKey,
        tile: &Tile,
        access_count: u64,
    ) -> Result<u64, CacheError> {
        let bytes = bincode::serialize(&(tile, access_count))?;
        let byte_size = bytes.len() as u64;
        let path = self.file_for(key);
        tokio::fs::write(&path, bytes).await?;

        self.index
            .insert(
                key,
                WarmSlot {
                    path,
                    meta: EntryMeta {
                        access_count,
                        byte_size,
                    },
                },
            )
            .await;
        self.index.run_pending_tasks().await;
        Ok(byte_size)
    }

    /// Reads `key`. A file that cannot be read or decoded is dropped from
    /// the index and reported as a miss.
    pub async fn get(&self, key: &TileKey) -> Option<(Tile, EntryMeta)> {
        let slot = self.index.get(key).await?;
        let loaded = match tokio::fs::read(&slot.path).await {
            Ok(bytes) => bincode::deserialize::<(Tile, u64)>(&bytes).map_err(CacheError::from),
            Err(e) => Err(CacheError::from(e)),
        };
        match loaded {
            Ok((tile, access_count)) => Some((
                tile,
                EntryMeta {
                    access_count: access_count.max(slot.meta.access_count),
                    byte_size: slot.meta.byte_size,
                },
            )),
            Err(e) => {
                warn!(tile = %key, path = %slot.path.display(), error = %e, "Dropping unreadable warm entry");
                self.index.invalidate(key).await;
                None
            }
        }
    }

    pub async fn remove(&self, key: &TileKey) {
        self.index.invalidate(key).await;
    }

    pub fn contains(&self, key: &TileKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn keys(&self) -> Vec<TileKey> {
        self.index.iter().map(|(k, _)| *k).collect()
    }

    /// Applies pending index maintenance, firing eviction listeners.
    pub async fn sync(&self) {
        self.index.run_pending_tasks().await;
    }

    pub fn entry_count(&self) -> u64 {
        self.index.entry_count()
    }

    pub fn bytes(&self) -> u64 {
        self.index.weighted_size()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{PixelBuffer, PixelLayout};

    fn tile(key: TileKey, fill: u8) -> Tile {
        let mut pixels = PixelBuffer::zeroed(16, 16, PixelLayout::gray8());
        pixels.data_mut().iter_mut().for_each(|b| *b = fill);
        Tile::new(key, pixels)
    }

    #[test]
    fn test_namespace_is_stable_and_distinct() {
        assert_eq!(namespace("ortho"), namespace("ortho"));
        assert_ne!(namespace("ortho"), namespace("dem"));
        assert_eq!(namespace("ortho").len(), 16);
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let warm = WarmTier::open(dir.path(), "ds", 1 << 20, tx).await.unwrap();
        let key = TileKey::new(2, 4, 6);

        warm.insert(key, &tile(key, 9), 3).await.unwrap();
        let (loaded, meta) = warm.get(&key).await.unwrap();
        assert_eq!(loaded, tile(key, 9));
        assert_eq!(meta.access_count, 3);

        warm.remove(&key).await;
        warm.sync().await;
        assert!(!warm.contains(&key));
        match rx.recv().await {
            Some(TierMessage::Delete { key: k, evicted, .. }) => {
                assert_eq!(k, key);
                assert!(!evicted);
            }
            _ => panic!("expected a delete message"),
        }
    }

    #[tokio::test]
    async fn test_budget_evicts_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let warm = WarmTier::open(dir.path(), "ds", 700, tx).await.unwrap();

        for x in 0..6 {
            let key = TileKey::new(0, x, 0);
            warm.insert(key, &tile(key, x as u8), 1).await.unwrap();
        }
        warm.sync().await;
        assert!(warm.bytes() <= 700);

        let mut evicted = 0;
        while let Ok(msg) = rx.try_recv() {
            if let TierMessage::Delete { evicted: true, .. } = msg {
                evicted += 1;
            }
        }
        assert!(evicted >= 3);
    }
}
