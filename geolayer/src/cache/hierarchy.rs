//! Two-tier cache with per-key state tracking and predictive prefetch.
//!
//! ```text
//!             put(p ≥ hot)            put(warm ≤ p < hot)
//!                 │                          │
//!                 ▼      evict (count > 1)   ▼
//!   get ──► [ Hot LRU ] ───► in transit ───► [ Warm disk ] ──► delete (worker)
//!                 ▲                          │
//!                 └──── promote (p ≥ hot) ───┘
//! ```
//!
//! Tier moves for a key happen under that key's shard lock. Side effects of
//! eviction (demotion writes, file deletion) are posted to the tier worker
//! and never call back into the hierarchy.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::hot::{HotEviction, HotTier};
use super::predictor::AccessPredictor;
use super::types::{
    CacheConfig, CacheStats, KeyState, PrefetchRequest, Tier, TierMessage, SHARD_COUNT,
};
use super::warm::WarmTier;
use super::CacheError;
use crate::store::{Tile, TileKey};

#[derive(Default)]
struct Counters {
    hot_hits: AtomicU64,
    warm_hits: AtomicU64,
    misses: AtomicU64,
    promotions: AtomicU64,
    demotions: AtomicU64,
    hot_evictions: AtomicU64,
    warm_evictions: AtomicU64,
    prefetch_sent: AtomicU64,
    prefetch_dropped: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct Shared {
    config: CacheConfig,
    dataset_id: String,
    hot: HotTier,
    warm: WarmTier,
    /// Demoted entries whose warm write has not been applied yet.
    in_transit: DashMap<TileKey, Arc<Tile>>,
    states: DashMap<TileKey, KeyState>,
    /// Failure order, oldest first. Bounds how many `Failed` states are kept.
    failures: parking_lot::Mutex<VecDeque<TileKey>>,
    shards: Vec<Mutex<()>>,
    predictor: Arc<dyn AccessPredictor>,
    events: mpsc::UnboundedSender<TierMessage>,
    prefetch: mpsc::Sender<PrefetchRequest>,
    counters: Counters,
}

impl Shared {
    fn shard(&self, key: TileKey) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % self.shards.len()]
    }

    fn set_state(&self, key: TileKey, state: KeyState) {
        self.states.insert(key, state);
    }

    fn clear_state_if(&self, key: TileKey, expected: &KeyState) {
        self.states.remove_if(&key, |_, s| s == expected);
    }

    /// Evicted keys are not covered by the caller's shard lock, so their
    /// state only changes while no newer copy is hot.
    fn set_state_unless_hot(&self, key: TileKey, state: KeyState) {
        let mut entry = self.states.entry(key).or_default();
        if !self.hot.contains(&key) {
            *entry.value_mut() = state;
        }
    }

    /// Routes hot evictions: demote when accessed more than once, else drop.
    fn absorb_evictions(&self, evicted: Vec<HotEviction>) {
        for e in evicted {
            if e.meta.access_count > 1 {
                self.in_transit.insert(e.key, Arc::clone(&e.tile));
                self.set_state_unless_hot(e.key, KeyState::Loaded(Tier::Warm));
                bump(&self.counters.demotions);
                trace!(tile = %e.key, accesses = e.meta.access_count, "Demoting to warm");
                let sent = self.events.send(TierMessage::Demote {
                    key: e.key,
                    tile: e.tile,
                    access_count: e.meta.access_count,
                });
                if sent.is_err() {
                    self.in_transit.remove(&e.key);
                    self.states.remove(&e.key);
                }
            } else {
                bump(&self.counters.hot_evictions);
                trace!(tile = %e.key, "Dropping single-use hot entry");
                let key = e.key;
                self.states.remove_if(&key, |_, st| {
                    *st == KeyState::Loaded(Tier::Hot) && !self.hot.contains(&key)
                });
            }
        }
    }

    /// Caller holds the key's shard lock.
    async fn store_hot(&self, key: TileKey, tile: Arc<Tile>, access_count: u64) {
        self.in_transit.remove(&key);
        if self.warm.contains(&key) {
            self.warm.remove(&key).await;
        }
        let access_count = self
            .hot
            .meta(&key)
            .map(|m| m.access_count + 1)
            .unwrap_or(access_count);
        let evicted = self.hot.insert(key, tile, access_count);
        self.set_state(key, KeyState::Loaded(Tier::Hot));
        self.absorb_evictions(evicted);
    }

    /// Caller holds the key's shard lock.
    async fn store_warm(&self, key: TileKey, tile: &Tile) -> Result<(), CacheError> {
        self.in_transit.remove(&key);
        self.hot.remove(&key);
        match self.warm.insert(key, tile, 1).await {
            Ok(_) => {
                self.set_state(key, KeyState::Loaded(Tier::Warm));
                Ok(())
            }
            Err(e) => {
                self.states.remove(&key);
                Err(e)
            }
        }
    }

    fn schedule_prefetch(&self, key: TileKey) {
        if !self.config.prefetch_enabled {
            return;
        }
        let predictions = self
            .predictor
            .predict(key, self.config.max_prefetch_candidates);
        for prediction in predictions {
            let candidate = prediction.key;
            let settled = self
                .states
                .get(&candidate)
                .is_some_and(|s| s.is_settled());
            if settled || self.hot.contains(&candidate) || self.warm.contains(&candidate) {
                continue;
            }
            let request = PrefetchRequest {
                key: candidate,
                probability: prediction.probability,
            };
            match self.prefetch.try_send(request) {
                Ok(()) => {
                    self.set_state(candidate, KeyState::Queued);
                    bump(&self.counters.prefetch_sent);
                }
                Err(TrySendError::Full(_)) => {
                    bump(&self.counters.prefetch_dropped);
                    trace!(tile = %candidate, "Prefetch queue full, dropping request");
                }
                Err(TrySendError::Closed(_)) => break,
            }
        }
    }

    async fn apply(&self, message: TierMessage) {
        match message {
            TierMessage::Demote {
                key,
                tile,
                access_count,
            } => {
                let _guard = self.shard(key).lock().await;
                let current = self
                    .in_transit
                    .get(&key)
                    .is_some_and(|t| Arc::ptr_eq(t.value(), &tile));
                if !current {
                    trace!(tile = %key, "Demotion superseded");
                    return;
                }
                if self.hot.contains(&key) {
                    self.set_state(key, KeyState::Loaded(Tier::Hot));
                } else {
                    match self.warm.insert(key, &tile, access_count).await {
                        Ok(_) => self.set_state(key, KeyState::Loaded(Tier::Warm)),
                        Err(e) => {
                            warn!(tile = %key, error = %e, "Demotion write failed, dropping entry");
                            self.clear_state_if(key, &KeyState::Loaded(Tier::Warm));
                        }
                    }
                }
                self.in_transit.remove_if(&key, |_, t| Arc::ptr_eq(t, &tile));
            }
            TierMessage::Delete { key, path, evicted } => {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to delete warm file")
                    }
                }
                if evicted {
                    bump(&self.counters.warm_evictions);
                    if !self.warm.contains(&key) && !self.in_transit.contains_key(&key) {
                        self.clear_state_if(key, &KeyState::Loaded(Tier::Warm));
                    }
                }
            }
            TierMessage::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

async fn run_tier_worker(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<TierMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = rx.recv() => message,
        };
        let Some(message) = message else {
            break;
        };
        match message {
            TierMessage::Flush(ack) => {
                // Work generated while draining lands in the queue before the
                // next try_recv, so the ack covers it too.
                let mut acks = vec![ack];
                while let Ok(next) = rx.try_recv() {
                    match next {
                        TierMessage::Flush(ack) => acks.push(ack),
                        other => shared.apply(other).await,
                    }
                }
                for ack in acks {
                    let _ = ack.send(());
                }
            }
            other => shared.apply(other).await,
        }
    }
    debug!(dataset = %shared.dataset_id, "Tier worker stopped");
}

/// Hot and warm tiers for one dataset.
pub struct CacheHierarchy {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for CacheHierarchy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHierarchy")
            .field("dataset_id", &self.shared.dataset_id)
            .field("predictor", &self.shared.predictor.name())
            .finish()
    }
}

impl CacheHierarchy {
    /// Opens the warm directory, starts the tier worker and returns the
    /// receiving end of the prefetch channel.
    pub async fn start(
        config: CacheConfig,
        dataset_id: impl Into<String>,
        predictor: Arc<dyn AccessPredictor>,
    ) -> Result<(Self, mpsc::Receiver<PrefetchRequest>), CacheError> {
        let dataset_id = dataset_id.into();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (prefetch_tx, prefetch_rx) = mpsc::channel(config.prefetch_queue_capacity.max(1));

        let warm = WarmTier::open(
            &config.warm_directory,
            &dataset_id,
            config.warm_capacity_bytes,
            events_tx.clone(),
        )
        .await?;

        info!(
            dataset = %dataset_id,
            hot_bytes = config.hot_capacity_bytes,
            warm_bytes = config.warm_capacity_bytes,
            warm_dir = %warm.directory().display(),
            predictor = predictor.name(),
            prefetch = config.prefetch_enabled,
            "Cache hierarchy started"
        );

        let shared = Arc::new(Shared {
            hot: HotTier::new(config.hot_capacity_bytes),
            warm,
            in_transit: DashMap::new(),
            states: DashMap::new(),
            failures: parking_lot::Mutex::new(VecDeque::new()),
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(())).collect(),
            predictor,
            events: events_tx,
            prefetch: prefetch_tx,
            counters: Counters::default(),
            dataset_id,
            config,
        });

        let shutdown = CancellationToken::new();
        tokio::spawn(run_tier_worker(
            Arc::clone(&shared),
            events_rx,
            shutdown.clone(),
        ));

        Ok((Self { shared, shutdown }, prefetch_rx))
    }

    pub fn dataset_id(&self) -> &str {
        &self.shared.dataset_id
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// Looks `key` up in Hot, then among in-transit demotions, then in Warm.
    ///
    /// A warm hit is promoted to Hot when the predicted probability for the
    /// key reaches the hot threshold.
    pub async fn get(&self, key: TileKey) -> Option<Arc<Tile>> {
        let s = &self.shared;
        let probability = s.predictor.probability(key);
        s.predictor.record_access(key);

        let _guard = s.shard(key).lock().await;
        if let Some(tile) = s.hot.get(&key) {
            bump(&s.counters.hot_hits);
            return Some(tile);
        }
        let in_transit = s.in_transit.get(&key).map(|t| Arc::clone(t.value()));
        if let Some(tile) = in_transit {
            bump(&s.counters.warm_hits);
            return Some(tile);
        }
        let Some((tile, meta)) = s.warm.get(&key).await else {
            bump(&s.counters.misses);
            return None;
        };
        bump(&s.counters.warm_hits);

        let tile = Arc::new(tile);
        if probability >= s.config.hot_threshold {
            s.warm.remove(&key).await;
            let evicted = s.hot.insert(key, Arc::clone(&tile), meta.access_count + 1);
            s.set_state(key, KeyState::Loaded(Tier::Hot));
            bump(&s.counters.promotions);
            debug!(tile = %key, probability, "Promoted to hot");
            s.absorb_evictions(evicted);
        }
        Some(tile)
    }

    /// Stores `tile` in the tier chosen by `probability` and schedules
    /// prefetch of related keys. Returns the tier, or `None` when the tile
    /// falls below the warm threshold and is not cached.
    pub async fn put(
        &self,
        key: TileKey,
        tile: Arc<Tile>,
        probability: f64,
    ) -> Result<Option<Tier>, CacheError> {
        let placement = self.place(key, tile, probability).await?;
        self.shared.schedule_prefetch(key);
        Ok(placement)
    }

    /// Like [`put`](Self::put) but never schedules further prefetch, so
    /// prefetched tiles do not fan out across the dataset.
    pub async fn put_prefetched(
        &self,
        key: TileKey,
        tile: Arc<Tile>,
        probability: f64,
    ) -> Result<Option<Tier>, CacheError> {
        self.place(key, tile, probability).await
    }

    async fn place(
        &self,
        key: TileKey,
        tile: Arc<Tile>,
        probability: f64,
    ) -> Result<Option<Tier>, CacheError> {
        let s = &self.shared;
        let placement = s.config.placement(probability);
        {
            let _guard = s.shard(key).lock().await;
            match placement {
                Some(Tier::Hot) => s.store_hot(key, tile, 1).await,
                Some(Tier::Warm) => s.store_warm(key, &tile).await?,
                None => {
                    s.states.remove_if(&key, |_, st| {
                        matches!(st, KeyState::Queued | KeyState::Loading)
                    });
                }
            }
        }
        trace!(tile = %key, probability, tier = ?placement, "Put");
        Ok(placement)
    }

    /// Stores `tile` in Warm regardless of probability. Used for results
    /// that arrived after their request was superseded.
    pub async fn put_sunk(&self, key: TileKey, tile: Arc<Tile>) -> Result<(), CacheError> {
        let s = &self.shared;
        let _guard = s.shard(key).lock().await;
        if s.hot.contains(&key) {
            return Ok(());
        }
        s.store_warm(key, &tile).await
    }

    pub fn state(&self, key: TileKey) -> KeyState {
        self.shared
            .states
            .get(&key)
            .map(|s| s.value().clone())
            .unwrap_or_default()
    }

    /// Marks `key` as being fetched. Returns false when it is already
    /// loading or resident.
    pub fn mark_loading(&self, key: TileKey) -> bool {
        let mut entry = self.shared.states.entry(key).or_default();
        match entry.value() {
            KeyState::Loading | KeyState::Loaded(_) => false,
            _ => {
                *entry.value_mut() = KeyState::Loading;
                true
            }
        }
    }

    /// Records a failed fetch. Only the most recent `max_failed_states`
    /// failures are kept; older ones revert to `Unrequested`.
    pub fn mark_failed(&self, key: TileKey, reason: impl Into<String>) {
        let s = &self.shared;
        s.set_state(key, KeyState::Failed(reason.into()));

        let mut failures = s.failures.lock();
        failures.retain(|k| *k != key);
        failures.push_back(key);
        while failures.len() > s.config.max_failed_states.max(1) {
            if let Some(oldest) = failures.pop_front() {
                s.states
                    .remove_if(&oldest, |_, st| matches!(st, KeyState::Failed(_)));
            }
        }
    }

    /// Number of keys currently in `Failed` or `Queued`.
    pub fn pending_state_count(&self) -> (usize, usize) {
        self.shared
            .states
            .iter()
            .fold((0, 0), |(failed, queued), e| match e.value() {
                KeyState::Failed(_) => (failed + 1, queued),
                KeyState::Queued => (failed, queued + 1),
                _ => (failed, queued),
            })
    }

    /// Returns a queued or loading key to `Unrequested`.
    pub fn mark_abandoned(&self, key: TileKey) {
        self.shared
            .states
            .remove_if(&key, |_, s| matches!(s, KeyState::Queued | KeyState::Loading));
    }

    /// Tier currently holding `key`. In-transit demotions count as Warm.
    pub fn tier_of(&self, key: TileKey) -> Option<Tier> {
        let s = &self.shared;
        if s.hot.contains(&key) {
            Some(Tier::Hot)
        } else if s.warm.contains(&key) || s.in_transit.contains_key(&key) {
            Some(Tier::Warm)
        } else {
            None
        }
    }

    /// Checks that no key is resident in both tiers.
    pub fn verify_consistency(&self) -> Result<(), CacheError> {
        let s = &self.shared;
        for key in s.hot.keys() {
            if s.warm.contains(&key) {
                return Err(CacheError::CacheConsistency { key });
            }
        }
        Ok(())
    }

    /// Waits until every queued demotion and deletion has been applied.
    pub async fn flush(&self) {
        self.shared.warm.sync().await;
        let (tx, rx) = oneshot::channel();
        if self.shared.events.send(TierMessage::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn stats(&self) -> CacheStats {
        let s = &self.shared;
        let c = &s.counters;
        CacheStats {
            hot_hits: c.hot_hits.load(Ordering::Relaxed),
            warm_hits: c.warm_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            promotions: c.promotions.load(Ordering::Relaxed),
            demotions: c.demotions.load(Ordering::Relaxed),
            hot_evictions: c.hot_evictions.load(Ordering::Relaxed),
            warm_evictions: c.warm_evictions.load(Ordering::Relaxed),
            prefetch_sent: c.prefetch_sent.load(Ordering::Relaxed),
            prefetch_dropped: c.prefetch_dropped.load(Ordering::Relaxed),
            hot_bytes: s.hot.bytes(),
            hot_entries: s.hot.len() as u64,
            warm_bytes: s.warm.bytes(),
            warm_entries: s.warm.entry_count(),
        }
    }

    /// Flushes pending tier work and stops the worker.
    pub async fn shutdown(&self) {
        self.flush().await;
        self.shutdown.cancel();
        info!(dataset = %self.shared.dataset_id, stats = %self.stats(), "Cache hierarchy stopped");
    }
}

impl Drop for CacheHierarchy {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DisabledPredictor, NeighborhoodPredictor};
    use crate::store::{PixelBuffer, PixelLayout};

    /// 16x16 gray tiles: 256 bytes each.
    fn tile(key: TileKey) -> Arc<Tile> {
        let mut pixels = PixelBuffer::zeroed(16, 16, PixelLayout::gray8());
        pixels.set_sample(0, 0, 0, key.x as f64);
        Arc::new(Tile::new(key, pixels))
    }

    async fn cache_with(
        config: CacheConfig,
        predictor: Arc<dyn AccessPredictor>,
    ) -> (CacheHierarchy, mpsc::Receiver<PrefetchRequest>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = config.with_warm_directory(dir.path());
        let (cache, rx) = CacheHierarchy::start(config, "test", predictor).await.unwrap();
        (cache, rx, dir)
    }

    fn no_prefetch() -> CacheConfig {
        CacheConfig::default()
            .with_hot_capacity(256 * 4)
            .with_warm_capacity(1 << 20)
            .with_prefetch(false, 0)
    }

    #[tokio::test]
    async fn test_put_places_by_probability() {
        let (cache, _rx, _dir) = cache_with(no_prefetch(), Arc::new(DisabledPredictor)).await;
        let (a, b, c) = (TileKey::new(0, 1, 0), TileKey::new(0, 2, 0), TileKey::new(0, 3, 0));

        assert_eq!(cache.put(a, tile(a), 0.9).await.unwrap(), Some(Tier::Hot));
        assert_eq!(cache.put(b, tile(b), 0.5).await.unwrap(), Some(Tier::Warm));
        assert_eq!(cache.put(c, tile(c), 0.1).await.unwrap(), None);

        assert_eq!(cache.tier_of(a), Some(Tier::Hot));
        assert_eq!(cache.tier_of(b), Some(Tier::Warm));
        assert_eq!(cache.tier_of(c), None);
        assert_eq!(cache.state(a), KeyState::Loaded(Tier::Hot));
        assert_eq!(cache.state(b), KeyState::Loaded(Tier::Warm));

        assert_eq!(cache.get(a).await.unwrap().pixels.sample(0, 0, 0), 1.0);
        assert_eq!(cache.get(b).await.unwrap().pixels.sample(0, 0, 0), 2.0);
        assert!(cache.get(c).await.is_none());

        let stats = cache.stats();
        assert_eq!((stats.hot_hits, stats.warm_hits, stats.misses), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_repeated_warm_hits_promote() {
        let (cache, _rx, _dir) =
            cache_with(no_prefetch(), Arc::new(NeighborhoodPredictor::new())).await;
        let key = TileKey::new(0, 4, 4);
        cache.put_sunk(key, tile(key)).await.unwrap();

        cache.get(key).await.unwrap();
        cache.get(key).await.unwrap();
        assert_eq!(cache.tier_of(key), Some(Tier::Warm));
        cache.get(key).await.unwrap();

        assert_eq!(cache.tier_of(key), Some(Tier::Hot));
        assert_eq!(cache.stats().promotions, 1);
        cache.flush().await;
        cache.verify_consistency().unwrap();
    }

    #[tokio::test]
    async fn test_eviction_demotes_only_reused_entries() {
        let config = no_prefetch().with_hot_capacity(256 * 2);
        let (cache, _rx, _dir) = cache_with(config, Arc::new(DisabledPredictor)).await;
        let keys: Vec<TileKey> = (0..4).map(|x| TileKey::new(0, x, 0)).collect();

        cache.put(keys[0], tile(keys[0]), 0.9).await.unwrap();
        cache.get(keys[0]).await.unwrap();
        cache.put(keys[1], tile(keys[1]), 0.9).await.unwrap();
        cache.put(keys[2], tile(keys[2]), 0.9).await.unwrap();
        cache.put(keys[3], tile(keys[3]), 0.9).await.unwrap();
        cache.flush().await;

        assert_eq!(cache.tier_of(keys[0]), Some(Tier::Warm));
        assert_eq!(cache.tier_of(keys[1]), None);
        assert_eq!(cache.state(keys[1]), KeyState::Unrequested);
        let stats = cache.stats();
        assert_eq!(stats.demotions, 1);
        assert_eq!(stats.hot_evictions, 1);
        assert_eq!(cache.get(keys[0]).await.unwrap().pixels.sample(0, 0, 0), 0.0);
        cache.verify_consistency().unwrap();
    }

    #[tokio::test]
    async fn test_put_emits_prefetch_for_neighbours() {
        let config = no_prefetch().with_prefetch(true, 4);
        let (cache, mut rx, _dir) =
            cache_with(config, Arc::new(NeighborhoodPredictor::new())).await;
        let key = TileKey::new(2, 10, 10);
        cache.put(key, tile(key), 0.9).await.unwrap();

        let mut requested = Vec::new();
        while let Ok(req) = rx.try_recv() {
            requested.push(req.key);
        }
        assert_eq!(requested.len(), 4);
        assert!(requested.contains(&TileKey::new(2, 11, 10)));
        assert!(requested.contains(&TileKey::new(2, 10, 9)));
        assert_eq!(cache.state(TileKey::new(2, 11, 10)), KeyState::Queued);

        // Already queued neighbours are not requested twice.
        cache.put(key, tile(key), 0.9).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_prefetch_queue_drops_requests() {
        let config = no_prefetch()
            .with_prefetch(true, 8)
            .with_prefetch_queue_capacity(2);
        let (cache, _rx, _dir) = cache_with(config, Arc::new(NeighborhoodPredictor::new())).await;
        let key = TileKey::new(0, 5, 5);
        cache.put(key, tile(key), 0.9).await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.prefetch_sent, 2);
        assert_eq!(stats.prefetch_dropped, 6);
    }

    #[tokio::test]
    async fn test_mark_loading_and_failure() {
        let (cache, _rx, _dir) = cache_with(no_prefetch(), Arc::new(DisabledPredictor)).await;
        let key = TileKey::new(1, 1, 1);
        assert!(cache.mark_loading(key));
        assert!(!cache.mark_loading(key));
        cache.mark_failed(key, "timeout");
        assert_eq!(cache.state(key), KeyState::Failed("timeout".to_string()));
        assert!(cache.mark_loading(key));
        cache.mark_abandoned(key);
        assert_eq!(cache.state(key), KeyState::Unrequested);
    }

    #[tokio::test]
    async fn test_failed_states_are_bounded() {
        let config = no_prefetch().with_max_failed_states(3);
        let (cache, _rx, _dir) = cache_with(config, Arc::new(DisabledPredictor)).await;
        let keys: Vec<TileKey> = (0..5).map(|x| TileKey::new(0, x, 0)).collect();
        for key in &keys {
            cache.mark_failed(*key, "decode");
        }
        // Failing again refreshes the key's position.
        cache.mark_failed(keys[2], "decode");
        cache.mark_failed(keys[0], "decode");

        assert_eq!(cache.pending_state_count(), (3, 0));
        assert_eq!(cache.state(keys[1]), KeyState::Unrequested);
        assert_eq!(cache.state(keys[3]), KeyState::Unrequested);
        assert!(matches!(cache.state(keys[4]), KeyState::Failed(_)));
        assert!(matches!(cache.state(keys[2]), KeyState::Failed(_)));
        assert!(matches!(cache.state(keys[0]), KeyState::Failed(_)));
    }

    #[tokio::test]
    async fn test_evicted_failure_keeps_newer_state() {
        let config = no_prefetch().with_max_failed_states(1);
        let (cache, _rx, _dir) = cache_with(config, Arc::new(DisabledPredictor)).await;
        let (a, b) = (TileKey::new(0, 0, 0), TileKey::new(0, 1, 0));
        cache.mark_failed(a, "io");
        assert!(cache.mark_loading(a));
        cache.mark_failed(b, "io");

        assert_eq!(cache.state(a), KeyState::Loading);
        assert!(matches!(cache.state(b), KeyState::Failed(_)));
    }

    #[tokio::test]
    async fn test_verify_consistency_reports_double_residency() {
        let (cache, _rx, _dir) = cache_with(no_prefetch(), Arc::new(DisabledPredictor)).await;
        let key = TileKey::new(0, 0, 0);
        cache.shared.hot.insert(key, tile(key), 1);
        cache.shared.warm.insert(key, &tile(key), 1).await.unwrap();
        assert!(matches!(
            cache.verify_consistency(),
            Err(CacheError::CacheConsistency { key: k }) if k == key
        ));
    }
}
