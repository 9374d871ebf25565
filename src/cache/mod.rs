//! The tile cache of one resolution level.
//!
//! Misses load through the pixel codec, or through a fallback initializer for tiles that were never
//! written. Evicted tiles go through the shared I/O pool back to the store; while such a write is in
//! flight, the tile is served from the pending set so a reload never races its own write-back.

mod io_pool;
mod tile;

pub use io_pool::{IoJob, IoPool};
pub use tile::{MaterializationState, Tile};

use crate::codec::PixelCodec;
use crate::config::{CacheBound, CacheOptions};
use crate::error::{Error, Result};
use crate::grid::{TileGrid, TileKey};
use crate::store::{SampleBuffer, SampleKind, VolumeStore};
use dashmap::{DashMap, DashSet};
use derive_more::Debug;
use futures::channel::oneshot;
use fxhash::{FxBuildHasher, FxHashSet};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc, Mutex, RwLock,
};

pub type ComputeFn = dyn Fn(&[u64], &[usize], SampleKind) -> SampleBuffer + Send + Sync;

/// Content of tiles that have never been written to the store.
#[derive(Clone, Debug)]
pub enum Initializer {
    Zeros,
    /// Called with the tile origin, extent and sample kind; must return `prod(extent)` samples.
    Compute(#[debug(skip)] Arc<ComputeFn>),
}
impl Initializer {
    pub fn compute(f: impl Fn(&[u64], &[usize], SampleKind) -> SampleBuffer + Send + Sync + 'static) -> Self {
        Initializer::Compute(Arc::new(f))
    }

    fn initialize(&self, min: &[u64], extent: &[usize], kind: SampleKind) -> Result<SampleBuffer> {
        let len = extent.iter().product();
        let data = match self {
            Initializer::Zeros => SampleBuffer::zeros(kind, len),
            Initializer::Compute(f) => f(min, extent, kind),
        };
        if data.len() != len || data.kind() != kind {
            return Err(Error::InvalidGeometry(format!(
                "initializer produced {} {:?} samples for a tile of {:?} {:?}",
                data.len(),
                data.kind(),
                extent,
                kind
            )));
        }
        Ok(data)
    }
}

/// Result of one write-back submission.
#[derive(Debug)]
pub struct WriteHandle {
    key: TileKey,
    #[debug(skip)]
    receiver: oneshot::Receiver<Result<()>>,
}
impl WriteHandle {
    pub fn key(&self) -> TileKey {
        self.key
    }
    /// Blocks until the write has been performed.
    pub fn wait(self) -> Result<()> {
        futures::executor::block_on(self.receiver).unwrap_or_else(|_| Err(Error::WorkerLost(self.key.to_string())))
    }
    /// The outcome if the write has finished already.
    pub fn try_result(&mut self) -> Option<Result<()>> {
        match self.receiver.try_recv() {
            Ok(result) => result,
            Err(_) => Some(Err(Error::WorkerLost(self.key.to_string()))),
        }
    }
}

#[derive(Default, Debug)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    store_loads: AtomicU64,
    initialized: AtomicU64,
    pending_hits: AtomicU64,
    evictions: AtomicU64,
    writes_submitted: AtomicU64,
    writes_completed: AtomicU64,
    writes_failed: AtomicU64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub store_loads: u64,
    pub initialized: u64,
    pub pending_hits: u64,
    pub evictions: u64,
    pub writes_submitted: u64,
    pub writes_completed: u64,
    pub writes_failed: u64,
}

enum SlotState {
    Empty,
    Loaded(Arc<Tile>),
    Evicted,
}

struct Slot {
    state: Mutex<SlotState>,
}

/// How a write-back is queued when the I/O queue is full.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Submission {
    /// Wait for room.
    Blocking,
    /// Give up; used on the I/O threads themselves.
    IfRoom,
}

#[derive(Debug)]
struct CacheInner {
    level: usize,
    grid: TileGrid,
    codec: Arc<PixelCodec>,
    #[debug(skip)]
    store: Arc<dyn VolumeStore>,
    #[debug(skip)]
    pool: Arc<IoPool>,
    priority: usize,
    options: CacheOptions,
    initializer: Option<Initializer>,
    writable: bool,
    #[debug(skip)]
    slots: DashMap<TileKey, Arc<Slot>, FxBuildHasher>,
    #[debug(skip)]
    pending: DashMap<TileKey, (Arc<Tile>, u64), FxBuildHasher>,
    #[debug(skip)]
    prefetching: DashSet<TileKey, FxBuildHasher>,
    materialized: RwLock<FxHashSet<TileKey>>,
    failures: Mutex<Vec<(TileKey, Error)>>,
    clock: AtomicU64,
    generation: AtomicU64,
    resident: AtomicUsize,
    stats: CacheStats,
}

/// Tile cache of one resolution level, cheap to clone.
#[derive(Clone, Debug)]
pub struct TileCache {
    inner: Arc<CacheInner>,
}

impl TileCache {
    /// Creates the cache of pyramid level `level`.
    ///
    /// Only a `writable` cache ever writes back; coarser levels of a pyramid are read-only views
    /// because the store accepts writes at full resolution only.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        level: usize,
        grid: TileGrid,
        codec: Arc<PixelCodec>,
        store: Arc<dyn VolumeStore>,
        pool: Arc<IoPool>,
        priority: usize,
        options: &CacheOptions,
        initializer: Option<Initializer>,
        writable: bool,
    ) -> Self {
        debug!(
            "tile cache for level {}: {} tiles of {:?}, priority {}, bound {:?}",
            level,
            grid.num_tiles(),
            grid.tile_extent(),
            priority,
            options.cache_bound
        );
        TileCache {
            inner: Arc::new(CacheInner {
                level,
                grid,
                codec,
                store,
                pool,
                priority,
                options: options.clone(),
                initializer,
                writable,
                slots: DashMap::default(),
                pending: DashMap::default(),
                prefetching: DashSet::default(),
                materialized: RwLock::new(FxHashSet::default()),
                failures: Mutex::new(vec![]),
                clock: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                resident: AtomicUsize::new(0),
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn level(&self) -> usize {
        self.inner.level
    }
    pub fn grid(&self) -> &TileGrid {
        &self.inner.grid
    }
    pub fn codec(&self) -> &PixelCodec {
        &self.inner.codec
    }
    pub fn priority(&self) -> usize {
        self.inner.priority
    }
    pub fn is_writable(&self) -> bool {
        self.inner.writable
    }
    pub fn resident_tiles(&self) -> usize {
        self.inner.resident.load(Ordering::Acquire)
    }

    fn key(&self, index: u64) -> Result<TileKey> {
        if index >= self.inner.grid.num_tiles() {
            return Err(Error::InvalidGeometry(format!(
                "tile {} outside of the {} tiles of level {}",
                index,
                self.inner.grid.num_tiles(),
                self.inner.level
            )));
        }
        Ok(TileKey::new(self.inner.level, index))
    }

    /// The tile with linear index `index`, loading it on a miss. Concurrent misses on the same tile
    /// share one load.
    pub fn get(&self, index: u64) -> Result<Arc<Tile>> {
        self.get_with(index, Submission::Blocking)
    }

    // loads on the i/o threads must never wait for room in their own queue
    fn get_with(&self, index: u64, submission: Submission) -> Result<Arc<Tile>> {
        let key = self.key(index)?;
        let inner = &self.inner;
        loop {
            let slot = inner
                .slots
                .entry(key)
                .or_insert_with(|| {
                    Arc::new(Slot {
                        state: Mutex::new(SlotState::Empty),
                    })
                })
                .clone();
            let mut state = slot.state.lock().unwrap();
            match &*state {
                SlotState::Loaded(tile) => {
                    inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                    tile.touch(inner.clock.fetch_add(1, Ordering::Relaxed));
                    return Ok(tile.clone());
                }
                SlotState::Evicted => {
                    drop(state);
                    inner.slots.remove_if(&key, |_, s| Arc::ptr_eq(s, &slot));
                    continue;
                }
                SlotState::Empty => {}
            }

            inner.stats.misses.fetch_add(1, Ordering::Relaxed);
            let (tile, persist) = self.load(key)?;
            tile.touch(inner.clock.fetch_add(1, Ordering::Relaxed));
            *state = SlotState::Loaded(tile.clone());
            drop(state);
            inner.resident.fetch_add(1, Ordering::AcqRel);

            if persist && self.write_back(tile.clone(), submission)?.is_none() {
                debug!("i/o queue full, tile {} stays dirty until evicted", key);
                tile.mark_dirty();
            }
            self.enforce_bound(submission)?;
            return Ok(tile);
        }
    }

    /// The tile if it is resident, without loading or waiting for a load in progress.
    pub fn get_if_present(&self, index: u64) -> Option<Arc<Tile>> {
        let key = TileKey::new(self.inner.level, index);
        let slot = self.inner.slots.get(&key).map(|s| s.clone())?;
        let state = slot.state.try_lock().ok()?;
        match &*state {
            SlotState::Loaded(tile) => {
                tile.touch(self.inner.clock.fetch_add(1, Ordering::Relaxed));
                Some(tile.clone())
            }
            _ => None,
        }
    }

    /// Queues a background load of the tile if it is not resident and the I/O queue has room.
    /// Returns whether a load was queued. Neither the load nor the evictions it causes ever block.
    pub fn prefetch(&self, index: u64) -> Result<bool> {
        let key = self.key(index)?;
        self.enforce_bound(Submission::IfRoom)?;
        if self.get_if_present(index).is_some() || !self.inner.prefetching.insert(key) {
            return Ok(false);
        }
        let cache = self.clone();
        let queued = self.inner.pool.try_submit(
            self.inner.priority,
            Box::new(move || {
                if let Err(e) = cache.get_with(index, Submission::IfRoom) {
                    warn!("prefetch of tile {} failed: {}", key, e);
                }
                cache.inner.prefetching.remove(&key);
            }),
        );
        if !matches!(queued, Ok(true)) {
            self.inner.prefetching.remove(&key);
        }
        queued
    }

    /// Loads the tile and tells whether it should be persisted right away.
    fn load(&self, key: TileKey) -> Result<(Arc<Tile>, bool)> {
        let inner = &self.inner;
        if let Some(pending) = inner.pending.get(&key) {
            inner.stats.pending_hits.fetch_add(1, Ordering::Relaxed);
            debug!("tile {} reinstated from pending write-back", key);
            return Ok((pending.0.clone(), false));
        }

        let (min, extent) = inner.grid.tile_bounds(key.index);
        let materialized = inner.materialized.read().unwrap().contains(&key);
        match (&inner.initializer, materialized) {
            (Some(initializer), false) => {
                let data = initializer.initialize(&min, &extent, inner.codec.internal_kind())?;
                inner.stats.initialized.fetch_add(1, Ordering::Relaxed);
                debug!("tile {} initialized", key);
                let tile = Arc::new(Tile::new(key, min, extent, data));
                if inner.options.initialize_as_dirty {
                    tile.mark_dirty();
                }
                Ok((tile, inner.options.persist_on_load && inner.writable))
            }
            _ => {
                let data = inner.codec.read(&*inner.store, inner.level, &min, &extent)?;
                inner.stats.store_loads.fetch_add(1, Ordering::Relaxed);
                debug!("tile {} loaded from store", key);
                Ok((Arc::new(Tile::new(key, min, extent, data)), false))
            }
        }
    }

    /// Evicts least recently used tiles until the bound holds. Tiles still referenced outside the
    /// cache are skipped.
    fn enforce_bound(&self, submission: Submission) -> Result<()> {
        let CacheBound::MaxTiles(max) = self.inner.options.cache_bound else {
            return Ok(());
        };
        if self.inner.resident.load(Ordering::Acquire) <= max {
            return Ok(());
        }
        let mut candidates: Vec<(u64, TileKey)> = self
            .inner
            .slots
            .iter()
            .filter_map(|entry| match &*entry.value().state.try_lock().ok()? {
                SlotState::Loaded(tile) if Arc::strong_count(tile) == 1 => Some((tile.last_access(), *entry.key())),
                _ => None,
            })
            .collect();
        candidates.sort_unstable();
        for (_, key) in candidates {
            if self.inner.resident.load(Ordering::Acquire) <= max {
                break;
            }
            self.evict_key(key, true, submission)?;
        }
        Ok(())
    }

    /// Removes the tile from memory, writing it back if needed. Returns the handle of the write-back,
    /// if one was submitted.
    pub fn evict(&self, index: u64) -> Result<Option<WriteHandle>> {
        self.evict_key(TileKey::new(self.inner.level, index), false, Submission::Blocking)
    }

    /// Evicts every resident tile.
    pub fn evict_all(&self) -> Result<Vec<WriteHandle>> {
        let keys: Vec<TileKey> = self.inner.slots.iter().map(|e| *e.key()).collect();
        let mut handles = vec![];
        for key in keys {
            handles.extend(self.evict_key(key, false, Submission::Blocking)?);
        }
        Ok(handles)
    }

    /// With `unused_only`, a tile referenced outside the cache stays. With [`Submission::IfRoom`], a
    /// tile whose write-back cannot be queued right now stays.
    fn evict_key(&self, key: TileKey, unused_only: bool, submission: Submission) -> Result<Option<WriteHandle>> {
        let inner = &self.inner;
        let Some(slot) = inner.slots.get(&key).map(|s| s.clone()) else {
            return Ok(None);
        };
        let mut state = slot.state.lock().unwrap();
        let tile = match &*state {
            SlotState::Loaded(tile) if !unused_only || Arc::strong_count(tile) == 1 => tile.clone(),
            _ => return Ok(None),
        };

        // pending before the slot goes away, so a concurrent miss reads it back from there
        let mut handle = None;
        let mut generation = None;
        if self.needs_write_back(&tile) {
            let g = self.register_pending(&tile);
            match submission {
                Submission::Blocking => generation = Some(g),
                Submission::IfRoom => match self.submit_pending(tile.clone(), g, Submission::IfRoom)? {
                    Some(h) => handle = Some(h),
                    None => return Ok(None),
                },
            }
        }
        *state = SlotState::Evicted;
        drop(state);
        inner.slots.remove_if(&key, |_, s| Arc::ptr_eq(s, &slot));
        inner.resident.fetch_sub(1, Ordering::AcqRel);
        inner.stats.evictions.fetch_add(1, Ordering::Relaxed);

        if let Some(g) = generation {
            handle = self.submit_pending(tile, g, Submission::Blocking)?;
        } else if handle.is_none() {
            debug!("tile {} dropped without write-back", key);
        }
        Ok(handle)
    }

    fn needs_write_back(&self, tile: &Tile) -> bool {
        self.inner.writable && (!self.inner.options.dirty_accesses || tile.is_dirty())
    }

    fn register_pending(&self, tile: &Arc<Tile>) -> u64 {
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel);
        self.inner.pending.insert(tile.key(), (tile.clone(), generation));
        generation
    }

    fn write_back(&self, tile: Arc<Tile>, submission: Submission) -> Result<Option<WriteHandle>> {
        let generation = self.register_pending(&tile);
        self.submit_pending(tile, generation, submission)
    }

    /// Queues the write of a tile registered as pending under `generation`. Returns `None` if the
    /// queue had no room for an [`Submission::IfRoom`] submission; the tile is then no longer pending.
    fn submit_pending(&self, tile: Arc<Tile>, generation: u64, submission: Submission) -> Result<Option<WriteHandle>> {
        let inner = &self.inner;
        let key = tile.key();
        let (sender, receiver) = oneshot::channel();
        let cache = self.inner.clone();
        let job: IoJob = Box::new(move || {
            let result = {
                // mutations wait for this guard, so any change made after it leaves the tile dirty
                let data = tile.data();
                if cache.options.dirty_accesses {
                    tile.clear_dirty();
                }
                cache.codec.write(&*cache.store, &data, tile.min(), tile.extent())
            };
            match &result {
                Ok(()) => {
                    cache.materialized.write().unwrap().insert(key);
                    cache.stats.writes_completed.fetch_add(1, Ordering::Relaxed);
                    debug!("tile {} written back", key);
                }
                Err(e) => {
                    warn!("write-back of tile {} failed: {}", key, e);
                    tile.mark_dirty();
                    cache.stats.writes_failed.fetch_add(1, Ordering::Relaxed);
                    cache.failures.lock().unwrap().push((key, e.clone()));
                }
            }
            cache.pending.remove_if(&key, |_, (_, g)| *g == generation);
            let _ = sender.send(result);
        });
        let submitted = match submission {
            Submission::Blocking => inner.pool.submit(inner.priority, job).map(|_| true),
            Submission::IfRoom => inner.pool.try_submit(inner.priority, job),
        };
        match submitted {
            Ok(true) => {
                inner.stats.writes_submitted.fetch_add(1, Ordering::Relaxed);
                Ok(Some(WriteHandle { key, receiver }))
            }
            Ok(false) => {
                inner.pending.remove_if(&key, |_, (_, g)| *g == generation);
                Ok(None)
            }
            Err(e) => {
                inner.pending.remove_if(&key, |_, (_, g)| *g == generation);
                Err(e)
            }
        }
    }

    fn resident(&self) -> Vec<Arc<Tile>> {
        let slots: Vec<Arc<Slot>> = self.inner.slots.iter().map(|e| e.value().clone()).collect();
        slots
            .iter()
            .filter_map(|slot| match &*slot.state.lock().unwrap() {
                SlotState::Loaded(tile) => Some(tile.clone()),
                _ => None,
            })
            .collect()
    }

    /// Submits every resident tile that needs writing for write-back and keeps it cached. Blocks
    /// only as long as the I/O queue is full. A tile whose write fails is dirty again afterwards.
    pub fn persist_all(&self) -> Result<Vec<WriteHandle>> {
        let tiles = self.resident();
        let mut handles = Vec::with_capacity(tiles.len());
        for tile in tiles.into_iter().filter(|tile| self.needs_write_back(tile)) {
            handles.extend(self.write_back(tile, Submission::Blocking)?);
        }
        info!("level {}: persisting {} tiles", self.inner.level, handles.len());
        Ok(handles)
    }

    /// Like [`TileCache::persist_all`], but also waits until every write has been performed. Fails
    /// with the first write error, including errors of earlier evictions not yet taken.
    pub fn persist_all_and_wait(&self) -> Result<()> {
        let mut first_error = None;
        for handle in self.persist_all()? {
            if let Err(e) = handle.wait() {
                first_error.get_or_insert(e);
            }
        }
        self.inner.pool.wait_idle();
        if let Some((_, e)) = self.take_failures().into_iter().next() {
            first_error.get_or_insert(e);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drains the write-back failures recorded so far.
    pub fn take_failures(&self) -> Vec<(TileKey, Error)> {
        std::mem::take(&mut *self.inner.failures.lock().unwrap())
    }

    pub fn materialization_state(&self, index: u64) -> MaterializationState {
        let key = TileKey::new(self.inner.level, index);
        if self.inner.initializer.is_none() || self.inner.materialized.read().unwrap().contains(&key) {
            MaterializationState::Materialized
        } else {
            MaterializationState::Virtual
        }
    }

    pub fn is_pending(&self, index: u64) -> bool {
        self.inner.pending.contains_key(&TileKey::new(self.inner.level, index))
    }

    pub fn invalidate(&self, _index: u64) -> Result<()> {
        Err(Error::UnsupportedOperation(
            "tiles cannot be invalidated once they may have been written to the store",
        ))
    }
    pub fn invalidate_all(&self) -> Result<()> {
        Err(Error::UnsupportedOperation(
            "tiles cannot be invalidated once they may have been written to the store",
        ))
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        let s = &self.inner.stats;
        CacheStatsSnapshot {
            hits: s.hits.load(Ordering::Relaxed),
            misses: s.misses.load(Ordering::Relaxed),
            store_loads: s.store_loads.load(Ordering::Relaxed),
            initialized: s.initialized.load(Ordering::Relaxed),
            pending_hits: s.pending_hits.load(Ordering::Relaxed),
            evictions: s.evictions.load(Ordering::Relaxed),
            writes_submitted: s.writes_submitted.load(Ordering::Relaxed),
            writes_completed: s.writes_completed.load(Ordering::Relaxed),
            writes_failed: s.writes_failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Encoding;
    use crate::grid::derive_tile_extent;
    use crate::store::{InMemoryStore, AXIS_C};
    use rayon::prelude::*;
    use std::sync::{atomic::AtomicBool, mpsc};
    use std::thread;
    use std::time::Duration;

    /// A 2-D U16 store of `width` x 8 samples in 4x4 blocks.
    fn store(width: usize) -> Arc<InMemoryStore> {
        let store = InMemoryStore::new(SampleKind::U16, [width, 8, 1, 1, 1], [4, 4, 1]);
        store.fill_with(|[x, y, ..]| (x + 100 * y) as f64);
        Arc::new(store)
    }

    fn cache_over(
        store: &Arc<InMemoryStore>,
        pool: &Arc<IoPool>,
        options: CacheOptions,
        initializer: Option<Initializer>,
    ) -> TileCache {
        let ext = store.extents();
        let dims = Encoding::Direct.internal_dims(&ext);
        let map = Encoding::Direct.axis_map(&ext, &dims).unwrap();
        let extent = derive_tile_extent(&dims, &store.pyramid_block_size(0), &map, None, SampleKind::U16, 1).unwrap();
        let grid = TileGrid::new(dims, extent).unwrap();
        let codec = Arc::new(PixelCodec::new(Encoding::Direct, map, SampleKind::U16, ext[AXIS_C]));
        TileCache::new(0, grid, codec, store.clone(), pool.clone(), 0, &options, initializer, true)
    }

    fn pool() -> Arc<IoPool> {
        Arc::new(IoPool::new(1, 10).unwrap())
    }

    #[test]
    fn concurrent_misses_share_one_load() {
        let store = store(8);
        let cache = cache_over(&store, &pool(), CacheOptions::default(), None);
        let tiles: Vec<Arc<Tile>> = (0..64).into_par_iter().map(|_| cache.get(1).unwrap()).collect();
        assert!(tiles.iter().all(|t| Arc::ptr_eq(t, &tiles[0])));
        assert_eq!(store.read_count(), 1);
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().hits, 63);
        assert_eq!(tiles[0].min(), &[4, 0]);
        assert_eq!(tiles[0].get(&[5, 2]), 205.0);
    }

    #[test]
    fn only_dirty_tiles_are_written_back() {
        let store = store(8);
        let cache = cache_over(&store, &pool(), CacheOptions::default(), None);
        cache.get(0).unwrap();
        assert!(cache.evict(0).unwrap().is_none());
        assert_eq!(store.write_count(), 0);

        cache.get(0).unwrap().set(&[1, 1], 7.0);
        let handle = cache.evict(0).unwrap().expect("dirty tile is written back");
        handle.wait().unwrap();
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.sample(0, [1, 1, 0, 0, 0]), 7.0);
        assert_eq!(cache.resident_tiles(), 0);
    }

    #[test]
    fn without_dirty_tracking_every_tile_is_written_back() {
        let store = store(8);
        let options = CacheOptions {
            dirty_accesses: false,
            ..Default::default()
        };
        let cache = cache_over(&store, &pool(), options, None);
        cache.get(2).unwrap();
        cache.evict(2).unwrap().expect("written back").wait().unwrap();
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn virtual_tiles_materialize_on_first_write() {
        let store = store(8);
        let initializer = Initializer::compute(|_, extent, kind| {
            let mut data = SampleBuffer::zeros(kind, extent.iter().product());
            (0..data.len()).for_each(|i| data.set_f64(i, 9.0));
            data
        });
        let cache = cache_over(&store, &pool(), CacheOptions::default(), Some(initializer));
        assert_eq!(cache.materialization_state(0), MaterializationState::Virtual);

        let tile = cache.get(0).unwrap();
        assert_eq!(tile.get(&[2, 2]), 9.0);
        assert_eq!(store.read_count(), 0);
        tile.set(&[2, 2], 4.0);
        drop(tile);
        cache.evict(0).unwrap().unwrap().wait().unwrap();
        assert_eq!(cache.materialization_state(0), MaterializationState::Materialized);

        let tile = cache.get(0).unwrap();
        assert_eq!(store.read_count(), 1);
        assert_eq!(tile.get(&[2, 2]), 4.0);
        assert_eq!(tile.get(&[3, 2]), 9.0);
        assert_eq!(cache.materialization_state(0), MaterializationState::Materialized);
        assert_eq!(cache.materialization_state(1), MaterializationState::Virtual);
    }

    #[test]
    fn initialized_tiles_can_start_dirty_or_persist_immediately() {
        let store = store(8);
        let pool = pool();
        let dirty = CacheOptions {
            initialize_as_dirty: true,
            ..Default::default()
        };
        let cache = cache_over(&store, &pool, dirty, Some(Initializer::Zeros));
        assert!(cache.get(0).unwrap().is_dirty());
        assert!(cache.evict(0).unwrap().is_some());

        let persist = CacheOptions {
            persist_on_load: true,
            ..Default::default()
        };
        let cache = cache_over(&store, &pool, persist, Some(Initializer::Zeros));
        cache.get(3).unwrap();
        pool.wait_idle();
        assert_eq!(cache.materialization_state(3), MaterializationState::Materialized);
        assert_eq!(store.sample(0, [5, 5, 0, 0, 0]), 0.0);
    }

    #[test]
    fn reload_during_write_back_returns_the_pending_tile() {
        let store = store(8);
        let cache = cache_over(&store, &pool(), CacheOptions::default(), Some(Initializer::Zeros));
        store.set_write_gate(false);
        let tile = cache.get(0).unwrap();
        tile.set(&[0, 0], 42.0);
        let handle = cache.evict(0).unwrap().unwrap();
        assert!(cache.is_pending(0));

        let reloaded = cache.get(0).unwrap();
        assert!(Arc::ptr_eq(&tile, &reloaded));
        assert_eq!(reloaded.get(&[0, 0]), 42.0);
        assert_eq!(store.read_count(), 0);
        assert_eq!(cache.stats().pending_hits, 1);

        store.set_write_gate(true);
        handle.wait().unwrap();
        assert!(!cache.is_pending(0));
        assert_eq!(store.sample(0, [0, 0, 0, 0, 0]), 42.0);
    }

    #[test]
    fn eviction_blocks_while_the_write_queue_is_full() {
        let store = store(16);
        let pool = Arc::new(IoPool::new(1, 2).unwrap());
        let cache = cache_over(&store, &pool, CacheOptions::default(), None);
        for index in 0..4 {
            cache.get(index).unwrap().mark_dirty();
        }
        store.set_write_gate(false);

        let mut handles = vec![cache.evict(0).unwrap().unwrap()];
        while store.write_count() == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        handles.push(cache.evict(1).unwrap().unwrap());
        handles.push(cache.evict(2).unwrap().unwrap());
        assert_eq!(pool.queued(), 2);

        let returned = Arc::new(AtomicBool::new(false));
        let blocked = {
            let (cache, returned) = (cache.clone(), returned.clone());
            thread::spawn(move || {
                let handle = cache.evict(3).unwrap().unwrap();
                returned.store(true, Ordering::SeqCst);
                handle
            })
        };
        thread::sleep(Duration::from_millis(100));
        assert!(!returned.load(Ordering::SeqCst));

        store.set_write_gate(true);
        handles.push(blocked.join().unwrap());
        assert!(returned.load(Ordering::SeqCst));
        for handle in handles {
            handle.wait().unwrap();
        }
        assert_eq!(store.write_count(), 4);
    }

    #[test]
    fn failed_write_backs_are_reported() {
        let store = store(8);
        let cache = cache_over(&store, &pool(), CacheOptions::default(), Some(Initializer::Zeros));
        store.set_fail_writes(true);
        cache.get(1).unwrap().set(&[4, 0], 1.0);
        let result = cache.evict(1).unwrap().unwrap().wait();
        assert!(matches!(result, Err(Error::StoreIo { .. })));

        let failures = cache.take_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, TileKey::new(0, 1));
        assert!(cache.take_failures().is_empty());
        assert_eq!(cache.materialization_state(1), MaterializationState::Virtual);
        assert!(!cache.is_pending(1));
        assert_eq!(cache.stats().writes_failed, 1);
    }

    #[test]
    fn failed_persist_keeps_the_tile_dirty_for_a_retry() {
        let store = store(8);
        let cache = cache_over(&store, &pool(), CacheOptions::default(), None);
        cache.get(0).unwrap().set(&[1, 1], 77.0);

        store.set_fail_writes(true);
        assert!(cache.persist_all_and_wait().is_err());
        assert!(cache.get(0).unwrap().is_dirty());
        assert_eq!(store.sample(0, [1, 1, 0, 0, 0]), 101.0);

        store.set_fail_writes(false);
        cache.persist_all_and_wait().unwrap();
        assert_eq!(store.sample(0, [1, 1, 0, 0, 0]), 77.0);
        assert!(!cache.get(0).unwrap().is_dirty());
        assert!(cache.evict(0).unwrap().is_none());
    }

    #[test]
    fn background_loads_persist_without_waiting_for_queue_room() {
        let store = store(8);
        let pool = Arc::new(IoPool::new(1, 1).unwrap());
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, release_rx) = (Mutex::new(started_tx), Mutex::new(release_rx));
        let initializer = Initializer::compute(move |_, extent, kind| {
            let _ = started_tx.lock().unwrap().send(());
            let _ = release_rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
            SampleBuffer::zeros(kind, extent.iter().product())
        });
        let options = CacheOptions {
            persist_on_load: true,
            ..Default::default()
        };
        let cache = cache_over(&store, &pool, options, Some(initializer));

        assert!(cache.prefetch(0).unwrap());
        started_rx.recv().unwrap();
        assert!(cache.prefetch(1).unwrap());
        assert_eq!(pool.queued(), 1);
        drop(release_tx);

        let (idle_tx, idle_rx) = mpsc::channel();
        let waiter = pool.clone();
        thread::spawn(move || {
            waiter.wait_idle();
            let _ = idle_tx.send(());
        });
        assert!(idle_rx.recv_timeout(Duration::from_secs(5)).is_ok());

        // the queue was full when tile 0 came in, so it is left for a later write-back
        assert!(cache.get_if_present(0).unwrap().is_dirty());
        assert_eq!(cache.materialization_state(0), MaterializationState::Virtual);
        assert_eq!(cache.materialization_state(1), MaterializationState::Materialized);
        cache.persist_all_and_wait().unwrap();
        assert_eq!(cache.materialization_state(0), MaterializationState::Materialized);
    }

    #[test]
    fn reloads_racing_an_eviction_never_see_older_data() {
        let store = store(8);
        let pool = pool();
        let cache = cache_over(&store, &pool, CacheOptions::default(), Some(Initializer::Zeros));
        let done = AtomicBool::new(false);
        thread::scope(|s| {
            for _ in 0..3 {
                s.spawn(|| {
                    let mut last = 0.0;
                    while !done.load(Ordering::SeqCst) {
                        let value = cache.get(0).unwrap().get(&[0, 0]);
                        assert!(value >= last, "read {} after {}", value, last);
                        last = value;
                    }
                });
            }
            for i in 1..=200 {
                cache.get(0).unwrap().set(&[0, 0], i as f64);
                cache.evict(0).unwrap();
            }
            done.store(true, Ordering::SeqCst);
        });
        pool.wait_idle();
        assert_eq!(store.sample(0, [0, 0, 0, 0, 0]), 200.0);
        assert_eq!(cache.get(0).unwrap().get(&[0, 0]), 200.0);
    }

    #[test]
    fn persist_all_keeps_tiles_resident() {
        let store = store(8);
        let cache = cache_over(&store, &pool(), CacheOptions::default(), None);
        cache.get(0).unwrap().set(&[0, 0], 1.0);
        cache.get(3).unwrap().set(&[7, 7], 2.0);
        cache.get(2).unwrap();
        cache.persist_all_and_wait().unwrap();
        assert_eq!(store.write_count(), 2);
        assert_eq!(cache.resident_tiles(), 3);
        assert!(!cache.get(0).unwrap().is_dirty());

        assert!(cache.persist_all().unwrap().is_empty());
        store.set_fail_writes(true);
        cache.get(2).unwrap().set(&[0, 4], 3.0);
        assert!(cache.persist_all_and_wait().is_err());
    }

    #[test]
    fn bounded_cache_evicts_least_recently_used() {
        let store = store(8);
        let options = CacheOptions {
            cache_bound: CacheBound::MaxTiles(2),
            ..Default::default()
        };
        let cache = cache_over(&store, &pool(), options, None);
        cache.get(0).unwrap();
        cache.get(1).unwrap();
        cache.get(0).unwrap();
        cache.get(2).unwrap();
        assert_eq!(cache.resident_tiles(), 2);
        assert!(cache.get_if_present(1).is_none());
        assert!(cache.get_if_present(0).is_some());
        assert!(cache.get_if_present(2).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn tiles_in_use_are_not_evicted() {
        let store = store(8);
        let options = CacheOptions {
            cache_bound: CacheBound::MaxTiles(1),
            ..Default::default()
        };
        let pool = pool();
        let cache = cache_over(&store, &pool, options, None);
        let held = cache.get(0).unwrap();
        cache.get(1).unwrap();
        cache.get(2).unwrap();
        assert!(cache.get_if_present(0).is_some());
        assert!(cache.get_if_present(1).is_none());
        assert_eq!(cache.resident_tiles(), 2);

        held.set(&[0, 0], 5.0);
        drop(held);
        cache.get(3).unwrap();
        assert_eq!(cache.resident_tiles(), 1);
        assert!(cache.get_if_present(3).is_some());
        pool.wait_idle();
        assert_eq!(store.sample(0, [0, 0, 0, 0, 0]), 5.0);
    }

    #[test]
    fn background_loads_respect_the_bound() {
        let store = store(16);
        let pool = pool();
        let options = CacheOptions {
            cache_bound: CacheBound::MaxTiles(2),
            ..Default::default()
        };
        let cache = cache_over(&store, &pool, options, None);
        for index in 0..8 {
            assert!(cache.prefetch(index).unwrap());
            pool.wait_idle();
            assert!(cache.resident_tiles() <= 2);
        }
        assert!(cache.get_if_present(6).is_some());
        assert!(cache.get_if_present(7).is_some());
        assert_eq!(cache.stats().evictions, 6);
    }

    #[test]
    fn prefetch_loads_in_the_background() {
        let store = store(8);
        let pool = pool();
        let cache = cache_over(&store, &pool, CacheOptions::default(), None);
        assert!(cache.get_if_present(3).is_none());
        assert!(cache.prefetch(3).unwrap());
        pool.wait_idle();
        assert!(cache.get_if_present(3).is_some());
        assert!(!cache.prefetch(3).unwrap());
        assert_eq!(store.read_count(), 1);
    }

    #[test]
    fn rejects_invalid_requests() {
        let store = store(8);
        let cache = cache_over(&store, &pool(), CacheOptions::default(), None);
        assert!(matches!(cache.get(4), Err(Error::InvalidGeometry(_))));
        assert!(matches!(cache.invalidate(0), Err(Error::UnsupportedOperation(_))));
        assert!(matches!(cache.invalidate_all(), Err(Error::UnsupportedOperation(_))));
    }
}
