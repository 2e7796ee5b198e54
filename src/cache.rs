//! Refcounted LRU cache of physical tiles for one pyramid level.
//!
//! The cache coalesces concurrent requests for the same tile: the first
//! request admits a slot in `Loading` state and triggers a fetch, later
//! requests pile onto the slot's FIFO waiter list, and completion fans the
//! tile out to every waiter. A slot is pinned while any copy job references
//! it (refcount above the cache's own residency count of 1) and eviction is
//! strict LRU among unpinned ready slots. Fetch failures are delivered to
//! the waiters and never cached.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::copier::{CopyMsg, PlannedCopy};
use crate::error::LoadResult;

/// Physical tile coordinate key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub level: usize,
    pub coord: Vec<usize>,
}

impl TileKey {
    pub fn new(level: usize, coord: Vec<usize>) -> Self {
        Self { level, coord }
    }
}

/// A fetched physical tile, shared read-only between copy jobs.
pub(crate) struct PhysicalTile<T> {
    data: Box<[T]>,
}

impl<T> PhysicalTile<T> {
    pub(crate) fn data(&self) -> &[T] {
        &self.data
    }
}

/// A pinned reference to a ready tile. Dropping the handle releases the
/// pin; once only the cache itself holds the tile it becomes evictable.
pub(crate) struct TileHandle<T> {
    tile: Arc<PhysicalTile<T>>,
    cache: Arc<CacheShared<T>>,
    key: TileKey,
}

impl<T> TileHandle<T> {
    pub(crate) fn data(&self) -> &[T] {
        self.tile.data()
    }
}

impl<T> Drop for TileHandle<T> {
    fn drop(&mut self) {
        self.cache.release(&self.key);
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub resident_bytes: usize,
    pub resident_tiles: usize,
}

enum SlotState<T> {
    /// Fetch dispatched, data not yet available.
    Loading,
    Ready(Arc<PhysicalTile<T>>),
}

struct Slot<T> {
    state: SlotState<T>,
    /// Cache residency (1) plus one per registered or active copy job.
    refcount: usize,
    /// Copy jobs registered while the slot was loading, FIFO.
    waiters: Vec<PlannedCopy<T>>,
}

struct CacheState<T> {
    slots: HashMap<TileKey, Slot<T>>,
    /// Front = least recently used.
    lru: VecDeque<TileKey>,
    resident_bytes: usize,
    shutdown: bool,
}

pub(crate) struct CacheShared<T> {
    state: Mutex<CacheState<T>>,
    /// Signaled when a slot becomes evictable or capacity is freed.
    evictable: Condvar,
    capacity_bytes: usize,
    tile_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Outcome of an acquire; the caller owns the follow-up.
pub(crate) enum AcquireOutcome<T> {
    /// Tile is resident: dispatch the returned copy job immediately.
    Ready {
        handle: TileHandle<T>,
        copy: PlannedCopy<T>,
    },
    /// Tile is being fetched; the copy was queued on its waiter list.
    Registered,
    /// A new slot was admitted in loading state with the copy as its first
    /// waiter: the caller must schedule the fetch.
    MustFetch,
    /// The cache was shut down while waiting for capacity.
    Shutdown,
}

/// Per-level bounded tile cache.
pub(crate) struct TileCache<T> {
    shared: Arc<CacheShared<T>>,
}

impl<T> TileCache<T> {
    /// Create a cache holding at most `capacity_bytes` of `tile_bytes`-sized
    /// tiles. The engine validates `capacity_bytes >= tile_bytes` up front.
    pub(crate) fn new(capacity_bytes: usize, tile_bytes: usize) -> Self {
        assert!(
            tile_bytes > 0 && capacity_bytes >= tile_bytes,
            "cache capacity below a single tile"
        );
        Self {
            shared: Arc::new(CacheShared {
                state: Mutex::new(CacheState {
                    slots: HashMap::new(),
                    lru: VecDeque::new(),
                    resident_bytes: 0,
                    shutdown: false,
                }),
                evictable: Condvar::new(),
                capacity_bytes,
                tile_bytes,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    /// Request a tile on behalf of a copy job.
    ///
    /// Blocks only when the cache is full and nothing is evictable; every
    /// other path returns immediately with the job either dispatchable or
    /// parked on a waiter list.
    pub(crate) fn acquire(&self, key: TileKey, copy: PlannedCopy<T>) -> AcquireOutcome<T> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        loop {
            if state.shutdown {
                return AcquireOutcome::Shutdown;
            }

            if let Some(slot) = state.slots.get_mut(&key) {
                slot.refcount += 1;
                match &slot.state {
                    SlotState::Ready(tile) => {
                        shared.hits.fetch_add(1, Ordering::Relaxed);
                        let tile = Arc::clone(tile);
                        touch(&mut state.lru, &key);
                        return AcquireOutcome::Ready {
                            handle: TileHandle {
                                tile,
                                cache: Arc::clone(shared),
                                key,
                            },
                            copy,
                        };
                    }
                    SlotState::Loading => {
                        shared.hits.fetch_add(1, Ordering::Relaxed);
                        slot.waiters.push(copy);
                        touch(&mut state.lru, &key);
                        return AcquireOutcome::Registered;
                    }
                }
            }

            // Miss: make room for a new slot, evicting strictly LRU among
            // unpinned ready slots, or wait until one shows up.
            if state.resident_bytes + shared.tile_bytes <= shared.capacity_bytes {
                break;
            }
            let candidate = state
                .lru
                .iter()
                .position(|k| {
                    state
                        .slots
                        .get(k)
                        .is_some_and(|s| s.refcount == 1 && matches!(s.state, SlotState::Ready(_)))
                })
                .map(|pos| state.lru[pos].clone());
            match candidate {
                Some(victim) => {
                    remove_slot(&mut state, &victim, shared.tile_bytes);
                    shared.evictions.fetch_add(1, Ordering::Relaxed);
                    log::debug!("evicted tile {victim:?}");
                }
                None => shared.evictable.wait(&mut state),
            }
        }

        shared.misses.fetch_add(1, Ordering::Relaxed);
        state.slots.insert(
            key.clone(),
            Slot {
                state: SlotState::Loading,
                refcount: 2, // residency + this job
                waiters: vec![copy],
            },
        );
        state.lru.push_back(key);
        state.resident_bytes += shared.tile_bytes;
        AcquireOutcome::MustFetch
    }

    /// Install a fetch result and collect the dispatchable jobs for every
    /// waiter, in registration order. The caller sends them after this
    /// returns, outside the cache lock.
    ///
    /// On failure the slot is dropped on the spot; failures are not cached.
    pub(crate) fn complete(&self, key: &TileKey, result: LoadResult<Box<[T]>>) -> Vec<CopyMsg<T>> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        let Some(slot) = state.slots.get_mut(key) else {
            debug_assert!(state.shutdown, "completed fetch for unknown slot");
            return Vec::new();
        };
        debug_assert!(matches!(slot.state, SlotState::Loading));
        let waiters = std::mem::take(&mut slot.waiters);

        match result {
            Ok(data) => {
                let tile = Arc::new(PhysicalTile { data });
                slot.state = SlotState::Ready(Arc::clone(&tile));
                drop(state);
                waiters
                    .into_iter()
                    .map(|copy| CopyMsg::Copy {
                        tile: TileHandle {
                            tile: Arc::clone(&tile),
                            cache: Arc::clone(shared),
                            key: key.clone(),
                        },
                        copy,
                    })
                    .collect()
            }
            Err(error) => {
                log::warn!("fetch failed for tile {key:?}: {error}");
                remove_slot(&mut state, key, shared.tile_bytes);
                shared.evictable.notify_all();
                drop(state);
                let error = Arc::new(error);
                waiters
                    .into_iter()
                    .map(|copy| CopyMsg::Failed {
                        copy,
                        error: Arc::clone(&error),
                    })
                    .collect()
            }
        }
    }

    /// Unblock capacity waiters and refuse further admissions.
    pub(crate) fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        state.shutdown = true;
        self.shared.evictable.notify_all();
    }

    pub(crate) fn stats(&self) -> CacheStats {
        let state = self.shared.state.lock();
        CacheStats {
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
            evictions: self.shared.evictions.load(Ordering::Relaxed),
            resident_bytes: state.resident_bytes,
            resident_tiles: state.slots.len(),
        }
    }
}

impl<T> CacheShared<T> {
    /// Drop one job reference; a slot left with only its residency count is
    /// evictable and capacity waiters are woken.
    fn release(&self, key: &TileKey) {
        let mut state = self.state.lock();
        let Some(slot) = state.slots.get_mut(key) else {
            // Teardown may drop the slot before in-flight handles.
            debug_assert!(state.shutdown, "released handle for unknown slot");
            return;
        };
        assert!(slot.refcount > 1, "tile refcount underflow");
        slot.refcount -= 1;
        if slot.refcount == 1 {
            self.evictable.notify_all();
        }
    }
}

/// Move `key` to the most-recently-used end.
fn touch(lru: &mut VecDeque<TileKey>, key: &TileKey) {
    if let Some(pos) = lru.iter().position(|k| k == key) {
        lru.remove(pos);
        lru.push_back(key.clone());
    }
}

fn remove_slot<T>(state: &mut CacheState<T>, key: &TileKey, tile_bytes: usize) {
    if state.slots.remove(key).is_some() {
        if let Some(pos) = state.lru.iter().position(|k| k == key) {
            state.lru.remove(pos);
        }
        state.resident_bytes -= tile_bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoadError;
    use crate::geometry::CopyRegion;
    use crate::view::{ViewBuffer, ViewGeometry, ViewState};

    fn test_view(len: usize) -> Arc<ViewState<u8>> {
        ViewState::new(
            ViewBuffer::new(len),
            std::sync::Weak::new(),
            ViewGeometry {
                level: 0,
                tile_coord: vec![0],
                origin: vec![0],
                view_dims: vec![len],
                radii: vec![0],
                front_fill: vec![0],
                back_fill: vec![0],
                center_dims: vec![len],
            },
            0,
            1,
        )
    }

    fn test_copy(len: usize) -> PlannedCopy<u8> {
        PlannedCopy {
            view: test_view(len),
            region: CopyRegion::new(vec![0], vec![0], vec![len]),
        }
    }

    fn ready_tile(cache: &TileCache<u8>, key: TileKey, fill: u8) -> Vec<CopyMsg<u8>> {
        match cache.acquire(key.clone(), test_copy(4)) {
            AcquireOutcome::MustFetch => {}
            _ => panic!("expected a fresh miss"),
        }
        cache.complete(&key, Ok(vec![fill; 4].into_boxed_slice()))
    }

    #[test]
    fn test_miss_then_hit() {
        let cache = TileCache::new(64, 4);
        let key = TileKey::new(0, vec![0, 0]);

        let msgs = ready_tile(&cache, key.clone(), 7);
        assert_eq!(msgs.len(), 1);
        drop(msgs); // handle drop releases the job pin

        match cache.acquire(key, test_copy(4)) {
            AcquireOutcome::Ready { handle, .. } => assert_eq!(handle.data(), &[7, 7, 7, 7]),
            _ => panic!("expected a resident hit"),
        }
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_waiters_coalesce_fifo() {
        let cache = TileCache::new(64, 4);
        let key = TileKey::new(0, vec![1]);

        assert!(matches!(
            cache.acquire(key.clone(), test_copy(4)),
            AcquireOutcome::MustFetch
        ));
        // Tag each waiter through its destination offset to observe order.
        for dst in 1..3usize {
            let copy = PlannedCopy {
                view: test_view(8),
                region: CopyRegion::new(vec![0], vec![dst], vec![4]),
            };
            assert!(matches!(
                cache.acquire(key.clone(), copy),
                AcquireOutcome::Registered
            ));
        }

        let msgs = cache.complete(&key, Ok(vec![1u8; 4].into_boxed_slice()));
        let offsets: Vec<usize> = msgs
            .iter()
            .map(|msg| match msg {
                CopyMsg::Copy { copy, .. } => copy.region.dst_begin[0],
                _ => panic!("expected copy messages"),
            })
            .collect();
        assert_eq!(offsets, vec![0, 1, 2]);
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().hits, 2);
    }

    #[test]
    fn test_failure_not_cached() {
        let cache = TileCache::new(64, 4);
        let key = TileKey::new(0, vec![2]);

        assert!(matches!(
            cache.acquire(key.clone(), test_copy(4)),
            AcquireOutcome::MustFetch
        ));
        let msgs = cache.complete(&key, Err(LoadError::Loader("boom".into())));
        assert_eq!(msgs.len(), 1);
        assert!(matches!(msgs[0], CopyMsg::Failed { .. }));
        assert_eq!(cache.stats().resident_tiles, 0);

        // The next request is a fresh miss, not a cached failure.
        assert!(matches!(
            cache.acquire(key, test_copy(4)),
            AcquireOutcome::MustFetch
        ));
    }

    #[test]
    fn test_lru_eviction_order() {
        // Room for two tiles.
        let cache = TileCache::new(8, 4);
        let key_a = TileKey::new(0, vec![0]);
        let key_b = TileKey::new(0, vec![1]);
        let key_c = TileKey::new(0, vec![2]);

        drop(ready_tile(&cache, key_a.clone(), 1));
        drop(ready_tile(&cache, key_b.clone(), 2));

        // Touch A so B becomes least recently used.
        match cache.acquire(key_a.clone(), test_copy(4)) {
            AcquireOutcome::Ready { handle, .. } => drop(handle),
            _ => panic!("expected hit"),
        }

        drop(ready_tile(&cache, key_c.clone(), 3));
        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.resident_tiles, 2);

        // B was evicted, A survived.
        assert!(matches!(
            cache.acquire(key_a, test_copy(4)),
            AcquireOutcome::Ready { .. }
        ));
        assert!(matches!(
            cache.acquire(key_b, test_copy(4)),
            AcquireOutcome::MustFetch
        ));
    }

    #[test]
    fn test_pinned_tile_not_evicted() {
        // Room for one tile only.
        let cache = Arc::new(TileCache::new(4, 4));
        let key_a = TileKey::new(0, vec![0]);
        let key_b = TileKey::new(0, vec![1]);

        let msgs = ready_tile(&cache, key_a.clone(), 1);
        let pinned = match msgs.into_iter().next().unwrap() {
            CopyMsg::Copy { tile, .. } => tile,
            _ => panic!("expected copy"),
        };

        // A is pinned, so admitting B must wait until the handle drops.
        let contender = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                matches!(cache.acquire(key_b, test_copy(4)), AcquireOutcome::MustFetch)
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!contender.is_finished());

        drop(pinned);
        assert!(contender.join().unwrap());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_resident_bytes_bounded() {
        let cache = TileCache::new(12, 4);
        for i in 0..6usize {
            drop(ready_tile(&cache, TileKey::new(0, vec![i]), i as u8));
            assert!(cache.stats().resident_bytes <= 12);
        }
        assert_eq!(cache.stats().resident_tiles, 3);
    }

    #[test]
    fn test_shutdown_unblocks_capacity_waiter() {
        let cache = Arc::new(TileCache::new(4, 4));
        let key_a = TileKey::new(0, vec![0]);

        let msgs = ready_tile(&cache, key_a, 1);
        let _pinned = match msgs.into_iter().next().unwrap() {
            CopyMsg::Copy { tile, .. } => tile,
            _ => panic!("expected copy"),
        };

        let contender = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                matches!(
                    cache.acquire(TileKey::new(0, vec![1]), test_copy(4)),
                    AcquireOutcome::Shutdown
                )
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        cache.shutdown();
        assert!(contender.join().unwrap());
    }
}
