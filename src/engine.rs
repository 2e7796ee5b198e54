//! The view pipeline: request, plan, fetch, copy, finalize, deliver.
//!
//! One requester thread allocates views and plans their tile copies, a
//! rayon pool fetches tiles into the per-level caches, per-level copier
//! pools move tile rectangles into view buffers, and one finalizer thread
//! runs the border fill and delivers views (reordered by request index
//! when ordering is on). Back-pressure flows backwards from the view free
//! pools: nothing allocates faster than the consumer releases.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::border::BorderCreator;
use crate::cache::{AcquireOutcome, CacheStats, TileCache, TileKey};
use crate::config::TileFlowConfig;
use crate::copier::{CopierPool, CopyMsg, PlannedCopy};
use crate::error::{ConfigError, TileFlowError};
use crate::loader::{FileGeometry, LoaderPool};
use crate::planner;
use crate::traversal::Traversal;
use crate::view::{View, ViewPool, ViewState};

/// Pending copy jobs admitted per level before planners and fetchers block.
const COPY_QUEUE_CAP: usize = 128;
/// Completed views buffered ahead of the finalizer.
const FINALIZE_QUEUE_CAP: usize = 64;
/// Pending requester commands.
const COMMAND_QUEUE_CAP: usize = 64;

pub(crate) enum FinalizeMsg<T> {
    Completed(Arc<ViewState<T>>),
    /// Re-evaluate the end-of-stream condition.
    Check,
    Shutdown,
}

enum Command {
    RequestView { level: usize, tile_coord: Vec<usize> },
    RequestLevel { level: usize },
    Finish,
}

struct LevelShared<T> {
    cache: TileCache<T>,
    pool: Arc<ViewPool<T>>,
    copier_tx: Sender<CopyMsg<T>>,
}

struct EngineShared<T> {
    file: FileGeometry,
    radii: Vec<usize>,
    release_count: Vec<usize>,
    creator: Arc<dyn BorderCreator<T>>,
    levels: Vec<LevelShared<T>>,
    loaders: LoaderPool<T>,
    fetch_pool: rayon::ThreadPool,
    finalizer_tx: Sender<FinalizeMsg<T>>,
    /// Views allocated so far; also the next request index.
    requested: AtomicU64,
    requesting_done: AtomicBool,
    /// Valid once `requesting_done` is set.
    total_requests: AtomicU64,
    active_fetches: Mutex<usize>,
    fetches_idle: Condvar,
}

impl<T> EngineShared<T> {
    fn wait_fetches_idle(&self) {
        let mut active = self.active_fetches.lock();
        while *active > 0 {
            self.fetches_idle.wait(&mut active);
        }
    }
}

/// Streaming view loader over one tiled multi-dimensional file.
///
/// Request views one by one or a level at a time, then pull them with
/// [`next`](Self::next) and hand buffers back with
/// [`release`](Self::release).
pub struct TileFlow<T: Copy + Default + Send + Sync + 'static> {
    shared: Arc<EngineShared<T>>,
    command_tx: Option<Sender<Command>>,
    requester: Option<JoinHandle<()>>,
    finalizer: Option<JoinHandle<()>>,
    copier_pools: Vec<CopierPool>,
    copy_threads: usize,
    output_rx: Mutex<Receiver<View<T>>>,
    finished: AtomicBool,
}

impl<T: Copy + Default + Send + Sync + 'static> std::fmt::Debug for TileFlow<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileFlow")
            .field("copy_threads", &self.copy_threads)
            .field("finished", &self.finished)
            .finish()
    }
}

impl<T: Copy + Default + Send + Sync + 'static> TileFlow<T> {
    /// Build the engine and spin up its worker pools.
    pub fn new(config: TileFlowConfig<T>) -> Result<Self, ConfigError> {
        let TileFlowConfig {
            loader,
            file,
            radii,
            cache_capacity_mb,
            view_available,
            release_count,
            ordered,
            border_creator,
            traversal,
            copy_threads,
        } = config;

        let element_size = std::mem::size_of::<T>();
        for level in 0..file.nb_levels() {
            let tile_bytes = file.tile_elements(level) * element_size;
            if cache_capacity_mb[level] * 1024 * 1024 < tile_bytes {
                return Err(ConfigError::CacheCapacityTooSmall {
                    level,
                    capacity_mb: cache_capacity_mb[level],
                    tile_bytes,
                });
            }
        }

        let (finalizer_tx, finalizer_rx) = bounded(FINALIZE_QUEUE_CAP);
        let output_cap = view_available.iter().sum::<usize>().max(1);
        let (output_tx, output_rx) = bounded(output_cap);

        let mut levels = Vec::with_capacity(file.nb_levels());
        let mut copier_pools = Vec::with_capacity(file.nb_levels());
        for level in 0..file.nb_levels() {
            let tile_bytes = file.tile_elements(level) * element_size;
            let view_elements: usize = file.tile_dims[level]
                .iter()
                .zip(&radii)
                .map(|(&t, &r)| t + 2 * r)
                .product();
            let (copier_tx, copier_rx) = bounded(COPY_QUEUE_CAP);
            copier_pools.push(CopierPool::spawn(
                level,
                copy_threads,
                file.tile_dims[level].clone(),
                copier_rx,
                finalizer_tx.clone(),
            ));
            levels.push(LevelShared {
                cache: TileCache::new(cache_capacity_mb[level] * 1024 * 1024, tile_bytes),
                pool: Arc::new(ViewPool::new(view_available[level], view_elements)),
                copier_tx,
            });
        }

        let (loaders, fetch_threads) = LoaderPool::new(loader);
        let fetch_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(fetch_threads)
            .thread_name(|idx| format!("tile-fetch-{idx}"))
            .build()
            .expect("failed to create tile fetch pool");

        let shared = Arc::new(EngineShared {
            file,
            radii,
            release_count,
            creator: border_creator,
            levels,
            loaders,
            fetch_pool,
            finalizer_tx,
            requested: AtomicU64::new(0),
            requesting_done: AtomicBool::new(false),
            total_requests: AtomicU64::new(0),
            active_fetches: Mutex::new(0),
            fetches_idle: Condvar::new(),
        });

        let (command_tx, command_rx) = bounded(COMMAND_QUEUE_CAP);
        let requester = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("view-request".into())
                .spawn(move || requester_loop(shared, command_rx, traversal))
                .expect("failed to spawn requester thread")
        };
        let finalizer = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("view-finalize".into())
                .spawn(move || finalizer_loop(shared, finalizer_rx, output_tx, ordered))
                .expect("failed to spawn finalizer thread")
        };

        Ok(Self {
            shared,
            command_tx: Some(command_tx),
            requester: Some(requester),
            finalizer: Some(finalizer),
            copier_pools,
            copy_threads,
            output_rx: Mutex::new(output_rx),
            finished: AtomicBool::new(false),
        })
    }

    /// Request a single view centered on `tile_coord` at `level`.
    pub fn request_view(&self, level: usize, tile_coord: &[usize]) -> Result<(), TileFlowError> {
        self.check_level(level)?;
        let nb_tiles = &self.shared.file.nb_tiles[level];
        if tile_coord.len() != nb_tiles.len()
            || tile_coord.iter().zip(nb_tiles).any(|(c, n)| c >= n)
        {
            return Err(ConfigError::TileOutOfRange {
                level,
                coord: tile_coord.to_vec(),
                nb_tiles: nb_tiles.clone(),
            }
            .into());
        }
        self.send_command(Command::RequestView {
            level,
            tile_coord: tile_coord.to_vec(),
        })
    }

    /// Request every view of `level`, in the configured traversal order.
    pub fn request_all_views(&self, level: usize) -> Result<(), TileFlowError> {
        self.check_level(level)?;
        self.send_command(Command::RequestLevel { level })
    }

    /// Signal that no more views will be requested; after the last
    /// outstanding view is delivered, [`next`](Self::next) returns `None`.
    pub fn finish_requesting_views(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(tx) = &self.command_tx {
            let _ = tx.send(Command::Finish);
        }
    }

    /// Next delivered view, blocking; `None` once every requested view has
    /// been delivered after [`finish_requesting_views`](Self::finish_requesting_views).
    pub fn next(&self) -> Option<View<T>> {
        self.output_rx.lock().recv().ok()
    }

    /// Return a view. Once it has been returned the configured number of
    /// times and the last handle is gone, its buffer rejoins the free pool
    /// and unblocks the next allocation.
    pub fn release(&self, view: View<T>) {
        let mut mutable = view.state.mutable.lock();
        assert!(
            mutable.releases_remaining > 0,
            "view released more times than configured"
        );
        mutable.releases_remaining -= 1;
        // Dropping `view` after the last release drops the last handle and
        // recycles the buffer through `ViewState::drop`.
    }

    /// Dimension names reported by the loader.
    pub fn dim_names(&self) -> &[String] {
        &self.shared.file.dim_names
    }

    /// Number of pyramid levels.
    pub fn nb_levels(&self) -> usize {
        self.shared.file.nb_levels()
    }

    /// Element count per dimension at `level`.
    pub fn full_dims(&self, level: usize) -> &[usize] {
        &self.shared.file.full_dims[level]
    }

    /// Physical tile shape at `level`.
    pub fn tile_dims(&self, level: usize) -> &[usize] {
        &self.shared.file.tile_dims[level]
    }

    /// Tile grid extent at `level`.
    pub fn nb_tiles_per_dim(&self, level: usize) -> &[usize] {
        &self.shared.file.nb_tiles[level]
    }

    /// Shape of the views produced for `level`: tile dims plus the halo.
    pub fn view_dims(&self, level: usize) -> Vec<usize> {
        self.shared.file.tile_dims[level]
            .iter()
            .zip(&self.shared.radii)
            .map(|(&t, &r)| t + 2 * r)
            .collect()
    }

    /// Tile cache statistics for `level`.
    pub fn cache_stats(&self, level: usize) -> CacheStats {
        self.shared.levels[level].cache.stats()
    }

    fn check_level(&self, level: usize) -> Result<(), TileFlowError> {
        if level >= self.shared.file.nb_levels() {
            return Err(ConfigError::LevelOutOfRange {
                level,
                nb_levels: self.shared.file.nb_levels(),
            }
            .into());
        }
        Ok(())
    }

    fn send_command(&self, command: Command) -> Result<(), TileFlowError> {
        if self.finished.load(Ordering::Acquire) {
            return Err(TileFlowError::RequestAfterFinish);
        }
        match &self.command_tx {
            Some(tx) if tx.send(command).is_ok() => Ok(()),
            _ => Err(TileFlowError::ShutDown),
        }
    }
}

impl<T: Copy + Default + Send + Sync + 'static> Drop for TileFlow<T> {
    fn drop(&mut self) {
        for level in &self.shared.levels {
            level.cache.shutdown();
            level.pool.shutdown();
        }
        self.command_tx = None;
        if let Some(handle) = self.requester.take() {
            let _ = handle.join();
        }
        // In-flight fetches still feed the copier queues; let them land
        // before stopping the copiers so nothing blocks on a dead channel.
        self.shared.wait_fetches_idle();
        for level in &self.shared.levels {
            for _ in 0..self.copy_threads {
                let _ = level.copier_tx.send(CopyMsg::Shutdown);
            }
        }
        for pool in &mut self.copier_pools {
            pool.join();
        }
        let _ = self.shared.finalizer_tx.send(FinalizeMsg::Shutdown);
        if let Some(handle) = self.finalizer.take() {
            let _ = handle.join();
        }
    }
}

fn requester_loop<T: Copy + Default + Send + Sync + 'static>(
    shared: Arc<EngineShared<T>>,
    commands: Receiver<Command>,
    traversal: Arc<dyn Traversal>,
) {
    while let Ok(command) = commands.recv() {
        match command {
            Command::RequestView { level, tile_coord } => {
                if !process_request(&shared, level, &tile_coord) {
                    return;
                }
            }
            Command::RequestLevel { level } => {
                for tile_coord in traversal.traversal(&shared.file.nb_tiles[level]) {
                    if !process_request(&shared, level, &tile_coord) {
                        return;
                    }
                }
            }
            Command::Finish => {
                shared
                    .total_requests
                    .store(shared.requested.load(Ordering::Relaxed), Ordering::Release);
                shared.requesting_done.store(true, Ordering::Release);
                let _ = shared.finalizer_tx.send(FinalizeMsg::Check);
                return;
            }
        }
    }
}

/// Allocate, plan and dispatch one view. Returns `false` on shutdown.
fn process_request<T: Copy + Default + Send + Sync + 'static>(
    shared: &Arc<EngineShared<T>>,
    level: usize,
    tile_coord: &[usize],
) -> bool {
    let level_rt = &shared.levels[level];
    let Some(buffer) = level_rt.pool.acquire() else {
        return false;
    };
    let geometry = planner::view_geometry(&shared.file, level, tile_coord, &shared.radii);
    let index = shared.requested.fetch_add(1, Ordering::Relaxed);
    let view = ViewState::new(
        buffer,
        Arc::downgrade(&level_rt.pool),
        geometry,
        index,
        shared.release_count[level],
    );

    let requests = planner::plan_requests(&view.geometry, &shared.file, shared.creator.as_ref());
    view.outstanding.store(requests.len(), Ordering::Release);
    if requests.is_empty() {
        let _ = shared.finalizer_tx.send(FinalizeMsg::Completed(view));
        return true;
    }

    for (key, region) in requests {
        let copy = PlannedCopy {
            view: Arc::clone(&view),
            region,
        };
        match level_rt.cache.acquire(key.clone(), copy) {
            AcquireOutcome::Ready { handle, copy } => {
                if level_rt
                    .copier_tx
                    .send(CopyMsg::Copy { tile: handle, copy })
                    .is_err()
                {
                    return false;
                }
            }
            AcquireOutcome::Registered => {}
            AcquireOutcome::MustFetch => spawn_fetch(shared, level, key),
            AcquireOutcome::Shutdown => return false,
        }
    }
    true
}

/// Fetch one tile on the rayon pool and fan the result out to the cache's
/// waiters.
fn spawn_fetch<T: Copy + Default + Send + Sync + 'static>(
    shared: &Arc<EngineShared<T>>,
    level: usize,
    key: TileKey,
) {
    *shared.active_fetches.lock() += 1;
    let elements = shared.file.tile_elements(level);
    let job_shared = Arc::clone(shared);
    shared.fetch_pool.spawn(move || {
        let (thread_id, mut loader) = job_shared.loaders.checkout();
        let mut data = vec![T::default(); elements].into_boxed_slice();
        let result = loader
            .load_tile_from_file(&mut data, &key.coord, key.level, thread_id)
            .map(|()| data);
        job_shared.loaders.checkin(thread_id, loader);

        let level_rt = &job_shared.levels[level];
        for msg in level_rt.cache.complete(&key, result) {
            let _ = level_rt.copier_tx.send(msg);
        }

        let mut active = job_shared.active_fetches.lock();
        *active -= 1;
        if *active == 0 {
            job_shared.fetches_idle.notify_all();
        }
    });
}

fn finalizer_loop<T: Copy + Default + Send + Sync + 'static>(
    shared: Arc<EngineShared<T>>,
    completed: Receiver<FinalizeMsg<T>>,
    output: Sender<View<T>>,
    ordered: bool,
) {
    let mut output = Some(output);
    let mut reorder: BTreeMap<u64, Arc<ViewState<T>>> = BTreeMap::new();
    let mut next_index: u64 = 0;
    let mut delivered: u64 = 0;

    while let Ok(msg) = completed.recv() {
        match msg {
            FinalizeMsg::Completed(view) => {
                finalize_view(&shared, &view);
                if ordered {
                    reorder.insert(view.index, view);
                    while let Some(view) = reorder.remove(&next_index) {
                        deliver(&mut output, view, &mut delivered);
                        next_index += 1;
                    }
                } else {
                    deliver(&mut output, view, &mut delivered);
                }
            }
            FinalizeMsg::Check => {}
            FinalizeMsg::Shutdown => return,
        }
        if shared.requesting_done.load(Ordering::Acquire)
            && delivered == shared.total_requests.load(Ordering::Acquire)
        {
            // Closing the output channel is what turns `next()` into `None`.
            output = None;
        }
    }
}

/// Run the border fill once every planned copy has landed, then hand off.
fn finalize_view<T: Copy + Default + Send + Sync + 'static>(
    shared: &Arc<EngineShared<T>>,
    view: &Arc<ViewState<T>>,
) {
    debug_assert_eq!(view.outstanding.load(Ordering::Acquire), 0);
    let failed = view.mutable.lock().error.is_some();
    if failed {
        return;
    }
    // Exclusive: copies are done and only the finalizer thread fills.
    let data = unsafe { view.buffer().as_mut_slice() };
    shared.creator.fill_border(data, &view.geometry);
}

fn deliver<T>(output: &mut Option<Sender<View<T>>>, view: Arc<ViewState<T>>, delivered: &mut u64) {
    *delivered += 1;
    if let Some(tx) = output {
        // Capacity equals the total view pool size, so this never blocks.
        let _ = tx.send(View { state: view });
    }
}
