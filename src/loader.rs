//! The tile loader contract consumed by the engine.
//!
//! A `TileLoader` is the only thing that knows the file format. It reports
//! the file geometry per pyramid level and fills caller-provided buffers
//! with physical tiles. The engine clones it once per fetch thread through
//! `clone_loader`, so implementations are free to keep stateful file
//! handles.

use parking_lot::Mutex;

use crate::error::{ConfigError, LoadResult};

/// Contract between the engine and a concrete file reader.
pub trait TileLoader<T>: Send {
    /// Number of dimensions of the file, channels included as the innermost
    /// dimension when present.
    fn nb_dims(&self) -> usize;

    /// Number of pyramid levels. Planar files report 1.
    fn nb_pyramid_levels(&self) -> usize;

    /// Human-readable name per dimension, e.g. `["row", "col", "channel"]`.
    fn dim_names(&self) -> Vec<String>;

    /// Element count per dimension at the given level.
    fn full_dims(&self, level: usize) -> Vec<usize>;

    /// Physical tile shape at the given level.
    fn tile_dims(&self, level: usize) -> Vec<usize>;

    /// Fill `buffer` (of `tile_dims(level)` shape) with the physical tile at
    /// `coord`. For edge tiles that are clipped by the file bounds only the
    /// in-file region has to be written; the engine never reads past it.
    ///
    /// Synchronous within the calling fetch worker. `thread_id` identifies
    /// the loader clone doing the work, for loaders that keep per-thread
    /// resources.
    fn load_tile_from_file(
        &mut self,
        buffer: &mut [T],
        coord: &[usize],
        level: usize,
        thread_id: usize,
    ) -> LoadResult<()>;

    /// Deep clone, one per parallel fetch worker.
    fn clone_loader(&self) -> Box<dyn TileLoader<T>>;

    /// Fetch worker count to run for this loader.
    fn number_threads(&self) -> usize {
        1
    }

    /// Sample width in bits, used by adaptive-layer bookkeeping.
    fn bits_per_sample(&self) -> usize {
        std::mem::size_of::<T>() * 8
    }
}

/// Validated snapshot of a loader's metadata, taken once at engine build.
#[derive(Debug, Clone)]
pub struct FileGeometry {
    pub nb_dims: usize,
    pub dim_names: Vec<String>,
    /// Per level, element count per dimension.
    pub full_dims: Vec<Vec<usize>>,
    /// Per level, physical tile shape.
    pub tile_dims: Vec<Vec<usize>>,
    /// Per level, tile grid extent (ceil of full / tile).
    pub nb_tiles: Vec<Vec<usize>>,
}

impl FileGeometry {
    /// Interrogate a loader and validate everything it reports.
    pub fn from_loader<T>(loader: &dyn TileLoader<T>) -> Result<Self, ConfigError> {
        let nb_dims = loader.nb_dims();
        if nb_dims == 0 {
            return Err(ConfigError::ZeroDimensions);
        }
        let nb_levels = loader.nb_pyramid_levels();
        if nb_levels == 0 {
            return Err(ConfigError::ZeroLevels);
        }
        let dim_names = loader.dim_names();
        if dim_names.len() != nb_dims {
            return Err(ConfigError::DimNameCount {
                count: dim_names.len(),
                expected: nb_dims,
            });
        }

        let mut full_dims = Vec::with_capacity(nb_levels);
        let mut tile_dims = Vec::with_capacity(nb_levels);
        let mut nb_tiles = Vec::with_capacity(nb_levels);
        for level in 0..nb_levels {
            let full = loader.full_dims(level);
            let tile = loader.tile_dims(level);
            check_dims(level, "full dims", &full, nb_dims)?;
            check_dims(level, "tile dims", &tile, nb_dims)?;
            for dim in 0..nb_dims {
                if full[dim] < tile[dim] {
                    return Err(ConfigError::FullSmallerThanTile { level, dim });
                }
            }
            nb_tiles.push(
                full.iter()
                    .zip(tile.iter())
                    .map(|(&f, &t)| f.div_ceil(t))
                    .collect(),
            );
            full_dims.push(full);
            tile_dims.push(tile);
        }

        Ok(Self {
            nb_dims,
            dim_names,
            full_dims,
            tile_dims,
            nb_tiles,
        })
    }

    pub fn nb_levels(&self) -> usize {
        self.full_dims.len()
    }

    /// Elements in one physical tile of the given level.
    pub fn tile_elements(&self, level: usize) -> usize {
        self.tile_dims[level].iter().product()
    }
}

fn check_dims(
    level: usize,
    what: &'static str,
    dims: &[usize],
    expected: usize,
) -> Result<(), ConfigError> {
    if dims.len() != expected {
        return Err(ConfigError::DimCount {
            level,
            what,
            count: dims.len(),
            expected,
        });
    }
    if let Some(dim) = dims.iter().position(|&d| d == 0) {
        return Err(ConfigError::ZeroDim { level, what, dim });
    }
    Ok(())
}

/// Pool of loader clones, one per fetch worker.
///
/// The fetch thread pool runs at most `len` jobs concurrently and every job
/// checks out exactly one loader, so a checkout never finds the pool empty.
pub(crate) struct LoaderPool<T> {
    slots: Mutex<Vec<(usize, Box<dyn TileLoader<T>>)>>,
}

impl<T> LoaderPool<T> {
    /// Build a pool from the user's loader: the original plus
    /// `number_threads - 1` deep clones. Returns the pool and its size.
    pub fn new(loader: Box<dyn TileLoader<T>>) -> (Self, usize) {
        let threads = loader.number_threads().max(1);
        let mut slots = Vec::with_capacity(threads);
        for thread_id in 1..threads {
            slots.push((thread_id, loader.clone_loader()));
        }
        slots.push((0, loader));
        (
            Self {
                slots: Mutex::new(slots),
            },
            threads,
        )
    }

    pub fn checkout(&self) -> (usize, Box<dyn TileLoader<T>>) {
        self.slots
            .lock()
            .pop()
            .expect("loader pool exhausted: more fetch jobs than fetch threads")
    }

    pub fn checkin(&self, thread_id: usize, loader: Box<dyn TileLoader<T>>) {
        self.slots.lock().push((thread_id, loader));
    }
}
