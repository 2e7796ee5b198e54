//! Adaptive tile loader: logical tiles rebucketed over native tiles.
//!
//! Some files expose tiles that are inconvenient for the consumer (strip
//! files with one-row tiles, or huge camera tiles). This decorator sits
//! between the engine and a concrete loader and serves logical tiles of a
//! caller-chosen shape per level, aggregating or subdividing the file's
//! native tiles underneath. Logical tiles need not be multiples of the
//! native shape; both ends of every native tile are clipped against the
//! logical extent.
//!
//! Native tiles go through a per-level moka cache shared by every clone of
//! the decorator, so parallel fetch workers coalesce their native reads:
//! `try_get_with` runs one load per native tile no matter how many logical
//! tiles want it.

use std::sync::Arc;

use moka::sync::Cache;

use crate::cache::TileKey;
use crate::copier::copy_region;
use crate::error::{ConfigError, LoadError, LoadResult};
use crate::geometry::{element_count, CopyRegion};
use crate::loader::{FileGeometry, TileLoader};
use crate::planner::for_each_coord;

/// Decorator exposing caller-chosen logical tile shapes over a concrete
/// loader's native tiles.
pub struct AdaptiveTileLoader<T> {
    inner: Box<dyn TileLoader<T>>,
    /// Native geometry of the wrapped loader.
    native: FileGeometry,
    /// Logical tile shape per level, what `tile_dims` reports upward.
    logical_tile_dims: Vec<Vec<usize>>,
    /// Per-level caches of native tiles, shared across clones.
    native_caches: Vec<Cache<TileKey, Arc<Vec<T>>>>,
}

impl<T> std::fmt::Debug for AdaptiveTileLoader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveTileLoader")
            .field("native", &self.native)
            .field("logical_tile_dims", &self.logical_tile_dims)
            .finish()
    }
}

impl<T: Copy + Default + Send + Sync + 'static> AdaptiveTileLoader<T> {
    /// Wrap `inner`, serving `logical_tile_dims_per_level`-shaped tiles and
    /// keeping up to `native_tiles_cached_per_level` native tiles warm per
    /// level.
    pub fn new(
        inner: Box<dyn TileLoader<T>>,
        logical_tile_dims_per_level: Vec<Vec<usize>>,
        native_tiles_cached_per_level: Vec<usize>,
    ) -> Result<Self, ConfigError> {
        let native = FileGeometry::from_loader(inner.as_ref())?;
        let nb_levels = native.nb_levels();

        if logical_tile_dims_per_level.len() != nb_levels {
            return Err(ConfigError::PerLevelCount {
                what: "logical tile dims",
                count: logical_tile_dims_per_level.len(),
                expected: nb_levels,
            });
        }
        for (level, dims) in logical_tile_dims_per_level.iter().enumerate() {
            if dims.len() != native.nb_dims {
                return Err(ConfigError::DimCount {
                    level,
                    what: "logical tile dims",
                    count: dims.len(),
                    expected: native.nb_dims,
                });
            }
            if let Some(dim) = dims.iter().position(|&d| d == 0) {
                return Err(ConfigError::ZeroDim {
                    level,
                    what: "logical tile dims",
                    dim,
                });
            }
        }
        if native_tiles_cached_per_level.len() != nb_levels {
            return Err(ConfigError::PerLevelCount {
                what: "native tile cache size",
                count: native_tiles_cached_per_level.len(),
                expected: nb_levels,
            });
        }
        if let Some(level) = native_tiles_cached_per_level.iter().position(|&n| n == 0) {
            return Err(ConfigError::ZeroPerLevelEntry {
                what: "native tile cache size",
                level,
            });
        }

        let native_caches = native_tiles_cached_per_level
            .iter()
            .map(|&count| Cache::new(count as u64))
            .collect();
        Ok(Self {
            inner,
            native,
            logical_tile_dims: logical_tile_dims_per_level,
            native_caches,
        })
    }
}

impl<T: Copy + Default + Send + Sync + 'static> TileLoader<T> for AdaptiveTileLoader<T> {
    fn nb_dims(&self) -> usize {
        self.native.nb_dims
    }

    fn nb_pyramid_levels(&self) -> usize {
        self.native.nb_levels()
    }

    fn dim_names(&self) -> Vec<String> {
        self.native.dim_names.clone()
    }

    fn full_dims(&self, level: usize) -> Vec<usize> {
        self.native.full_dims[level].clone()
    }

    fn tile_dims(&self, level: usize) -> Vec<usize> {
        self.logical_tile_dims[level].clone()
    }

    fn load_tile_from_file(
        &mut self,
        buffer: &mut [T],
        coord: &[usize],
        level: usize,
        thread_id: usize,
    ) -> LoadResult<()> {
        let logical_dims = &self.logical_tile_dims[level];
        let native_dims = &self.native.tile_dims[level];
        let full_dims = &self.native.full_dims[level];
        let nb_dims = self.native.nb_dims;

        // Logical tile extent, clipped by the file.
        let begin: Vec<usize> = (0..nb_dims).map(|d| coord[d] * logical_dims[d]).collect();
        let end: Vec<usize> = (0..nb_dims)
            .map(|d| (begin[d] + logical_dims[d]).min(full_dims[d]))
            .collect();

        let native_begin: Vec<usize> = (0..nb_dims).map(|d| begin[d] / native_dims[d]).collect();
        let native_end: Vec<usize> = (0..nb_dims)
            .map(|d| end[d].div_ceil(native_dims[d]))
            .collect();

        let cache = &self.native_caches[level];
        let inner = &mut self.inner;
        let native_elements = element_count(native_dims);

        let mut failure = None;
        for_each_coord(&native_begin, &native_end, &mut |native_coord| {
            if failure.is_some() {
                return;
            }
            let key = TileKey::new(level, native_coord.to_vec());
            let tile = cache.try_get_with(key, || {
                let mut data = vec![T::default(); native_elements];
                inner.load_tile_from_file(&mut data, native_coord, level, thread_id)?;
                Ok::<_, LoadError>(Arc::new(data))
            });
            let tile = match tile {
                Ok(tile) => tile,
                Err(err) => {
                    failure = Some((*err).clone());
                    return;
                }
            };

            // Clip the native tile against the logical extent; both ends
            // may be partial.
            let mut src_begin = Vec::with_capacity(nb_dims);
            let mut dst_begin = Vec::with_capacity(nb_dims);
            let mut shape = Vec::with_capacity(nb_dims);
            for dim in 0..nb_dims {
                let clip_begin = begin[dim].max(native_coord[dim] * native_dims[dim]);
                let clip_end = end[dim].min((native_coord[dim] + 1) * native_dims[dim]);
                src_begin.push(clip_begin - native_coord[dim] * native_dims[dim]);
                dst_begin.push(clip_begin - begin[dim]);
                shape.push(clip_end.saturating_sub(clip_begin));
            }
            let region = CopyRegion::new(src_begin, dst_begin, shape);
            if !region.is_empty() {
                copy_region(&tile, native_dims, buffer, logical_dims, &region);
            }
        });

        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn clone_loader(&self) -> Box<dyn TileLoader<T>> {
        Box::new(Self {
            inner: self.inner.clone_loader(),
            native: self.native.clone(),
            logical_tile_dims: self.logical_tile_dims.clone(),
            // moka caches clone shallowly: every loader clone shares the
            // same native tiles.
            native_caches: self.native_caches.clone(),
        })
    }

    fn number_threads(&self) -> usize {
        self.inner.number_threads()
    }

    fn bits_per_sample(&self) -> usize {
        self.inner.bits_per_sample()
    }
}
