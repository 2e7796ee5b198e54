//! Shared test fixtures: an in-memory tile loader over a synthetic file,
//! with fetch instrumentation and failure injection, plus a mirror border
//! creator exercising reversed copies end to end.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::border::{BorderCreator, BorderRequest};
use crate::copier::copy_region;
use crate::error::{LoadError, LoadResult};
use crate::geometry::{element_count, CopyRegion};
use crate::loader::{FileGeometry, TileLoader};
use crate::planner::for_each_coord;
use crate::view::ViewGeometry;

/// Value stored at a file coordinate: each index contributes one decimal
/// digit, e.g. `[1, 2]` → 23. Collision-free for test files under 9
/// elements per dimension.
pub(crate) fn coordinate_value(coord: &[usize]) -> i32 {
    coord.iter().fold(0i32, |acc, &c| acc * 10 + (c as i32 + 1))
}

/// In-memory tile loader over a synthetic file whose values encode their
/// coordinates. Clones share the backing data, the fetch counter, and the
/// injected-failure set.
pub(crate) struct VirtualTileLoader {
    full_dims: Vec<Vec<usize>>,
    tile_dims: Vec<Vec<usize>>,
    dim_names: Vec<String>,
    data: Arc<Vec<Vec<i32>>>,
    fetches: Arc<AtomicUsize>,
    fail_coords: Arc<HashSet<(usize, Vec<usize>)>>,
    threads: usize,
}

impl VirtualTileLoader {
    pub(crate) fn single_level(full_dims: Vec<usize>, tile_dims: Vec<usize>) -> Self {
        Self::pyramid(vec![full_dims], vec![tile_dims])
    }

    pub(crate) fn pyramid(full_dims: Vec<Vec<usize>>, tile_dims: Vec<Vec<usize>>) -> Self {
        let nb_dims = full_dims[0].len();
        let data = full_dims
            .iter()
            .map(|dims| {
                let mut values = Vec::with_capacity(element_count(dims));
                for_each_coord(&vec![0; nb_dims], dims, &mut |coord| {
                    values.push(coordinate_value(coord));
                });
                values
            })
            .collect();
        Self {
            dim_names: (0..nb_dims).map(|d| format!("dim{d}")).collect(),
            full_dims,
            tile_dims,
            data: Arc::new(data),
            fetches: Arc::new(AtomicUsize::new(0)),
            fail_coords: Arc::new(HashSet::new()),
            threads: 2,
        }
    }

    pub(crate) fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Make every fetch of the given level-0 tile coordinates fail.
    pub(crate) fn failing_on(mut self, coords: Vec<Vec<usize>>) -> Self {
        self.fail_coords = Arc::new(coords.into_iter().map(|c| (0, c)).collect());
        self
    }

    /// Shared counter of successful `load_tile_from_file` calls.
    pub(crate) fn fetch_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.fetches)
    }
}

impl TileLoader<i32> for VirtualTileLoader {
    fn nb_dims(&self) -> usize {
        self.full_dims[0].len()
    }

    fn nb_pyramid_levels(&self) -> usize {
        self.full_dims.len()
    }

    fn dim_names(&self) -> Vec<String> {
        self.dim_names.clone()
    }

    fn full_dims(&self, level: usize) -> Vec<usize> {
        self.full_dims[level].clone()
    }

    fn tile_dims(&self, level: usize) -> Vec<usize> {
        self.tile_dims[level].clone()
    }

    fn load_tile_from_file(
        &mut self,
        buffer: &mut [i32],
        coord: &[usize],
        level: usize,
        _thread_id: usize,
    ) -> LoadResult<()> {
        if self.fail_coords.contains(&(level, coord.to_vec())) {
            return Err(LoadError::Loader(format!(
                "injected failure for tile {coord:?}"
            )));
        }
        self.fetches.fetch_add(1, Ordering::Relaxed);

        let full = &self.full_dims[level];
        let tile = &self.tile_dims[level];
        let nb_dims = full.len();
        let mut src_begin = Vec::with_capacity(nb_dims);
        let mut shape = Vec::with_capacity(nb_dims);
        for dim in 0..nb_dims {
            let begin = coord[dim] * tile[dim];
            let end = (begin + tile[dim]).min(full[dim]);
            src_begin.push(begin);
            shape.push(end.saturating_sub(begin));
        }
        let region = CopyRegion::new(src_begin, vec![0; nb_dims], shape);
        if !region.is_empty() {
            copy_region(&self.data[level], full, buffer, tile, &region);
        }
        Ok(())
    }

    fn clone_loader(&self) -> Box<dyn TileLoader<i32>> {
        Box::new(Self {
            full_dims: self.full_dims.clone(),
            tile_dims: self.tile_dims.clone(),
            dim_names: self.dim_names.clone(),
            data: Arc::clone(&self.data),
            fetches: Arc::clone(&self.fetches),
            fail_coords: Arc::clone(&self.fail_coords),
            threads: self.threads,
        })
    }

    fn number_threads(&self) -> usize {
        self.threads
    }
}

/// Tile loader over a directory of raw little-endian `i32` tile files laid
/// out as `<dir>/<level>/<c0>_<c1>_...bin`, one file per physical tile.
pub(crate) struct RawFileTileLoader {
    dir: std::path::PathBuf,
    full_dims: Vec<usize>,
    tile_dims: Vec<usize>,
}

impl RawFileTileLoader {
    pub(crate) fn new(
        dir: std::path::PathBuf,
        full_dims: Vec<usize>,
        tile_dims: Vec<usize>,
    ) -> Self {
        Self {
            dir,
            full_dims,
            tile_dims,
        }
    }

    pub(crate) fn tile_path(dir: &std::path::Path, level: usize, coord: &[usize]) -> std::path::PathBuf {
        let name: Vec<String> = coord.iter().map(|c| c.to_string()).collect();
        dir.join(level.to_string())
            .join(format!("{}.bin", name.join("_")))
    }
}

impl TileLoader<i32> for RawFileTileLoader {
    fn nb_dims(&self) -> usize {
        self.full_dims.len()
    }

    fn nb_pyramid_levels(&self) -> usize {
        1
    }

    fn dim_names(&self) -> Vec<String> {
        (0..self.full_dims.len()).map(|d| format!("dim{d}")).collect()
    }

    fn full_dims(&self, _level: usize) -> Vec<usize> {
        self.full_dims.clone()
    }

    fn tile_dims(&self, _level: usize) -> Vec<usize> {
        self.tile_dims.clone()
    }

    fn load_tile_from_file(
        &mut self,
        buffer: &mut [i32],
        coord: &[usize],
        level: usize,
        _thread_id: usize,
    ) -> LoadResult<()> {
        let path = Self::tile_path(&self.dir, level, coord);
        let bytes =
            std::fs::read(&path).map_err(|err| LoadError::io(level, coord, err))?;
        if bytes.len() != buffer.len() * 4 {
            return Err(LoadError::UnsupportedFormat(format!(
                "tile file {} holds {} bytes, expected {}",
                path.display(),
                bytes.len(),
                buffer.len() * 4
            )));
        }
        for (value, chunk) in buffer.iter_mut().zip(bytes.chunks_exact(4)) {
            *value = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(())
    }

    fn clone_loader(&self) -> Box<dyn TileLoader<i32>> {
        Box::new(Self {
            dir: self.dir.clone(),
            full_dims: self.full_dims.clone(),
            tile_dims: self.tile_dims.clone(),
        })
    }

    fn number_threads(&self) -> usize {
        2
    }
}

/// Border creator mirroring the center tile into the out-of-file ghost
/// region, for files with a single tile per level. Every ghost segment is
/// sourced from the tile with the touched axes reversed, so corner regions
/// exercise composed reversals; the fill pass has nothing left to do.
pub(crate) struct MirrorBorderCreator;

#[derive(Clone, Copy, PartialEq)]
enum Segment {
    Front,
    InFile,
    Back,
}

impl BorderCreator<i32> for MirrorBorderCreator {
    fn border_requests(&self, geometry: &ViewGeometry, file: &FileGeometry) -> Vec<BorderRequest> {
        let nb_dims = file.nb_dims;
        assert!(
            file.nb_tiles[geometry.level].iter().all(|&n| n == 1),
            "mirror fixture expects a single tile per level"
        );
        let front = &geometry.front_fill;
        let back = &geometry.back_fill;
        let dims = &geometry.view_dims;
        let extent: Vec<usize> = (0..nb_dims)
            .map(|d| dims[d] - front[d] - back[d])
            .collect();

        let mut requests = Vec::new();
        let mut segments = vec![Segment::InFile; nb_dims];
        enumerate_segments(&mut segments, 0, &mut |segments| {
            if segments.iter().all(|&s| s == Segment::InFile) {
                return;
            }
            let mut src_begin = Vec::with_capacity(nb_dims);
            let mut dst_begin = Vec::with_capacity(nb_dims);
            let mut shape = Vec::with_capacity(nb_dims);
            let mut reverse = Vec::with_capacity(nb_dims);
            for dim in 0..nb_dims {
                match segments[dim] {
                    Segment::Front => {
                        src_begin.push(0);
                        dst_begin.push(0);
                        shape.push(front[dim]);
                        reverse.push(true);
                    }
                    Segment::InFile => {
                        src_begin.push(0);
                        dst_begin.push(front[dim]);
                        shape.push(extent[dim]);
                        reverse.push(false);
                    }
                    Segment::Back => {
                        src_begin.push(extent[dim] - back[dim]);
                        dst_begin.push(dims[dim] - back[dim]);
                        shape.push(back[dim]);
                        reverse.push(true);
                    }
                }
            }
            let region = CopyRegion::with_reverse(src_begin, dst_begin, shape, reverse);
            if !region.is_empty() {
                requests.push(BorderRequest {
                    tile_coord: vec![0; nb_dims],
                    region,
                });
            }
        });
        requests
    }

    fn fill_border(&self, _data: &mut [i32], _geometry: &ViewGeometry) {}
}

fn enumerate_segments(
    segments: &mut Vec<Segment>,
    dim: usize,
    visit: &mut impl FnMut(&[Segment]),
) {
    if dim == segments.len() {
        visit(segments);
        return;
    }
    for segment in [Segment::Front, Segment::InFile, Segment::Back] {
        segments[dim] = segment;
        enumerate_segments(segments, dim + 1, visit);
    }
    segments[dim] = Segment::InFile;
}
