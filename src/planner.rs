//! Per-view request planning.
//!
//! For one view the planner intersects the view extent with the file,
//! emits one copy per overlapping physical tile, and appends whatever the
//! border creator wants sourced from the file for the ghost region. The
//! emitted destination rectangles are pairwise disjoint, which is what
//! lets the copier pool write one view from several threads without
//! locking the buffer.

use crate::border::BorderCreator;
use crate::cache::TileKey;
use crate::geometry::CopyRegion;
use crate::loader::FileGeometry;
use crate::view::ViewGeometry;

/// Geometry of the view centered on `tile_coord` at `level`.
pub(crate) fn view_geometry(
    file: &FileGeometry,
    level: usize,
    tile_coord: &[usize],
    radii: &[usize],
) -> ViewGeometry {
    let tile_dims = &file.tile_dims[level];
    let full_dims = &file.full_dims[level];
    let nb_dims = file.nb_dims;

    let mut origin = Vec::with_capacity(nb_dims);
    let mut view_dims = Vec::with_capacity(nb_dims);
    let mut front_fill = Vec::with_capacity(nb_dims);
    let mut back_fill = Vec::with_capacity(nb_dims);
    let mut center_dims = Vec::with_capacity(nb_dims);
    for dim in 0..nb_dims {
        let tile_begin = (tile_coord[dim] * tile_dims[dim]) as i64;
        let begin = tile_begin - radii[dim] as i64;
        let extent = tile_dims[dim] + 2 * radii[dim];
        let end = begin + extent as i64;
        origin.push(begin);
        view_dims.push(extent);
        front_fill.push((-begin).max(0) as usize);
        back_fill.push((end - full_dims[dim] as i64).max(0) as usize);
        center_dims.push((full_dims[dim] - tile_coord[dim] * tile_dims[dim]).min(tile_dims[dim]));
    }

    ViewGeometry {
        level,
        tile_coord: tile_coord.to_vec(),
        origin,
        view_dims,
        radii: radii.to_vec(),
        front_fill,
        back_fill,
        center_dims,
    }
}

/// Every copy needed to populate the view from the file: the in-file part
/// of the view extent (center plus halo) tile by tile, then the border
/// creator's extra ghost-region copies.
pub(crate) fn plan_requests<T>(
    geometry: &ViewGeometry,
    file: &FileGeometry,
    creator: &dyn BorderCreator<T>,
) -> Vec<(TileKey, CopyRegion)> {
    let level = geometry.level;
    let tile_dims = &file.tile_dims[level];
    let full_dims = &file.full_dims[level];
    let nb_dims = file.nb_dims;

    // Intersection of the view extent with the file, in file coordinates.
    let begin: Vec<usize> = (0..nb_dims)
        .map(|d| geometry.origin[d].max(0) as usize)
        .collect();
    let end: Vec<usize> = (0..nb_dims)
        .map(|d| {
            ((geometry.origin[d] + geometry.view_dims[d] as i64) as usize).min(full_dims[d])
        })
        .collect();

    let tile_begin: Vec<usize> = (0..nb_dims).map(|d| begin[d] / tile_dims[d]).collect();
    let tile_end: Vec<usize> = (0..nb_dims)
        .map(|d| end[d].div_ceil(tile_dims[d]))
        .collect();

    let mut requests = Vec::new();
    for_each_coord(&tile_begin, &tile_end, &mut |tile| {
        let mut src_begin = Vec::with_capacity(nb_dims);
        let mut dst_begin = Vec::with_capacity(nb_dims);
        let mut shape = Vec::with_capacity(nb_dims);
        for dim in 0..nb_dims {
            let clip_begin = begin[dim].max(tile[dim] * tile_dims[dim]);
            let clip_end = end[dim].min((tile[dim] + 1) * tile_dims[dim]);
            src_begin.push(clip_begin - tile[dim] * tile_dims[dim]);
            dst_begin.push((clip_begin as i64 - geometry.origin[dim]) as usize);
            shape.push(clip_end - clip_begin);
        }
        requests.push((
            TileKey::new(level, tile.to_vec()),
            CopyRegion::new(src_begin, dst_begin, shape),
        ));
    });

    requests.extend(
        creator
            .border_requests(geometry, file)
            .into_iter()
            .map(|req| (TileKey::new(level, req.tile_coord), req.region)),
    );
    requests
}

/// Visit every coordinate of the `[begin, end)` box, last dimension
/// fastest.
pub(crate) fn for_each_coord(begin: &[usize], end: &[usize], visit: &mut impl FnMut(&[usize])) {
    if begin.iter().zip(end).any(|(b, e)| b >= e) {
        return;
    }
    let mut current = begin.to_vec();
    loop {
        visit(&current);
        let mut dim = begin.len();
        loop {
            if dim == 0 {
                return;
            }
            dim -= 1;
            current[dim] += 1;
            if current[dim] < end[dim] {
                break;
            }
            current[dim] = begin[dim];
        }
    }
}
