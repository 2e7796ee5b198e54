//! Ghost-region creation strategies.
//!
//! A border creator decides how the part of a view that falls outside the
//! file gets populated. It acts in two phases: while a view is planned it
//! may emit extra tile copies that source ghost data from the file (mirror
//! styles do this, with reversed axes); after every copy has landed its
//! fill pass writes whatever the copies did not cover. The built-ins copy
//! nothing from the file: `Constant` writes a fixed value and `Replicate`
//! duplicates the outermost populated slab of each dimension.

use crate::geometry::CopyRegion;
use crate::loader::FileGeometry;
use crate::view::ViewGeometry;

/// An extra ghost-region copy requested by a border creator, sourcing data
/// from a physical tile of the view's level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BorderRequest {
    pub tile_coord: Vec<usize>,
    pub region: CopyRegion,
}

/// Strategy populating the ghost region around a view's center tile.
pub trait BorderCreator<T>: Send + Sync {
    /// Extra tile copies to schedule for this view. Regions returned here
    /// must be disjoint from the planner's center copies and from each
    /// other.
    fn border_requests(
        &self,
        geometry: &ViewGeometry,
        file: &FileGeometry,
    ) -> Vec<BorderRequest>;

    /// Fill the remaining ghost cells of a view whose planned copies have
    /// all completed.
    fn fill_border(&self, data: &mut [T], geometry: &ViewGeometry);
}

/// Writes a fixed value into every ghost cell outside the file.
pub struct ConstantBorderCreator<T> {
    value: T,
}

impl<T> ConstantBorderCreator<T> {
    pub fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T: Copy + Send + Sync> BorderCreator<T> for ConstantBorderCreator<T> {
    fn border_requests(&self, _geometry: &ViewGeometry, _file: &FileGeometry) -> Vec<BorderRequest> {
        Vec::new()
    }

    fn fill_border(&self, data: &mut [T], geometry: &ViewGeometry) {
        if no_fill(geometry) {
            return;
        }
        fill_front_back(
            data,
            &geometry.view_dims,
            &geometry.front_fill,
            &geometry.back_fill,
            self.value,
            0,
            0,
        );
    }
}

/// Duplicates the outermost populated slab of each dimension into the
/// ghost region, so edges extend and corners replicate corner values.
pub struct ReplicateBorderCreator;

impl<T: Copy + Send + Sync> BorderCreator<T> for ReplicateBorderCreator {
    fn border_requests(&self, _geometry: &ViewGeometry, _file: &FileGeometry) -> Vec<BorderRequest> {
        Vec::new()
    }

    fn fill_border(&self, data: &mut [T], geometry: &ViewGeometry) {
        if no_fill(geometry) {
            return;
        }
        replicate(
            data,
            &geometry.view_dims,
            &geometry.front_fill,
            &geometry.back_fill,
            0,
            0,
        );
    }
}

fn no_fill(geometry: &ViewGeometry) -> bool {
    geometry.front_fill.iter().sum::<usize>() + geometry.back_fill.iter().sum::<usize>() == 0
}

/// Constant fill: write the front and back extents of the current
/// dimension, then recurse into the populated slab. Each ghost cell is
/// written exactly once.
fn fill_front_back<T: Copy>(
    data: &mut [T],
    dims: &[usize],
    front: &[usize],
    back: &[usize],
    value: T,
    dim: usize,
    delta: usize,
) {
    if dim == dims.len() - 1 {
        data[delta..delta + front[dim]].fill(value);
        let start = delta + dims[dim] - back[dim];
        data[start..start + back[dim]].fill(value);
        return;
    }
    let volume: usize = dims[dim + 1..].iter().product();
    data[delta..delta + front[dim] * volume].fill(value);
    let start = delta + (dims[dim] - back[dim]) * volume;
    data[start..start + back[dim] * volume].fill(value);
    for pos in front[dim]..dims[dim] - back[dim] {
        fill_front_back(data, dims, front, back, value, dim + 1, delta + pos * volume);
    }
}

/// Replicate fill: resolve the inner dimensions of the populated slab
/// first, then duplicate its outermost rows outward. Doing the inner
/// dimensions first is what makes corner regions copy true corner values.
fn replicate<T: Copy>(
    data: &mut [T],
    dims: &[usize],
    front: &[usize],
    back: &[usize],
    dim: usize,
    delta: usize,
) {
    let volume: usize = dims[dim + 1..].iter().product();
    if dim < dims.len() - 1 {
        for pos in front[dim]..dims[dim] - back[dim] {
            replicate(data, dims, front, back, dim + 1, delta + pos * volume);
        }
    }
    let src_front = delta + front[dim] * volume;
    for pos in 0..front[dim] {
        data.copy_within(src_front..src_front + volume, delta + pos * volume);
    }
    let src_back = delta + (dims[dim] - back[dim] - 1) * volume;
    for pos in dims[dim] - back[dim]..dims[dim] {
        data.copy_within(src_back..src_back + volume, delta + pos * volume);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(dims: Vec<usize>, front: Vec<usize>, back: Vec<usize>) -> ViewGeometry {
        let nb_dims = dims.len();
        ViewGeometry {
            level: 0,
            tile_coord: vec![0; nb_dims],
            origin: front.iter().map(|&f| -(f as i64)).collect(),
            center_dims: dims
                .iter()
                .zip(front.iter().zip(back.iter()))
                .map(|(&d, (&f, &b))| d - f - b)
                .collect(),
            view_dims: dims,
            radii: vec![0; nb_dims],
            front_fill: front,
            back_fill: back,
        }
    }

    #[test]
    fn test_constant_1d() {
        let mut data = vec![0i32, 0, 10, 11, 12, 0, 0];
        let creator = ConstantBorderCreator::new(9);
        creator.fill_border(&mut data, &geometry(vec![7], vec![2], vec![2]));
        assert_eq!(data, vec![9, 9, 10, 11, 12, 9, 9]);
    }

    #[test]
    fn test_constant_2d_asymmetric() {
        // 4x4 view, front fill (1, 2), back fill (0, 1).
        let mut data = vec![5i32; 16];
        for row in 1..4 {
            for col in 2..3 {
                data[row * 4 + col] = (10 * row + col) as i32;
            }
        }
        let creator = ConstantBorderCreator::new(0);
        creator.fill_border(&mut data, &geometry(vec![4, 4], vec![1, 2], vec![0, 1]));
        #[rustfmt::skip]
        assert_eq!(
            data,
            vec![
                0, 0,  0, 0,
                0, 0, 12, 0,
                0, 0, 22, 0,
                0, 0, 32, 0,
            ]
        );
    }

    #[test]
    fn test_constant_skips_filled_view() {
        let mut data = vec![1i32; 9];
        let creator = ConstantBorderCreator::new(0);
        creator.fill_border(&mut data, &geometry(vec![3, 3], vec![0, 0], vec![0, 0]));
        assert_eq!(data, vec![1; 9]);
    }

    #[test]
    fn test_replicate_1d() {
        let mut data = vec![0i32, 0, 10, 11, 12, 0, 0];
        let creator = ReplicateBorderCreator;
        creator.fill_border(&mut data, &geometry(vec![7], vec![2], vec![2]));
        assert_eq!(data, vec![10, 10, 10, 11, 12, 12, 12]);
    }

    #[test]
    fn test_replicate_2d_corners() {
        // 5x5 view around a populated 3x3 center with values 10r + c.
        let mut data = vec![0i32; 25];
        for row in 0..3 {
            for col in 0..3 {
                data[(row + 1) * 5 + col + 1] = (10 * row + col) as i32;
            }
        }
        let creator = ReplicateBorderCreator;
        creator.fill_border(&mut data, &geometry(vec![5, 5], vec![1, 1], vec![1, 1]));
        #[rustfmt::skip]
        assert_eq!(
            data,
            vec![
                 0,  0,  1,  2,  2,
                 0,  0,  1,  2,  2,
                10, 10, 11, 12, 12,
                20, 20, 21, 22, 22,
                20, 20, 21, 22, 22,
            ]
        );
    }

    #[test]
    fn test_replicate_3d_outer_layers() {
        // 3 layers of 2x2, only the middle layer populated.
        let mut data = vec![0i32; 12];
        data[4..8].copy_from_slice(&[1, 2, 3, 4]);
        let creator = ReplicateBorderCreator;
        creator.fill_border(&mut data, &geometry(vec![3, 2, 2], vec![1, 0, 0], vec![1, 0, 0]));
        assert_eq!(data, vec![1, 2, 3, 4, 1, 2, 3, 4, 1, 2, 3, 4]);
    }

    #[test]
    fn test_builtins_request_nothing() {
        let geometry = geometry(vec![5], vec![1], vec![1]);
        let file = FileGeometry {
            nb_dims: 1,
            dim_names: vec!["x".into()],
            full_dims: vec![vec![3]],
            tile_dims: vec![vec![3]],
            nb_tiles: vec![vec![1]],
        };
        let constant = ConstantBorderCreator::new(0u8);
        let replicate = ReplicateBorderCreator;
        assert!(BorderCreator::<u8>::border_requests(&constant, &geometry, &file).is_empty());
        assert!(BorderCreator::<u8>::border_requests(&replicate, &geometry, &file).is_empty());
    }
}
