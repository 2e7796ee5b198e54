//! Rectangle copies from physical tiles into view buffers.
//!
//! The copy core is a D-dimensional strided transfer: the innermost
//! contiguous run moves with a bulk copy, outer dimensions iterate. A
//! reversed axis walks the source rectangle from its far end back to its
//! near end (element-wise on the innermost axis), so reversals compose
//! across axes for corner-mirrored ghost regions.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use crate::cache::TileHandle;
use crate::engine::FinalizeMsg;
use crate::error::LoadError;
use crate::geometry::{strides, CopyRegion};
use crate::view::ViewState;

/// One planned copy into a view, produced by the planner and carried
/// through the cache's waiter lists.
pub(crate) struct PlannedCopy<T> {
    pub(crate) view: Arc<ViewState<T>>,
    pub(crate) region: CopyRegion,
}

/// Work items for the copier pool.
pub(crate) enum CopyMsg<T> {
    /// Copy a rectangle of a ready tile into the view.
    Copy {
        tile: TileHandle<T>,
        copy: PlannedCopy<T>,
    },
    /// The tile fetch failed; account the copy and mark the view.
    Failed {
        copy: PlannedCopy<T>,
        error: Arc<LoadError>,
    },
    Shutdown,
}

/// Copy `region` from `src` (shape `src_dims`) into `dst` (shape
/// `dst_dims`). Safe variant over exclusive destination slices.
pub(crate) fn copy_region<T: Copy>(
    src: &[T],
    src_dims: &[usize],
    dst: &mut [T],
    dst_dims: &[usize],
    region: &CopyRegion,
) {
    debug_assert_eq!(src.len(), src_dims.iter().product::<usize>());
    debug_assert_eq!(dst.len(), dst_dims.iter().product::<usize>());
    unsafe { copy_region_into(src, src_dims, dst.as_mut_ptr(), dst_dims, region) }
}

/// Raw-pointer copy core, used by copier workers writing disjoint
/// rectangles of a shared view buffer.
///
/// # Safety
/// `dst` must point to a live buffer of shape `dst_dims` and no other
/// thread may concurrently touch the destination rectangle.
pub(crate) unsafe fn copy_region_into<T: Copy>(
    src: &[T],
    src_dims: &[usize],
    dst: *mut T,
    dst_dims: &[usize],
    region: &CopyRegion,
) {
    let nb_dims = src_dims.len();
    debug_assert_eq!(dst_dims.len(), nb_dims);
    debug_assert_eq!(region.shape.len(), nb_dims);
    debug_assert!(region
        .src_begin
        .iter()
        .zip(&region.shape)
        .zip(src_dims)
        .all(|((&b, &s), &d)| b + s <= d));
    debug_assert!(region
        .dst_begin
        .iter()
        .zip(&region.shape)
        .zip(dst_dims)
        .all(|((&b, &s), &d)| b + s <= d));

    if region.is_empty() {
        return;
    }
    let src_strides = strides(src_dims);
    let dst_strides = strides(dst_dims);
    copy_rec(src, dst, &src_strides, &dst_strides, region, 0, 0, 0);
}

#[allow(clippy::too_many_arguments)]
unsafe fn copy_rec<T: Copy>(
    src: &[T],
    dst: *mut T,
    src_strides: &[usize],
    dst_strides: &[usize],
    region: &CopyRegion,
    dim: usize,
    src_offset: usize,
    dst_offset: usize,
) {
    let len = region.shape[dim];
    if dim == region.shape.len() - 1 {
        // Innermost run: stride 1 on both sides.
        let src_base = src_offset + region.src_begin[dim];
        let dst_base = dst_offset + region.dst_begin[dim];
        if region.reverse[dim] {
            for k in 0..len {
                *dst.add(dst_base + k) = src[src_base + len - 1 - k];
            }
        } else {
            std::ptr::copy_nonoverlapping(src.as_ptr().add(src_base), dst.add(dst_base), len);
        }
        return;
    }
    for k in 0..len {
        let src_k = if region.reverse[dim] { len - 1 - k } else { k };
        copy_rec(
            src,
            dst,
            src_strides,
            dst_strides,
            region,
            dim + 1,
            src_offset + (region.src_begin[dim] + src_k) * src_strides[dim],
            dst_offset + (region.dst_begin[dim] + k) * dst_strides[dim],
        );
    }
}

/// Per-level pool of copier workers draining a bounded job channel.
pub(crate) struct CopierPool {
    handles: Vec<JoinHandle<()>>,
}

impl CopierPool {
    pub(crate) fn spawn<T>(
        level: usize,
        threads: usize,
        tile_dims: Vec<usize>,
        jobs: Receiver<CopyMsg<T>>,
        finalizer: Sender<FinalizeMsg<T>>,
    ) -> Self
    where
        T: Copy + Default + Send + Sync + 'static,
    {
        let handles = (0..threads)
            .map(|worker| {
                let jobs = jobs.clone();
                let finalizer = finalizer.clone();
                let tile_dims = tile_dims.clone();
                std::thread::Builder::new()
                    .name(format!("view-copy-{level}-{worker}"))
                    .spawn(move || worker_loop(tile_dims, jobs, finalizer))
                    .expect("failed to spawn copier thread")
            })
            .collect();
        Self { handles }
    }

    pub(crate) fn join(&mut self) {
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop<T: Copy + Default + Send + Sync>(
    tile_dims: Vec<usize>,
    jobs: Receiver<CopyMsg<T>>,
    finalizer: Sender<FinalizeMsg<T>>,
) {
    while let Ok(msg) = jobs.recv() {
        match msg {
            CopyMsg::Copy { tile, copy } => {
                let view_dims = copy.view.geometry.view_dims.clone();
                // The planner guarantees this rectangle is disjoint from
                // every other copy targeting the same view.
                unsafe {
                    copy_region_into(
                        tile.data(),
                        &tile_dims,
                        copy.view.buffer().base_ptr(),
                        &view_dims,
                        &copy.region,
                    );
                }
                drop(tile); // releases the cache refcount
                finish_copy(copy.view, &finalizer);
            }
            CopyMsg::Failed { copy, error } => {
                copy.view.mutable.lock().error.get_or_insert(error);
                finish_copy(copy.view, &finalizer);
            }
            CopyMsg::Shutdown => break,
        }
    }
}

/// Account one finished copy; the zero transition hands the view to the
/// finalizer exactly once.
fn finish_copy<T>(view: Arc<ViewState<T>>, finalizer: &Sender<FinalizeMsg<T>>) {
    let previous = view.outstanding.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(previous > 0, "outstanding copy counter underflow");
    if previous == 1 {
        let _ = finalizer.send(FinalizeMsg::Completed(view));
    }
}
