//! View buffers, their lifecycle state, and the per-level free pool.
//!
//! A view buffer is written concurrently by several copier workers, each
//! into a rectangle no other worker touches (the planner emits disjoint
//! destination rectangles). The buffer therefore stores `UnsafeCell<T>`
//! cells and hands out a raw base pointer; the write discipline is:
//!
//! - copiers write only between allocation and the outstanding-copy counter
//!   reaching zero, each inside its own planned rectangle;
//! - the finalizer's border fill runs single-threaded after that;
//! - consumers read only after delivery, through a `View` handle whose
//!   existence proves no writer remains (recycling requires every handle to
//!   have been consumed by `release`).

use std::cell::UnsafeCell;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use crate::error::LoadError;
use crate::geometry::{element_count, offset_of, strides};

/// Dense element storage shared between copier workers.
pub(crate) struct ViewBuffer<T> {
    cells: Box<[UnsafeCell<T>]>,
}

// Writers touch disjoint rectangles and readers are ordered after the last
// write by the outstanding-copy counter and channel hand-offs (see module
// docs), so sharing across threads is sound for any sendable element.
unsafe impl<T: Send> Send for ViewBuffer<T> {}
unsafe impl<T: Send> Sync for ViewBuffer<T> {}

impl<T: Copy + Default> ViewBuffer<T> {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            cells: (0..len).map(|_| UnsafeCell::new(T::default())).collect(),
        }
    }
}

impl<T> ViewBuffer<T> {
    pub(crate) fn len(&self) -> usize {
        self.cells.len()
    }

    /// Base pointer for rectangle writes.
    pub(crate) fn base_ptr(&self) -> *mut T {
        self.cells.as_ptr() as *mut T
    }

    /// Read the whole buffer.
    ///
    /// # Safety
    /// No writer may be active: only call once all copies for the current
    /// allocation have completed (or before any were issued).
    pub(crate) unsafe fn as_slice(&self) -> &[T] {
        std::slice::from_raw_parts(self.base_ptr(), self.len())
    }

    /// Exclusive access for the border fill pass.
    ///
    /// # Safety
    /// Caller must be the only thread touching the buffer.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn as_mut_slice(&self) -> &mut [T] {
        std::slice::from_raw_parts_mut(self.base_ptr(), self.len())
    }
}

/// Immutable geometry of one allocated view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewGeometry {
    /// Pyramid level the view belongs to.
    pub level: usize,
    /// Logical tile position the view is centered on.
    pub tile_coord: Vec<usize>,
    /// File coordinate of the buffer's first element; negative inside the
    /// front halo of the first tiles.
    pub origin: Vec<i64>,
    /// Buffer shape: `tile_dims + 2 * radii`.
    pub view_dims: Vec<usize>,
    /// Halo extent per dimension.
    pub radii: Vec<usize>,
    /// Leading element count per dimension that falls before the file.
    pub front_fill: Vec<usize>,
    /// Trailing element count per dimension that falls past the file.
    pub back_fill: Vec<usize>,
    /// Extent of the center tile actually backed by the file (clipped at
    /// the file's far edge for partial tiles).
    pub center_dims: Vec<usize>,
}

impl ViewGeometry {
    /// Elements in the view buffer.
    pub fn element_count(&self) -> usize {
        element_count(&self.view_dims)
    }
}

/// Mutable per-allocation state, touched under a short lock.
pub(crate) struct ViewMutable {
    pub(crate) releases_remaining: usize,
    pub(crate) error: Option<Arc<LoadError>>,
}

/// Engine-side state of one view allocation.
///
/// The buffer travels: pool → allocation → (copies, fill, delivery) → back
/// to the pool when the last handle to this state drops. Dropping is the
/// recycling point because `Drop` gives the one place with guaranteed
/// exclusive access, making buffer reuse race-free by construction.
pub(crate) struct ViewState<T> {
    buffer: Option<ViewBuffer<T>>,
    pool: Weak<ViewPool<T>>,
    pub(crate) geometry: ViewGeometry,
    pub(crate) index: u64,
    /// Copies still pending before the view may be finalized.
    pub(crate) outstanding: AtomicUsize,
    pub(crate) mutable: Mutex<ViewMutable>,
}

impl<T> ViewState<T> {
    pub(crate) fn new(
        buffer: ViewBuffer<T>,
        pool: Weak<ViewPool<T>>,
        geometry: ViewGeometry,
        index: u64,
        release_count: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            buffer: Some(buffer),
            pool,
            geometry,
            index,
            outstanding: AtomicUsize::new(0),
            mutable: Mutex::new(ViewMutable {
                releases_remaining: release_count,
                error: None,
            }),
        })
    }

    pub(crate) fn buffer(&self) -> &ViewBuffer<T> {
        // Only `drop` takes the buffer, and it needs exclusive access.
        self.buffer.as_ref().expect("view buffer already recycled")
    }
}

impl<T> Drop for ViewState<T> {
    fn drop(&mut self) {
        if let (Some(buffer), Some(pool)) = (self.buffer.take(), self.pool.upgrade()) {
            pool.recycle(buffer);
        }
    }
}

/// A delivered view: one center tile plus its halo.
///
/// Cheap to clone; consumers that hand a view to several downstream users
/// clone it once per user and every user returns its clone through
/// [`crate::TileFlow::release`].
pub struct View<T> {
    pub(crate) state: Arc<ViewState<T>>,
}

impl<T> Clone for View<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Copy + Default> View<T> {
    /// Pyramid level of the view.
    pub fn level(&self) -> usize {
        self.state.geometry.level
    }

    /// Logical tile position the view is centered on.
    pub fn tile_coord(&self) -> &[usize] {
        &self.state.geometry.tile_coord
    }

    /// Full view geometry.
    pub fn geometry(&self) -> &ViewGeometry {
        &self.state.geometry
    }

    /// Monotone request index, the position in the request sequence.
    pub fn request_index(&self) -> u64 {
        self.state.index
    }

    /// Error of the first failed tile fetch, if any. A view carrying an
    /// error has unspecified buffer contents.
    pub fn fetch_error(&self) -> Option<Arc<LoadError>> {
        self.state.mutable.lock().error.clone()
    }

    /// The whole view buffer, halo included, in row-major order.
    pub fn data(&self) -> &[T] {
        // No writer can be active while a consumer handle exists: copies and
        // border fill complete before delivery, and recycling waits for
        // every handle to be released.
        unsafe { self.state.buffer().as_slice() }
    }

    /// Element at a view-local index.
    pub fn get(&self, index: &[usize]) -> T {
        let geometry = &self.state.geometry;
        debug_assert_eq!(index.len(), geometry.view_dims.len());
        let offset = offset_of(index, &strides(&geometry.view_dims));
        self.data()[offset]
    }
}

/// Bounded free pool of view buffers for one pyramid level.
///
/// The allocator blocks here when every buffer is in flight, which is the
/// pipeline's primary back-pressure point.
pub(crate) struct ViewPool<T> {
    inner: Mutex<PoolInner<T>>,
    available: Condvar,
}

struct PoolInner<T> {
    buffers: Vec<ViewBuffer<T>>,
    shutdown: bool,
}

impl<T: Copy + Default> ViewPool<T> {
    pub(crate) fn new(pool_size: usize, buffer_len: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                buffers: (0..pool_size).map(|_| ViewBuffer::new(buffer_len)).collect(),
                shutdown: false,
            }),
            available: Condvar::new(),
        }
    }
}

impl<T> ViewPool<T> {
    /// Take a free buffer, blocking until one is recycled. Returns `None`
    /// once the pool is shut down.
    pub(crate) fn acquire(&self) -> Option<ViewBuffer<T>> {
        let mut inner = self.inner.lock();
        loop {
            if inner.shutdown {
                return None;
            }
            if let Some(buffer) = inner.buffers.pop() {
                return Some(buffer);
            }
            self.available.wait(&mut inner);
        }
    }

    /// Return a buffer and wake one blocked allocator.
    pub(crate) fn recycle(&self, buffer: ViewBuffer<T>) {
        let mut inner = self.inner.lock();
        inner.buffers.push(buffer);
        self.available.notify_one();
    }

    pub(crate) fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shutdown = true;
        self.available.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn free_count(&self) -> usize {
        self.inner.lock().buffers.len()
    }
}
