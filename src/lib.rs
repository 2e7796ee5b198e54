//! tileflow_core - streaming view loader for very large tiled rasters.
//!
//! Consumers of microscopy, volumetric and pyramidal images rarely want
//! raw file tiles: they want overlapping windows, one center tile plus a
//! halo drawn from the neighbouring tiles, delivered concurrently and in
//! fixed memory. This crate provides:
//! - A bounded, refcounted physical-tile cache with at-most-one concurrent
//!   fetch per tile (waiters coalesce, strict LRU eviction among unpinned
//!   tiles).
//! - Parallel tile I/O on a dedicated rayon pool and parallel
//!   tile-to-view copies with per-axis reversal support.
//! - Pluggable ghost-region strategies (replicate, constant, custom) and
//!   traversal orderings, with ordered or as-soon-as-ready delivery.
//! - A bounded free pool of view buffers recycled after a configurable
//!   number of consumer releases.
//!
//! ```ignore
//! let mut config = TileFlowConfig::new(Box::new(my_tiff_loader))?;
//! config.radius(1);
//! config.ordered(true);
//! let flow = TileFlow::new(config)?;
//!
//! flow.request_all_views(0)?;
//! flow.finish_requesting_views();
//! while let Some(view) = flow.next() {
//!     process(view.data(), view.geometry());
//!     flow.release(view);
//! }
//! ```

mod adaptive;
mod border;
mod cache;
mod config;
mod copier;
mod engine;
mod error;
mod geometry;
mod loader;
mod planner;
mod traversal;
mod view;
#[cfg(test)]
pub(crate) mod test_utils;

pub use adaptive::AdaptiveTileLoader;
pub use border::{BorderCreator, BorderRequest, ConstantBorderCreator, ReplicateBorderCreator};
pub use cache::{CacheStats, TileKey};
pub use config::{FillingType, TileFlowConfig, TraversalType};
pub use engine::TileFlow;
pub use error::{ConfigError, LoadError, LoadResult, TileFlowError};
pub use geometry::CopyRegion;
pub use loader::{FileGeometry, TileLoader};
pub use traversal::{NaiveTraversal, Traversal};
pub use view::{View, ViewGeometry};
