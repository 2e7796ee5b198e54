//! Engine configuration.
//!
//! A `TileFlowConfig` wraps a tile loader, validates everything it reports,
//! and collects the per-level knobs before the engine spins up its worker
//! pools. Every setter fails fast; a config that builds into an engine has
//! nothing left to go wrong at request time.

use std::sync::Arc;

use crate::border::{BorderCreator, ConstantBorderCreator, ReplicateBorderCreator};
use crate::error::ConfigError;
use crate::loader::{FileGeometry, TileLoader};
use crate::traversal::{NaiveTraversal, Traversal};

/// Built-in ghost-region filling strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillingType {
    /// Replicate the outermost populated slab of each dimension.
    Default,
    /// Fill with a constant; needs a value via `border_creator_constant`.
    Constant,
    /// User implementation; needs `border_creator_custom`.
    Custom,
}

/// Built-in traversal orderings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalType {
    /// Lexicographic, last dimension fastest.
    Naive,
    /// User implementation; needs `traversal_custom`.
    Custom,
}

/// Validated configuration for a [`crate::TileFlow`] engine.
pub struct TileFlowConfig<T> {
    pub(crate) loader: Box<dyn TileLoader<T>>,
    pub(crate) file: FileGeometry,
    pub(crate) radii: Vec<usize>,
    pub(crate) cache_capacity_mb: Vec<usize>,
    pub(crate) view_available: Vec<usize>,
    pub(crate) release_count: Vec<usize>,
    pub(crate) ordered: bool,
    pub(crate) border_creator: Arc<dyn BorderCreator<T>>,
    pub(crate) traversal: Arc<dyn Traversal>,
    pub(crate) copy_threads: usize,
}

impl<T: Copy + Default + Send + Sync + 'static> TileFlowConfig<T> {
    /// Wrap a loader, interrogating and validating its metadata.
    pub fn new(loader: Box<dyn TileLoader<T>>) -> Result<Self, ConfigError> {
        let file = FileGeometry::from_loader(loader.as_ref())?;
        let nb_levels = file.nb_levels();
        let nb_dims = file.nb_dims;
        Ok(Self {
            loader,
            file,
            radii: vec![0; nb_dims],
            cache_capacity_mb: vec![10; nb_levels],
            view_available: vec![1; nb_levels],
            release_count: vec![1; nb_levels],
            ordered: false,
            border_creator: Arc::new(ReplicateBorderCreator),
            traversal: Arc::new(NaiveTraversal),
            copy_threads: 2,
        })
    }

    /// Use the same halo radius for every dimension.
    pub fn radius(&mut self, shared_radius: usize) {
        self.radii = vec![shared_radius; self.file.nb_dims];
    }

    /// Per-dimension halo radii.
    pub fn radii(&mut self, radii: Vec<usize>) -> Result<(), ConfigError> {
        if radii.len() != self.file.nb_dims {
            return Err(ConfigError::RadiiCount {
                count: radii.len(),
                expected: self.file.nb_dims,
            });
        }
        self.radii = radii;
        Ok(())
    }

    /// Deliver views in request order instead of completion order.
    pub fn ordered(&mut self, ordered: bool) {
        self.ordered = ordered;
    }

    /// Times a view must be released before its buffer is recycled, per
    /// level.
    pub fn release_count_per_level(&mut self, counts: Vec<usize>) -> Result<(), ConfigError> {
        self.release_count = self.checked_per_level("release count", counts)?;
        Ok(())
    }

    /// View free-pool size per level: how many views may be in flight at
    /// once.
    pub fn view_available(&mut self, counts: Vec<usize>) -> Result<(), ConfigError> {
        self.view_available = self.checked_per_level("view availability", counts)?;
        Ok(())
    }

    /// Physical-tile cache budget in MB per level.
    pub fn cache_capacity_mb(&mut self, capacities: Vec<usize>) -> Result<(), ConfigError> {
        self.cache_capacity_mb = self.checked_per_level("cache capacity", capacities)?;
        Ok(())
    }

    /// Select a built-in border creator. `Constant` and `Custom` carry a
    /// payload and must go through their dedicated setters.
    pub fn border_creator(&mut self, filling_type: FillingType) -> Result<(), ConfigError> {
        match filling_type {
            FillingType::Default => {
                self.border_creator = Arc::new(ReplicateBorderCreator);
                Ok(())
            }
            FillingType::Constant => Err(ConfigError::ConstantBorderNeedsValue),
            FillingType::Custom => Err(ConfigError::CustomBorderNeedsImpl),
        }
    }

    /// Fill the out-of-file ghost region with a constant.
    pub fn border_creator_constant(&mut self, value: T) {
        self.border_creator = Arc::new(ConstantBorderCreator::new(value));
    }

    /// Use a caller-supplied border creator.
    pub fn border_creator_custom(&mut self, creator: Arc<dyn BorderCreator<T>>) {
        self.border_creator = creator;
    }

    /// Select a built-in traversal. `Custom` must go through
    /// `traversal_custom`.
    pub fn traversal_type(&mut self, traversal_type: TraversalType) -> Result<(), ConfigError> {
        match traversal_type {
            TraversalType::Naive => {
                self.traversal = Arc::new(NaiveTraversal);
                Ok(())
            }
            TraversalType::Custom => Err(ConfigError::CustomTraversalNeedsImpl),
        }
    }

    /// Use a caller-supplied traversal.
    pub fn traversal_custom(&mut self, traversal: Arc<dyn Traversal>) {
        self.traversal = traversal;
    }

    /// Copier pool size per level.
    pub fn copy_threads(&mut self, threads: usize) -> Result<(), ConfigError> {
        if threads == 0 {
            return Err(ConfigError::ZeroCopyThreads);
        }
        self.copy_threads = threads;
        Ok(())
    }

    fn checked_per_level(
        &self,
        what: &'static str,
        values: Vec<usize>,
    ) -> Result<Vec<usize>, ConfigError> {
        let nb_levels = self.file.nb_levels();
        if values.len() != nb_levels {
            return Err(ConfigError::PerLevelCount {
                what,
                count: values.len(),
                expected: nb_levels,
            });
        }
        if let Some(level) = values.iter().position(|&v| v == 0) {
            return Err(ConfigError::ZeroPerLevelEntry { what, level });
        }
        Ok(values)
    }
}
