//! Error types for tileflow_core.

use thiserror::Error;

/// Construction-time validation failures.
///
/// Every variant is detected before any worker thread is spawned; a
/// configuration that builds is a configuration that can run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("the tile loader reports 0 dimensions, data needs at least 1")]
    ZeroDimensions,

    #[error("the tile loader reports 0 pyramid levels, planar files have 1")]
    ZeroLevels,

    #[error("{count} dimension names given for {expected} dimensions")]
    DimNameCount { count: usize, expected: usize },

    #[error("level {level}: {what} has {count} entries, expected {expected}")]
    DimCount {
        level: usize,
        what: &'static str,
        count: usize,
        expected: usize,
    },

    #[error("level {level}: {what} has a zero entry in dimension {dim}")]
    ZeroDim {
        level: usize,
        what: &'static str,
        dim: usize,
    },

    #[error("level {level}: full dims are smaller than tile dims in dimension {dim}")]
    FullSmallerThanTile { level: usize, dim: usize },

    #[error("{what} has {count} entries, expected one per level ({expected})")]
    PerLevelCount {
        what: &'static str,
        count: usize,
        expected: usize,
    },

    #[error("{what} must not contain a zero entry (level {level})")]
    ZeroPerLevelEntry { what: &'static str, level: usize },

    #[error("{count} radii given for {expected} dimensions")]
    RadiiCount { count: usize, expected: usize },

    #[error("level {level}: cache capacity of {capacity_mb} MB cannot hold a single {tile_bytes}-byte tile")]
    CacheCapacityTooSmall {
        level: usize,
        capacity_mb: usize,
        tile_bytes: usize,
    },

    #[error("the constant border creator needs a value, call border_creator_constant(value)")]
    ConstantBorderNeedsValue,

    #[error("a custom border creator needs an implementation, call border_creator_custom(creator)")]
    CustomBorderNeedsImpl,

    #[error("a custom traversal needs an implementation, call traversal_custom(traversal)")]
    CustomTraversalNeedsImpl,

    #[error("copy thread count must not be zero")]
    ZeroCopyThreads,

    #[error("level {level} is out of range, the file has {nb_levels} levels")]
    LevelOutOfRange { level: usize, nb_levels: usize },

    #[error("tile coordinate {coord:?} is outside the {nb_tiles:?} tile grid of level {level}")]
    TileOutOfRange {
        level: usize,
        coord: Vec<usize>,
        nb_tiles: Vec<usize>,
    },
}

/// Runtime tile-fetch failures, surfaced on the view that needed the tile.
///
/// Shared between all waiters of a failed slot, hence the `String` payloads
/// (the error is cloned behind an `Arc` and must not borrow the source).
#[derive(Error, Debug, Clone)]
pub enum LoadError {
    #[error("IO error reading tile {coord:?} at level {level}: {message}")]
    Io {
        level: usize,
        coord: Vec<usize>,
        message: String,
    },

    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("tile loader error: {0}")]
    Loader(String),
}

impl LoadError {
    /// Wrap an `io::Error` for a specific tile fetch.
    pub fn io(level: usize, coord: &[usize], err: std::io::Error) -> Self {
        LoadError::Io {
            level,
            coord: coord.to_vec(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for tile fetches.
pub type LoadResult<T> = Result<T, LoadError>;

/// Errors surfaced by the running engine.
#[derive(Error, Debug, Clone)]
pub enum TileFlowError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("views can no longer be requested after finish_requesting_views")]
    RequestAfterFinish,

    #[error("the engine is shut down")]
    ShutDown,
}
