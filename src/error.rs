use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for cache operations.
pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Every failure the cache reports to its callers.
///
/// None of these are fatal: the engine is left consistent and the
/// per-operation `fail` counter has been bumped before the error returns.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Lookup miss on find, update or erase.
    #[error("key not found")]
    NotFound,

    /// `insert` of a key that is already cached.
    #[error("key already exists")]
    AlreadyExists,

    /// No node could be produced even after the LRU list was drained.
    #[error("no free node can hold {requested} bytes and nothing is left to evict")]
    OutOfSpace { requested: usize },

    /// Key plus value is larger than the largest size class, or larger
    /// than the fixed slot of the node being rewritten in place.
    #[error("entry of {size} bytes exceeds the {limit} byte limit")]
    ValueTooLarge { size: usize, limit: usize },

    /// `update` with a key or value length different from the stored one.
    #[error(
        "size mismatch: stored key/value are {stored_key}/{stored_value} bytes, got {key}/{value}"
    )]
    SizeMismatch {
        stored_key: usize,
        stored_value: usize,
        key: usize,
        value: usize,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to read config file {path}: {source}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Creating, mapping or flushing the backing file failed.
    #[error("cache region {path}: {source}")]
    Region {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The backing file exists but does not hold a compatible region.
    #[error("cache region {path} cannot be attached: {reason}")]
    BadRegion { path: PathBuf, reason: String },

    /// Reported by `Cache::verify` when a structural invariant is broken.
    #[error("cache structure is inconsistent: {0}")]
    Corrupted(String),
}

impl CacheError {
    pub(crate) fn region(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CacheError::Region {
            path: path.into(),
            source,
        }
    }
}
