//! Fixed-capacity key/value cache with size-classed node storage and LRU
//! eviction, optionally backed by a memory-mapped file shared between
//! processes.
//!
//! ```no_run
//! use ccache::{Cache, CacheConfig};
//!
//! let cache = Cache::open_with(&CacheConfig::default(), None)?;
//! cache.insert(b"user:1", b"alice", None)?;
//! assert_eq!(cache.find(b"user:1")?, b"alice");
//! # Ok::<(), ccache::CacheError>(())
//! ```
mod config;
mod entry;
mod error;
mod key;
mod shm;
mod stats;

pub use config::{CacheConfig, MAX_SIZE_CLASSES};
pub use entry::Entry;
pub use error::{CacheError, Result};
pub use key::{default_compare, Comparator};
pub use shm::{Cache, EvictFn, UpdateFn};
pub use stats::{CacheStats, ClassStats, OpStats};
