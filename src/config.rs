//! Cache configuration: the size-class ladder, bucket count and region sizing.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::shm::layout;

/// Upper bound on the number of size classes a ladder may produce.
pub const MAX_SIZE_CLASSES: usize = 4096;

/// Settings for opening a cache.
///
/// Loaded from a JSON document with [`CacheConfig::from_file`] or built in
/// code. Missing fields take their [`Default`] values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Backing file. `None` keeps the region on the process heap.
    pub path: Option<PathBuf>,
    /// Capacity (key + value bytes) of the smallest size class.
    pub min_size: usize,
    /// Capacity of the largest size class; larger entries are rejected.
    pub max_size: usize,
    /// Step between consecutive size classes.
    pub align_size: usize,
    /// Number of hash buckets.
    pub hashitem: usize,
    /// Bytes of node storage. Preallocated nodes are carved from it first,
    /// the remainder is carved on demand.
    pub datasize: usize,
    /// Nodes carved into every size class when the region is formatted.
    pub prealloc_num: usize,
    /// Format a fresh region (`true`) or attach to the one already at `path`.
    pub init: bool,
    /// Move entries to the most-recently-used position on `find`. When off,
    /// `find` only takes the read lock and eviction order is insertion and
    /// write order.
    pub promote_on_find: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            path: None,
            min_size: 32,
            max_size: 1024,
            align_size: 32,
            hashitem: 1024,
            datasize: 1 << 20,
            prealloc_num: 16,
            init: true,
            promote_on_find: true,
        }
    }
}

impl CacheConfig {
    /// Read a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| CacheError::ConfigFile {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| CacheError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check the settings describe a region that can be laid out.
    pub fn validate(&self) -> Result<()> {
        if self.min_size == 0 {
            return Err(invalid("min_size must be at least 1"));
        }
        if self.min_size > self.max_size {
            return Err(invalid(format!(
                "min_size {} is larger than max_size {}",
                self.min_size, self.max_size
            )));
        }
        if self.max_size > layout::MAX_CAPACITY {
            return Err(invalid(format!(
                "max_size {} is above the largest class capacity {}",
                self.max_size,
                layout::MAX_CAPACITY
            )));
        }
        if self.align_size == 0 {
            return Err(invalid("align_size must be at least 1"));
        }
        if self.hashitem == 0 {
            return Err(invalid("hashitem must be at least 1"));
        }
        if self.hashitem > u32::MAX as usize || self.prealloc_num > u32::MAX as usize {
            return Err(invalid("hashitem and prealloc_num must fit in 32 bits"));
        }
        let classes = (self.max_size - self.min_size) / self.align_size + 1;
        if classes > MAX_SIZE_CLASSES {
            return Err(invalid(format!(
                "{classes} size classes requested, at most {MAX_SIZE_CLASSES} are supported"
            )));
        }
        let needed = self
            .checked_prealloc_bytes()
            .ok_or_else(|| invalid("preallocation size overflows"))?;
        if needed > self.datasize {
            return Err(invalid(format!(
                "preallocating {} nodes per class needs {needed} bytes, datasize is {}",
                self.prealloc_num, self.datasize
            )));
        }
        match self.checked_region_size() {
            Some(size) if size <= isize::MAX as usize => Ok(()),
            _ => Err(invalid(format!(
                "datasize {} does not fit in the address space",
                self.datasize
            ))),
        }
    }

    /// Capacities of the size classes, ascending. The last one is always
    /// `max_size`.
    pub fn size_classes(&self) -> Vec<usize> {
        let step = self.align_size.max(1);
        let mut classes = Vec::new();
        let mut capacity = self.min_size;
        while capacity < self.max_size {
            classes.push(capacity);
            capacity += step;
        }
        classes.push(self.max_size);
        classes
    }

    /// Bytes of node storage taken by the initial preallocation. Saturates
    /// on configs `validate` rejects.
    pub fn prealloc_bytes(&self) -> usize {
        self.checked_prealloc_bytes().unwrap_or(usize::MAX)
    }

    fn checked_prealloc_bytes(&self) -> Option<usize> {
        self.size_classes().iter().try_fold(0usize, |total, &capacity| {
            layout::slot_size(capacity)
                .checked_mul(self.prealloc_num)
                .and_then(|bytes| total.checked_add(bytes))
        })
    }

    /// Total size of a region laid out from this config. Saturates on
    /// configs `validate` rejects.
    pub fn region_size(&self) -> usize {
        self.checked_region_size().unwrap_or(usize::MAX)
    }

    fn checked_region_size(&self) -> Option<usize> {
        layout::checked_region_size(self.hashitem, self.size_classes().len(), self.datasize)
    }
}

fn invalid(msg: impl Into<String>) -> CacheError {
    CacheError::Config(msg.into())
}
