/// Backing memory for a cache.
///
/// A region is either a zeroed heap buffer owned by this process, or a
/// memory-mapped file that several processes can map at once. Both hold
/// the same layout: header + bucket heads + size classes + node area.
use std::fs;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use super::freearea;
use super::layout::{self, Space, MAGIC, NIL, VERSION};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};

enum Backing {
    /// `u64` words keep the base 8-byte aligned.
    Heap(Box<[u64]>),
    Mapped { mmap: MmapMut, path: PathBuf },
}

/// The full cache region, owning its memory and handing out a raw base
/// pointer to the structures within.
pub struct Region {
    backing: Backing,
    base: *mut u8,
    len: usize,
}

impl Region {
    /// Allocate and format a region on the process heap.
    pub fn heap(config: &CacheConfig) -> Result<Self> {
        let len = config.region_size();
        let mut words = vec![0u64; len.div_ceil(8)].into_boxed_slice();
        let base = words.as_mut_ptr() as *mut u8;
        let region = Region {
            backing: Backing::Heap(words),
            base,
            len,
        };
        unsafe { region.format(config) };
        Ok(region)
    }

    /// Create (or truncate) the file at `path` and format a fresh region in it.
    pub fn create(path: &Path, config: &CacheConfig) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir).map_err(|e| CacheError::region(path, e))?;
            }
        }

        let len = config.region_size();
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| CacheError::region(path, e))?;
        file.set_len(len as u64)
            .map_err(|e| CacheError::region(path, e))?;

        // Safety: the file was just truncated; nobody else has it mapped
        // unless they ignore the ownership rules of `Cache::open`.
        let mut mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| CacheError::region(path, e))?;
        mmap.fill(0);

        let base = mmap.as_mut_ptr();
        let region = Region {
            backing: Backing::Mapped {
                mmap,
                path: path.to_path_buf(),
            },
            base,
            len,
        };
        unsafe { region.format(config) };
        region.flush()?;
        Ok(region)
    }

    /// Map an existing region, checking it was formatted with the same geometry.
    pub fn attach(path: &Path, config: &CacheConfig) -> Result<Self> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| CacheError::region(path, e))?;
        let file_len = file
            .metadata()
            .map_err(|e| CacheError::region(path, e))?
            .len() as usize;
        if file_len < layout::HEADER_SIZE {
            return Err(bad_region(path, format!("file is only {file_len} bytes")));
        }

        let mut mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| CacheError::region(path, e))?;
        let base = mmap.as_mut_ptr();
        let region = Region {
            backing: Backing::Mapped {
                mmap,
                path: path.to_path_buf(),
            },
            base,
            len: file_len,
        };

        let header = unsafe { region.space().header() };
        if header.magic != MAGIC {
            return Err(bad_region(path, "bad magic"));
        }
        if header.version != VERSION {
            return Err(bad_region(
                path,
                format!("layout version {} is not {VERSION}", header.version),
            ));
        }
        let classes = config.size_classes();
        let expected = [
            ("hashitem", header.hashitem as usize, config.hashitem),
            ("min_size", header.min_size as usize, config.min_size),
            ("max_size", header.max_size as usize, config.max_size),
            ("align_size", header.align_size as usize, config.align_size),
            ("prealloc_num", header.prealloc_num as usize, config.prealloc_num),
            ("size classes", header.class_num as usize, classes.len()),
            ("filesize", header.filesize as usize, config.region_size()),
        ];
        for (field, stored, wanted) in expected {
            if stored != wanted {
                return Err(bad_region(
                    path,
                    format!("{field} is {stored} in the region but {wanted} in the config"),
                ));
            }
        }
        if file_len < header.filesize as usize {
            return Err(bad_region(
                path,
                format!("file is {file_len} bytes, header says {}", header.filesize),
            ));
        }

        Ok(region)
    }

    /// Write the header, empty every bucket, lay out the size classes and
    /// carve the preallocated nodes.
    ///
    /// # Safety
    /// The region must be zeroed and exclusively owned.
    unsafe fn format(&self, config: &CacheConfig) {
        let classes = config.size_classes();
        let space = self.space();
        let data_start = layout::data_offset(config.hashitem, classes.len());

        let header = space.header_mut();
        header.magic = MAGIC;
        header.version = VERSION;
        header.filesize = self.len as u64;
        header.hashitem = config.hashitem as u32;
        header.class_num = classes.len() as u32;
        header.min_size = config.min_size as u32;
        header.max_size = config.max_size as u32;
        header.align_size = config.align_size as u32;
        header.prealloc_num = config.prealloc_num as u32;
        header.start_free = data_start as u64;
        header.data_end = (data_start + config.datasize) as u64;
        header.freesize = config.datasize as u64;
        header.lru_head = NIL;
        header.lru_tail = NIL;
        header.used_count = 0;
        header.stats = [0; layout::STAT_COUNT];
        header.lock_word = 0;

        for bucket in 0..config.hashitem {
            space.set_bucket_head(bucket, NIL);
        }

        for (index, &capacity) in classes.iter().enumerate() {
            let class = space.class_mut(index);
            class.capacity = capacity as u32;
            class.slot_size = layout::slot_size(capacity) as u32;
            class.free_head = NIL;
            class.free_count = 0;
            class.total_count = 0;
        }

        freearea::format(space, config.prealloc_num);
    }

    pub fn space(&self) -> Space<'_> {
        unsafe { Space::new(self.base) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Backing file, if the region is mapped.
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Heap(_) => None,
            Backing::Mapped { path, .. } => Some(path),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.backing, Backing::Mapped { .. })
    }

    /// Push dirty pages of a mapped region to its file.
    pub fn flush(&self) -> Result<()> {
        match &self.backing {
            Backing::Heap(_) => Ok(()),
            Backing::Mapped { mmap, path } => {
                mmap.flush().map_err(|e| CacheError::region(path, e))
            }
        }
    }
}

fn bad_region(path: &Path, reason: impl Into<String>) -> CacheError {
    CacheError::BadRegion {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}
