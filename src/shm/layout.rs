/// `#[repr(C)]` structures that live in the cache region.
///
/// All structs use fixed-size fields and explicit padding so the
/// layout is identical across compilations and processes. Links between
/// records are byte offsets from the region base, never pointers, so a
/// region can be mapped at any address.
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64};

/// Magic bytes at the start of the header to validate the mapping.
pub const MAGIC: [u8; 8] = *b"CCACHE01";

pub const VERSION: u32 = 1;

/// Size of the fixed header at the start of the region.
pub const HEADER_SIZE: usize = 256;

/// Offset 0 is the header, so no node ever lives there.
pub const NIL: u64 = 0;

/// Node state values.
pub const NODE_FREE: u32 = 0;
pub const NODE_IN_USE: u32 = 1;

/// Indices into `Header::stats`: three counters (total, success, fail)
/// per operation kind, then the visit counter.
pub const STAT_FIND: usize = 0;
pub const STAT_UPDATE: usize = 3;
pub const STAT_SET: usize = 6;
pub const STAT_INSERT: usize = 9;
pub const STAT_ERASE: usize = 12;
pub const STAT_VISIT: usize = 15;
pub const STAT_COUNT: usize = 16;

const STATS_OFFSET: usize = 64;
const LOCK_WORD_OFFSET: usize = 220;

/// Header lives at offset 0 of the region.
///
/// Fields are ordered u64-first to avoid implicit alignment padding
/// in `#[repr(C)]`.
#[repr(C)]
#[derive(Debug)]
pub struct Header {
    // 8-byte aligned group
    pub magic: [u8; 8],     // 0..8
    pub filesize: u64,      // 8..16
    pub freesize: u64,      // 16..24  (uncarved bytes left in the node area)
    pub start_free: u64,    // 24..32  (offset of the next uncarved byte)
    pub data_end: u64,      // 32..40
    pub lru_head: u64,      // 40..48  (most recently used, NIL = empty)
    pub lru_tail: u64,      // 48..56  (least recently used)
    pub used_count: u64,    // 56..64
    pub stats: [u64; STAT_COUNT], // 64..192

    // 4-byte aligned group
    pub version: u32,      // 192..196
    pub hashitem: u32,     // 196..200
    pub class_num: u32,    // 200..204
    pub min_size: u32,     // 204..208
    pub max_size: u32,     // 208..212
    pub align_size: u32,   // 212..216
    pub prealloc_num: u32, // 216..220
    pub lock_word: u32,    // 220..224 (reader/writer state for mapped regions)

    // Explicit padding to 256 bytes: 256 - 224 = 32
    pub _pad: [u8; 32],
}

const _: () = assert!(std::mem::size_of::<Header>() == HEADER_SIZE);
const _: () = assert!(std::mem::offset_of!(Header, stats) == STATS_OFFSET);
const _: () = assert!(std::mem::offset_of!(Header, lock_word) == LOCK_WORD_OFFSET);

/// Each bucket is the offset of the first node in its chain.
pub const BUCKET_SIZE: usize = 8;

/// One size class of the free-area allocator.
#[repr(C)]
#[derive(Debug)]
pub struct SizeClass {
    pub capacity: u32,
    pub slot_size: u32,
    pub free_head: u64,
    pub free_count: u64,
    pub total_count: u64,
}

pub const SIZE_CLASS_SIZE: usize = 32;
const _: () = assert!(std::mem::size_of::<SizeClass>() == SIZE_CLASS_SIZE);

/// Per-node header inside the node area. Followed by key bytes then value bytes.
pub const NODE_HEADER_SIZE: usize = 64;

#[repr(C)]
#[derive(Debug)]
pub struct NodeHeader {
    // 8-byte aligned group
    pub bucket_prev: u64, // 0..8
    pub bucket_next: u64, // 8..16
    pub lru_prev: u64,    // 16..24 (towards the most recently used end)
    pub lru_next: u64,    // 24..32
    pub free_next: u64,   // 32..40

    // 4-byte aligned group
    pub class: u32,     // 40..44
    pub bucket: u32,    // 44..48
    pub key_len: u32,   // 48..52
    pub value_len: u32, // 52..56
    pub state: u32,     // 56..60

    pub _pad: u32, // 60..64
}

const _: () = assert!(std::mem::size_of::<NodeHeader>() == NODE_HEADER_SIZE);

#[inline]
pub const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Bytes taken by one node whose class holds `capacity` data bytes.
#[inline]
pub const fn slot_size(capacity: usize) -> usize {
    NODE_HEADER_SIZE + align8(capacity)
}

/// Largest class capacity whose slot size still fits `SizeClass::slot_size`.
pub const MAX_CAPACITY: usize = (u32::MAX as usize - NODE_HEADER_SIZE) & !7;

/// Offset of the bucket array from the start of the region.
pub fn buckets_offset() -> usize {
    HEADER_SIZE
}

/// Offset of the size-class array.
pub fn classes_offset(hashitem: usize) -> usize {
    HEADER_SIZE + hashitem * BUCKET_SIZE
}

/// Offset of the node area.
pub fn data_offset(hashitem: usize, class_num: usize) -> usize {
    classes_offset(hashitem) + class_num * SIZE_CLASS_SIZE
}

/// Total size of the region, or `None` when the layout does not fit in a
/// `usize`.
pub fn checked_region_size(hashitem: usize, class_num: usize, datasize: usize) -> Option<usize> {
    let buckets = hashitem.checked_mul(BUCKET_SIZE)?;
    let classes = class_num.checked_mul(SIZE_CLASS_SIZE)?;
    let data = datasize.checked_add(7)? & !7;
    HEADER_SIZE
        .checked_add(buckets)?
        .checked_add(classes)?
        .checked_add(data)
}

/// Typed accessors over a raw region base pointer.
///
/// Every accessor is `unsafe`: the caller must hold the engine lock in the
/// mode the access needs, and every offset handed in must name a record
/// that was laid out by `freearea::format` or `freearea::carve`.
#[derive(Clone, Copy)]
pub struct Space<'a> {
    base: *mut u8,
    _region: PhantomData<&'a ()>,
}

impl<'a> Space<'a> {
    /// # Safety
    /// `base` must point to a formatted region that lives for `'a` and is
    /// aligned to 8 bytes.
    pub unsafe fn new(base: *mut u8) -> Self {
        Space {
            base,
            _region: PhantomData,
        }
    }

    pub unsafe fn header(&self) -> &'a Header {
        &*(self.base as *const Header)
    }

    #[allow(clippy::mut_from_ref)]
    pub unsafe fn header_mut(&self) -> &'a mut Header {
        &mut *(self.base as *mut Header)
    }

    /// Atomic view of one statistics counter.
    #[inline]
    pub unsafe fn stat(&self, index: usize) -> &'a AtomicU64 {
        debug_assert!(index < STAT_COUNT);
        &*(self.base.add(STATS_OFFSET + index * 8) as *const AtomicU64)
    }

    /// Atomic view of the lock word.
    pub unsafe fn lock_word(&self) -> &'a AtomicU32 {
        &*(self.base.add(LOCK_WORD_OFFSET) as *const AtomicU32)
    }

    #[inline]
    pub unsafe fn bucket_head(&self, bucket: usize) -> u64 {
        *(self.base.add(buckets_offset() + bucket * BUCKET_SIZE) as *const u64)
    }

    #[inline]
    pub unsafe fn set_bucket_head(&self, bucket: usize, node: u64) {
        *(self.base.add(buckets_offset() + bucket * BUCKET_SIZE) as *mut u64) = node;
    }

    #[inline]
    pub unsafe fn class(&self, index: usize) -> &'a SizeClass {
        let hashitem = self.header().hashitem as usize;
        &*(self
            .base
            .add(classes_offset(hashitem) + index * SIZE_CLASS_SIZE) as *const SizeClass)
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn class_mut(&self, index: usize) -> &'a mut SizeClass {
        let hashitem = self.header().hashitem as usize;
        &mut *(self
            .base
            .add(classes_offset(hashitem) + index * SIZE_CLASS_SIZE) as *mut SizeClass)
    }

    #[inline]
    pub unsafe fn node(&self, node: u64) -> &'a NodeHeader {
        debug_assert!(node != NIL);
        &*(self.base.add(node as usize) as *const NodeHeader)
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn node_mut(&self, node: u64) -> &'a mut NodeHeader {
        debug_assert!(node != NIL);
        &mut *(self.base.add(node as usize) as *mut NodeHeader)
    }

    /// Data capacity of the slot at `node`.
    pub unsafe fn capacity(&self, node: u64) -> usize {
        self.class(self.node(node).class as usize).capacity as usize
    }

    pub unsafe fn key(&self, node: u64) -> &'a [u8] {
        let n = self.node(node);
        std::slice::from_raw_parts(
            self.base.add(node as usize + NODE_HEADER_SIZE),
            n.key_len as usize,
        )
    }

    pub unsafe fn value(&self, node: u64) -> &'a [u8] {
        let n = self.node(node);
        std::slice::from_raw_parts(
            self.base
                .add(node as usize + NODE_HEADER_SIZE + n.key_len as usize),
            n.value_len as usize,
        )
    }

    /// Copy key and value into the node. Caller checked they fit.
    pub unsafe fn write_entry(&self, node: u64, key: &[u8], value: &[u8]) {
        debug_assert!(key.len() + value.len() <= self.capacity(node));
        let dest = self.base.add(node as usize + NODE_HEADER_SIZE);
        std::ptr::copy_nonoverlapping(key.as_ptr(), dest, key.len());
        std::ptr::copy_nonoverlapping(value.as_ptr(), dest.add(key.len()), value.len());
        let n = self.node_mut(node);
        n.key_len = key.len() as u32;
        n.value_len = value.len() as u32;
    }

    /// Overwrite only the value, keeping the stored key.
    pub unsafe fn write_value(&self, node: u64, value: &[u8]) {
        let key_len = self.node(node).key_len as usize;
        debug_assert!(key_len + value.len() <= self.capacity(node));
        let dest = self.base.add(node as usize + NODE_HEADER_SIZE + key_len);
        std::ptr::copy_nonoverlapping(value.as_ptr(), dest, value.len());
        self.node_mut(node).value_len = value.len() as u32;
    }

    /// Zero the data bytes of a node being returned to its free list.
    pub unsafe fn clear_data(&self, node: u64) {
        let capacity = self.capacity(node);
        std::ptr::write_bytes(self.base.add(node as usize + NODE_HEADER_SIZE), 0, capacity);
        let n = self.node_mut(node);
        n.key_len = 0;
        n.value_len = 0;
    }
}
