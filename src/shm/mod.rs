//! The cache engine.
//!
//! `Cache` is a fixed-capacity key/value cache whose whole state (header,
//! bucket heads, size classes, node area) lives in one region, either on the
//! heap or in a memory-mapped file shared between processes.
//!
//! Every node is either on its size class's free list or in use, in which
//! case it sits on exactly one bucket chain and on the global LRU list.
//! All of it is guarded by one reader-writer lock; `find` takes the write
//! lock because a hit moves the node to the head of the LRU list.
pub mod freearea;
pub mod hashtable;
pub mod layout;
pub mod lock;
pub mod lrulist;
pub mod region;

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

use hashbrown::HashSet;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::entry::Entry;
use crate::error::{CacheError, Result};
use crate::key::{self, Comparator};
use crate::stats::{CacheStats, ClassStats, OpStats};
use freearea::Allocation;
use layout::{
    Space, NIL, NODE_FREE, NODE_IN_USE, STAT_ERASE, STAT_FIND, STAT_INSERT, STAT_SET,
    STAT_UPDATE, STAT_VISIT,
};
use lock::{EngineLock, ShmRwLock};
use region::Region;

/// Called once for every node evicted to make room, with its final content.
pub type EvictFn<'a> = &'a mut dyn for<'e> FnMut(Entry<'e>);

/// Called by `set` when the key exists: receives the stored entry and the
/// caller's value, and leaves the value to store in the buffer.
pub type UpdateFn<'a> = &'a mut dyn for<'e> FnMut(Entry<'e>, &mut Vec<u8>);

/// A fixed-capacity LRU cache over raw key/value bytes.
pub struct Cache {
    region: Region,
    lock: EngineLock,
    compare: Comparator,
    hashitem: usize,
    promote_on_find: bool,
    closed: bool,
}

impl Cache {
    /// Open a cache described by a JSON config file.
    ///
    /// `compare` decides key equality; `None` uses byte-wise comparison.
    pub fn open(config_file: impl AsRef<Path>, compare: Option<Comparator>) -> Result<Self> {
        let config = CacheConfig::from_file(config_file)?;
        Self::open_with(&config, compare)
    }

    /// Open a cache from an in-memory config.
    ///
    /// With a `path`, `init` formats a fresh file and `!init` attaches to
    /// the region already in it. Without a `path` the region lives on the
    /// heap and is always fresh.
    ///
    /// Attaching a second mapping to a file whose region is in use by an
    /// incompatible engine is undefined behavior; cooperating handles share
    /// the lock stored in the region.
    pub fn open_with(config: &CacheConfig, compare: Option<Comparator>) -> Result<Self> {
        config.validate()?;

        let region = match &config.path {
            None => {
                if !config.init {
                    debug!("heap cache has nothing to attach to, formatting a fresh region");
                }
                Region::heap(config)?
            }
            Some(path) if config.init => Region::create(path, config)?,
            Some(path) => Region::attach(path, config)?,
        };

        let lock = if region.is_shared() {
            let word = unsafe { region.space().lock_word() as *const AtomicU32 };
            EngineLock::Shared(unsafe { ShmRwLock::from_existing(word) })
        } else {
            EngineLock::Local(RwLock::new(()))
        };

        let cache = Cache {
            compare: compare.unwrap_or_else(|| Box::new(key::default_compare) as Comparator),
            hashitem: config.hashitem,
            promote_on_find: config.promote_on_find,
            closed: false,
            region,
            lock,
        };

        info!(
            path = ?cache.region.path(),
            attached = config.path.is_some() && !config.init,
            filesize = cache.region.len(),
            hashitem = cache.hashitem,
            size_classes = config.size_classes().len(),
            entries = cache.len(),
            "cache opened"
        );
        Ok(cache)
    }

    /// Flush a mapped region and release it. The region's contents are left
    /// as they are so a later `open` with `init = false` can attach.
    ///
    /// Dropping a `Cache` does the same but can only log a failed flush.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.shutdown()
    }

    fn shutdown(&self) -> Result<()> {
        let result = {
            let _guard = self.lock.write();
            self.region.flush()
        };
        info!(path = ?self.region.path(), "cache closed");
        result
    }

    fn space(&self) -> Space<'_> {
        self.region.space()
    }

    /// Bucket a key is stored in.
    pub fn bucket_index(&self, key: &[u8]) -> usize {
        key::bucket_index(key, self.hashitem)
    }

    /// Copy out the value stored under `key`.
    ///
    /// A hit moves the entry to the most-recently-used position unless the
    /// cache was opened with `promote_on_find = false`.
    pub fn find(&self, key: &[u8]) -> Result<Vec<u8>> {
        let bucket = self.bucket_index(key);
        if self.promote_on_find {
            let _guard = self.lock.write();
            let result = unsafe { self.find_locked(bucket, key, true) };
            self.tally(STAT_FIND, result)
        } else {
            let _guard = self.lock.read();
            let result = unsafe { self.find_locked(bucket, key, false) };
            self.tally(STAT_FIND, result)
        }
    }

    unsafe fn find_locked(&self, bucket: usize, key: &[u8], promote: bool) -> Result<Vec<u8>> {
        let space = self.space();
        let node = hashtable::locate(space, bucket, key, &*self.compare).ok_or(CacheError::NotFound)?;
        if promote {
            lrulist::advance(space, node);
        }
        Ok(space.value(node).to_vec())
    }

    /// Store a new entry. Never overwrites: an existing key is
    /// `AlreadyExists`. Least recently used entries are evicted as needed,
    /// each passed to `on_evict` first when one is given.
    ///
    /// `on_evict` runs with the write lock held and must not call back into
    /// the cache.
    pub fn insert(&self, key: &[u8], value: &[u8], on_evict: Option<EvictFn<'_>>) -> Result<()> {
        let bucket = self.bucket_index(key);
        let _guard = self.lock.write();
        let result = unsafe { self.insert_locked(bucket, key, value, on_evict) };
        self.tally(STAT_INSERT, result)
    }

    unsafe fn insert_locked(
        &self,
        bucket: usize,
        key: &[u8],
        value: &[u8],
        on_evict: Option<EvictFn<'_>>,
    ) -> Result<()> {
        let space = self.space();
        if hashtable::locate(space, bucket, key, &*self.compare).is_some() {
            return Err(CacheError::AlreadyExists);
        }

        let node = self.allocate_node(key.len() + value.len(), on_evict)?;
        space.write_entry(node, key, value);
        hashtable::link(space, bucket, node);
        lrulist::push_head(space, node);
        space.header_mut().used_count += 1;
        Ok(())
    }

    /// Get a node for `size` bytes, evicting from the LRU tail until the
    /// allocator can satisfy the request or nothing is left to evict.
    unsafe fn allocate_node(&self, size: usize, mut on_evict: Option<EvictFn<'_>>) -> Result<u64> {
        let space = self.space();
        loop {
            match freearea::allocate(space, size)? {
                Allocation::Node(node) => return Ok(node),
                Allocation::NeedsEviction => {
                    let Some(victim) = lrulist::evict_one(space) else {
                        warn!(requested = size, "cache is empty and still has no room");
                        return Err(CacheError::OutOfSpace { requested: size });
                    };

                    debug!(
                        class = space.node(victim).class,
                        key_len = space.node(victim).key_len,
                        requested = size,
                        "evicting least recently used entry"
                    );
                    if let Some(callback) = on_evict.as_deref_mut() {
                        callback(self.entry(victim));
                    }
                    hashtable::unlink(space, victim);
                    space.header_mut().used_count -= 1;
                    freearea::release(space, victim);
                }
            }
        }
    }

    /// Store `value` under `key` whether or not it exists.
    ///
    /// When the key exists, `update` (if given) sees the stored entry and
    /// rewrites the buffer holding `value`; the result replaces the stored
    /// value in place and must fit the node's slot. When the key is absent
    /// this behaves like `insert`. Returns the value now stored.
    pub fn set(
        &self,
        key: &[u8],
        value: &[u8],
        on_evict: Option<EvictFn<'_>>,
        update: Option<UpdateFn<'_>>,
    ) -> Result<Vec<u8>> {
        let bucket = self.bucket_index(key);
        let _guard = self.lock.write();
        let result = unsafe { self.set_locked(bucket, key, value, on_evict, update) };
        self.tally(STAT_SET, result)
    }

    unsafe fn set_locked(
        &self,
        bucket: usize,
        key: &[u8],
        value: &[u8],
        on_evict: Option<EvictFn<'_>>,
        update: Option<UpdateFn<'_>>,
    ) -> Result<Vec<u8>> {
        let space = self.space();
        let Some(node) = hashtable::locate(space, bucket, key, &*self.compare) else {
            self.insert_locked(bucket, key, value, on_evict)?;
            return Ok(value.to_vec());
        };

        let mut merged = value.to_vec();
        if let Some(update) = update {
            update(self.entry(node), &mut merged);
        }

        let capacity = space.capacity(node);
        let size = space.node(node).key_len as usize + merged.len();
        if size > capacity {
            return Err(CacheError::ValueTooLarge {
                size,
                limit: capacity,
            });
        }

        space.write_value(node, &merged);
        lrulist::advance(space, node);
        Ok(merged)
    }

    /// Overwrite the value of an existing entry. Key and value lengths must
    /// equal the stored ones.
    pub fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let bucket = self.bucket_index(key);
        let _guard = self.lock.write();
        let result = unsafe { self.update_locked(bucket, key, value) };
        self.tally(STAT_UPDATE, result)
    }

    unsafe fn update_locked(&self, bucket: usize, key: &[u8], value: &[u8]) -> Result<()> {
        let space = self.space();
        let node = hashtable::locate(space, bucket, key, &*self.compare).ok_or(CacheError::NotFound)?;

        let n = space.node(node);
        if n.key_len as usize != key.len() || n.value_len as usize != value.len() {
            return Err(CacheError::SizeMismatch {
                stored_key: n.key_len as usize,
                stored_value: n.value_len as usize,
                key: key.len(),
                value: value.len(),
            });
        }

        space.write_value(node, value);
        lrulist::advance(space, node);
        Ok(())
    }

    /// Remove an entry, returning its value. The node goes back to its
    /// size class's free list.
    pub fn erase(&self, key: &[u8]) -> Result<Vec<u8>> {
        let bucket = self.bucket_index(key);
        let _guard = self.lock.write();
        let result = unsafe { self.erase_locked(bucket, key) };
        self.tally(STAT_ERASE, result)
    }

    unsafe fn erase_locked(&self, bucket: usize, key: &[u8]) -> Result<Vec<u8>> {
        let space = self.space();
        let node = hashtable::locate(space, bucket, key, &*self.compare).ok_or(CacheError::NotFound)?;

        let value = space.value(node).to_vec();
        hashtable::unlink(space, node);
        lrulist::remove(space, node);
        space.header_mut().used_count -= 1;
        freearea::release(space, node);
        Ok(value)
    }

    /// Call `visitor` on every entry, bucket by bucket, under the read lock.
    /// Recency is not touched. Returns the number of entries visited.
    ///
    /// `visitor` must not call back into the cache.
    pub fn visit(&self, mut visitor: impl FnMut(Entry<'_>)) -> usize {
        let _guard = self.lock.read();
        let space = self.space();
        let mut visited = 0;
        for bucket in 0..self.hashitem {
            for node in unsafe { hashtable::chain(space, bucket) } {
                visitor(unsafe { self.entry(node) });
                visited += 1;
            }
        }
        unsafe { space.stat(STAT_VISIT) }.fetch_add(1, AtomicOrdering::Relaxed);
        visited
    }

    /// Return every entry to the free lists and zero the counters.
    pub fn clear(&self) {
        let _guard = self.lock.write();
        let space = self.space();
        unsafe {
            let mut cursor = space.header().lru_head;
            while cursor != NIL {
                let next = space.node(cursor).lru_next;
                freearea::release(space, cursor);
                cursor = next;
            }
            hashtable::clear(space);
            lrulist::clear(space);
            let header = space.header_mut();
            header.used_count = 0;
            header.stats = [0; layout::STAT_COUNT];
        }
        debug!(path = ?self.region.path(), "cache cleared");
    }

    /// Number of entries in use.
    pub fn len(&self) -> usize {
        let _guard = self.lock.read();
        unsafe { self.space().header().used_count as usize }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-operation counters. Read without the lock, so concurrent
    /// operations may be partially reflected.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            find: self.op_stats(STAT_FIND),
            update: self.op_stats(STAT_UPDATE),
            set: self.op_stats(STAT_SET),
            insert: self.op_stats(STAT_INSERT),
            erase: self.op_stats(STAT_ERASE),
            visits: unsafe { self.space().stat(STAT_VISIT) }.load(AtomicOrdering::Relaxed),
        }
    }

    /// Occupancy of every size class, smallest first.
    pub fn class_stats(&self) -> Vec<ClassStats> {
        let _guard = self.lock.read();
        let space = self.space();
        unsafe {
            (0..space.header().class_num as usize)
                .map(|index| {
                    let class = space.class(index);
                    ClassStats {
                        capacity: class.capacity as usize,
                        total: class.total_count as usize,
                        free: class.free_count as usize,
                    }
                })
                .collect()
        }
    }

    /// Walk every free list, the LRU list and every bucket chain, checking
    /// that each node is either free or in use (chained and on the LRU
    /// list) and that the counts add up.
    pub fn verify(&self) -> Result<()> {
        let _guard = self.lock.read();
        let space = self.space();
        unsafe { self.verify_locked(space) }
    }

    unsafe fn verify_locked(&self, space: Space<'_>) -> Result<()> {
        let header = space.header();
        let mut free = HashSet::new();
        let mut carved = 0u64;

        for class in 0..header.class_num as usize {
            let sc = space.class(class);
            let mut count = 0u64;
            let mut cursor = sc.free_head;
            while cursor != NIL {
                let node = space.node(cursor);
                if !free.insert(cursor) {
                    return Err(corrupted(format!("free node {cursor} reached twice")));
                }
                if node.state != NODE_FREE || node.class as usize != class {
                    return Err(corrupted(format!(
                        "node {cursor} on free list of class {class} has state {} and class {}",
                        node.state, node.class
                    )));
                }
                count += 1;
                cursor = node.free_next;
            }
            if count != sc.free_count {
                return Err(corrupted(format!(
                    "class {class} counts {} free nodes, its list holds {count}",
                    sc.free_count
                )));
            }
            carved += sc.total_count;
        }

        let mut in_use = HashSet::new();
        let mut prev = NIL;
        let mut cursor = header.lru_head;
        while cursor != NIL {
            let node = space.node(cursor);
            if !in_use.insert(cursor) {
                return Err(corrupted(format!("LRU node {cursor} reached twice")));
            }
            if node.state != NODE_IN_USE || free.contains(&cursor) {
                return Err(corrupted(format!("LRU node {cursor} is not in use")));
            }
            if node.lru_prev != prev {
                return Err(corrupted(format!("LRU node {cursor} has a stale back link")));
            }
            prev = cursor;
            cursor = node.lru_next;
        }
        if header.lru_tail != prev {
            return Err(corrupted("LRU tail does not end the list"));
        }
        if in_use.len() as u64 != header.used_count {
            return Err(corrupted(format!(
                "header counts {} entries, LRU list holds {}",
                header.used_count,
                in_use.len()
            )));
        }

        let mut chained = HashSet::new();
        for bucket in 0..self.hashitem {
            let mut prev = NIL;
            let mut cursor = space.bucket_head(bucket);
            while cursor != NIL {
                let node = space.node(cursor);
                if !chained.insert(cursor) {
                    return Err(corrupted(format!("chained node {cursor} reached twice")));
                }
                if !in_use.contains(&cursor) {
                    return Err(corrupted(format!(
                        "node {cursor} in bucket {bucket} is not on the LRU list"
                    )));
                }
                if node.bucket as usize != bucket || node.bucket_prev != prev {
                    return Err(corrupted(format!("node {cursor} has stale bucket links")));
                }
                if self.bucket_index(space.key(cursor)) != bucket {
                    return Err(corrupted(format!("node {cursor} is in the wrong bucket")));
                }
                prev = cursor;
                cursor = node.bucket_next;
            }
        }
        if chained.len() != in_use.len() {
            return Err(corrupted(format!(
                "{} nodes chained but {} on the LRU list",
                chained.len(),
                in_use.len()
            )));
        }

        if free.len() as u64 + header.used_count != carved {
            return Err(corrupted(format!(
                "{} free + {} in use != {carved} carved",
                free.len(),
                header.used_count
            )));
        }
        Ok(())
    }

    unsafe fn entry(&self, node: u64) -> Entry<'_> {
        let space = self.space();
        let class = space.node(node).class as usize;
        Entry {
            key: space.key(node),
            value: space.value(node),
            size_class: class,
            capacity: space.class(class).capacity as usize,
        }
    }

    fn op_stats(&self, base: usize) -> OpStats {
        let space = self.space();
        unsafe {
            OpStats {
                total: space.stat(base).load(AtomicOrdering::Relaxed),
                success: space.stat(base + 1).load(AtomicOrdering::Relaxed),
                fail: space.stat(base + 2).load(AtomicOrdering::Relaxed),
            }
        }
    }

    /// Count an operation outcome. Called with the lock held.
    fn tally<T>(&self, base: usize, result: Result<T>) -> Result<T> {
        let space = self.space();
        let outcome = if result.is_ok() { base + 1 } else { base + 2 };
        unsafe {
            space.stat(base).fetch_add(1, AtomicOrdering::Relaxed);
            space.stat(outcome).fetch_add(1, AtomicOrdering::Relaxed);
        }
        result
    }
}

fn corrupted(msg: impl Into<String>) -> CacheError {
    CacheError::Corrupted(msg.into())
}

impl Drop for Cache {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(error) = self.shutdown() {
            warn!(%error, "flushing cache on drop failed");
        }
    }
}

// Cache is Send+Sync because every access to the region goes through the lock.
unsafe impl Send for Cache {}
unsafe impl Sync for Cache {}
