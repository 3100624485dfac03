/// Size-classed free-area allocator.
///
/// Every size class owns a singly-linked free list threaded through
/// `NodeHeader::free_next`. Nodes are carved once from the node area and
/// never change class; there is no splitting or coalescing, so a request
/// can fail while other classes still hold free bytes.
use tracing::debug;

use super::layout::{NodeHeader, Space, NIL, NODE_FREE, NODE_IN_USE};
use crate::error::{CacheError, Result};

/// Outcome of an allocation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    Node(u64),
    /// The fitting class has no free node and the node area is used up.
    /// The engine must evict before asking again.
    NeedsEviction,
}

/// Carve `prealloc_num` nodes into every class of a freshly formatted region.
///
/// # Safety
/// Caller must own the region exclusively.
pub unsafe fn format(space: Space, prealloc_num: usize) {
    let class_num = space.header().class_num as usize;
    for class in 0..class_num {
        for _ in 0..prealloc_num {
            if !carve(space, class) {
                // Config validation guarantees the preallocation fits.
                debug_assert!(false, "node area too small for preallocation");
                return;
            }
        }
    }
}

/// Index of the smallest class whose capacity holds `size` bytes.
///
/// # Safety
/// Caller must hold the engine lock.
pub unsafe fn class_for(space: Space, size: usize) -> Result<usize> {
    let header = space.header();
    let class_num = header.class_num as usize;
    let max_size = header.max_size as usize;
    if size > max_size {
        return Err(CacheError::ValueTooLarge {
            size,
            limit: max_size,
        });
    }

    let (mut lo, mut hi) = (0, class_num);
    while lo < hi {
        let mid = (lo + hi) / 2;
        if (space.class(mid).capacity as usize) < size {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

/// Hand out a node able to hold `size` bytes of key plus value.
///
/// Tries the free list of the smallest fitting class, then a fresh slot
/// carved for that class. Free nodes of other classes are never borrowed.
///
/// # Safety
/// Caller must hold the write lock.
pub unsafe fn allocate(space: Space, size: usize) -> Result<Allocation> {
    let class = class_for(space, size)?;

    if let Some(node) = pop(space, class) {
        return Ok(Allocation::Node(node));
    }

    if carve(space, class) {
        debug!(
            class,
            capacity = space.class(class).capacity,
            freesize = space.header().freesize,
            "carved node from free area"
        );
        if let Some(node) = pop(space, class) {
            return Ok(Allocation::Node(node));
        }
    }

    Ok(Allocation::NeedsEviction)
}

/// Clear a node and push it onto the head of its class's free list.
///
/// The node must already be unlinked from its bucket and the LRU list.
///
/// # Safety
/// Caller must hold the write lock.
pub unsafe fn release(space: Space, node: u64) {
    space.clear_data(node);

    let class = space.node(node).class as usize;
    let free_head = space.class(class).free_head;

    let n = space.node_mut(node);
    n.state = NODE_FREE;
    n.bucket_prev = NIL;
    n.bucket_next = NIL;
    n.lru_prev = NIL;
    n.lru_next = NIL;
    n.bucket = 0;
    n.free_next = free_head;

    let c = space.class_mut(class);
    c.free_head = node;
    c.free_count += 1;
}

/// Pop the head of a class's free list and mark it in use.
unsafe fn pop(space: Space, class: usize) -> Option<u64> {
    let node = space.class(class).free_head;
    if node == NIL {
        return None;
    }

    let next = space.node(node).free_next;
    let c = space.class_mut(class);
    c.free_head = next;
    c.free_count -= 1;

    let n = space.node_mut(node);
    n.free_next = NIL;
    n.state = NODE_IN_USE;
    Some(node)
}

/// Carve one slot for `class` out of the uncarved node area and push it
/// onto that class's free list. Returns `false` when there is no room.
unsafe fn carve(space: Space, class: usize) -> bool {
    let slot_size = space.class(class).slot_size as u64;
    let header = space.header();
    if header.freesize < slot_size {
        return false;
    }

    let node = header.start_free;
    let header = space.header_mut();
    header.start_free += slot_size;
    header.freesize -= slot_size;

    std::ptr::write_bytes(space.node_mut(node) as *mut NodeHeader, 0, 1);
    let n = space.node_mut(node);
    n.class = class as u32;
    n.state = NODE_FREE;
    n.free_next = space.class(class).free_head;

    let c = space.class_mut(class);
    c.free_head = node;
    c.free_count += 1;
    c.total_count += 1;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::shm::layout;
    use crate::shm::region::Region;

    /// Classes 16/32/48/64, `prealloc` nodes each, plus `spare` uncarved bytes.
    fn region(prealloc: usize, spare: usize) -> Region {
        let mut cfg = CacheConfig {
            min_size: 16,
            max_size: 64,
            align_size: 16,
            hashitem: 4,
            prealloc_num: prealloc,
            ..CacheConfig::default()
        };
        cfg.datasize = cfg.prealloc_bytes() + spare;
        Region::heap(&cfg).unwrap()
    }

    fn node_of(alloc: Allocation) -> u64 {
        match alloc {
            Allocation::Node(node) => node,
            Allocation::NeedsEviction => panic!("expected a node"),
        }
    }

    #[test]
    fn picks_smallest_fitting_class() {
        let region = region(1, 0);
        let space = region.space();
        unsafe {
            assert_eq!(class_for(space, 0).unwrap(), 0);
            assert_eq!(class_for(space, 16).unwrap(), 0);
            assert_eq!(class_for(space, 17).unwrap(), 1);
            assert_eq!(class_for(space, 48).unwrap(), 2);
            assert_eq!(class_for(space, 64).unwrap(), 3);
            assert!(matches!(
                class_for(space, 65),
                Err(CacheError::ValueTooLarge { size: 65, limit: 64 })
            ));
        }
    }

    #[test]
    fn exhausted_class_asks_for_eviction_even_with_larger_nodes_free() {
        let region = region(1, 0);
        let space = region.space();
        unsafe {
            let first = node_of(allocate(space, 10).unwrap());
            assert_eq!(space.node(first).class, 0);
            assert_eq!(space.node(first).state, NODE_IN_USE);
            assert_eq!(space.class(0).free_count, 0);

            assert_eq!(allocate(space, 10).unwrap(), Allocation::NeedsEviction);
            for class in 1..4 {
                assert_eq!(space.class(class).free_count, 1);
            }

            let big = node_of(allocate(space, 40).unwrap());
            assert_eq!(space.node(big).class, 2);
            assert_eq!(allocate(space, 40).unwrap(), Allocation::NeedsEviction);
        }
    }

    #[test]
    fn carves_from_spare_space_before_asking_for_eviction() {
        let region = region(0, layout::slot_size(32));
        let space = region.space();
        unsafe {
            let node = node_of(allocate(space, 20).unwrap());
            assert_eq!(space.node(node).class, 1);
            assert_eq!(space.class(1).total_count, 1);
            assert_eq!(space.header().freesize, 0);

            assert_eq!(allocate(space, 20).unwrap(), Allocation::NeedsEviction);
        }
    }

    #[test]
    fn release_pushes_back_to_own_class() {
        let region = region(2, 0);
        let space = region.space();
        unsafe {
            let node = node_of(allocate(space, 30).unwrap());
            space.write_entry(node, b"key", b"value");
            assert_eq!(space.class(1).free_count, 1);

            release(space, node);
            assert_eq!(space.class(1).free_count, 2);
            assert_eq!(space.class(1).free_head, node);
            assert_eq!(space.node(node).state, NODE_FREE);
            assert!(space.key(node).is_empty());

            // Freed node is reused first.
            assert_eq!(node_of(allocate(space, 30).unwrap()), node);
        }
    }
}
