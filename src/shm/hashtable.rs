/// Bucket chains over raw region memory.
///
/// Each bucket head points at a doubly-linked chain threaded through
/// `NodeHeader::bucket_prev/bucket_next`. This module never hashes: the
/// engine hands it a bucket index.
use std::cmp::Ordering;

use super::layout::{Space, NIL};

/// Find the node in `bucket` whose key compares equal to `key`.
///
/// # Safety
/// Caller must hold the engine lock and `bucket` must be in range.
pub unsafe fn locate(
    space: Space,
    bucket: usize,
    key: &[u8],
    compare: &dyn Fn(&[u8], &[u8]) -> Ordering,
) -> Option<u64> {
    let mut cursor = space.bucket_head(bucket);
    while cursor != NIL {
        if compare(space.key(cursor), key) == Ordering::Equal {
            return Some(cursor);
        }
        cursor = space.node(cursor).bucket_next;
    }
    None
}

/// Push `node` onto the head of `bucket`'s chain.
///
/// # Safety
/// Caller must hold the write lock; `node` must not be in any chain.
pub unsafe fn link(space: Space, bucket: usize, node: u64) {
    let head = space.bucket_head(bucket);

    let n = space.node_mut(node);
    n.bucket = bucket as u32;
    n.bucket_prev = NIL;
    n.bucket_next = head;

    if head != NIL {
        space.node_mut(head).bucket_prev = node;
    }
    space.set_bucket_head(bucket, node);
}

/// Remove `node` from the chain it is on.
///
/// # Safety
/// Caller must hold the write lock; `node` must be linked.
pub unsafe fn unlink(space: Space, node: u64) {
    let n = space.node(node);
    let (prev, next, bucket) = (n.bucket_prev, n.bucket_next, n.bucket as usize);

    if prev != NIL {
        space.node_mut(prev).bucket_next = next;
    } else {
        space.set_bucket_head(bucket, next);
    }

    if next != NIL {
        space.node_mut(next).bucket_prev = prev;
    }

    let n = space.node_mut(node);
    n.bucket_prev = NIL;
    n.bucket_next = NIL;
}

/// Collect the nodes of one chain, head first.
///
/// # Safety
/// Caller must hold the engine lock.
pub unsafe fn chain(space: Space, bucket: usize) -> Vec<u64> {
    let mut nodes = Vec::new();
    let mut cursor = space.bucket_head(bucket);
    while cursor != NIL {
        nodes.push(cursor);
        cursor = space.node(cursor).bucket_next;
    }
    nodes
}

/// Empty every bucket.
///
/// # Safety
/// Caller must hold the write lock.
pub unsafe fn clear(space: Space) {
    let hashitem = space.header().hashitem as usize;
    for bucket in 0..hashitem {
        space.set_bucket_head(bucket, NIL);
    }
}
