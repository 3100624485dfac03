/// Global LRU list over every in-use node.
///
/// Intrusive doubly-linked list using the `lru_prev/lru_next` offsets in
/// each node header. Head is the most recently used node, tail the next
/// eviction victim.
use super::layout::{Space, NIL};

/// Put `node` at the head of the list. `node` must not be on the list.
///
/// # Safety
/// Caller must hold the write lock.
pub unsafe fn push_head(space: Space, node: u64) {
    let head = space.header().lru_head;

    let n = space.node_mut(node);
    n.lru_prev = NIL;
    n.lru_next = head;

    if head != NIL {
        space.node_mut(head).lru_prev = node;
    } else {
        space.header_mut().lru_tail = node;
    }
    space.header_mut().lru_head = node;
}

/// Unlink `node` from wherever it sits in the list.
///
/// # Safety
/// Caller must hold the write lock; `node` must be on the list.
pub unsafe fn remove(space: Space, node: u64) {
    let n = space.node(node);
    let (prev, next) = (n.lru_prev, n.lru_next);

    if prev != NIL {
        space.node_mut(prev).lru_next = next;
    } else {
        space.header_mut().lru_head = next;
    }

    if next != NIL {
        space.node_mut(next).lru_prev = prev;
    } else {
        space.header_mut().lru_tail = prev;
    }

    let n = space.node_mut(node);
    n.lru_prev = NIL;
    n.lru_next = NIL;
}

/// Mark `node` most recently used.
///
/// # Safety
/// Caller must hold the write lock; `node` must be on the list.
pub unsafe fn advance(space: Space, node: u64) {
    if space.header().lru_head == node {
        return;
    }
    remove(space, node);
    push_head(space, node);
}

/// Detach and return the least recently used node, or `None` when the
/// list is empty. The node stays in its bucket; the caller unlinks it.
///
/// # Safety
/// Caller must hold the write lock.
pub unsafe fn evict_one(space: Space) -> Option<u64> {
    let tail = space.header().lru_tail;
    if tail == NIL {
        return None;
    }
    remove(space, tail);
    Some(tail)
}

/// Forget every member without touching the nodes.
///
/// # Safety
/// Caller must hold the write lock.
pub unsafe fn clear(space: Space) {
    let header = space.header_mut();
    header.lru_head = NIL;
    header.lru_tail = NIL;
}
