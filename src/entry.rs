/// Read-only view of a cached node, handed to eviction, update and visit
/// callbacks. Borrows the region; copy out anything that must outlive the
/// callback.
#[derive(Debug, Clone, Copy)]
pub struct Entry<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
    /// Size class the node's slot belongs to.
    pub size_class: usize,
    /// Bytes of key plus value the slot can hold.
    pub capacity: usize,
}
