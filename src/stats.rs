/// Counters for one operation kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpStats {
    pub total: u64,
    pub success: u64,
    pub fail: u64,
}

/// Snapshot of the per-operation counters kept in the region header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub find: OpStats,
    pub update: OpStats,
    pub set: OpStats,
    pub insert: OpStats,
    pub erase: OpStats,
    pub visits: u64,
}

/// Occupancy of one size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassStats {
    /// Bytes of key plus value a node of this class holds.
    pub capacity: usize,
    /// Nodes carved for this class so far.
    pub total: usize,
    /// Nodes of this class on the free list.
    pub free: usize,
}
