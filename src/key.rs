use std::cmp::Ordering;
use std::hash::BuildHasher;

use ahash::RandomState;

/// Fixed seeds so every process attached to a region picks the same bucket
/// for a key.
const SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

/// Key comparator: returns `Equal` when two stored keys name the same entry.
pub type Comparator = Box<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

/// Byte-wise comparison over the common prefix, shorter key first on a tie.
#[inline]
pub fn default_compare(a: &[u8], b: &[u8]) -> Ordering {
    let len = a.len().min(b.len());
    match a[..len].cmp(&b[..len]) {
        Ordering::Equal => a.len().cmp(&b.len()),
        other => other,
    }
}

/// Stable 64-bit hash of a key.
#[inline]
pub fn hash_key(key: &[u8]) -> u64 {
    let state = RandomState::with_seeds(SEEDS[0], SEEDS[1], SEEDS[2], SEEDS[3]);
    BuildHasher::hash_one(&state, key)
}

/// Bucket a key falls into in a table of `hashitem` buckets.
#[inline]
pub fn bucket_index(key: &[u8], hashitem: usize) -> usize {
    (hash_key(key) % hashitem as u64) as usize
}
