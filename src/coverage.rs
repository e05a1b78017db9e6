//! At-most-once branch-edge coverage recorder: a fixed-size hash table of
//! CAS-updated flags, shared lock-free across every fuzzing worker.
use std::sync::atomic::{AtomicU8, Ordering};

const NOT_COVERED: u8 = 0;
const COVERED: u8 = 1;

/// A fixed-size coverage map. An edge `(from, to)` is hashed with
/// MurmurHash3 (32-bit, seed 0) into a cell index; the cell is upgraded from
/// 0 to 1 at most once, across the entire process lifetime.
#[derive(Debug)]
pub struct CoverageMap {
    hashes: Vec<AtomicU8>,
}

impl CoverageMap {
    /// Creates a coverage map with `capacity` cells. `capacity` should be a
    /// power of two; the spec's source used 1024, which collides badly on
    /// any realistic target, so callers should prefer tens of thousands.
    pub fn new(capacity: usize) -> Self {
        let mut hashes = Vec::with_capacity(capacity);
        hashes.resize_with(capacity, || AtomicU8::new(NOT_COVERED));
        Self { hashes }
    }

    /// Records that the edge `from -> to` was taken. Returns `true` iff this
    /// call is the first to observe this edge anywhere in the process.
    pub fn on_branch(&self, from: u64, to: u64) -> bool {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&from.to_le_bytes());
        key[8..].copy_from_slice(&to.to_le_bytes());
        let hash = murmur3_32(&key, 0) as usize % self.hashes.len();

        self.hashes[hash]
            .compare_exchange(NOT_COVERED, COVERED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Number of cells in the map.
    pub fn capacity(&self) -> usize {
        self.hashes.len()
    }
}

/// MurmurHash3 x86_32, seeded. Ported directly from the reference algorithm;
/// used here purely as a non-cryptographic mixing function for coverage
/// bucketing, so it is implemented inline rather than pulled in as a
/// dependency for a couple dozen lines of bit-twiddling.
fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e2d51;
    const C2: u32 = 0x1b873593;

    let mut hash = seed;
    let chunks = data.chunks_exact(4);
    let remainder = chunks.remainder();

    for chunk in chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);

        hash ^= k;
        hash = hash.rotate_left(13);
        hash = hash.wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    let mut k = 0u32;
    for (i, &byte) in remainder.iter().enumerate().rev() {
        k ^= (byte as u32) << (8 * i);
    }
    if !remainder.is_empty() {
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        hash ^= k;
    }

    hash ^= data.len() as u32;
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85ebca6b);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xc2b2ae35);
    hash ^= hash >> 16;

    hash
}
