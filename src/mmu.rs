//! Byte-addressable guest memory with per-byte permission tags and a
//! dirty-block bitmap that makes snapshot reset cheap.
//!
//! Guest memory layout (grows with the guest, never relocates):
//!
//! ```text
//! [ loaded ELF program headers ] [ guest stack, 1 MiB ] [ heap, bump-allocated ]
//! ```
use bitflags::bitflags;

use crate::error::MmuError;

/// Bytes per dirty-tracking block.
pub const DIRTY_BLOCK_SIZE: usize = 64;

bitflags! {
    /// Per-byte guest memory permission flags.
    pub struct Perm: u8 {
        /// The byte may be fetched and executed as an instruction.
        const EXEC = 1 << 0;
        /// The byte may be written.
        const WRITE = 1 << 1;
        /// The byte may be read.
        const READ = 1 << 2;
        /// The byte has been allocated but not yet written; reading it is a fault.
        const RAW = 1 << 3;
    }
}

/// Tracks which 64-byte blocks of guest memory have been written since the
/// last reset, both as an order-preserving, duplicate-free sequence (walked
/// at reset time) and as a bitmap (consulted to keep the sequence
/// duplicate-free in O(1)).
#[derive(Debug, Clone)]
struct DirtyState {
    /// Indices of dirtied blocks, in first-dirtied order. No duplicates.
    blocks: Vec<usize>,
    /// One bit per block, packed 64 per word. Bit set iff the block index is
    /// present in `blocks`.
    bitmap: Vec<u64>,
}

impl DirtyState {
    fn new(num_blocks: usize) -> Self {
        let bitmap_words = (num_blocks + 63) / 64;
        Self {
            blocks: Vec::with_capacity(num_blocks),
            bitmap: vec![0u64; bitmap_words],
        }
    }

    #[inline]
    fn is_dirty(&self, block: usize) -> bool {
        let word = block / 64;
        let bit = block % 64;
        (self.bitmap[word] & (1u64 << bit)) != 0
    }

    #[inline]
    fn mark_dirty(&mut self, block: usize) {
        if !self.is_dirty(block) {
            let word = block / 64;
            let bit = block % 64;
            self.bitmap[word] |= 1u64 << bit;
            self.blocks.push(block);
        }
    }

    fn clear(&mut self) {
        for &block in &self.blocks {
            self.bitmap[block / 64] = 0;
        }
        self.blocks.clear();
    }
}

/// The guest's flat, byte-permissioned address space.
#[derive(Debug, Clone)]
pub struct Mmu {
    memory: Vec<u8>,
    permissions: Vec<u8>,
    /// Bump-pointer allocator cursor; the virtual address of the next
    /// allocation.
    curr_alloc_adr: u64,
    dirty: DirtyState,
}

impl Mmu {
    /// Creates a guest address space of `memory_size` bytes, with the
    /// allocator cursor starting at `base_alloc_adr` (just past wherever the
    /// caller has already reserved memory, e.g. the ELF image and stack).
    pub fn new(memory_size: usize, base_alloc_adr: u64) -> Self {
        let num_blocks = (memory_size + DIRTY_BLOCK_SIZE - 1) / DIRTY_BLOCK_SIZE;
        Self {
            memory: vec![0u8; memory_size],
            permissions: vec![0u8; memory_size],
            curr_alloc_adr: base_alloc_adr,
            dirty: DirtyState::new(num_blocks),
        }
    }

    /// Total size of guest memory in bytes.
    #[inline]
    pub fn memory_size(&self) -> usize {
        self.memory.len()
    }

    /// Current bump-pointer allocation cursor.
    #[inline]
    pub fn curr_alloc_adr(&self) -> u64 {
        self.curr_alloc_adr
    }

    /// Directly sets the allocation cursor. Used by the ELF loader to
    /// reserve space for loaded segments before the first `allocate` call.
    pub fn set_curr_alloc_adr(&mut self, adr: u64) {
        self.curr_alloc_adr = adr;
    }

    #[inline]
    fn block_of(addr: u64) -> usize {
        (addr / DIRTY_BLOCK_SIZE as u64) as usize
    }

    fn mark_range_dirty(&mut self, addr: u64, len: usize) {
        if len == 0 {
            return;
        }
        let start_block = Self::block_of(addr);
        let end_block = Self::block_of(addr + len as u64 - 1);
        for block in start_block..=end_block {
            self.dirty.mark_dirty(block);
        }
    }

    /// Bumps the allocation cursor by `size` bytes, rounded up to a 16-byte
    /// alignment, and returns the guest address of the allocation. Freshly
    /// allocated bytes are tagged `WRITE | RAW` (not yet readable).
    pub fn allocate(&mut self, size: usize) -> Result<u64, MmuError> {
        let aligned_size = (size + 0xf) & !0xf;

        if self.curr_alloc_adr as usize >= self.memory.len() {
            return Err(MmuError::MemFull);
        }
        if self.curr_alloc_adr as usize + aligned_size > self.memory.len() {
            return Err(MmuError::WouldOverrun);
        }

        let base = self.curr_alloc_adr;
        self.curr_alloc_adr += aligned_size as u64;
        self.set_permissions(base, Perm::WRITE | Perm::RAW, aligned_size)?;

        Ok(base)
    }

    /// Overwrites the permission bytes of `[addr, addr+len)` with `perm`.
    pub fn set_permissions(&mut self, addr: u64, perm: Perm, len: usize) -> Result<(), MmuError> {
        let end = addr
            .checked_add(len as u64)
            .ok_or(MmuError::OutOfRange)?;
        if end as usize > self.permissions.len() {
            return Err(MmuError::OutOfRange);
        }
        let start = addr as usize;
        self.permissions[start..end as usize].fill(perm.bits());
        Ok(())
    }

    /// Writes `src` into guest memory at `addr`. Requires `WRITE` set on
    /// every destination byte. Clears `RAW` and sets `READ` across the
    /// written range if any byte carried `RAW`. Marks overlapping dirty
    /// blocks. Fails without modifying any byte if the range is out of
    /// bounds or any byte lacks `WRITE`.
    pub fn write(&mut self, addr: u64, src: &[u8]) -> Result<(), MmuError> {
        let len = src.len();
        if len == 0 {
            return Ok(());
        }
        let end = addr.checked_add(len as u64).ok_or(MmuError::OutOfRange)?;
        if end as usize > self.memory.len() {
            return Err(MmuError::OutOfRange);
        }

        let start = addr as usize;
        let mut has_raw = false;
        for (i, &perm) in self.permissions[start..end as usize].iter().enumerate() {
            let perm = Perm::from_bits_truncate(perm);
            if perm.contains(Perm::RAW) {
                has_raw = true;
            }
            if !perm.contains(Perm::WRITE) {
                return Err(MmuError::NoPerm {
                    address: addr + i as u64,
                });
            }
        }

        self.memory[start..end as usize].copy_from_slice(src);
        self.mark_range_dirty(addr, len);

        if has_raw {
            for perm in &mut self.permissions[start..end as usize] {
                let mut p = Perm::from_bits_truncate(*perm);
                p.remove(Perm::RAW);
                p.insert(Perm::READ);
                *perm = p.bits();
            }
        }

        Ok(())
    }

    /// Reads `len` bytes from guest memory at `addr` into `dst`. Requires
    /// `READ` set on every source byte. Does not alter permissions or dirty
    /// state.
    pub fn read(&self, dst: &mut [u8], addr: u64, len: usize) -> Result<(), MmuError> {
        if len == 0 {
            return Ok(());
        }
        let end = addr.checked_add(len as u64).ok_or(MmuError::OutOfRange)?;
        if end as usize > self.memory.len() {
            return Err(MmuError::OutOfRange);
        }

        let start = addr as usize;
        for (i, &perm) in self.permissions[start..end as usize].iter().enumerate() {
            if !Perm::from_bits_truncate(perm).contains(Perm::READ) {
                return Err(MmuError::NoPerm {
                    address: addr + i as u64,
                });
            }
        }

        dst[..len].copy_from_slice(&self.memory[start..end as usize]);
        Ok(())
    }

    /// Fetches `len` bytes at `addr` for instruction decode. Requires `EXEC`
    /// set on every byte; fetching never touches dirty state.
    pub fn fetch(&self, addr: u64, len: usize) -> Result<&[u8], MmuError> {
        let end = addr.checked_add(len as u64).ok_or(MmuError::OutOfRange)?;
        if end as usize > self.memory.len() {
            return Err(MmuError::OutOfRange);
        }
        let start = addr as usize;
        for (i, &perm) in self.permissions[start..end as usize].iter().enumerate() {
            if !Perm::from_bits_truncate(perm).contains(Perm::EXEC) {
                return Err(MmuError::NoPerm {
                    address: addr + i as u64,
                });
            }
        }
        Ok(&self.memory[start..end as usize])
    }

    /// Raw permission byte at `addr`, for instruction fetch's EXEC check.
    #[inline]
    pub fn permission_at(&self, addr: u64) -> Option<Perm> {
        self.permissions
            .get(addr as usize)
            .map(|&p| Perm::from_bits_truncate(p))
    }

    /// Copies out the raw permission bytes of `[addr, addr+len)`. Used by
    /// the snapshot engine to save/restore permissions around fuzz
    /// injection (spec.md §4.7 step 7) without disturbing dirty tracking.
    pub fn permission_bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        let start = addr as usize;
        self.permissions[start..start + len].to_vec()
    }

    /// Overwrites the raw permission bytes of `[addr, addr+bytes.len())`
    /// with `bytes`, without touching dirty state (the companion `write`
    /// call that preceded this already marked the range dirty).
    pub fn set_permission_bytes(&mut self, addr: u64, bytes: &[u8]) {
        let start = addr as usize;
        self.permissions[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Linear scan for `needle` at the given access width (1/2/4/8 bytes,
    /// little-endian), returning all matching guest addresses. Debug-only
    /// per the spec; exposed unconditionally since its cost is only paid
    /// when called.
    pub fn search(&self, needle: u64, width: usize) -> Vec<u64> {
        assert!(matches!(width, 1 | 2 | 4 | 8), "invalid search width");
        let mut hits = Vec::new();
        let mut i = 0usize;
        while i + width <= self.memory.len() {
            let mut buf = [0u8; 8];
            buf[..width].copy_from_slice(&self.memory[i..i + width]);
            let value = u64::from_le_bytes(buf) & mask_for_width(width);
            if value == needle & mask_for_width(width) {
                hits.push(i as u64);
            }
            i += width;
        }
        hits
    }

    /// Restores every byte and permission that has been dirtied since the
    /// last reset from `src`, then clears the dirty set and restores the
    /// allocation cursor. Cost is proportional to the worker's working set,
    /// not to total guest memory size.
    pub fn reset(&mut self, src: &Mmu) {
        debug_assert_eq!(self.memory.len(), src.memory.len(), "reset source size mismatch");

        for &block in &self.dirty.blocks {
            let block_adr = block * DIRTY_BLOCK_SIZE;
            let block_end = (block_adr + DIRTY_BLOCK_SIZE).min(self.memory.len());
            self.memory[block_adr..block_end].copy_from_slice(&src.memory[block_adr..block_end]);
            self.permissions[block_adr..block_end]
                .copy_from_slice(&src.permissions[block_adr..block_end]);
        }
        self.dirty.clear();
        self.curr_alloc_adr = src.curr_alloc_adr;
    }
}

fn mask_for_width(width: usize) -> u64 {
    match width {
        1 => 0xff,
        2 => 0xffff,
        4 => 0xffff_ffff,
        8 => u64::MAX,
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_of_allocate_is_observable() {
        let mut mmu = Mmu::new(4096, 0);
        let a = mmu.allocate(1).unwrap();
        let b = mmu.allocate(1).unwrap();
        let c = mmu.allocate(1).unwrap();
        assert_eq!(b - a, 16);
        assert_eq!(c - b, 16);
    }

    #[test]
    fn allocate_would_overrun_leaves_cursor_unchanged() {
        let mut mmu = Mmu::new(32, 0);
        let before = mmu.curr_alloc_adr();
        let err = mmu.allocate(64).unwrap_err();
        assert_eq!(err, MmuError::WouldOverrun);
        assert_eq!(mmu.curr_alloc_adr(), before);
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut mmu = Mmu::new(4096, 0);
        let addr = mmu.allocate(8).unwrap();
        mmu.write(addr, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let mut out = [0u8; 8];
        mmu.read(&mut out, addr, 8).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn write_out_of_range_fails_and_does_not_modify() {
        let mut mmu = Mmu::new(16, 0);
        mmu.set_permissions(0, Perm::all(), 16).unwrap();
        let snapshot = mmu.memory.clone();
        let err = mmu.write(10, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap_err();
        assert_eq!(err, MmuError::OutOfRange);
        assert_eq!(mmu.memory, snapshot);
    }

    #[test]
    fn write_to_last_byte_inclusive_is_legal() {
        let mut mmu = Mmu::new(16, 0);
        mmu.set_permissions(0, Perm::all(), 16).unwrap();
        mmu.write(15, &[0x42]).unwrap();
        let mut out = [0u8; 1];
        mmu.read(&mut out, 15, 1).unwrap();
        assert_eq!(out, [0x42]);
    }

    #[test]
    fn read_of_uninitialized_memory_faults() {
        let mut mmu = Mmu::new(4096, 0);
        let addr = mmu.allocate(8).unwrap();
        let mut out = [0u8; 4];
        let err = mmu.read(&mut out, addr, 4).unwrap_err();
        assert!(matches!(err, MmuError::NoPerm { .. }));
    }

    #[test]
    fn write_clears_raw_and_sets_read() {
        let mut mmu = Mmu::new(4096, 0);
        let addr = mmu.allocate(8).unwrap();
        mmu.write(addr, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let perm = mmu.permission_at(addr).unwrap();
        assert!(perm.contains(Perm::READ));
        assert!(!perm.contains(Perm::RAW));
    }

    #[test]
    fn reset_restores_dirtied_bytes_and_perms() {
        let snapshot = Mmu::new(4096, 0);
        let mut worker = snapshot.clone();
        worker.set_permissions(100, Perm::READ | Perm::WRITE, 32).unwrap();
        worker.write(100, &[0xaa; 17]).unwrap();

        worker.reset(&snapshot);

        assert_eq!(worker.memory, snapshot.memory);
        assert_eq!(worker.permissions, snapshot.permissions);
        assert!(worker.dirty.blocks.is_empty());
    }

    #[test]
    fn dirty_block_at_last_block_resets_correctly() {
        let size = 256;
        let snapshot = Mmu::new(size, 0);
        let mut worker = snapshot.clone();
        let last_block_start = (size - DIRTY_BLOCK_SIZE) as u64;
        worker
            .set_permissions(last_block_start, Perm::READ | Perm::WRITE, DIRTY_BLOCK_SIZE)
            .unwrap();
        worker.write(last_block_start, &[0xff; DIRTY_BLOCK_SIZE]).unwrap();

        worker.reset(&snapshot);

        assert_eq!(worker.memory, snapshot.memory);
        assert_eq!(worker.permissions, snapshot.permissions);
    }

    #[test]
    fn fetch_without_exec_perm_faults() {
        let mut mmu = Mmu::new(16, 0);
        mmu.set_permissions(0, Perm::READ | Perm::WRITE, 16).unwrap();
        let err = mmu.fetch(0, 4).unwrap_err();
        assert!(matches!(err, MmuError::NoPerm { .. }));
    }

    #[test]
    fn fetch_with_exec_perm_returns_bytes() {
        let mut mmu = Mmu::new(16, 0);
        mmu.set_permissions(0, Perm::EXEC | Perm::WRITE, 16).unwrap();
        mmu.write(0, &[0x13, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(mmu.fetch(0, 4).unwrap(), &[0x13, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn set_permissions_out_of_range() {
        let mut mmu = Mmu::new(16, 0);
        let err = mmu.set_permissions(10, Perm::READ, 16).unwrap_err();
        assert_eq!(err, MmuError::OutOfRange);
    }

    proptest::proptest! {
        /// spec.md §8's round-trip law: writing `k` bytes at an allocated
        /// address and reading them back always yields the same bytes.
        #[test]
        fn write_then_read_round_trips_for_arbitrary_bytes(bytes in proptest::collection::vec(0u8..=255, 1..=256)) {
            let mut mmu = Mmu::new(1 << 16, 0);
            let addr = mmu.allocate(bytes.len()).unwrap();
            mmu.write(addr, &bytes).unwrap();

            let mut out = vec![0u8; bytes.len()];
            mmu.read(&mut out, addr, bytes.len()).unwrap();
            proptest::prop_assert_eq!(out, bytes);
        }

        /// A dirty block's contents always match the snapshot's after reset,
        /// regardless of how many scattered writes preceded it.
        #[test]
        fn reset_always_converges_to_snapshot(
            writes in proptest::collection::vec((0u16..4096, proptest::collection::vec(0u8..=255, 1..=32)), 1..16)
        ) {
            let snapshot = Mmu::new(8192, 0);
            let mut worker = snapshot.clone();
            for (offset, bytes) in &writes {
                let addr = *offset as u64;
                if worker.set_permissions(addr, Perm::READ | Perm::WRITE, bytes.len()).is_ok() {
                    let _ = worker.write(addr, bytes);
                }
            }

            worker.reset(&snapshot);

            proptest::prop_assert_eq!(&worker.memory, &snapshot.memory);
            proptest::prop_assert_eq!(&worker.permissions, &snapshot.permissions);
            proptest::prop_assert!(worker.dirty.blocks.is_empty());
        }
    }
}
