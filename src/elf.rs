//! Target ELF loading, via the `object` crate rather than a hand-rolled
//! parser (`original_source`'s `elf_loader.c`): `object::File` handles
//! 32/64-bit and endianness transparently, and its `segments()` iterator
//! already filters to `PT_LOAD` entries, which is all this loader needs.
use std::path::Path;

use object::{Object, ObjectSegment, SegmentFlags};

use crate::cpu::Cpu;
use crate::error::ElfError;
use crate::mmu::Perm;

const PAGE_SIZE: u64 = 0x1000;

/// What the loader learned about the target binary.
#[derive(Debug, Clone, Copy)]
pub struct Elf {
    /// The guest address execution should begin at.
    pub entry_point: u64,
}

/// Reads `path`, materializes every loadable segment into `cpu`'s guest
/// memory with the segment's ELF permissions, advances the bump allocator
/// past the highest segment, and points the guest PC at the entry point.
pub fn load(path: &Path, cpu: &mut Cpu) -> Result<Elf, ElfError> {
    let bytes = std::fs::read(path).map_err(ElfError::Io)?;
    let file = object::File::parse(&*bytes)?;

    if file.format() != object::BinaryFormat::Elf {
        return Err(ElfError::Unsupported(format!(
            "{:?} is not an ELF binary",
            file.format()
        )));
    }

    let entry_point = file.entry();
    let memory_size = cpu.mmu().memory_size() as u64;
    let mut max_end = 0u64;

    for segment in file.segments() {
        let vaddr = segment.address();
        let mem_size = segment.size();
        if mem_size == 0 {
            continue;
        }

        let end = vaddr
            .checked_add(mem_size)
            .ok_or(ElfError::SegmentTooLarge { address: vaddr, size: mem_size })?;
        if end > memory_size {
            return Err(ElfError::SegmentTooLarge { address: vaddr, size: mem_size });
        }

        let file_bytes = segment.data().map_err(ElfError::Parse)?;

        // Segments may be writable only transiently during load, so grant
        // WRITE unconditionally first and narrow to the ELF's declared
        // flags afterward.
        cpu.mmu_mut().set_permissions(vaddr, Perm::WRITE, mem_size as usize)?;
        cpu.mmu_mut().write(vaddr, file_bytes)?;
        if (mem_size as usize) > file_bytes.len() {
            let pad_len = mem_size as usize - file_bytes.len();
            cpu.mmu_mut().write(vaddr + file_bytes.len() as u64, &vec![0u8; pad_len])?;
        }

        let p_flags = match segment.flags() {
            SegmentFlags::Elf { p_flags } => p_flags,
            _ => 0,
        };
        // PF_X=1, PF_W=2, PF_R=4 line up bit-for-bit with EXEC/WRITE/READ.
        let perm = Perm::from_bits_truncate(p_flags as u8 & Perm::all().bits());
        cpu.mmu_mut().set_permissions(vaddr, perm, mem_size as usize)?;

        let page_end = (end + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        max_end = max_end.max(page_end);
    }

    if max_end > cpu.mmu().curr_alloc_adr() {
        cpu.mmu_mut().set_curr_alloc_adr(max_end);
    }

    cpu.set_pc(entry_point);

    Ok(Elf { entry_point })
}
