//! The guest `ecall` shim: a small, fixed set of Linux RV64 syscall numbers,
//! ported from `original_source`'s `syscall_riscv.c`. Fatal misuse that the
//! C source `abort()`s on (an unsupported `close` fd, a negative `brk`
//! delta) is converted to a recoverable [`ExitReason`] here instead, per
//! spec.md §9.
use crate::cpu::{Cpu, ExitReason};
use crate::cpu::registers::{A7, RiscvReg};
use crate::mmu::Perm;

const SYS_CLOSE: u64 = 57;
const SYS_WRITE: u64 = 64;
const SYS_FSTAT: u64 = 80;
const SYS_EXIT: u64 = 93;
const SYS_BRK: u64 = 214;

/// Byte size of the Linux kernel's 64-bit `struct stat` (with padding),
/// as laid out in `syscall_riscv.c`'s `kernel_stat`.
const KERNEL_STAT_SIZE: usize = 128;

/// The fixed-size Linux `struct stat` layout this shim fills in. Field
/// ordering and widths mirror the kernel's 64-bit `stat` ABI; only the
/// fields `original_source` ever populates are non-zero. Serialized by hand
/// (rather than a `#[repr(C)]` transmute) since struct padding bytes are not
/// guaranteed initialized by a struct literal.
#[derive(Default, Clone, Copy)]
struct KernelStat {
    st_dev: u64,
    st_ino: u64,
    st_mode: u32,
    st_nlink: u32,
    st_uid: u32,
    st_gid: u32,
    st_rdev: u64,
    st_size: i64,
    st_blksize: i32,
    st_blocks: i64,
}

impl KernelStat {
    fn to_bytes(self) -> [u8; KERNEL_STAT_SIZE] {
        let mut buf = [0u8; KERNEL_STAT_SIZE];
        buf[0..8].copy_from_slice(&self.st_dev.to_le_bytes());
        buf[8..16].copy_from_slice(&self.st_ino.to_le_bytes());
        buf[16..20].copy_from_slice(&self.st_mode.to_le_bytes());
        buf[20..24].copy_from_slice(&self.st_nlink.to_le_bytes());
        buf[24..28].copy_from_slice(&self.st_uid.to_le_bytes());
        buf[28..32].copy_from_slice(&self.st_gid.to_le_bytes());
        buf[32..40].copy_from_slice(&self.st_rdev.to_le_bytes());
        // bytes 40..48: __pad1, left zero.
        buf[48..56].copy_from_slice(&self.st_size.to_le_bytes());
        buf[56..60].copy_from_slice(&self.st_blksize.to_le_bytes());
        // bytes 60..64: __pad2, left zero.
        buf[64..72].copy_from_slice(&self.st_blocks.to_le_bytes());
        // bytes 72..128: atime/mtime/ctime and glibc-reserved, left zero.
        buf
    }

    /// Magic values taken verbatim from `syscall_riscv.c`'s `kernel_stat`
    /// literals, themselves captured from running `fstat` on the host.
    fn for_fd(fd: u64) -> Option<Self> {
        let (st_ino, st_rdev) = match fd {
            0 => (0x6, 0x8803),
            1 => (0xe, 0x880b),
            2 => (0xf, 0x880c),
            _ => return None,
        };
        Some(Self {
            st_dev: 0x17,
            st_ino,
            st_mode: 0x2190,
            st_nlink: 1,
            st_uid: 0x3e8,
            st_gid: 0x5,
            st_rdev,
            st_blksize: 1024,
            ..Default::default()
        })
    }
}

/// Services the `ecall` the interpreter just decoded. Returns `Some(reason)`
/// if the syscall ends the run (unsupported number, bad fd, graceful exit,
/// or a guest memory fault encountered while servicing it); `None` to keep
/// running. The caller (`Cpu::execute`) advances PC by 4 iff this returns
/// `None`, per spec.md §9's "PC is advanced iff exit reason remains NoExit"
/// clarification.
pub fn handle_ecall(cpu: &mut Cpu) -> Option<ExitReason> {
    let num = cpu.get_reg(A7);

    match num {
        SYS_CLOSE => {
            let fd = cpu.get_reg(RiscvReg::A0 as u8);
            if fd > 2 {
                // original_source aborts the whole process here; the spec
                // converts fatal misuse into a recoverable exit reason.
                return Some(ExitReason::SyscallUnsupported);
            }
            cpu.set_reg(RiscvReg::A0 as u8, 0);
            None
        }
        SYS_WRITE => {
            let fd = cpu.get_reg(RiscvReg::A0 as u8);
            let buf_adr = cpu.get_reg(RiscvReg::A1 as u8);
            let len = cpu.get_reg(RiscvReg::A2 as u8);

            if fd != 1 && fd != 2 {
                return Some(ExitReason::SyscallUnsupported);
            }

            let mut buf = vec![0u8; len as usize];
            if cpu.mmu().read(&mut buf, buf_adr, len as usize).is_err() {
                return Some(ExitReason::SegfaultRead);
            }
            tracing::debug!(fd, len, "guest write");
            cpu.set_reg(RiscvReg::A0 as u8, len);
            None
        }
        SYS_FSTAT => {
            let fd = cpu.get_reg(RiscvReg::A0 as u8);
            let statbuf_adr = cpu.get_reg(RiscvReg::A1 as u8);

            let stat = match KernelStat::for_fd(fd) {
                Some(stat) => stat,
                None => return Some(ExitReason::FstatBadFd),
            };

            if cpu.mmu_mut().write(statbuf_adr, &stat.to_bytes()).is_err() {
                return Some(ExitReason::SegfaultWrite);
            }
            cpu.set_reg(RiscvReg::A0 as u8, 0);
            None
        }
        SYS_EXIT => Some(ExitReason::Graceful),
        SYS_BRK => {
            let requested = cpu.get_reg(RiscvReg::A0 as u8);
            if requested == 0 {
                cpu.set_reg(RiscvReg::A0 as u8, cpu.mmu().curr_alloc_adr());
                return None;
            }

            let delta = requested as i64 - cpu.mmu().curr_alloc_adr() as i64;
            if delta < 0 {
                // No support for freeing memory; original_source aborts.
                return Some(ExitReason::SyscallUnsupported);
            }

            match cpu.mmu_mut().allocate(delta as usize) {
                Ok(base) => {
                    let new_end = base + delta as u64;
                    cpu.mmu_mut()
                        .set_permissions(base, Perm::READ | Perm::WRITE, delta as usize)
                        .expect("just-allocated range is in bounds");
                    cpu.set_reg(RiscvReg::A0 as u8, new_end);
                    None
                }
                Err(_) => Some(ExitReason::SyscallUnsupported),
            }
        }
        _ => Some(ExitReason::SyscallUnsupported),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::CoverageMap;
    use crate::mmu::Mmu;
    use std::sync::Arc;

    fn cpu_for_syscalls() -> Cpu {
        let mut mmu = Mmu::new(1 << 16, 4096);
        mmu.set_permissions(0, Perm::EXEC, 4096).unwrap();
        Cpu::new(mmu, Arc::new(CoverageMap::new(16)))
    }

    #[test]
    fn close_on_std_fds_succeeds() {
        let mut cpu = cpu_for_syscalls();
        cpu.set_reg(A7, SYS_CLOSE);
        cpu.set_reg(RiscvReg::A0 as u8, 1);
        assert_eq!(handle_ecall(&mut cpu), None);
        assert_eq!(cpu.get_reg(RiscvReg::A0 as u8), 0);
    }

    #[test]
    fn close_on_other_fd_is_unsupported() {
        let mut cpu = cpu_for_syscalls();
        cpu.set_reg(A7, SYS_CLOSE);
        cpu.set_reg(RiscvReg::A0 as u8, 5);
        assert_eq!(handle_ecall(&mut cpu), Some(ExitReason::SyscallUnsupported));
    }

    #[test]
    fn fstat_bad_fd_sets_exit_reason() {
        let mut cpu = cpu_for_syscalls();
        cpu.set_reg(A7, SYS_FSTAT);
        cpu.set_reg(RiscvReg::A0 as u8, 99);
        assert_eq!(handle_ecall(&mut cpu), Some(ExitReason::FstatBadFd));
    }

    #[test]
    fn fstat_stdout_writes_statbuf_and_returns_zero() {
        let mut cpu = cpu_for_syscalls();
        let statbuf = cpu.mmu_mut().allocate(256).unwrap();
        cpu.mmu_mut()
            .set_permissions(statbuf, Perm::READ | Perm::WRITE, 256)
            .unwrap();
        cpu.set_reg(A7, SYS_FSTAT);
        cpu.set_reg(RiscvReg::A0 as u8, 1);
        cpu.set_reg(RiscvReg::A1 as u8, statbuf);
        assert_eq!(handle_ecall(&mut cpu), None);
        assert_eq!(cpu.get_reg(RiscvReg::A0 as u8), 0);
    }

    #[test]
    fn exit_syscall_is_graceful() {
        let mut cpu = cpu_for_syscalls();
        cpu.set_reg(A7, SYS_EXIT);
        assert_eq!(handle_ecall(&mut cpu), Some(ExitReason::Graceful));
    }

    #[test]
    fn brk_zero_returns_current_cursor() {
        let mut cpu = cpu_for_syscalls();
        let before = cpu.mmu().curr_alloc_adr();
        cpu.set_reg(A7, SYS_BRK);
        cpu.set_reg(RiscvReg::A0 as u8, 0);
        assert_eq!(handle_ecall(&mut cpu), None);
        assert_eq!(cpu.get_reg(RiscvReg::A0 as u8), before);
    }

    #[test]
    fn brk_round_trip_grows_heap_and_is_readable_writable() {
        let mut cpu = cpu_for_syscalls();
        let p = cpu.mmu().curr_alloc_adr();
        cpu.set_reg(A7, SYS_BRK);
        cpu.set_reg(RiscvReg::A0 as u8, p + 4096);
        assert_eq!(handle_ecall(&mut cpu), None);
        assert_eq!(cpu.get_reg(RiscvReg::A0 as u8), p + 4096);

        cpu.mmu_mut().write(p, &[0x42]).unwrap();
        let mut out = [0u8; 1];
        cpu.mmu().read(&mut out, p, 1).unwrap();
        assert_eq!(out, [0x42]);
    }

    #[test]
    fn brk_negative_delta_is_unsupported() {
        let mut cpu = cpu_for_syscalls();
        let p = cpu.mmu().curr_alloc_adr();
        cpu.set_reg(A7, SYS_BRK);
        cpu.set_reg(RiscvReg::A0 as u8, p.saturating_sub(16));
        assert_eq!(handle_ecall(&mut cpu), Some(ExitReason::SyscallUnsupported));
    }

    #[test]
    fn unknown_syscall_is_unsupported() {
        let mut cpu = cpu_for_syscalls();
        cpu.set_reg(A7, 9999);
        assert_eq!(handle_ecall(&mut cpu), Some(ExitReason::SyscallUnsupported));
    }
}
