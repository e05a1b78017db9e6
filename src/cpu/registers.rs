//! The RV64I guest register file: 32 general-purpose registers plus the
//! program counter, packed into a single 33-word array (mirrors how
//! `hy_rs::arch::x86_64::Register` names a fixed host register set).
use num_derive::FromPrimitive;

/// Index of the zero register, hardwired to zero.
pub const ZERO: u8 = 0;
/// Index of the stack pointer register.
pub const SP: u8 = 2;
/// Index of the frame pointer register.
pub const FP: u8 = 8;
/// Index of the syscall-number register (`a7`).
pub const A7: u8 = 17;
/// Index of the program counter "register" within [`Registers`].
pub const PC: u8 = 32;

/// The 32 general-purpose RV64I registers, using their ABI names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum RiscvReg {
    Zero = 0,
    Ra,
    Sp,
    Gp,
    Tp,
    T0,
    T1,
    T2,
    Fp,
    S1,
    A0,
    A1,
    A2,
    A3,
    A4,
    A5,
    A6,
    A7,
    S2,
    S3,
    S4,
    S5,
    S6,
    S7,
    S8,
    S9,
    S10,
    S11,
    T3,
    T4,
    T5,
    T6,
}

/// The guest register file: 32 GPRs (`x0..x31`) plus the program counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registers(pub [u64; 33]);

impl Registers {
    /// All registers zeroed.
    pub fn new() -> Self {
        Self([0u64; 33])
    }

    /// Reads register `reg` (0..=31 for GPRs, 32 for PC).
    #[inline]
    pub fn get(&self, reg: u8) -> u64 {
        self.0[reg as usize]
    }

    /// Writes register `reg`. Writes to `x0` are silently discarded by the
    /// caller re-zeroing it at the top of every dispatch cycle, so this
    /// function need not special-case it.
    #[inline]
    pub fn set(&mut self, reg: u8, value: u64) {
        self.0[reg as usize] = value;
    }

    /// Current program counter.
    #[inline]
    pub fn pc(&self) -> u64 {
        self.0[PC as usize]
    }

    /// Overwrites the program counter.
    #[inline]
    pub fn set_pc(&mut self, value: u64) {
        self.0[PC as usize] = value;
    }

    /// Current stack pointer (`x2`).
    #[inline]
    pub fn sp(&self) -> u64 {
        self.0[SP as usize]
    }

    /// Overwrites the stack pointer (`x2`).
    #[inline]
    pub fn set_sp(&mut self, value: u64) {
        self.0[SP as usize] = value;
    }

    /// Re-zeroes `x0`. Called at the top of every fetch/decode/execute
    /// cycle so instruction handlers never need to special-case writes to
    /// the zero register.
    #[inline]
    pub fn zero_x0(&mut self) {
        self.0[ZERO as usize] = 0;
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x0_reads_as_zero_regardless_of_writes() {
        let mut regs = Registers::new();
        regs.set(ZERO, 0xdead_beef);
        regs.zero_x0();
        assert_eq!(regs.get(ZERO), 0);
    }
}
