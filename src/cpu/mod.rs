//! The RV64I interpreter: register file, fetch/decode/execute loop, and the
//! snapshot/reset/fork operations the fuzzing engine drives workers with.
use std::sync::Arc;

use crate::coverage::CoverageMap;
use crate::mmu::{Mmu, Perm};
use crate::stats::Stats;

pub mod decode;
pub mod registers;

use decode::{decode, Instruction, Width};
use registers::Registers;

/// Why a guest run stopped. `NoExit` only ever escapes [`Cpu::run_until`];
/// [`Cpu::run`] always returns one of the other variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Execution reached the requested breakpoint address without faulting.
    NoExit,
    /// The guest issued `ecall` with an `a7` this shim does not implement.
    SyscallUnsupported,
    /// The guest called `fstat` on a file descriptor other than 0/1/2.
    FstatBadFd,
    /// A load faulted: missing `READ` permission.
    SegfaultRead,
    /// A store faulted: missing `WRITE` permission.
    SegfaultWrite,
    /// The fetched word did not decode to a supported instruction, or fetch
    /// itself faulted on missing `EXEC` permission.
    InvalidOpcode,
    /// The guest exited cleanly via `ecall`/`exit` (`a7 == 93`).
    Graceful,
    /// The run exceeded its configured instruction budget.
    Timeout,
}

/// One RV64I hart: registers plus the guest address space it executes
/// against. `run`/`run_until` are the only entry points that execute guest
/// code; everything else is bookkeeping around them.
#[derive(Clone)]
pub struct Cpu {
    regs: Registers,
    mmu: Mmu,
    coverage: Arc<CoverageMap>,
    /// Set by `on_branch` whenever the just-taken branch is new process-wide
    /// coverage. The engine reads and clears this after each run to decide
    /// whether to promote the input into the corpus.
    new_coverage: bool,
}

impl Cpu {
    /// Builds a hart over `mmu`, sharing `coverage` with every other worker.
    pub fn new(mmu: Mmu, coverage: Arc<CoverageMap>) -> Self {
        Self {
            regs: Registers::new(),
            mmu,
            coverage,
            new_coverage: false,
        }
    }

    /// The guest register file.
    pub fn registers(&self) -> &Registers {
        &self.regs
    }

    /// The guest register file, mutably (used by the ELF loader and stack
    /// builder during setup).
    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.regs
    }

    /// The guest address space.
    pub fn mmu(&self) -> &Mmu {
        &self.mmu
    }

    /// The guest address space, mutably.
    pub fn mmu_mut(&mut self) -> &mut Mmu {
        &mut self.mmu
    }

    /// Value of register `reg` (0..=31 GPRs, 32 for `pc`).
    pub fn get_reg(&self, reg: u8) -> u64 {
        self.regs.get(reg)
    }

    /// Overwrites register `reg`.
    pub fn set_reg(&mut self, reg: u8, value: u64) {
        self.regs.set(reg, value);
    }

    /// Current program counter.
    pub fn get_pc(&self) -> u64 {
        self.regs.pc()
    }

    /// Overwrites the program counter.
    pub fn set_pc(&mut self, value: u64) {
        self.regs.set_pc(value);
    }

    /// Current stack pointer.
    pub fn get_sp(&self) -> u64 {
        self.regs.sp()
    }

    /// Overwrites the stack pointer.
    pub fn set_sp(&mut self, value: u64) {
        self.regs.set_sp(value);
    }

    /// Whether the most recently completed run observed at least one
    /// process-wide-new coverage edge. Consumed (and reset) by the caller.
    pub fn take_new_coverage(&mut self) -> bool {
        std::mem::take(&mut self.new_coverage)
    }

    /// Pushes `value` onto the guest stack, decrementing `sp` by 8 first.
    /// Used by the initial stack builder; guest code moves its own `sp`
    /// during normal execution.
    pub fn stack_push(&mut self, value: u64) -> Result<(), crate::error::MmuError> {
        let sp = self.regs.sp() - 8;
        self.regs.set_sp(sp);
        self.mmu.write(sp, &value.to_le_bytes())
    }

    /// Lays out the initial guest stack exactly as spec'd: each argv string
    /// gets its own dedicated 4 KiB guest page (mirrors `ARG_MAX` in
    /// `original_source`'s `riscv_build_stack`), then the stack itself holds,
    /// from top to bottom, a zero auxv terminator, a zero envp terminator, a
    /// zero argv terminator, the argv pointers high-to-low, and finally
    /// `argc`.
    pub fn build_stack(&mut self, argv: &[String]) -> Result<(), crate::error::MmuError> {
        const ARG_PAGE_SIZE: usize = 4096;

        let mut argv_ptrs = Vec::with_capacity(argv.len());
        for arg in argv {
            let bytes = arg.as_bytes();
            let arg_adr = self.mmu.allocate(ARG_PAGE_SIZE)?;
            self.mmu.set_permissions(arg_adr, Perm::READ | Perm::WRITE, ARG_PAGE_SIZE)?;
            self.mmu.write(arg_adr, bytes)?;
            argv_ptrs.push(arg_adr);
        }

        // AT_NULL auxv terminator.
        self.stack_push(0)?;
        // envp terminator: no environment variables.
        self.stack_push(0)?;
        // argv terminator.
        self.stack_push(0)?;

        for &ptr in argv_ptrs.iter().rev() {
            self.stack_push(ptr)?;
        }
        self.stack_push(argv.len() as u64)?;

        Ok(())
    }

    /// Re-zeroes `x0` and fetches, decodes, and executes exactly one
    /// instruction. Returns `Some(reason)` if this instruction ended the
    /// run; `None` to keep going.
    fn execute(&mut self, stats: &mut Stats) -> Option<ExitReason> {
        self.regs.zero_x0();
        stats.executed_instructions += 1;

        let pc = self.regs.pc();
        let word = match self.mmu.fetch(pc, 4) {
            Ok(bytes) => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            Err(_) => return Some(ExitReason::InvalidOpcode),
        };

        let instr = match decode(word) {
            Ok(instr) => instr,
            Err(_) => return Some(ExitReason::InvalidOpcode),
        };

        let mut next_pc = pc.wrapping_add(4);
        let mut exit = None;

        match instr {
            Instruction::Lui { rd, imm } => self.regs.set(rd, imm as i64 as u64),
            Instruction::Auipc { rd, imm } => {
                self.regs.set(rd, pc.wrapping_add(imm as i64 as u64))
            }
            Instruction::Jal { rd, imm } => {
                self.regs.set(rd, next_pc);
                next_pc = pc.wrapping_add(imm as i64 as u64);
            }
            Instruction::Jalr { rd, rs1, imm } => {
                let target = (self.regs.get(rs1).wrapping_add(imm as i64 as u64)) & !1u64;
                self.regs.set(rd, next_pc);
                next_pc = target;
            }
            Instruction::Branch { funct3, rs1, rs2, imm } => {
                let a = self.regs.get(rs1);
                let b = self.regs.get(rs2);
                let taken = match funct3 {
                    0 => a == b,                           // BEQ
                    1 => a != b,                           // BNE
                    4 => (a as i64) < (b as i64),           // BLT
                    5 => (a as i64) >= (b as i64),          // BGE
                    6 => a < b,                             // BLTU
                    7 => a >= b,                            // BGEU
                    _ => unreachable!("decode rejects other funct3 values"),
                };
                if taken {
                    let target = pc.wrapping_add(imm as i64 as u64);
                    if self.coverage.on_branch(pc, target) {
                        self.new_coverage = true;
                    }
                    next_pc = target;
                }
            }
            Instruction::Load { width, signed, rd, rs1, imm } => {
                let addr = self.regs.get(rs1).wrapping_add(imm as i64 as u64);
                match self.load(addr, width, signed) {
                    Ok(value) => self.regs.set(rd, value),
                    Err(_) => exit = Some(ExitReason::SegfaultRead),
                }
            }
            Instruction::Store { width, rs1, rs2, imm } => {
                let addr = self.regs.get(rs1).wrapping_add(imm as i64 as u64);
                let value = self.regs.get(rs2);
                if self.store(addr, width, value).is_err() {
                    exit = Some(ExitReason::SegfaultWrite);
                }
            }
            Instruction::OpImm { funct3, rd, rs1, imm } => {
                let a = self.regs.get(rs1);
                let imm64 = imm as i64 as u64;
                let value = match funct3 {
                    0 => a.wrapping_add(imm64),             // ADDI
                    2 => ((a as i64) < (imm as i64)) as u64, // SLTI
                    3 => (a < imm64) as u64,                 // SLTIU
                    4 => a ^ imm64,                          // XORI
                    6 => a | imm64,                          // ORI
                    7 => a & imm64,                          // ANDI
                    _ => unreachable!("decode rejects other funct3 values"),
                };
                self.regs.set(rd, value);
            }
            Instruction::Shift { right, arithmetic, rd, rs1, shamt } => {
                let a = self.regs.get(rs1);
                let value = if !right {
                    a << shamt
                } else if arithmetic {
                    ((a as i64) >> shamt) as u64
                } else {
                    a >> shamt
                };
                self.regs.set(rd, value);
            }
            Instruction::Op { funct3, funct7, rd, rs1, rs2 } => {
                let a = self.regs.get(rs1);
                let b = self.regs.get(rs2);
                let value = match (funct3, funct7) {
                    (0, 0) => a.wrapping_add(b),             // ADD
                    (0, 32) => a.wrapping_sub(b),            // SUB
                    (1, 0) => a << (b & 0x3f),                // SLL
                    (2, 0) => ((a as i64) < (b as i64)) as u64, // SLT
                    (3, 0) => (a < b) as u64,                 // SLTU
                    (4, 0) => a ^ b,                          // XOR
                    (5, 0) => a >> (b & 0x3f),                 // SRL
                    (5, 32) => ((a as i64) >> (b & 0x3f)) as u64, // SRA
                    (6, 0) => a | b,                          // OR
                    (7, 0) => a & b,                          // AND
                    _ => unreachable!("decode rejects other funct3/funct7 combinations"),
                };
                self.regs.set(rd, value);
            }
            Instruction::OpImm32 { rd, rs1, imm, .. } => {
                let a = self.regs.get(rs1) as u32;
                let value = a.wrapping_add(imm as u32) as i32 as i64 as u64;
                self.regs.set(rd, value);
            }
            Instruction::Shift32 { right, arithmetic, rd, rs1, shamt } => {
                let a = self.regs.get(rs1) as u32;
                let value = if !right {
                    (a << shamt) as i32 as i64 as u64
                } else if arithmetic {
                    ((a as i32) >> shamt) as i64 as u64
                } else {
                    (a >> shamt) as i32 as i64 as u64
                };
                self.regs.set(rd, value);
            }
            Instruction::Op32 { funct3, funct7, rd, rs1, rs2 } => {
                let a = self.regs.get(rs1) as u32;
                let b = self.regs.get(rs2) as u32;
                let value = match (funct3, funct7) {
                    (0, 0) => a.wrapping_add(b) as i32 as i64 as u64,
                    (0, 32) => a.wrapping_sub(b) as i32 as i64 as u64,
                    (1, 0) => (a << (b & 0x1f)) as i32 as i64 as u64,
                    (5, 0) => (a >> (b & 0x1f)) as i32 as i64 as u64,
                    (5, 32) => ((a as i32) >> (b & 0x1f)) as i64 as u64,
                    _ => unreachable!("decode rejects other funct3/funct7 combinations"),
                };
                self.regs.set(rd, value);
            }
            Instruction::Ecall => match crate::syscall::handle_ecall(self) {
                Some(reason) => exit = Some(reason),
                None => {}
            },
            Instruction::Ebreak => exit = Some(ExitReason::InvalidOpcode),
            Instruction::Fence => exit = Some(ExitReason::InvalidOpcode),
        }

        if exit.is_none() {
            self.regs.set_pc(next_pc);
        }
        exit
    }

    fn load(&self, addr: u64, width: Width, signed: bool) -> Result<u64, crate::error::MmuError> {
        let len = width_bytes(width);
        let mut buf = [0u8; 8];
        self.mmu.read(&mut buf[..len], addr, len)?;
        let raw = u64::from_le_bytes(buf);
        Ok(if signed {
            sign_extend(raw, len)
        } else {
            raw
        })
    }

    fn store(&mut self, addr: u64, width: Width, value: u64) -> Result<(), crate::error::MmuError> {
        let len = width_bytes(width);
        self.mmu.write(addr, &value.to_le_bytes()[..len])
    }

    /// Runs until a run-ending condition is reached or `max_instructions`
    /// instructions have retired, whichever comes first.
    pub fn run(&mut self, stats: &mut Stats, max_instructions: u64) -> ExitReason {
        let start = stats.executed_instructions;
        loop {
            if stats.executed_instructions - start >= max_instructions {
                return ExitReason::Timeout;
            }
            if let Some(reason) = self.execute(stats) {
                return reason;
            }
        }
    }

    /// Runs until `pc == break_adr` (returning [`ExitReason::NoExit`]) or a
    /// fault/syscall/timeout ends the run first. Used once, at startup, to
    /// drive the snapshot hart from the ELF entry point to the address the
    /// fuzzing loop should reset back to on every iteration.
    pub fn run_until(&mut self, stats: &mut Stats, break_adr: u64, max_instructions: u64) -> ExitReason {
        let start = stats.executed_instructions;
        loop {
            if self.regs.pc() == break_adr {
                return ExitReason::NoExit;
            }
            if stats.executed_instructions - start >= max_instructions {
                return ExitReason::Timeout;
            }
            if let Some(reason) = self.execute(stats) {
                return reason;
            }
        }
    }

    /// Resets this hart's registers and dirtied memory back to `src`, ready
    /// for the next fuzzing iteration. Cheaper than [`Cpu::fork`] since it
    /// reuses this hart's own backing memory.
    pub fn reset(&mut self, src: &Cpu) {
        self.regs = src.regs;
        self.mmu.reset(&src.mmu);
        self.new_coverage = false;
    }

    /// Deep-clones this hart (registers and full guest memory) to hand to a
    /// new worker thread. Called once per worker at startup; every
    /// subsequent iteration uses the cheaper [`Cpu::reset`].
    pub fn fork(&self) -> Cpu {
        self.clone()
    }
}

#[inline]
fn width_bytes(width: Width) -> usize {
    match width {
        Width::Byte => 1,
        Width::Half => 2,
        Width::Word => 4,
        Width::Double => 8,
    }
}

#[inline]
fn sign_extend(value: u64, len: usize) -> u64 {
    let shift = (8 - len) * 8;
    ((value << shift) as i64 >> shift) as u64
}
