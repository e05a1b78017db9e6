//! snapfuzz-rv64i is a snapshot-based, coverage-guided fuzzer built around a
//! software RV64I emulator. A target ELF binary is run up to a chosen guest
//! program counter and the resulting CPU state captured as a snapshot; each
//! worker thread then repeatedly forks that snapshot, mutates and injects an
//! input from the corpus, runs to an exit condition, and resets, recording
//! new control-flow edges into a shared coverage map as it goes.

pub mod config;
pub mod corpus;
pub mod coverage;
pub mod cpu;
pub mod elf;
pub mod engine;
pub mod error;
pub mod mmu;
pub mod stats;
pub mod syscall;

pub use config::Config;
pub use corpus::Corpus;
pub use coverage::CoverageMap;
pub use cpu::{Cpu, ExitReason};
pub use engine::{EngineConfig, SnapshotEngine};
pub use error::FuzzError;
pub use mmu::{Mmu, Perm};
pub use stats::{GlobalStats, Reporter, Stats};
