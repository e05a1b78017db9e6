//! One [`SnapshotEngine`] per fuzzing worker: owns a private `Cpu`, picks
//! and mutates inputs from the shared corpus, injects them into guest
//! memory, runs to an exit condition, writes crashes, promotes
//! newly-covering inputs, and resets. Ported from `original_source`'s
//! `snapshot_engine.c`, restructured as an owned-state object instead of a
//! struct of function pointers (spec.md §9).
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::corpus::Corpus;
use crate::cpu::{Cpu, ExitReason};
use crate::error::EngineError;
use crate::mmu::Perm;
use crate::stats::Stats;

/// Immutable, shared configuration every worker's engine is built from.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Guest address of the fuzz injection buffer.
    pub fuzz_buf_adr: u64,
    /// Maximum length, in bytes, injected per run.
    pub fuzz_buf_size: usize,
    /// Directory crashing inputs are written to.
    pub crash_dir: PathBuf,
    /// Per-run guest instruction budget.
    pub max_instructions_per_run: u64,
    /// Dump guest registers to the log whenever a run crashes.
    pub dump_regs_on_crash: bool,
}

/// One worker's private fuzzing loop state.
pub struct SnapshotEngine {
    cpu: Cpu,
    snapshot: Arc<Cpu>,
    corpus: Arc<Corpus>,
    config: Arc<EngineConfig>,
    rng: SmallRng,
    stats: Stats,
    owner: std::thread::ThreadId,
}

impl SnapshotEngine {
    /// Forks `snapshot` into a new private `Cpu` for this worker.
    pub fn new(snapshot: Arc<Cpu>, corpus: Arc<Corpus>, config: Arc<EngineConfig>, seed: u64) -> Self {
        Self {
            cpu: snapshot.fork(),
            snapshot,
            corpus,
            config,
            rng: SmallRng::seed_from_u64(seed),
            stats: Stats::default(),
            owner: std::thread::current().id(),
        }
    }

    /// This worker's accumulated stats.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Runs one fuzzing iteration: pick, mutate, inject, run, (maybe) write
    /// a crash, (maybe) promote into the corpus, reset. Mirrors
    /// `snapshot_engine_fuzz` plus the surrounding reset step from
    /// `fuzzer_fuzz_input`.
    pub fn iterate(&mut self) -> Result<ExitReason, EngineError> {
        #[cfg(debug_assertions)]
        assert_eq!(
            std::thread::current().id(),
            self.owner,
            "SnapshotEngine accessed from a foreign thread"
        );

        if self.corpus.is_empty() {
            return Err(EngineError::EmptyCorpus);
        }

        let idx = self.rng.gen_range(0..self.corpus.len());
        let chosen = self
            .corpus
            .get(idx)
            .expect("index chosen from corpus.len() must be in bounds");

        let effective_len = chosen.len().min(self.config.fuzz_buf_size);
        if effective_len == 0 {
            return Err(EngineError::EmptyEffectiveInput);
        }

        let mut private_copy: Vec<u8> = chosen[..effective_len].to_vec();
        self.mutate(&mut private_copy);
        self.inject(&private_copy);

        let reason = self.cpu.run(&mut self.stats, self.config.max_instructions_per_run);
        self.stats.record_exit(reason);

        if is_crash(reason) {
            if self.config.dump_regs_on_crash {
                tracing::warn!(?reason, pc = self.cpu.get_pc(), regs = ?self.cpu.registers(), "guest crash");
            }
            self.write_crash(reason, &private_copy)?;
        }

        if self.cpu.take_new_coverage() {
            let _ = self.corpus.add(Arc::from(private_copy.into_boxed_slice()));
        }

        self.cpu.reset(&self.snapshot);
        self.stats.resets += 1;

        Ok(reason)
    }

    /// Performs `nb ∈ [1, len]` independent random byte overwrites, per
    /// spec.md §4.7 step 6 (a deliberately simple "bit-flip-style" mutator;
    /// the interface permits swapping in something smarter).
    fn mutate(&mut self, buf: &mut [u8]) {
        let len = buf.len();
        let nb = self.rng.gen_range(1..=len);
        for _ in 0..nb {
            let idx = self.rng.gen_range(0..len);
            buf[idx] = self.rng.gen();
        }
    }

    /// Writes `data` into the fuzz buffer, temporarily granting `WRITE` and
    /// restoring the saved permission bytes afterward. The intervening
    /// `write` call marks the range's blocks dirty, which is what makes the
    /// subsequent reset restore the injection site (spec.md §4.7 step 7).
    fn inject(&mut self, data: &[u8]) {
        let addr = self.config.fuzz_buf_adr;
        let saved_perms = self.cpu.mmu().permission_bytes(addr, data.len());

        self.cpu
            .mmu_mut()
            .set_permissions(addr, Perm::WRITE, data.len())
            .expect("fuzz buffer address range is configured to be in-bounds");
        self.cpu
            .mmu_mut()
            .write(addr, data)
            .expect("fuzz buffer was just granted WRITE");
        self.cpu.mmu_mut().set_permission_bytes(addr, &saved_perms);
    }

    fn write_crash(&self, reason: ExitReason, data: &[u8]) -> Result<(), EngineError> {
        let category = match reason {
            ExitReason::SegfaultRead => "segfault-read",
            ExitReason::SegfaultWrite => "segfault-write",
            ExitReason::InvalidOpcode => "invalid-opcode",
            _ => return Ok(()),
        };

        let now = chrono::Local::now();
        let filename = format!(
            "{category}-{}:{}.crash",
            now.format("%Y-%m-%d-%H:%M:%S"),
            now.timestamp_subsec_nanos(),
        );
        std::fs::write(self.config.crash_dir.join(filename), data)?;
        Ok(())
    }
}

fn is_crash(reason: ExitReason) -> bool {
    matches!(
        reason,
        ExitReason::SegfaultRead | ExitReason::SegfaultWrite | ExitReason::InvalidOpcode
    )
}

/// A spawned worker thread plus the handle the reporter polls for stats.
pub struct Worker {
    handle: JoinHandle<()>,
    /// This worker's most recently published stats snapshot.
    pub published: Arc<Mutex<Stats>>,
}

impl Worker {
    /// Blocks until the worker thread exits (only happens after shutdown is
    /// signaled).
    pub fn join(self) -> std::thread::Result<()> {
        self.handle.join()
    }
}

/// Spawns `num_workers` OS threads, each running its own `SnapshotEngine` in
/// a tight loop until `shutdown` is set. Matches spec.md §5's scheduling
/// model: one thread per worker, no inter-worker coordination beyond the
/// shared coverage map and corpus mutex.
pub fn spawn_workers(
    num_workers: usize,
    snapshot: Arc<Cpu>,
    corpus: Arc<Corpus>,
    config: Arc<EngineConfig>,
    shutdown: Arc<AtomicBool>,
) -> Vec<Worker> {
    (0..num_workers)
        .map(|id| {
            let snapshot = Arc::clone(&snapshot);
            let corpus = Arc::clone(&corpus);
            let config = Arc::clone(&config);
            let shutdown = Arc::clone(&shutdown);
            let published = Arc::new(Mutex::new(Stats::default()));
            let published_handle = Arc::clone(&published);

            let handle = std::thread::Builder::new()
                .name(format!("snapfuzz-worker-{id}"))
                .spawn(move || {
                    let mut engine = SnapshotEngine::new(snapshot, corpus, config, id as u64);
                    while !shutdown.load(Ordering::Relaxed) {
                        match engine.iterate() {
                            Ok(_) => {}
                            Err(EngineError::EmptyCorpus) | Err(EngineError::EmptyEffectiveInput) => {
                                tracing::warn!(worker = id, "nothing to fuzz yet, idling");
                                std::thread::sleep(std::time::Duration::from_millis(50));
                            }
                            Err(err) => {
                                tracing::error!(worker = id, error = %err, "engine error, stopping worker");
                                break;
                            }
                        }
                        *published_handle.lock().expect("published stats mutex poisoned") =
                            *engine.stats();
                    }
                })
                .expect("failed to spawn worker thread");

            Worker { handle, published }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::CoverageMap;
    use crate::mmu::Mmu;

    const FUZZ_BUF_ADR: u64 = 0x3000;

    fn encode_i(opcode: u32, funct3: u32, rd: u32, rs1: u32, imm: u32) -> u32 {
        (imm << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
    }

    fn encode_u(opcode: u32, rd: u32, imm20: u32) -> u32 {
        (imm20 << 12) | (rd << 7) | opcode
    }

    fn encode_b(opcode: u32, funct3: u32, rs1: u32, rs2: u32, imm: u32) -> u32 {
        ((imm & 0x1000) << 19)
            | (((imm >> 11) & 0x1) << 7)
            | (((imm >> 1) & 0xf) << 8)
            | (((imm >> 5) & 0x3f) << 25)
            | (rs2 << 20)
            | (rs1 << 15)
            | (funct3 << 12)
            | opcode
    }

    /// Builds a snapshot hart whose program: loads a byte from the fuzz
    /// buffer, branches on whether it is nonzero (recording a coverage edge
    /// either way), then exits gracefully via `ecall`. Both branch outcomes
    /// converge on the same `ecall` so every run is graceful.
    fn branching_snapshot(coverage: Arc<CoverageMap>) -> Cpu {
        let mmu = Mmu::new(1 << 16, 0x4000);
        let mut cpu = Cpu::new(mmu, coverage);
        cpu.mmu_mut()
            .set_permissions(0, Perm::EXEC | Perm::WRITE, 6 * 4)
            .unwrap();
        cpu.mmu_mut()
            .set_permissions(FUZZ_BUF_ADR, Perm::READ | Perm::WRITE, 1)
            .unwrap();

        let code = [
            encode_u(0x37, 5, 0x3), // lui x5, 0x3000
            encode_i(0x03, 0, 10, 5, 0), // lb x10, 0(x5)
            encode_b(0x63, 1, 10, 0, 8), // bne x10, x0, +8
            encode_i(0x13, 0, 0, 0, 0), // addi x0, x0, 0 (fallthrough nop)
            encode_i(0x13, 0, 17, 0, 93), // addi x17, x0, 93 (SYS_EXIT)
            encode_i(0x73, 0, 0, 0, 0), // ecall
        ];
        for (i, word) in code.iter().enumerate() {
            cpu.mmu_mut().write((i * 4) as u64, &word.to_le_bytes()).unwrap();
        }
        cpu.set_pc(0);
        cpu
    }

    /// A snapshot whose program always faults: loads from an address with
    /// no `READ` permission.
    fn crashing_snapshot(coverage: Arc<CoverageMap>) -> Cpu {
        let mmu = Mmu::new(1 << 16, 0x4000);
        let mut cpu = Cpu::new(mmu, coverage);
        cpu.mmu_mut().set_permissions(0, Perm::EXEC | Perm::WRITE, 4).unwrap();
        cpu.mmu_mut()
            .set_permissions(FUZZ_BUF_ADR, Perm::READ | Perm::WRITE, 1)
            .unwrap();
        // lb x10, 0(x0): x0 is always 0, and guest address 0 only has
        // EXEC|WRITE, never READ, so every run faults.
        let lb = encode_i(0x03, 0, 10, 0, 0);
        cpu.mmu_mut().write(0, &lb.to_le_bytes()).unwrap();
        cpu.set_pc(0);
        cpu
    }

    fn engine_config(crash_dir: PathBuf) -> Arc<EngineConfig> {
        Arc::new(EngineConfig {
            fuzz_buf_adr: FUZZ_BUF_ADR,
            fuzz_buf_size: 1,
            crash_dir,
            max_instructions_per_run: 1_000,
            dump_regs_on_crash: false,
        })
    }

    #[test]
    fn iterate_on_empty_corpus_is_an_error() {
        let coverage = Arc::new(CoverageMap::new(1024));
        let snapshot = Arc::new(branching_snapshot(Arc::clone(&coverage)));
        let corpus = Arc::new(Corpus::new(coverage, 1024));
        let config = engine_config(std::env::temp_dir());
        let mut engine = SnapshotEngine::new(snapshot, corpus, config, 0);
        assert!(matches!(engine.iterate(), Err(EngineError::EmptyCorpus)));
    }

    #[test]
    fn iterate_resets_and_counts_graceful_exits() {
        let coverage = Arc::new(CoverageMap::new(1024));
        let snapshot = Arc::new(branching_snapshot(Arc::clone(&coverage)));
        let corpus = Arc::new(Corpus::new(coverage, 1024));
        corpus.add(Arc::from(&[0u8][..])).unwrap();
        let config = engine_config(std::env::temp_dir());
        let mut engine = SnapshotEngine::new(snapshot, corpus, config, 1);

        for _ in 0..16 {
            let reason = engine.iterate().unwrap();
            assert_eq!(reason, ExitReason::Graceful);
        }
        assert_eq!(engine.stats().resets, 16);
        assert_eq!(engine.stats().graceful_exits, 16);
    }

    #[test]
    fn newly_covering_inputs_are_promoted_into_the_corpus() {
        let coverage = Arc::new(CoverageMap::new(1024));
        let snapshot = Arc::new(branching_snapshot(Arc::clone(&coverage)));
        let corpus = Arc::new(Corpus::new(coverage, 1024));
        corpus.add(Arc::from(&[0u8][..])).unwrap();
        let config = engine_config(std::env::temp_dir());
        let mut engine = SnapshotEngine::new(snapshot, corpus.clone(), config, 2);

        // The branch is taken iff the (randomly mutated) single fuzz byte
        // is nonzero; with 255/256 odds per run, some run in this many
        // iterations discovers the taken-branch edge and gets promoted.
        for _ in 0..64 {
            engine.iterate().unwrap();
        }
        assert!(corpus.len() > 1, "expected at least one input to be promoted");
    }

    #[test]
    fn crashing_run_writes_a_crash_file_and_does_not_promote() {
        let coverage = Arc::new(CoverageMap::new(1024));
        let snapshot = Arc::new(crashing_snapshot(coverage.clone()));
        let corpus = Arc::new(Corpus::new(coverage, 1024));
        corpus.add(Arc::from(&[0u8][..])).unwrap();
        let crash_dir = tempfile::tempdir().unwrap();
        let config = engine_config(crash_dir.path().to_path_buf());
        let mut engine = SnapshotEngine::new(snapshot, corpus.clone(), config, 3);

        let reason = engine.iterate().unwrap();
        assert_eq!(reason, ExitReason::SegfaultRead);
        assert_eq!(engine.stats().read_faults, 1);

        let entries: Vec<_> = std::fs::read_dir(crash_dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].as_ref().unwrap().file_name();
        assert!(name.to_string_lossy().starts_with("segfault-read-"));
        assert!(name.to_string_lossy().ends_with(".crash"));
    }
}
