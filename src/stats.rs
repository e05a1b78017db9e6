//! Per-worker execution counters, folded periodically into a global
//! mutex-protected aggregate for reporting.
use std::sync::Mutex;
use std::time::Instant;

use crate::cpu::ExitReason;

/// Counters owned exclusively by a single worker thread. Plain integers:
/// incremented from one thread only, so no atomics are needed here.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    /// Total guest instructions retired.
    pub executed_instructions: u64,
    /// Number of times this worker has reset its emulator to the snapshot.
    pub resets: u64,
    /// Runs that ended via the guest `exit` syscall.
    pub graceful_exits: u64,
    /// Runs that ended on an unsupported syscall number.
    pub unsupported_syscalls: u64,
    /// Runs that ended on `fstat` with an unsupported file descriptor.
    pub bad_fstat_fds: u64,
    /// Runs that ended on an illegal guest memory read.
    pub read_faults: u64,
    /// Runs that ended on an illegal guest memory write.
    pub write_faults: u64,
    /// Runs that ended on an opcode this interpreter does not implement.
    pub invalid_opcodes: u64,
    /// Runs that exceeded the configured instruction budget.
    pub timeouts: u64,
}

impl Stats {
    /// Folds a just-observed exit reason into the matching counter. Mirrors
    /// the "report exit reason" step the interpreter's run loop performs
    /// immediately after a run ends.
    pub fn record_exit(&mut self, reason: ExitReason) {
        match reason {
            ExitReason::NoExit => {}
            ExitReason::SyscallUnsupported => self.unsupported_syscalls += 1,
            ExitReason::FstatBadFd => self.bad_fstat_fds += 1,
            ExitReason::SegfaultRead => self.read_faults += 1,
            ExitReason::SegfaultWrite => self.write_faults += 1,
            ExitReason::InvalidOpcode => self.invalid_opcodes += 1,
            ExitReason::Graceful => self.graceful_exits += 1,
            ExitReason::Timeout => self.timeouts += 1,
        }
    }

    fn merge_from(&mut self, other: &Stats) {
        self.executed_instructions += other.executed_instructions;
        self.resets += other.resets;
        self.graceful_exits += other.graceful_exits;
        self.unsupported_syscalls += other.unsupported_syscalls;
        self.bad_fstat_fds += other.bad_fstat_fds;
        self.read_faults += other.read_faults;
        self.write_faults += other.write_faults;
        self.invalid_opcodes += other.invalid_opcodes;
        self.timeouts += other.timeouts;
    }
}

/// The global aggregate, folded into from each worker's local [`Stats`] once
/// per reporting tick.
pub struct GlobalStats {
    inner: Mutex<Stats>,
}

impl GlobalStats {
    /// Creates an empty aggregate.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Stats::default()),
        }
    }

    /// Folds `delta` (a worker's stats since the last tick) into the
    /// aggregate.
    pub fn merge(&self, delta: &Stats) {
        let mut guard = self.inner.lock().expect("global stats mutex poisoned");
        guard.merge_from(delta);
    }

    /// Snapshot of the current aggregate.
    pub fn snapshot(&self) -> Stats {
        *self.inner.lock().expect("global stats mutex poisoned")
    }

    /// Zeroes the aggregate. Workers publish their full cumulative totals
    /// (not deltas) once per iteration, so the reporter resets the
    /// aggregate and re-merges every worker's latest snapshot each tick
    /// rather than accumulating across ticks.
    pub fn reset(&self) {
        *self.inner.lock().expect("global stats mutex poisoned") = Stats::default();
    }
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the previous tick's totals so the reporter can compute per-second
/// rates from deltas.
pub struct Reporter {
    last_tick: Instant,
    last_instructions: u64,
    last_resets: u64,
}

impl Reporter {
    /// Starts a reporter anchored at the current instant.
    pub fn new() -> Self {
        Self {
            last_tick: Instant::now(),
            last_instructions: 0,
            last_resets: 0,
        }
    }

    /// Formats the periodic one-line summary and updates the rate baseline.
    /// Matches the spec's exact field ordering and labels.
    pub fn tick(&mut self, stats: &Stats) -> String {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_tick).as_secs_f64().max(1e-9);

        let inst_rate = (stats.executed_instructions - self.last_instructions) as f64 / elapsed;
        let reset_rate = (stats.resets - self.last_resets) as f64 / elapsed;

        self.last_tick = now;
        self.last_instructions = stats.executed_instructions;
        self.last_resets = stats.resets;

        format!(
            "exec insts: {} | syscall-unsupported: {} | fstat-bad: {} | graceful: {} | unknown: {} | resets: {} | inst/sec: {:.0} | resets/sec: {:.0}",
            stats.executed_instructions,
            stats.unsupported_syscalls,
            stats.bad_fstat_fds,
            stats.graceful_exits,
            stats.invalid_opcodes,
            stats.resets,
            inst_rate,
            reset_rate,
        )
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_accumulates_across_workers() {
        let global = GlobalStats::new();
        let mut a = Stats::default();
        a.executed_instructions = 10;
        a.resets = 1;
        let mut b = Stats::default();
        b.executed_instructions = 5;
        b.resets = 2;

        global.merge(&a);
        global.merge(&b);

        let snap = global.snapshot();
        assert_eq!(snap.executed_instructions, 15);
        assert_eq!(snap.resets, 3);
    }

    #[test]
    fn record_exit_increments_matching_counter() {
        let mut s = Stats::default();
        s.record_exit(ExitReason::SegfaultRead);
        s.record_exit(ExitReason::Graceful);
        s.record_exit(ExitReason::NoExit);
        assert_eq!(s.read_faults, 1);
        assert_eq!(s.graceful_exits, 1);
    }
}
