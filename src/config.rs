//! The immutable fuzzer configuration, built once from CLI flags via
//! `clap`'s derive API and passed by value into every constructor. No
//! process-wide mutable config struct (`original_source`'s `global_config_t`
//! is explicitly not carried over; see spec.md §9, "Global config").
use std::path::PathBuf;

use clap::Parser;

/// Default guest memory size: 256 MiB, per spec.md §3.
const DEFAULT_MEMORY_SIZE: usize = 256 * 1024 * 1024;
/// Default coverage map capacity. The source used 1024, which collides
/// badly on any realistic target (spec.md §9's "coverage map sizing" flag);
/// tens of thousands is a safer default.
const DEFAULT_COVERAGE_CAPACITY: usize = 65536;
/// Default corpus capacity, matching spec.md §4.3.
const DEFAULT_MAX_INPUTS: usize = 1_000_000;

/// Snapshot-based coverage-guided fuzzer over a software RV64I emulator.
#[derive(Debug, Parser)]
#[command(name = "snapfuzz", version, about)]
pub struct Config {
    /// Path to the target RV64I ELF binary.
    #[arg(long)]
    pub target: PathBuf,

    /// Arguments passed to the guest program (argv[1..]); argv[0] is the
    /// target path itself.
    #[arg(long = "target-arg")]
    pub target_argv: Vec<String>,

    /// Directory to recursively seed the initial corpus from.
    #[arg(long)]
    pub corpus_dir: PathBuf,

    /// Directory crashing inputs are written to.
    #[arg(long)]
    pub crashes_dir: PathBuf,

    /// Number of fuzzing worker threads.
    #[arg(long, default_value_t = default_thread_count())]
    pub threads: usize,

    /// Guest memory size in bytes (a power of two is recommended).
    #[arg(long, default_value_t = DEFAULT_MEMORY_SIZE, value_parser = parse_int)]
    pub memory: usize,

    /// Guest address of the fuzz injection buffer.
    #[arg(long, value_parser = parse_hex_u64)]
    pub fuzz_buf_adr: u64,

    /// Maximum length, in bytes, of the fuzz injection buffer.
    #[arg(long, value_parser = parse_int)]
    pub fuzz_buf_size: usize,

    /// Guest PC at which the pre-fuzz snapshot is captured. Defaults to the
    /// ELF entry point if omitted (spec.md §6).
    #[arg(long, value_parser = parse_hex_u64)]
    pub break_adr: Option<u64>,

    /// Number of cells in the shared coverage map.
    #[arg(long, default_value_t = DEFAULT_COVERAGE_CAPACITY)]
    pub coverage_map_capacity: usize,

    /// Maximum number of inputs the corpus will hold.
    #[arg(long, default_value_t = DEFAULT_MAX_INPUTS)]
    pub max_corpus_inputs: usize,

    /// Per-run guest instruction budget; exceeding it ends the run with
    /// `ExitReason::Timeout` (spec.md §5, "Cancellation & timeouts").
    #[arg(long, default_value_t = 50_000_000)]
    pub max_instructions_per_run: u64,

    /// Instruction budget used only while advancing the snapshot hart from
    /// the ELF entry point to `break_adr` at startup.
    #[arg(long, default_value_t = 500_000_000)]
    pub max_snapshot_instructions: u64,

    /// Tracing log level (`error`, `warn`, `info`, `debug`, `trace`).
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Dump guest registers to the log when a run ends in a crash.
    #[arg(long, default_value_t = false)]
    pub dump_regs_on_crash: bool,
}

fn default_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Parses a decimal or `0x`-prefixed hexadecimal integer.
fn parse_int(s: &str) -> Result<usize, String> {
    parse_hex_u64(s).map(|v| v as usize)
}

/// Parses a decimal or `0x`-prefixed hexadecimal `u64`, for guest addresses.
fn parse_hex_u64(s: &str) -> Result<u64, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|e| e.to_string())
    } else {
        s.parse::<u64>().map_err(|e| e.to_string())
    }
}
