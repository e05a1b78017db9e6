//! Command-line entry point: parses configuration, loads the target and
//! seed corpus, captures the pre-fuzz snapshot, spawns the worker pool, and
//! reports aggregate stats once per second until interrupted.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use clap::Parser;
use snapfuzz_rv64i::config::Config;
use snapfuzz_rv64i::coverage::CoverageMap;
use snapfuzz_rv64i::cpu::Cpu;
use snapfuzz_rv64i::engine::{self, EngineConfig};
use snapfuzz_rv64i::error::FuzzError;
use snapfuzz_rv64i::mmu::Mmu;
use snapfuzz_rv64i::stats::{GlobalStats, Reporter, Stats};
use snapfuzz_rv64i::{corpus::Corpus, elf};

fn main() {
    let config = Config::parse();

    let filter = tracing_subscriber::EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(err) = run(config) {
        tracing::error!(error = %err, "fatal error");
        std::process::exit(1);
    }
}

fn run(config: Config) -> Result<(), FuzzError> {
    std::fs::create_dir_all(&config.crashes_dir)
        .map_err(|e| FuzzError::CrashDirUnusable(config.crashes_dir.clone(), e))?;

    let coverage = Arc::new(CoverageMap::new(config.coverage_map_capacity));
    let corpus = Arc::new(Corpus::load_dir(
        &config.corpus_dir,
        Arc::clone(&coverage),
        config.max_corpus_inputs,
    )?);
    tracing::info!(inputs = corpus.len(), "seed corpus loaded");

    let mmu = Mmu::new(config.memory, 0);
    let mut cpu = Cpu::new(mmu, Arc::clone(&coverage));

    let loaded = elf::load(&config.target, &mut cpu)?;
    let mut argv = vec![config.target.to_string_lossy().into_owned()];
    argv.extend(config.target_argv.iter().cloned());
    cpu.build_stack(&argv)?;

    let break_adr = config.break_adr.unwrap_or(loaded.entry_point);
    let mut snapshot_stats = Stats::default();
    let reason = cpu.run_until(&mut snapshot_stats, break_adr, config.max_snapshot_instructions);
    if reason != snapfuzz_rv64i::ExitReason::NoExit {
        tracing::warn!(?reason, "snapshot hart did not reach break_adr cleanly");
    }
    tracing::info!(break_adr, "snapshot captured");

    let snapshot = Arc::new(cpu);
    let engine_config = Arc::new(EngineConfig {
        fuzz_buf_adr: config.fuzz_buf_adr,
        fuzz_buf_size: config.fuzz_buf_size,
        crash_dir: config.crashes_dir.clone(),
        max_instructions_per_run: config.max_instructions_per_run,
        dump_regs_on_crash: config.dump_regs_on_crash,
    });

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            tracing::info!("shutdown requested");
            shutdown.store(true, Ordering::Relaxed);
        })
        .expect("failed to install Ctrl-C handler");
    }

    let workers = engine::spawn_workers(
        config.threads,
        Arc::clone(&snapshot),
        Arc::clone(&corpus),
        engine_config,
        Arc::clone(&shutdown),
    );
    tracing::info!(threads = config.threads, "workers started");

    report_until_shutdown(&workers, &shutdown);

    for worker in workers {
        let _ = worker.join();
    }

    Ok(())
}

fn report_until_shutdown(workers: &[engine::Worker], shutdown: &Arc<AtomicBool>) {
    let global = GlobalStats::new();
    let mut reporter = Reporter::new();

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_secs(1));
        global.reset();
        for worker in workers {
            let snapshot = published_snapshot(&worker.published);
            global.merge(&snapshot);
        }
        tracing::info!("{}", reporter.tick(&global.snapshot()));
    }
}

fn published_snapshot(published: &Mutex<Stats>) -> Stats {
    *published.lock().expect("published stats mutex poisoned")
}
