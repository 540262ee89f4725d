//! loaded-latency CLI
//!
//! Sweeps 0..=N bandwidth threads, measuring pointer-chase latency on a
//! dedicated core while the other threads saturate memory bandwidth.
//!
//! # Output Format
//!
//! The report goes to stdout (CSV by default):
//! `BW Threads, Bandwidth (GB/s), Latency (ns)` followed by one row per step.
//! Diagnostics go to stderr through `env_logger` (`RUST_LOG` overrides the
//! default `info` level).
//!
//! # Exit Codes
//!
//! - `0`: Success (failed steps still produce zero rows)
//! - `1`: The report could not be written
//! - `2`: Invalid arguments or configuration error

use std::io;
use std::process::ExitCode;

use clap::Parser;
use loaded_latency::config::{KIB, DEFAULT_LATENCY_ITERATIONS};
use loaded_latency::report::{write_report, OutputFormat};
use loaded_latency::{
    CoreAssignment, Orchestrator, PortablePlatform, ReadKernelKind, ShuffleKind, TestConfig,
};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "loaded-latency",
    version,
    about = "Measure memory latency under increasing bandwidth load"
)]
struct Cli {
    /// Highest number of bandwidth threads in the sweep (default: CPUs - 1)
    #[arg(long = "bw-threads", value_name = "N")]
    bw_threads: Option<usize>,

    /// Core the latency prober is pinned to
    #[arg(long, value_name = "C", default_value_t = 0)]
    latency_core: usize,

    /// Explicit bandwidth cores, used in order as the thread count grows
    #[arg(long = "bw-cores", value_name = "a,b,c", value_delimiter = ',')]
    bw_cores: Option<Vec<usize>>,

    /// Multiplier applied to the latency iteration count
    #[arg(long, value_name = "F", default_value_t = 1.0)]
    scale_iterations: f64,

    /// Dependent loads per latency measurement (before scaling)
    #[arg(long, value_name = "K", default_value_t = DEFAULT_LATENCY_ITERATIONS)]
    iterations: u64,

    /// Spin hints per cache line between saturator blocks; 0 disables throttling
    #[arg(long, value_name = "T", default_value_t = 0)]
    throttle: u32,

    /// Total bandwidth working set in KiB, split across saturators
    #[arg(long = "bw-memory-kb", value_name = "KB")]
    bw_memory_kb: Option<usize>,

    /// Latency region size in KiB
    #[arg(long = "latency-memory-kb", value_name = "KB")]
    latency_memory_kb: Option<usize>,

    /// Seed for permutation construction
    #[arg(long, value_name = "S")]
    seed: Option<u64>,

    /// Permutation builder
    #[arg(long, value_name = "literal|sattolo", default_value_t = ShuffleKind::Literal)]
    shuffle: ShuffleKind,

    /// Saturator read kernel
    #[arg(long, value_name = "scalar|unrolled|best", default_value_t = ReadKernelKind::Scalar)]
    kernel: ReadKernelKind,

    /// Do not request explicit huge pages for the latency region
    #[arg(long)]
    no_huge_pages: bool,

    /// Use the portable platform (no pinning, heap memory)
    #[arg(long)]
    portable: bool,

    /// Report format
    #[arg(long, value_name = "csv|json", default_value_t = OutputFormat::Csv)]
    format: OutputFormat,
}

impl Cli {
    fn to_config(&self) -> Result<TestConfig, String> {
        let mut config = TestConfig::default();

        if !self.scale_iterations.is_finite() || self.scale_iterations < 0.0 {
            return Err(format!(
                "--scale-iterations must be a non-negative number, got {}",
                self.scale_iterations
            ));
        }
        config.latency_iterations = (self.iterations as f64 * self.scale_iterations).round() as u64;
        config.throttle = self.throttle;
        config.latency_core = self.latency_core;
        config.shuffle = self.shuffle;
        config.kernel = self.kernel;
        config.huge_pages = !self.no_huge_pages;

        if let Some(kb) = self.bw_memory_kb {
            config.bandwidth_memory_bytes = kib_to_bytes(kb, "--bw-memory-kb")?;
        }
        if let Some(kb) = self.latency_memory_kb {
            config.latency_memory_bytes = kib_to_bytes(kb, "--latency-memory-kb")?;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(cores) = &self.bw_cores {
            config.bandwidth_cores = CoreAssignment::Explicit(cores.clone());
            config.bandwidth_thread_cap = cores.len();
        }
        if let Some(n) = self.bw_threads {
            config.bandwidth_thread_cap = n;
        }
        Ok(config)
    }
}

fn kib_to_bytes(kb: usize, flag: &str) -> Result<usize, String> {
    kb.checked_mul(KIB)
        .ok_or_else(|| format!("{} value {} overflows", flag, kb))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match cli.to_config() {
        Ok(config) => config,
        Err(msg) => {
            log::error!("{}", msg);
            return ExitCode::from(2);
        }
    };

    let mut orchestrator = match Orchestrator::new(config) {
        Ok(o) => o,
        Err(e) => {
            log::error!("invalid configuration: {}", e);
            return ExitCode::from(2);
        }
    };
    if cli.portable {
        orchestrator = orchestrator.with_platform(Box::new(PortablePlatform));
    }

    let config = orchestrator.config();
    log::info!(
        "latency: {} KiB, {} iterations, core {}; bandwidth: {} KiB total, up to {} threads, throttle {}",
        config.latency_memory_bytes / KIB,
        config.latency_iterations,
        config.latency_core,
        config.bandwidth_memory_bytes / KIB,
        config.bandwidth_thread_cap,
        config.throttle
    );

    let result = orchestrator.run_sweep();
    if result.aborted {
        log::warn!(
            "sweep aborted after {} of {} steps",
            result.rows.len(),
            orchestrator.config().bandwidth_thread_cap + 1
        );
    }

    let stdout = io::stdout();
    if let Err(e) = write_report(&result, cli.format, stdout.lock()) {
        log::error!("failed to write report: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
