//! Test orchestrator: one measurement step, and the sweep over thread counts.
//!
//! # Step protocol
//!
//! ```text
//!  orchestrator        fill-i           saturator-i        prober
//!  ------------        ------           -----------        ------
//!  alloc buffers
//!  spawn fills ------> fill pattern
//!  alloc + build chase    |
//!  join fills <-----------+
//!  t0 = now
//!  spawn saturators ---------------->  pin, stream...
//!  spawn prober ---------------------------------------->  pin, chase K
//!  join prober <-----------------------------------------  ProbeResult
//!  raise stop  ------------------------> sees stop
//!  join saturators <-------------------  bytes read
//!  t1 = now
//! ```
//!
//! Every thread is created inside a `std::thread::scope` and joined before the
//! step returns. The stop signal is raised on every path out of the window,
//! including spawn failures and worker panics, so the scope can always drain.
//! The first fatal error wins; later ones are dropped.
//!
//! # Arithmetic
//!
//! - Latency is the prober's own figure (its loop timing only).
//! - Bandwidth is `(64 * K + sum(saturator bytes)) / (t1 - t0)` in GB/s. The
//!   prober is charged a full cache line per access although it loads 4 bytes.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

use crate::config::{AffinityPlan, TestConfig};
use crate::error::{ConfigError, RegionPurpose, StepError};
use crate::permutation::{PermutationArray, ShuffleKind};
use crate::platform::{self, PageHint, PageKind, Platform, Region, CACHE_LINE};
use crate::prober::{run_probe, ProbeResult};
use crate::rng::XorShift64;
use crate::saturator::{
    fill_pattern, run_saturator, ReadKernel, ReadKernelKind, SaturatorReport, StopSignal,
};

// ============================================================================
// Observer hooks
// ============================================================================

/// Hooks around the timed window, e.g. for starting and stopping external
/// performance counters. All methods run on the orchestrator thread.
pub trait WindowObserver: Send + Sync {
    /// Right before the window's start timestamp.
    fn window_started(&self, _bandwidth_threads: usize) {}

    /// After the prober was joined, before the stop signal is raised.
    fn probe_joined(&self, _probe: &ProbeResult) {}

    /// After every saturator was joined and the measurement computed.
    fn window_finished(&self, _measurement: &StepMeasurement) {}
}

/// Observer that does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl WindowObserver for NoopObserver {}

// ============================================================================
// Results
// ============================================================================

/// Everything measured in one step.
#[derive(Clone, Debug)]
pub struct StepMeasurement {
    pub bandwidth_threads: usize,
    pub latency_ns: f64,
    /// Aggregate bandwidth over the window, prober included.
    pub bandwidth_gbs: f64,
    /// Wall time of the whole window (saturator launch to last join).
    pub elapsed: Duration,
    /// Bytes charged to the prober (one cache line per access).
    pub prober_bytes: u64,
    /// Bytes read by each saturator, in spawn order.
    pub saturator_bytes: Vec<u64>,
    pub pinned_saturators: usize,
    pub latency_pages: PageKind,
    pub probe: ProbeResult,
}

impl StepMeasurement {
    /// Bandwidth from saturators alone.
    pub fn saturator_gbs(&self) -> f64 {
        gb_per_sec(self.saturator_bytes.iter().sum(), self.elapsed)
    }

    /// Bandwidth attributed to the prober's chase alone.
    pub fn prober_gbs(&self) -> f64 {
        gb_per_sec(self.prober_bytes, self.elapsed)
    }
}

/// One row of the sweep: what the reporting layer prints.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize)]
pub struct SweepRow {
    pub bandwidth_threads: usize,
    pub bandwidth_gbs: f64,
    pub latency_ns: f64,
}

impl SweepRow {
    /// Placeholder row for a failed step.
    pub fn failed(bandwidth_threads: usize) -> Self {
        Self {
            bandwidth_threads,
            bandwidth_gbs: 0.0,
            latency_ns: 0.0,
        }
    }
}

impl From<&StepMeasurement> for SweepRow {
    fn from(m: &StepMeasurement) -> Self {
        Self {
            bandwidth_threads: m.bandwidth_threads,
            bandwidth_gbs: m.bandwidth_gbs,
            latency_ns: m.latency_ns,
        }
    }
}

/// A step that produced a placeholder row instead of a measurement.
#[derive(Debug)]
pub struct StepFailure {
    pub bandwidth_threads: usize,
    pub error: StepError,
}

/// Parameters a sweep ran with, echoed into the JSON report.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct SweepSettings {
    pub platform: &'static str,
    pub shuffle: ShuffleKind,
    pub kernel: ReadKernelKind,
    pub seed: u64,
    pub latency_iterations: u64,
    pub throttle: u32,
}

impl SweepSettings {
    fn new(config: &TestConfig, platform: &dyn Platform) -> Self {
        Self {
            platform: platform.name(),
            shuffle: config.shuffle,
            kernel: config.kernel,
            seed: config.seed,
            latency_iterations: config.latency_iterations,
            throttle: config.throttle,
        }
    }
}

/// Output of [`Orchestrator::run_sweep`].
#[derive(Debug, Default)]
pub struct SweepResult {
    pub settings: SweepSettings,
    /// One row per attempted step, in thread-count order.
    pub rows: Vec<SweepRow>,
    pub measurements: Vec<StepMeasurement>,
    pub failures: Vec<StepFailure>,
    /// True if the sweep stopped early because memory ran out.
    pub aborted: bool,
}

/// `bytes / elapsed` in GB/s (1e9 bytes). Elapsed is clamped to 1 ns.
pub fn gb_per_sec(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64().max(1e-9);
    bytes as f64 / 1e9 / secs
}

// ============================================================================
// Orchestrator
// ============================================================================

struct Window {
    probe: ProbeResult,
    reports: Vec<SaturatorReport>,
    elapsed: Duration,
}

/// Runs measurement steps for a fixed [`TestConfig`].
pub struct Orchestrator {
    config: TestConfig,
    platform: Box<dyn Platform>,
    kernel: Box<dyn ReadKernel>,
    observer: Box<dyn WindowObserver>,
}

impl Orchestrator {
    /// Validates `config` and sets up the probed platform and the configured
    /// read kernel.
    pub fn new(config: TestConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let kernel = config.kernel.instantiate();
        Ok(Self {
            config,
            platform: platform::probe(),
            kernel,
            observer: Box::new(NoopObserver),
        })
    }

    pub fn with_platform(mut self, platform: Box<dyn Platform>) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_kernel(mut self, kernel: Box<dyn ReadKernel>) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn with_observer(mut self, observer: Box<dyn WindowObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &TestConfig {
        &self.config
    }

    pub fn platform(&self) -> &dyn Platform {
        self.platform.as_ref()
    }

    /// Runs steps for 0..=cap bandwidth threads.
    ///
    /// Failed steps produce a zero row. An allocation failure ends the sweep;
    /// any other failure moves on to the next thread count.
    ///
    /// # Panics
    ///
    /// Never on step failure: worker panics come back as
    /// [`StepError::WorkerPanicked`] in [`SweepResult::failures`].
    ///
    /// # Performance
    ///
    /// Each step allocates and pre-faults the full bandwidth and latency
    /// regions anew, so a default sweep touches about 2 GiB per step.
    pub fn run_sweep(&self) -> SweepResult {
        let cap = self.config.bandwidth_thread_cap;
        log::info!(
            "sweeping 0..={} bandwidth threads on {} platform, {} kernel, {} shuffle",
            cap,
            self.platform.name(),
            self.kernel.name(),
            self.config.shuffle
        );

        let mut result = SweepResult {
            settings: SweepSettings::new(&self.config, self.platform.as_ref()),
            ..SweepResult::default()
        };
        for threads in 0..=cap {
            match self.run_step(threads) {
                Ok(m) => {
                    log::info!(
                        "{} bw threads: {:.3} GB/s, {:.2} ns (saturators {:.3} GB/s, prober {:.3} GB/s)",
                        threads,
                        m.bandwidth_gbs,
                        m.latency_ns,
                        m.saturator_gbs(),
                        m.prober_gbs()
                    );
                    result.rows.push(SweepRow::from(&m));
                    result.measurements.push(m);
                }
                Err(error) => {
                    log::error!("step with {} bw threads failed: {}", threads, error);
                    result.rows.push(SweepRow::failed(threads));
                    let pressure = error.is_memory_pressure();
                    result.failures.push(StepFailure {
                        bandwidth_threads: threads,
                        error,
                    });
                    if pressure {
                        if threads < cap {
                            log::warn!(
                                "skipping steps {}..={}: allocation is failing",
                                threads + 1,
                                cap
                            );
                        }
                        result.aborted = true;
                        break;
                    }
                }
            }
        }
        result
    }

    /// Runs one measurement with `bandwidth_threads` saturators.
    ///
    /// Every thread the step spawned has been joined by the time this
    /// returns, whatever the outcome.
    ///
    /// # Errors
    ///
    /// - [`StepError::Allocation`] if a saturator buffer or the latency region
    ///   cannot be obtained (huge pages are retried as standard pages first).
    /// - [`StepError::Layout`] if the latency region cannot hold a chase.
    /// - [`StepError::Spawn`] / [`StepError::WorkerPanicked`] for thread
    ///   failures; the first one wins.
    ///
    /// # Panics
    ///
    /// Does not panic on worker panics; see [`StepError::WorkerPanicked`].
    pub fn run_step(&self, bandwidth_threads: usize) -> Result<StepMeasurement, StepError> {
        let plan = self
            .config
            .affinity_plan(bandwidth_threads, &self.platform.available_cores());
        log::debug!(
            "step {}: latency core {}, saturator cores {:?}",
            bandwidth_threads,
            plan.latency,
            plan.saturators
        );
        let unpinned = plan.unpinned_saturators();
        if unpinned > 0 {
            log::warn!(
                "{} of {} saturators have no dedicated core and will run unpinned",
                unpinned,
                bandwidth_threads
            );
        }

        let per_thread = self.config.per_thread_buffer_bytes(bandwidth_threads);
        let mut buffers = Vec::with_capacity(bandwidth_threads);
        for i in 0..bandwidth_threads {
            let region = self
                .platform
                .allocate_standard(per_thread, PageHint::Default)
                .map_err(|e| StepError::allocation(RegionPurpose::SaturatorBuffer(i), per_thread, e))?;
            buffers.push(region);
        }

        let array = self.prepare(&mut buffers, bandwidth_threads)?;

        let stop = CachePadded::new(StopSignal::new());
        self.observer.window_started(bandwidth_threads);
        let window = self.timed_window(&buffers, &array, &plan, &stop)?;

        let prober_bytes = (CACHE_LINE as u64).saturating_mul(self.config.latency_iterations);
        let saturator_bytes: Vec<u64> = window.reports.iter().map(|r| r.bytes_read).collect();
        let total = saturator_bytes
            .iter()
            .fold(prober_bytes, |acc, &b| acc.saturating_add(b));

        let measurement = StepMeasurement {
            bandwidth_threads,
            latency_ns: window.probe.latency_ns,
            bandwidth_gbs: gb_per_sec(total, window.elapsed),
            elapsed: window.elapsed,
            prober_bytes,
            saturator_bytes,
            pinned_saturators: window.reports.iter().filter(|r| r.pinned).count(),
            latency_pages: array.region().pages(),
            probe: window.probe,
        };
        self.observer.window_finished(&measurement);
        Ok(measurement)
    }

    /// Fills saturator buffers on their own threads while this thread builds
    /// the chase array, then joins the fills.
    fn prepare(
        &self,
        buffers: &mut [Region],
        bandwidth_threads: usize,
    ) -> Result<PermutationArray, StepError> {
        thread::scope(|scope| {
            let mut first_err = None;
            let mut fills = Vec::with_capacity(buffers.len());
            for (i, buffer) in buffers.iter_mut().enumerate() {
                let spawned = thread::Builder::new()
                    .name(format!("llat-fill-{i}"))
                    .spawn_scoped(scope, move || fill_pattern(buffer));
                match spawned {
                    Ok(handle) => fills.push(handle),
                    Err(e) => {
                        first_err = Some(StepError::spawn("fill", e));
                        break;
                    }
                }
            }

            let array = self.build_latency_array(bandwidth_threads);

            for handle in fills {
                if handle.join().is_err() {
                    first_err.get_or_insert(StepError::WorkerPanicked { role: "fill" });
                }
            }
            match first_err {
                Some(err) => Err(err),
                None => array,
            }
        })
    }

    fn build_latency_array(&self, bandwidth_threads: usize) -> Result<PermutationArray, StepError> {
        let region = self.allocate_latency_region()?;
        let mut rng = XorShift64::for_step(self.config.seed, bandwidth_threads);
        log::debug!(
            "building {} chase over {} bytes ({:?} pages), rng state {:#x}",
            self.config.shuffle,
            region.len(),
            region.pages(),
            rng.state()
        );
        PermutationArray::build(region, CACHE_LINE, self.config.shuffle, &mut rng)
            .map_err(StepError::Layout)
    }

    /// Large pages first when configured; standard pages with a huge-page
    /// hint otherwise or on failure.
    fn allocate_latency_region(&self) -> Result<Region, StepError> {
        let bytes = self.config.latency_memory_bytes;
        if self.config.huge_pages {
            match self.platform.allocate_large(bytes) {
                Ok(region) => return Ok(region),
                Err(e) => log::warn!(
                    "failed to map {} bytes with huge pages ({}); using standard pages with a huge page hint",
                    bytes,
                    e
                ),
            }
        }
        self.platform
            .allocate_standard(bytes, PageHint::PreferHuge)
            .map_err(|e| StepError::allocation(RegionPurpose::LatencyArray, bytes, e))
    }

    fn timed_window(
        &self,
        buffers: &[Region],
        array: &PermutationArray,
        plan: &AffinityPlan,
        stop: &StopSignal,
    ) -> Result<Window, StepError> {
        let platform = self.platform.as_ref();
        let kernel = self.kernel.as_ref();
        let throttle = self.config.throttle;
        let iterations = self.config.latency_iterations;
        let latency_target = &plan.latency;

        thread::scope(|scope| {
            let start = Instant::now();

            let mut spawn_err = None;
            let mut saturators = Vec::with_capacity(buffers.len());
            for (i, (buffer, target)) in buffers.iter().zip(&plan.saturators).enumerate() {
                let spawned = thread::Builder::new()
                    .name(format!("llat-saturator-{i}"))
                    .spawn_scoped(scope, move || {
                        run_saturator(i, buffer, target.as_ref(), platform, kernel, stop, throttle)
                    });
                match spawned {
                    Ok(handle) => saturators.push(handle),
                    Err(e) => {
                        spawn_err = Some(StepError::spawn("saturator", e));
                        break;
                    }
                }
            }

            let probe = match spawn_err {
                Some(err) => Err(err),
                None => thread::Builder::new()
                    .name("llat-prober".to_string())
                    .spawn_scoped(scope, move || {
                        run_probe(array, iterations, Some(latency_target), platform)
                    })
                    .map_err(|e| StepError::spawn("prober", e))
                    .and_then(|handle| {
                        handle
                            .join()
                            .map_err(|_| StepError::WorkerPanicked { role: "prober" })
                    }),
            };

            if let Ok(result) = &probe {
                self.observer.probe_joined(result);
            }
            stop.raise();

            let mut saturator_err = None;
            let mut reports = Vec::with_capacity(saturators.len());
            for handle in saturators {
                match handle.join() {
                    Ok(report) => reports.push(report),
                    Err(_) => {
                        saturator_err.get_or_insert(StepError::WorkerPanicked { role: "saturator" });
                    }
                }
            }
            let elapsed = start.elapsed();

            let probe = probe?;
            if let Some(err) = saturator_err {
                return Err(err);
            }
            Ok(Window {
                probe,
                reports,
                elapsed,
            })
        })
    }
}
