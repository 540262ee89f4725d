//! Loaded memory latency measurement.
//!
//! ## Scope
//! Measures DRAM access latency while a configurable number of threads
//! saturate memory bandwidth. One *step* pairs a latency prober (a dependent
//! pointer chase over a large random cyclic permutation) with `n` bandwidth
//! saturators streaming private buffers; a *sweep* runs steps for
//! `n = 0..=cap` and yields `(n, aggregate GB/s, ns per access)` rows.
//!
//! ## Key invariants
//! - The chase array is a permutation of cell offsets; its walk from cell 0
//!   is a single cycle, so every load misses predictably.
//! - Saturators keep reading until the prober has been joined, so the whole
//!   latency window is under load.
//! - Every thread of a step is joined before the step returns, on success
//!   and on failure alike.
//! - All memory is pre-faulted before the timed window.
//!
//! ## Step flow
//! `allocate -> fill || build chase -> [start saturators, run prober, stop] -> aggregate`
//!
//! ## Notable entry points
//! - [`TestConfig`]: immutable run parameters and validation.
//! - [`Orchestrator`]: `run_step` / `run_sweep`.
//! - [`PermutationArray`]: builder and cycle analysis for the chase array.
//! - [`Platform`]: affinity and large-page services (`NativePlatform`, `PortablePlatform`).
//! - [`ReadKernel`]: saturator read strategies.
//! - [`report`]: CSV and JSON output.

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod permutation;
pub mod platform;
pub mod prober;
pub mod report;
pub mod rng;
pub mod saturator;

pub use config::{AffinityPlan, CoreAssignment, TestConfig};
pub use error::{ConfigError, RegionPurpose, StepError};
pub use orchestrator::{
    NoopObserver, Orchestrator, StepFailure, StepMeasurement, SweepResult, SweepRow,
    SweepSettings, WindowObserver,
};
pub use permutation::{PermutationArray, ShuffleKind};
pub use platform::{
    CpuSet, NativePlatform, PageHint, PageKind, Platform, PortablePlatform, Region, CACHE_LINE,
    MAX_REGION_BYTES,
};
pub use prober::{run_probe, ProbeResult};
pub use report::OutputFormat;
pub use rng::XorShift64;
pub use saturator::{
    fill_pattern, run_saturator, ReadKernel, ReadKernelKind, SaturatorReport, ScalarReadKernel,
    StopSignal, UnrolledReadKernel,
};
