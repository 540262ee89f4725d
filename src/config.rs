//! Run configuration and per-step affinity planning.
//!
//! [`TestConfig`] is built once (by the CLI or a caller) and never mutated
//! while a sweep runs. Everything a step needs, including which cores its
//! threads land on, is derived from it.
//!
//! ## Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | bandwidth memory (total) | 1 GiB |
//! | latency memory | 1 GiB |
//! | latency iterations | 100 000 |
//! | throttle | 0 (unthrottled) |
//! | latency core | 0 |
//! | bandwidth thread cap | online CPUs - 1 |
//! | core assignment | descending from the highest core |
//! | huge pages | preferred |

use std::collections::HashSet;

use crate::error::ConfigError;
use crate::permutation::{PermutationArray, ShuffleKind};
use crate::platform::{CpuSet, CACHE_LINE, CPU_SET_CAPACITY, MAX_REGION_BYTES};
use crate::saturator::ReadKernelKind;

pub const KIB: usize = 1024;
pub const DEFAULT_BANDWIDTH_MEMORY_BYTES: usize = 1024 * 1024 * KIB;
pub const DEFAULT_LATENCY_MEMORY_BYTES: usize = 1024 * 1024 * KIB;
pub const DEFAULT_LATENCY_ITERATIONS: u64 = 100_000;
pub const DEFAULT_SEED: u64 = 0x853c49e6748fea9b;

/// How saturator cores are chosen as the thread count grows.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum CoreAssignment {
    /// Highest core first, walking down and skipping the latency core.
    #[default]
    Descending,
    /// Step `n` uses the first `n` cores of the list.
    Explicit(Vec<usize>),
}

/// Immutable configuration for a sweep.
#[derive(Clone, Debug, PartialEq)]
pub struct TestConfig {
    /// Total saturator working set, split evenly across the step's threads.
    pub bandwidth_memory_bytes: usize,
    /// Size of the pointer-chase region.
    pub latency_memory_bytes: usize,
    /// Dependent loads per prober run.
    pub latency_iterations: u64,
    /// Spin hints per cache line between saturator blocks; 0 = unthrottled.
    pub throttle: u32,
    pub latency_core: usize,
    pub bandwidth_cores: CoreAssignment,
    /// Highest bandwidth thread count in the sweep (inclusive).
    pub bandwidth_thread_cap: usize,
    /// Seed for permutation construction.
    pub seed: u64,
    pub shuffle: ShuffleKind,
    pub kernel: ReadKernelKind,
    /// Request explicit huge pages for the latency region.
    pub huge_pages: bool,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            bandwidth_memory_bytes: DEFAULT_BANDWIDTH_MEMORY_BYTES,
            latency_memory_bytes: DEFAULT_LATENCY_MEMORY_BYTES,
            latency_iterations: DEFAULT_LATENCY_ITERATIONS,
            throttle: 0,
            latency_core: 0,
            bandwidth_cores: CoreAssignment::Descending,
            bandwidth_thread_cap: crate::platform::num_cpus().saturating_sub(1),
            seed: DEFAULT_SEED,
            shuffle: ShuffleKind::default(),
            kernel: ReadKernelKind::default(),
            huge_pages: true,
        }
    }
}

impl TestConfig {
    /// A small configuration suitable for tests and smoke runs: 1 MiB latency
    /// region, 4 MiB bandwidth region, 10 000 iterations, cap of 2.
    pub fn small() -> Self {
        Self {
            bandwidth_memory_bytes: 4 * 1024 * KIB,
            latency_memory_bytes: 1024 * KIB,
            latency_iterations: 10_000,
            bandwidth_thread_cap: 2,
            huge_pages: false,
            ..Self::default()
        }
    }

    /// Checks the configuration without touching memory or threads.
    ///
    /// # Errors
    ///
    /// The first violated constraint, checked in field order: iterations,
    /// latency region bounds, bandwidth memory, then cores.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.latency_iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        if self.latency_memory_bytes < CACHE_LINE {
            return Err(ConfigError::LatencyRegionTooSmall {
                bytes: self.latency_memory_bytes,
                min: CACHE_LINE,
            });
        }
        if self.latency_memory_bytes > PermutationArray::MAX_BYTES {
            return Err(ConfigError::LatencyRegionTooLarge {
                bytes: self.latency_memory_bytes,
                max: PermutationArray::MAX_BYTES,
            });
        }
        if self.bandwidth_thread_cap > 0 && self.bandwidth_memory_bytes == 0 {
            return Err(ConfigError::ZeroBandwidthMemory {
                cap: self.bandwidth_thread_cap,
            });
        }
        if self.bandwidth_memory_bytes > MAX_REGION_BYTES {
            return Err(ConfigError::BandwidthRegionTooLarge {
                bytes: self.bandwidth_memory_bytes,
                max: MAX_REGION_BYTES,
            });
        }
        check_core(self.latency_core)?;

        if let CoreAssignment::Explicit(cores) = &self.bandwidth_cores {
            let mut seen = HashSet::with_capacity(cores.len());
            for &core in cores {
                check_core(core)?;
                if core == self.latency_core {
                    return Err(ConfigError::LatencyCoreReused { core });
                }
                if !seen.insert(core) {
                    return Err(ConfigError::DuplicateCore { core });
                }
            }
            if self.bandwidth_thread_cap > cores.len() {
                return Err(ConfigError::CapExceedsCoreList {
                    cap: self.bandwidth_thread_cap,
                    cores: cores.len(),
                });
            }
        }
        Ok(())
    }

    /// Per-saturator buffer size for a step with `threads` saturators.
    ///
    /// `ceil(total / threads)` rounded up to a whole cache line; zero
    /// threads means zero bytes (no division).
    ///
    /// A share that cannot be rounded without overflowing saturates to
    /// `usize::MAX`, which every allocator rejects. [`validate`](Self::validate)
    /// keeps valid configs below that point.
    pub fn per_thread_buffer_bytes(&self, threads: usize) -> usize {
        if threads == 0 {
            return 0;
        }
        self.bandwidth_memory_bytes
            .div_ceil(threads)
            .checked_next_multiple_of(CACHE_LINE)
            .unwrap_or(usize::MAX)
    }

    /// Resolves which cores every thread of a step with `threads` saturators
    /// is pinned to. `available` lists the cores the process may run on,
    /// ascending.
    pub fn affinity_plan(&self, threads: usize, available: &[usize]) -> AffinityPlan {
        let latency = CpuSet::single(self.latency_core).unwrap_or_default();
        let saturators = match &self.bandwidth_cores {
            CoreAssignment::Explicit(cores) => (0..threads)
                .map(|i| cores.get(i).and_then(|&c| CpuSet::single(c).ok()))
                .collect(),
            CoreAssignment::Descending => {
                let mut candidates = available
                    .iter()
                    .rev()
                    .copied()
                    .filter(|&c| c != self.latency_core);
                (0..threads)
                    .map(|_| candidates.next().and_then(|c| CpuSet::single(c).ok()))
                    .collect()
            }
        };
        AffinityPlan {
            latency,
            saturators,
        }
    }
}

fn check_core(core: usize) -> Result<(), ConfigError> {
    if core >= CPU_SET_CAPACITY {
        return Err(ConfigError::CoreOutOfRange {
            core,
            capacity: CPU_SET_CAPACITY,
        });
    }
    Ok(())
}

/// Core targets for one step.
///
/// `saturators[i]` is `None` when no distinct core is left for saturator `i`;
/// that thread runs unpinned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AffinityPlan {
    pub latency: CpuSet,
    pub saturators: Vec<Option<CpuSet>>,
}

impl AffinityPlan {
    /// Number of saturators that will run without a core of their own.
    pub fn unpinned_saturators(&self) -> usize {
        self.saturators.iter().filter(|t| t.is_none()).count()
    }

    /// True if no two targets (latency included) share a core.
    pub fn is_disjoint(&self) -> bool {
        let mut union = self.latency.clone();
        for target in self.saturators.iter().flatten() {
            if union.intersects(target) {
                return false;
            }
            union.union_with(target);
        }
        true
    }
}
