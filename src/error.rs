//! Error types for configuration and measurement steps.
//!
//! Two enums, split by when they can occur:
//! - [`ConfigError`]: rejected before any memory is touched.
//! - [`StepError`]: a single sweep step could not produce a measurement.
//!
//! Soft failures (affinity pinning, huge-page fallback, madvise) are not
//! errors; they are logged where they happen and the step continues.
//!
//! Both enums are `#[non_exhaustive]`; match with a fallback arm.

use std::fmt;
use std::io;

/// Which allocation a [`StepError::Allocation`] refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionPurpose {
    /// The pointer-chase array.
    LatencyArray,
    /// A saturator's private buffer (index within the step).
    SaturatorBuffer(usize),
}

impl fmt::Display for RegionPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LatencyArray => f.write_str("latency array"),
            Self::SaturatorBuffer(idx) => write!(f, "saturator {} buffer", idx),
        }
    }
}

/// Invalid [`TestConfig`](crate::TestConfig).
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The prober must run at least one iteration.
    ZeroIterations,
    /// Latency region holds no complete cell.
    LatencyRegionTooSmall { bytes: usize, min: usize },
    /// Latency region has more words than a `u32` offset can address.
    LatencyRegionTooLarge { bytes: usize, max: usize },
    /// Saturators requested but no bandwidth memory configured.
    ZeroBandwidthMemory { cap: usize },
    /// Bandwidth working set larger than any region can be.
    BandwidthRegionTooLarge { bytes: usize, max: usize },
    /// Core index beyond the CPU set capacity.
    CoreOutOfRange { core: usize, capacity: usize },
    /// Explicit bandwidth core list contains the latency core.
    LatencyCoreReused { core: usize },
    /// Explicit bandwidth core list repeats a core.
    DuplicateCore { core: usize },
    /// Thread cap exceeds the explicit bandwidth core list.
    CapExceedsCoreList { cap: usize, cores: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroIterations => write!(f, "latency iterations must be > 0"),
            Self::LatencyRegionTooSmall { bytes, min } => write!(
                f,
                "latency region of {} bytes is smaller than one cell ({} bytes)",
                bytes, min
            ),
            Self::LatencyRegionTooLarge { bytes, max } => write!(
                f,
                "latency region of {} bytes exceeds the addressable maximum of {} bytes",
                bytes, max
            ),
            Self::ZeroBandwidthMemory { cap } => write!(
                f,
                "bandwidth memory is 0 but up to {} bandwidth threads were requested",
                cap
            ),
            Self::BandwidthRegionTooLarge { bytes, max } => write!(
                f,
                "bandwidth memory of {} bytes exceeds the region maximum of {} bytes",
                bytes, max
            ),
            Self::CoreOutOfRange { core, capacity } => {
                write!(f, "core {} exceeds CPU set capacity {}", core, capacity)
            }
            Self::LatencyCoreReused { core } => write!(
                f,
                "core {} is both the latency core and a bandwidth core",
                core
            ),
            Self::DuplicateCore { core } => {
                write!(f, "core {} appears more than once in the bandwidth core list", core)
            }
            Self::CapExceedsCoreList { cap, cores } => write!(
                f,
                "bandwidth thread cap {} exceeds the {} listed bandwidth cores",
                cap, cores
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// A sweep step failed before producing a measurement.
#[derive(Debug)]
#[non_exhaustive]
pub enum StepError {
    /// Memory for a buffer or the chase array could not be obtained.
    Allocation {
        purpose: RegionPurpose,
        bytes: usize,
        source: io::Error,
    },
    /// The OS refused to create a worker thread.
    Spawn {
        role: &'static str,
        source: io::Error,
    },
    /// A worker thread panicked.
    WorkerPanicked { role: &'static str },
    /// The chase array could not be laid out over the allocated region.
    Layout(ConfigError),
}

impl StepError {
    #[inline]
    pub fn allocation(purpose: RegionPurpose, bytes: usize, source: io::Error) -> Self {
        Self::Allocation {
            purpose,
            bytes,
            source,
        }
    }

    #[inline]
    pub fn spawn(role: &'static str, source: io::Error) -> Self {
        Self::Spawn { role, source }
    }

    /// True if the failure means later steps will fail the same way.
    ///
    /// Total bandwidth memory is constant across the sweep, so an allocation
    /// failure at one thread count repeats at the next.
    pub fn is_memory_pressure(&self) -> bool {
        matches!(self, Self::Allocation { .. })
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allocation {
                purpose,
                bytes,
                source,
            } => write!(
                f,
                "failed to allocate {} bytes for {}: {}",
                bytes, purpose, source
            ),
            Self::Spawn { role, source } => write!(f, "failed to spawn {} thread: {}", role, source),
            Self::WorkerPanicked { role } => write!(f, "{} thread panicked", role),
            Self::Layout(err) => write!(f, "invalid chase layout: {}", err),
        }
    }
}

impl std::error::Error for StepError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Allocation { source, .. } | Self::Spawn { source, .. } => Some(source),
            Self::Layout(err) => Some(err),
            Self::WorkerPanicked { .. } => None,
        }
    }
}
