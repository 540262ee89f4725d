//! Bandwidth saturators: threads that stream a private buffer until stopped.
//!
//! # Contract
//!
//! A saturator owns one buffer exclusively. It reads the buffer end to end,
//! wraps to offset 0, and repeats until the step's [`StopSignal`] is raised,
//! then reports how many bytes it consumed. Reads are done by a
//! [`ReadKernel`]; the saturator never knows which one.
//!
//! # Stop latency
//!
//! Kernels poll the signal once per [`BLOCK_BYTES`] block. At ~10 GB/s per
//! thread a 32 KiB block takes a few microseconds, so saturators wind down
//! well inside the timer resolution that matters for a sweep step.
//!
//! # Throttle
//!
//! `throttle = 0` is unthrottled. Otherwise each block is followed by
//! `throttle` spin-loop hints per cache line in the block, lowering the
//! offered load to produce partial-saturation points on the latency curve.

use std::fmt;
use std::hint::black_box;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::platform::{CpuSet, Platform, Region, CACHE_LINE};

/// Bytes read between two polls of the stop signal.
pub const BLOCK_BYTES: usize = 32 * 1024;

const BLOCK_QWORDS: usize = BLOCK_BYTES / 8;
const LINE_QWORDS: usize = CACHE_LINE / 8;

// ============================================================================
// StopSignal
// ============================================================================

/// Write-once stop flag shared by every saturator in a step.
///
/// Raised with `Release` after the prober has been joined; polled with
/// `Acquire`. Wrap in `crossbeam_utils::CachePadded` when sharing so the
/// polled line is not disturbed by neighbouring data.
#[derive(Debug, Default)]
pub struct StopSignal {
    raised: AtomicBool,
}

impl StopSignal {
    pub const fn new() -> Self {
        Self {
            raised: AtomicBool::new(false),
        }
    }

    /// Raises the signal. Returns `false` if it was already raised.
    #[inline]
    pub fn raise(&self) -> bool {
        !self.raised.swap(true, Ordering::Release)
    }

    #[inline]
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }
}

// ============================================================================
// Read kernels
// ============================================================================

/// Strategy that drives reads against a buffer until stopped.
///
/// Implementations must read every byte they count, poll `stop` at least
/// once per [`BLOCK_BYTES`], and wrap around at the end of `buf`.
pub trait ReadKernel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the number of bytes consumed.
    fn drive(&self, buf: &[u64], stop: &StopSignal, throttle: u32) -> u64;
}

/// One `u64` load per iteration, single accumulator.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScalarReadKernel;

impl ReadKernel for ScalarReadKernel {
    fn name(&self) -> &'static str {
        "scalar"
    }

    fn drive(&self, buf: &[u64], stop: &StopSignal, throttle: u32) -> u64 {
        drive_blocks(buf, stop, throttle, |block| {
            let mut acc = 0u64;
            for &q in block {
                acc = acc.wrapping_add(q);
            }
            acc
        })
    }
}

/// One cache line per iteration with eight independent accumulators, which
/// the compiler turns into wide vector loads on most targets.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnrolledReadKernel;

impl ReadKernel for UnrolledReadKernel {
    fn name(&self) -> &'static str {
        "unrolled"
    }

    fn drive(&self, buf: &[u64], stop: &StopSignal, throttle: u32) -> u64 {
        drive_blocks(buf, stop, throttle, |block| {
            let mut acc = [0u64; LINE_QWORDS];
            let mut lines = block.chunks_exact(LINE_QWORDS);
            for line in &mut lines {
                for (a, &q) in acc.iter_mut().zip(line) {
                    *a = a.wrapping_add(q);
                }
            }
            let mut sum = acc.iter().fold(0u64, |s, &a| s.wrapping_add(a));
            for &q in lines.remainder() {
                sum = sum.wrapping_add(q);
            }
            sum
        })
    }
}

/// Shared wrap-around block loop. `read_block` must touch every word it is
/// handed; its result is fed to `black_box` so the reads stay observable.
#[inline(always)]
fn drive_blocks<F>(buf: &[u64], stop: &StopSignal, throttle: u32, mut read_block: F) -> u64
where
    F: FnMut(&[u64]) -> u64,
{
    if buf.is_empty() {
        return 0;
    }
    let mut bytes = 0u64;
    loop {
        for block in buf.chunks(BLOCK_QWORDS) {
            black_box(read_block(black_box(block)));
            bytes = bytes.saturating_add((block.len() * 8) as u64);
            if throttle != 0 {
                let lines = block.len().div_ceil(LINE_QWORDS);
                for _ in 0..(throttle as usize).saturating_mul(lines) {
                    std::hint::spin_loop();
                }
            }
            if stop.is_raised() {
                return bytes;
            }
        }
    }
}

/// Named kernel selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadKernelKind {
    #[default]
    Scalar,
    Unrolled,
}

impl ReadKernelKind {
    /// The fastest kernel available on this build.
    pub fn best() -> Self {
        Self::Unrolled
    }

    pub fn instantiate(self) -> Box<dyn ReadKernel> {
        match self {
            Self::Scalar => Box::new(ScalarReadKernel),
            Self::Unrolled => Box::new(UnrolledReadKernel),
        }
    }
}

impl fmt::Display for ReadKernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Scalar => "scalar",
            Self::Unrolled => "unrolled",
        })
    }
}

impl FromStr for ReadKernelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scalar" => Ok(Self::Scalar),
            "unrolled" => Ok(Self::Unrolled),
            "best" => Ok(Self::best()),
            other => Err(format!(
                "unknown kernel '{}'; expected 'scalar', 'unrolled' or 'best'",
                other
            )),
        }
    }
}

// ============================================================================
// Fill phase
// ============================================================================

/// Pre-faults `region` with a deterministic `f32` ramp (`i + 0.2`).
///
/// Run once per buffer before the timed window so first-touch page faults
/// never land inside the measurement.
pub fn fill_pattern(region: &mut Region) {
    for (i, w) in region.words_mut().iter_mut().enumerate() {
        *w = (i as f32 + 0.2).to_bits();
    }
}

// ============================================================================
// Saturator thread body
// ============================================================================

/// Result of one saturator thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SaturatorReport {
    pub bytes_read: u64,
    pub pinned: bool,
}

/// Pins (softly) and then streams `buffer` until `stop` is raised.
///
/// Returns only after observing `stop`; the caller must raise it on every
/// path or the join blocks forever.
pub fn run_saturator(
    index: usize,
    buffer: &Region,
    target: Option<&CpuSet>,
    platform: &dyn Platform,
    kernel: &dyn ReadKernel,
    stop: &StopSignal,
    throttle: u32,
) -> SaturatorReport {
    let pinned = match target {
        Some(cores) => match platform.pin_current_thread(cores) {
            Ok(()) => true,
            Err(e) => {
                log::warn!(
                    "saturator {} failed to pin to cores {}: {}; running unpinned",
                    index,
                    cores,
                    e
                );
                false
            }
        },
        None => false,
    };

    let bytes_read = kernel.drive(buffer.qwords(), stop, throttle);
    log::trace!(
        "saturator {} read {} bytes with {} kernel",
        index,
        bytes_read,
        kernel.name()
    );
    SaturatorReport { bytes_read, pinned }
}
