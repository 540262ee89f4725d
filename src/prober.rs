//! Latency prober: a dependent-load chase over a [`PermutationArray`].
//!
//! Each load's address is the previous load's value, so the core cannot issue
//! the next access until the current one returns. Elapsed time divided by the
//! iteration count is therefore the round-trip latency of whatever level of
//! the hierarchy the array lives in (DRAM, for the default 1 GiB region).
//!
//! The loop also sums the loaded values and passes the sum through
//! `black_box`; without an observable result the compiler is free to delete
//! the chase entirely.

use std::hint::black_box;
use std::time::{Duration, Instant};

use crate::permutation::PermutationArray;
use crate::platform::{CpuSet, Platform};

/// Outcome of one prober run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProbeResult {
    pub iterations: u64,
    /// Mean nanoseconds per dependent load. Always `> 0` and finite.
    pub latency_ns: f64,
    /// Wall time of the chase loop alone.
    pub elapsed: Duration,
    /// Wrapping sum of visited offsets.
    pub checksum: u32,
    pub pinned: bool,
}

/// Walks `array` for `iterations` dependent loads starting from cell 0.
///
/// Pins to `target` first; a pinning failure is logged and the chase runs
/// unpinned.
///
/// # Performance
///
/// Runtime is `iterations` times the load-to-use latency of the region's
/// memory level, about 10 ms for 100 000 DRAM misses.
pub fn run_probe(
    array: &PermutationArray,
    iterations: u64,
    target: Option<&CpuSet>,
    platform: &dyn Platform,
) -> ProbeResult {
    let pinned = match target {
        Some(cores) => match platform.pin_current_thread(cores) {
            Ok(()) => true,
            Err(e) => {
                log::warn!(
                    "latency prober failed to pin to cores {}: {}; running unpinned",
                    cores,
                    e
                );
                false
            }
        },
        None => false,
    };

    log::debug!(
        "latency prober: {} iterations over {} cells",
        iterations,
        array.cells()
    );

    let (checksum, elapsed) = chase(array.words(), iterations);
    if checksum == 0 {
        log::warn!("latency chase checksum is zero; the chase may not have run as intended");
    }

    ProbeResult {
        iterations,
        latency_ns: per_access_ns(elapsed, iterations),
        elapsed,
        checksum,
        pinned,
    }
}

/// The timed loop. Kept out of line so the timed region is exactly this body.
#[inline(never)]
fn chase(words: &[u32], iterations: u64) -> (u32, Duration) {
    let words = black_box(words);
    let start = Instant::now();
    let mut current = words[0];
    let mut sum = 0u32;
    for _ in 0..iterations {
        current = words[current as usize];
        sum = sum.wrapping_add(current);
    }
    let elapsed = start.elapsed();
    (black_box(sum), elapsed)
}

/// Nanoseconds per access, with the elapsed time clamped to 1 ns so a
/// too-fast run on a coarse clock still yields a positive figure.
pub(crate) fn per_access_ns(elapsed: Duration, iterations: u64) -> f64 {
    let ns = elapsed.as_nanos().max(1) as f64;
    ns / iterations.max(1) as f64
}
