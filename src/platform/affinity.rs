//! Core masks and thread pinning.
//!
//! A loaded-latency figure is only meaningful when the prober owns its core
//! and every saturator owns another one. A migrating prober pays TLB and
//! private-cache refills; a saturator sharing the prober's core turns the
//! measurement into an SMT contention test.
//!
//! [`CpuSet`] is a plain bitmask on every target so plans can be built and
//! compared anywhere. Only [`CpuSet::apply`] and [`allowed_cpus`] touch the
//! OS, and only on Linux; elsewhere they return `Unsupported`.
//!
//! Under cgroups or `taskset` the process sees a subset of the host's CPUs.
//! [`allowed_cpus`] reports that subset; pinning outside it fails with the
//! OS error and the caller decides whether that matters (the engine logs and
//! runs unpinned).

use std::fmt;
use std::io;

/// Highest core index + 1 a [`CpuSet`] can hold (glibc's `CPU_SETSIZE`).
pub const CPU_SET_CAPACITY: usize = 1024;

const MASK_WORDS: usize = CPU_SET_CAPACITY / 64;

#[inline]
pub(crate) fn validate_core(core: usize) -> io::Result<()> {
    if core < CPU_SET_CAPACITY {
        return Ok(());
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("core {} is outside the {}-core mask", core, CPU_SET_CAPACITY),
    ))
}

// ============================================================================
// CpuSet
// ============================================================================

/// Fixed-size core mask; converted to `cpu_set_t` only when applied.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CpuSet {
    mask: [u64; MASK_WORDS],
}

impl CpuSet {
    pub const fn new() -> Self {
        Self {
            mask: [0; MASK_WORDS],
        }
    }

    /// Mask with only `core` set.
    pub fn single(core: usize) -> io::Result<Self> {
        let mut set = Self::new();
        set.set(core)?;
        Ok(set)
    }

    /// Fails with `InvalidInput` for `core >= CPU_SET_CAPACITY`.
    pub fn set(&mut self, core: usize) -> io::Result<()> {
        validate_core(core)?;
        self.mask[core >> 6] |= bit(core);
        Ok(())
    }

    pub fn clear(&mut self, core: usize) -> io::Result<()> {
        validate_core(core)?;
        self.mask[core >> 6] &= !bit(core);
        Ok(())
    }

    /// Out-of-range cores read as unset.
    pub fn is_set(&self, core: usize) -> bool {
        core < CPU_SET_CAPACITY && self.mask[core >> 6] & bit(core) != 0
    }

    pub fn count(&self) -> usize {
        self.mask.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.mask.iter().all(|&w| w == 0)
    }

    pub fn intersects(&self, other: &CpuSet) -> bool {
        self.mask.iter().zip(&other.mask).any(|(a, b)| a & b != 0)
    }

    /// Adds every core of `other` to this mask.
    pub fn union_with(&mut self, other: &CpuSet) {
        for (a, b) in self.mask.iter_mut().zip(&other.mask) {
            *a |= b;
        }
    }

    /// Cores in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.mask.iter().enumerate().flat_map(|(w, &word)| {
            let mut rest = word;
            std::iter::from_fn(move || {
                if rest == 0 {
                    return None;
                }
                let low = rest.trailing_zeros() as usize;
                rest &= rest - 1;
                Some(w * 64 + low)
            })
        })
    }

    /// Restricts the calling thread to this mask.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an empty mask; otherwise whatever
    /// `pthread_setaffinity_np` reports (typically `EINVAL` for cores the
    /// process may not use).
    #[cfg(target_os = "linux")]
    pub fn apply(&self) -> io::Result<()> {
        if self.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "refusing to pin to an empty core mask",
            ));
        }

        // SAFETY: an all-zero cpu_set_t is a valid empty mask; every index
        // from iter() is below CPU_SETSIZE; the call reads `raw` only for
        // the size we pass and reports failure through its return value.
        let rc = unsafe {
            let mut raw: libc::cpu_set_t = std::mem::zeroed();
            for core in self.iter() {
                libc::CPU_SET(core, &mut raw);
            }
            libc::pthread_setaffinity_np(
                libc::pthread_self(),
                std::mem::size_of::<libc::cpu_set_t>(),
                &raw,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(rc))
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn apply(&self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "thread pinning needs Linux",
        ))
    }
}

#[inline]
fn bit(core: usize) -> u64 {
    1u64 << (core & 63)
}

impl Default for CpuSet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// `{0, 2, 5}`
impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        let mut sep = "";
        for core in self.iter() {
            write!(f, "{}{}", sep, core)?;
            sep = ", ";
        }
        f.write_str("}")
    }
}

impl FromIterator<usize> for CpuSet {
    /// Indices beyond capacity are dropped.
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = CpuSet::new();
        for core in iter.into_iter().filter(|&c| c < CPU_SET_CAPACITY) {
            set.mask[core >> 6] |= bit(core);
        }
        set
    }
}

// ============================================================================
// Discovery
// ============================================================================

/// Cores the calling thread may be scheduled on (cgroup and taskset aware).
#[cfg(target_os = "linux")]
pub fn allowed_cpus() -> io::Result<CpuSet> {
    // SAFETY: pid 0 means the calling thread; the kernel writes at most
    // size_of::<cpu_set_t>() bytes into the zeroed mask.
    let raw = unsafe {
        let mut raw: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut raw) != 0 {
            return Err(io::Error::last_os_error());
        }
        raw
    };

    // SAFETY: every probed index is below CPU_SETSIZE.
    Ok((0..CPU_SET_CAPACITY)
        .filter(|&core| unsafe { libc::CPU_ISSET(core, &raw) })
        .collect())
}

#[cfg(not(target_os = "linux"))]
pub fn allowed_cpus() -> io::Result<CpuSet> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "reading the affinity mask needs Linux",
    ))
}

/// Usable parallelism, never below 1.
pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or_else(|e| {
            log::warn!("available_parallelism failed ({}); assuming one CPU", e);
            1
        })
}
