//! Platform capabilities used by the measurement engine.
//!
//! The engine needs exactly two OS services: pin the calling thread to a set
//! of cores, and hand out memory (with large pages when possible). Both sit
//! behind [`Platform`] so the orchestrator never branches on the target OS:
//!
//! - [`NativePlatform`]: Linux. `pthread_setaffinity_np`, `MAP_HUGETLB`
//!   anonymous mappings, `MADV_HUGEPAGE` on the fallback path.
//! - [`PortablePlatform`]: anywhere. Aligned heap memory, no pinning.
//!
//! [`probe()`] picks one at runtime based on what the environment supports.

pub mod affinity;
pub mod region;

use std::io;
#[cfg(target_os = "linux")]
use std::sync::OnceLock;

pub use affinity::{allowed_cpus, num_cpus, CpuSet, CPU_SET_CAPACITY};
pub use region::{PageKind, Region, CACHE_LINE, MAX_REGION_BYTES};

/// How a standard allocation should be hinted to the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageHint {
    /// No hint; plain default pages.
    Default,
    /// Ask for transparent huge pages (`MADV_HUGEPAGE`) where supported.
    PreferHuge,
}

/// OS services consumed by the orchestrator and its worker threads.
///
/// Implementations must be shareable across the step's scoped threads.
pub trait Platform: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Pins the calling thread to `cores`.
    fn pin_current_thread(&self, cores: &CpuSet) -> io::Result<()>;

    /// Allocates `bytes` backed by explicit large pages.
    ///
    /// The mapping is a whole number of huge pages; the returned region's
    /// length is `bytes` rounded up to a cache line.
    ///
    /// # Errors
    ///
    /// Failure is expected on machines without a reserved huge page pool; the
    /// caller falls back to [`Platform::allocate_standard`]. `InvalidInput`
    /// for zero or unrepresentable lengths.
    fn allocate_large(&self, bytes: usize) -> io::Result<Region>;

    /// Allocates `bytes` of zeroed, cache-line-aligned memory.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for zero or unrepresentable lengths; otherwise whatever
    /// the allocator or `mmap` reports (typically `OutOfMemory`).
    fn allocate_standard(&self, bytes: usize, hint: PageHint) -> io::Result<Region>;

    /// Cores this process may run on, ascending.
    fn available_cores(&self) -> Vec<usize> {
        (0..num_cpus()).collect()
    }
}

// ============================================================================
// Native (Linux)
// ============================================================================

/// Linux implementation backed by libc affinity calls and anonymous mappings.
#[derive(Clone, Copy, Debug, Default)]
pub struct NativePlatform;

#[cfg(target_os = "linux")]
impl Platform for NativePlatform {
    fn name(&self) -> &'static str {
        "native-linux"
    }

    fn pin_current_thread(&self, cores: &CpuSet) -> io::Result<()> {
        cores.apply()
    }

    fn allocate_large(&self, bytes: usize) -> io::Result<Region> {
        let len = region::round_to_line(bytes)?;
        let page = huge_page_size();
        let mapped = region::round_to_page(len, page)?;
        if mapped != len {
            log::debug!(
                "huge mapping of {} bytes rounded up to {} ({}-byte pages)",
                len,
                mapped,
                page
            );
        }
        // None = the kernel's default huge page size, the one meminfo reports.
        let map = memmap2::MmapOptions::new()
            .len(mapped)
            .huge(None)
            .map_anon()?;
        Ok(Region::from_mmap(map, len, PageKind::Huge))
    }

    fn allocate_standard(&self, bytes: usize, hint: PageHint) -> io::Result<Region> {
        let len = region::round_to_line(bytes)?;
        let map = memmap2::MmapOptions::new().len(len).map_anon()?;
        if hint == PageHint::PreferHuge {
            // Advisory only: THP may be disabled system-wide.
            if let Err(e) = map.advise(memmap2::Advice::HugePage) {
                log::debug!("madvise(MADV_HUGEPAGE) on {} bytes failed: {}", len, e);
            }
        }
        Ok(Region::from_mmap(map, len, PageKind::Standard))
    }

    fn available_cores(&self) -> Vec<usize> {
        match allowed_cpus() {
            Ok(set) if !set.is_empty() => set.iter().collect(),
            _ => (0..num_cpus()).collect(),
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl Platform for NativePlatform {
    fn name(&self) -> &'static str {
        "native-unsupported"
    }

    fn pin_current_thread(&self, cores: &CpuSet) -> io::Result<()> {
        cores.apply()
    }

    fn allocate_large(&self, _bytes: usize) -> io::Result<Region> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "large pages are not supported on this platform",
        ))
    }

    fn allocate_standard(&self, bytes: usize, _hint: PageHint) -> io::Result<Region> {
        Region::heap(bytes)
    }
}

/// Used when `/proc/meminfo` is unreadable or has no `Hugepagesize` line.
pub const DEFAULT_HUGE_PAGE_SIZE: usize = 2 << 20;

/// The kernel's default huge page size in bytes, read once per process.
#[cfg(target_os = "linux")]
pub fn huge_page_size() -> usize {
    static SIZE: OnceLock<usize> = OnceLock::new();
    *SIZE.get_or_init(|| match std::fs::read_to_string("/proc/meminfo") {
        Ok(text) => parse_huge_page_size(&text).unwrap_or_else(|| {
            log::debug!(
                "no Hugepagesize in /proc/meminfo; assuming {} bytes",
                DEFAULT_HUGE_PAGE_SIZE
            );
            DEFAULT_HUGE_PAGE_SIZE
        }),
        Err(e) => {
            log::debug!(
                "reading /proc/meminfo failed ({}); assuming {}-byte huge pages",
                e,
                DEFAULT_HUGE_PAGE_SIZE
            );
            DEFAULT_HUGE_PAGE_SIZE
        }
    })
}

#[cfg(not(target_os = "linux"))]
pub fn huge_page_size() -> usize {
    DEFAULT_HUGE_PAGE_SIZE
}

/// Parses `Hugepagesize:    2048 kB` out of `/proc/meminfo` text.
///
/// Returns `None` for a missing line, an unknown unit, or a size that is not
/// a power of two.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_huge_page_size(meminfo: &str) -> Option<usize> {
    let rest = meminfo
        .lines()
        .find_map(|line| line.strip_prefix("Hugepagesize:"))?;
    let mut fields = rest.split_whitespace();
    let value: usize = fields.next()?.parse().ok()?;
    let bytes = match fields.next() {
        Some("kB") => value.checked_mul(1024)?,
        None => value,
        Some(_) => return None,
    };
    bytes.is_power_of_two().then_some(bytes)
}

// ============================================================================
// Portable fallback
// ============================================================================

/// Fallback that never touches OS-specific APIs.
///
/// Affinity requests fail with `Unsupported` (callers log and continue);
/// memory comes from the global allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct PortablePlatform;

impl Platform for PortablePlatform {
    fn name(&self) -> &'static str {
        "portable"
    }

    fn pin_current_thread(&self, _cores: &CpuSet) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "portable platform does not pin threads",
        ))
    }

    fn allocate_large(&self, _bytes: usize) -> io::Result<Region> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "portable platform has no large-page allocator",
        ))
    }

    fn allocate_standard(&self, bytes: usize, _hint: PageHint) -> io::Result<Region> {
        Region::heap(bytes)
    }
}

/// Selects the best platform implementation for this process.
///
/// Native is chosen when the process can read its own affinity mask; anything
/// else (non-Linux, seccomp-restricted sandboxes) gets the portable fallback.
pub fn probe() -> Box<dyn Platform> {
    match allowed_cpus() {
        Ok(set) if set.count() > 0 => {
            log::debug!("platform probe: native, allowed cpus {}", set);
            Box::new(NativePlatform)
        }
        Ok(_) => {
            log::warn!("platform probe: empty affinity mask, using portable platform");
            Box::new(PortablePlatform)
        }
        Err(e) => {
            log::info!("platform probe: affinity unavailable ({}), using portable platform", e);
            Box::new(PortablePlatform)
        }
    }
}
