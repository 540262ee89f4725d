//! Owned memory regions for the latency array and saturator buffers.
//!
//! A [`Region`] is a zero-initialized, at least cache-line-aligned block of
//! bytes. Two backings exist:
//!
//! | Backing | Alignment | Source |
//! |---------|-----------|--------|
//! | `Mapped` | page (or huge page) | anonymous `mmap` via `memmap2` |
//! | `Heap` | 64 bytes | `std::alloc::alloc_zeroed` |
//!
//! Both hand out `&[u8]`, `&[u32]` and `&[u64]` views. Word views are sound
//! because every backing is at least 64-byte aligned and lengths are rounded
//! to whole cache lines at allocation time.
//!
//! Regions are released on drop; a step never reuses a region from a previous
//! step.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io;
use std::ptr::NonNull;

use memmap2::MmapMut;

/// Cache line size assumed by the chase layout and bandwidth accounting.
pub const CACHE_LINE: usize = 64;

/// Largest region any backing can hold: `Layout` and `mmap` both cap sizes
/// at `isize::MAX`, truncated here to a whole cache line.
pub const MAX_REGION_BYTES: usize = isize::MAX as usize & !(CACHE_LINE - 1);

/// Page size class a region ended up with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageKind {
    /// Explicit huge pages (`MAP_HUGETLB`).
    Huge,
    /// Default pages, optionally with a transparent-huge-page hint.
    Standard,
}

/// Owned, cache-line-aligned byte region.
pub struct Region {
    backing: Backing,
    len: usize,
    pages: PageKind,
}

enum Backing {
    Mapped(MmapMut),
    Heap(AlignedBuffer),
}

impl Region {
    /// Wraps `map`, exposing at most its first `len` bytes (truncated to a
    /// whole cache line). The mapping itself stays whole until drop.
    pub(crate) fn from_mmap(map: MmapMut, len: usize, pages: PageKind) -> Self {
        let len = len.min(map.len());
        let len = len - len % CACHE_LINE;
        Self {
            backing: Backing::Mapped(map),
            len,
            pages,
        }
    }

    /// Allocates `bytes` (rounded up to a cache line) from the global allocator.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` when the allocator returns null, `InvalidInput` for a
    /// zero or unrepresentable length.
    pub fn heap(bytes: usize) -> io::Result<Self> {
        let buf = AlignedBuffer::zeroed(round_to_line(bytes)?)?;
        Ok(Self {
            len: buf.len,
            backing: Backing::Heap(buf),
            pages: PageKind::Standard,
        })
    }

    /// Length in bytes (a multiple of [`CACHE_LINE`]).
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn pages(&self) -> PageKind {
        self.pages
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped(map) => &map[..self.len],
            Backing::Heap(buf) => buf.as_slice(),
        }
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        match &mut self.backing {
            Backing::Mapped(map) => &mut map[..len],
            Backing::Heap(buf) => buf.as_mut_slice(),
        }
    }

    /// View as `u32` words.
    ///
    /// # Performance
    ///
    /// A reinterpreting cast; no copy, O(1).
    #[inline]
    pub fn words(&self) -> &[u32] {
        let bytes = self.as_bytes();
        // SAFETY: backing is >= 64-byte aligned and len is a multiple of 64,
        // u32 has no invalid bit patterns, and the borrow ties the view's
        // lifetime to `self`.
        unsafe { std::slice::from_raw_parts(bytes.as_ptr().cast::<u32>(), bytes.len() / 4) }
    }

    /// Mutable `u32` view; the chase builder writes offsets through it.
    ///
    /// # Panics
    ///
    /// Never: the backing is line-aligned and `len` is a multiple of
    /// [`CACHE_LINE`], so the cast always fits.
    #[inline]
    pub fn words_mut(&mut self) -> &mut [u32] {
        let bytes = self.as_bytes_mut();
        let len = bytes.len() / 4;
        // SAFETY: as in `words`, with exclusive access through `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr().cast::<u32>(), len) }
    }

    /// View as `u64` words (the bandwidth kernels' unit of reading).
    #[inline]
    pub fn qwords(&self) -> &[u64] {
        let bytes = self.as_bytes();
        // SAFETY: alignment and length argument as in `words`.
        unsafe { std::slice::from_raw_parts(bytes.as_ptr().cast::<u64>(), bytes.len() / 8) }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backing = match self.backing {
            Backing::Mapped(_) => "mapped",
            Backing::Heap(_) => "heap",
        };
        f.debug_struct("Region")
            .field("backing", &backing)
            .field("len", &self.len)
            .field("pages", &self.pages)
            .finish()
    }
}

/// Rounds a requested length up to a whole cache line, rejecting zero.
pub(crate) fn round_to_line(bytes: usize) -> io::Result<usize> {
    if bytes == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "region length must be non-zero",
        ));
    }
    bytes.checked_next_multiple_of(CACHE_LINE).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("region length {} overflows when rounded to a cache line", bytes),
        )
    })
}

/// Rounds a requested length up to a whole number of `page`-byte pages.
///
/// `hugetlb` mappings must be created and unmapped in whole huge pages; a
/// shorter length makes `munmap` fail and the mapping outlives its region.
pub(crate) fn round_to_page(bytes: usize, page: usize) -> io::Result<usize> {
    let bytes = round_to_line(bytes)?;
    bytes.checked_next_multiple_of(page.max(CACHE_LINE)).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("region length {} overflows when rounded to {}-byte pages", bytes, page),
        )
    })
}

// ============================================================================
// Aligned heap allocation
// ============================================================================

/// RAII cache-line-aligned heap allocation.
///
/// `Vec<T>` only guarantees `align_of::<T>()`; the chase layout needs cells to
/// sit on line boundaries, so the allocation is made by hand.
///
/// # Safety
/// - `ptr` is non-null and valid for `len` bytes for the buffer's lifetime
/// - memory is zero-initialized on construction
struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: AlignedBuffer uniquely owns its allocation; no interior sharing.
unsafe impl Send for AlignedBuffer {}
// SAFETY: shared access only hands out `&[u8]`.
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    fn zeroed(len: usize) -> io::Result<Self> {
        let layout = Self::layout(len)?;
        // SAFETY: layout has non-zero size (round_to_line rejects zero).
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("allocator returned null for {} bytes", len),
            )
        })?;
        Ok(Self { ptr, len })
    }

    fn layout(len: usize) -> io::Result<Layout> {
        Layout::from_size_align(len, CACHE_LINE)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: see type-level invariants.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: see type-level invariants; `&mut self` gives exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // Layout was valid at construction, so it is valid here.
        if let Ok(layout) = Self::layout(self.len) {
            // SAFETY: ptr came from alloc_zeroed with this exact layout.
            unsafe { dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_region_is_zeroed_and_aligned() {
        let region = Region::heap(1000).unwrap();
        assert_eq!(region.len(), 1024);
        assert_eq!(region.pages(), PageKind::Standard);
        assert_eq!(region.as_bytes().as_ptr() as usize % CACHE_LINE, 0);
        assert!(region.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn word_views_cover_the_region() {
        let mut region = Region::heap(256).unwrap();
        assert_eq!(region.words().len(), 64);
        assert_eq!(region.qwords().len(), 32);

        region.words_mut()[3] = 0xAABB_CCDD;
        assert_eq!(region.words()[3], 0xAABB_CCDD);
    }

    #[test]
    fn zero_length_is_rejected() {
        let err = Region::heap(0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn absurd_length_fails_cleanly() {
        assert!(Region::heap(usize::MAX - 3).is_err());
    }

    #[test]
    fn mapped_region_truncates_to_whole_lines() {
        let map = memmap2::MmapOptions::new().len(4096 + 10).map_anon().unwrap();
        let region = Region::from_mmap(map, usize::MAX, PageKind::Standard);
        assert_eq!(region.len(), 4096);
        assert_eq!(region.words().len(), 1024);
    }

    #[test]
    fn mapped_region_exposes_only_the_requested_view() {
        let map = memmap2::MmapOptions::new().len(8192).map_anon().unwrap();
        let mut region = Region::from_mmap(map, 3000, PageKind::Standard);
        assert_eq!(region.len(), 2944);
        assert_eq!(region.as_bytes_mut().len(), 2944);
        assert_eq!(region.qwords().len(), 2944 / 8);
    }

    #[test]
    fn page_rounding_covers_whole_pages() {
        let huge = 2 << 20;
        assert_eq!(round_to_page(3000 * 1024, huge).unwrap(), 4 << 20);
        assert_eq!(round_to_page(huge, huge).unwrap(), huge);
        assert_eq!(round_to_page(1, huge).unwrap(), huge);
        assert_eq!(round_to_page(100, 0).unwrap(), 128);
        assert!(round_to_page(0, huge).is_err());
        assert!(round_to_page(usize::MAX - 100, huge).is_err());
    }
}
