//! Randomized pointer-chase array construction and cycle analysis.
//!
//! # Layout
//!
//! The latency region is viewed as `u32` words. One *cell* lives at the start
//! of every `stride`-byte line (64 bytes = 16 words); the remaining words of
//! each line are unused. A cell holds the word offset of the next cell, so the
//! prober's chase is a plain indexed load:
//!
//! ```text
//!   words: [ c0 . . . | c1 . . . | c2 . . . | ... ]
//!            |            ^
//!            +------------+   words[0] == 16  (cell 0 -> cell 1)
//! ```
//!
//! Every cell offset appears exactly once, so the array is a permutation of
//! cells. The interesting property is how that permutation decomposes into
//! cycles: a chase that starts at cell 0 only ever touches cell 0's cycle.
//! If that cycle is short, the working set collapses into cache and the
//! "DRAM latency" figure is really an L2 figure.
//!
//! # Shuffles
//!
//! Both start from the identity and walk `i` from the last cell down to 1,
//! swapping cell `i` with a drawn cell `j < i`:
//!
//! | Kind | Draw for `i` |
//! |------|--------------|
//! | [`ShuffleKind::Literal`] | `j = 0` if `i == 1`, else uniform `[0, i - 1)` |
//! | [`ShuffleKind::Sattolo`] | uniform `[0, i)` |
//!
//! `Literal` reproduces the historical tool's draw, which excludes the slot
//! directly below `i`. Any swap sequence with `j < i` yields a single n-cycle,
//! so both kinds cover every cell; `Literal` just samples the cyclic
//! permutations non-uniformly. Use [`PermutationArray::main_cycle_coverage`]
//! to check a built array rather than trusting either argument.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::platform::{Region, CACHE_LINE};
use crate::rng::XorShift64;

const WORD: usize = std::mem::size_of::<u32>();

/// Which shuffle builds the chase order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShuffleKind {
    /// The historical draw that skips the immediately preceding slot.
    #[default]
    Literal,
    /// Sattolo's algorithm; one cycle through every cell.
    Sattolo,
}

impl ShuffleKind {
    /// Index to swap with cell `i` (`i >= 1`).
    #[inline]
    fn draw(self, rng: &mut XorShift64, i: usize) -> usize {
        match self {
            Self::Literal => {
                if i == 1 {
                    0
                } else {
                    rng.next_usize(i - 1)
                }
            }
            Self::Sattolo => rng.next_usize(i),
        }
    }
}

impl fmt::Display for ShuffleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Literal => "literal",
            Self::Sattolo => "sattolo",
        })
    }
}

impl FromStr for ShuffleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "literal" => Ok(Self::Literal),
            "sattolo" => Ok(Self::Sattolo),
            other => Err(format!(
                "unknown shuffle '{}'; expected 'literal' or 'sattolo'",
                other
            )),
        }
    }
}

/// The pointer-chase array.
///
/// Read-only once built; the prober borrows it for the timed loop.
pub struct PermutationArray {
    region: Region,
    stride_words: usize,
    cells: usize,
}

impl PermutationArray {
    /// Largest region (bytes) whose word offsets fit in a `u32`.
    pub const MAX_BYTES: usize = (u32::MAX as usize + 1) * WORD;

    /// Builds the chase order inside `region`.
    ///
    /// `stride` is the distance between cells in bytes (normally
    /// [`CACHE_LINE`]); it is rounded down to whole words, minimum one.
    ///
    /// # Errors
    ///
    /// The region must hold at least one cell and be addressable with `u32`
    /// word offsets.
    ///
    /// # Performance
    ///
    /// One RNG draw and one random swap per cell; a 1 GiB region (16M cells)
    /// is dominated by the swaps' cache misses.
    pub fn build(
        mut region: Region,
        stride: usize,
        kind: ShuffleKind,
        rng: &mut XorShift64,
    ) -> Result<Self, ConfigError> {
        let stride_words = (stride / WORD).max(1);
        let bytes = region.len();
        if bytes > Self::MAX_BYTES {
            return Err(ConfigError::LatencyRegionTooLarge {
                bytes,
                max: Self::MAX_BYTES,
            });
        }
        let cells = region.words().len() / stride_words;
        if cells == 0 {
            return Err(ConfigError::LatencyRegionTooSmall {
                bytes,
                min: stride_words * WORD,
            });
        }

        let words = region.words_mut();
        for cell in 0..cells {
            let at = cell * stride_words;
            words[at] = at as u32;
        }
        for i in (1..cells).rev() {
            let j = kind.draw(rng, i);
            words.swap(i * stride_words, j * stride_words);
        }

        Ok(Self {
            region,
            stride_words,
            cells,
        })
    }

    /// Heap-backed convenience constructor with a cache-line stride.
    pub fn with_len(bytes: usize, kind: ShuffleKind, seed: u64) -> Result<Self, ConfigError> {
        let region = Region::heap(bytes).map_err(|_| ConfigError::LatencyRegionTooSmall {
            bytes,
            min: CACHE_LINE,
        })?;
        Self::build(region, CACHE_LINE, kind, &mut XorShift64::new(seed))
    }

    /// The raw word array the chase runs over.
    #[inline]
    pub fn words(&self) -> &[u32] {
        self.region.words()
    }

    #[inline]
    pub fn cells(&self) -> usize {
        self.cells
    }

    #[inline]
    pub fn stride_words(&self) -> usize {
        self.stride_words
    }

    /// Size of the chase region in bytes.
    #[inline]
    pub fn len_bytes(&self) -> usize {
        self.region.len()
    }

    #[inline]
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Word offset stored in `cell`.
    #[inline]
    pub fn next_offset(&self, cell: usize) -> u32 {
        self.words()[cell * self.stride_words]
    }

    /// Cell values in cell order (word offsets).
    pub fn cell_values(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.cells).map(move |c| self.next_offset(c))
    }

    /// True if every cell offset appears exactly once.
    pub fn is_permutation(&self) -> bool {
        let mut seen = vec![false; self.cells];
        for value in self.cell_values() {
            let value = value as usize;
            if value % self.stride_words != 0 {
                return false;
            }
            let cell = value / self.stride_words;
            if cell >= self.cells || seen[cell] {
                return false;
            }
            seen[cell] = true;
        }
        true
    }

    /// Length of the cycle containing cell 0, i.e. the number of distinct
    /// cells a chase starting at offset 0 visits.
    ///
    /// Returns `None` if the walk does not return to cell 0 within `cells`
    /// steps (only possible if the array is not a permutation).
    pub fn cycle_len_from_start(&self) -> Option<usize> {
        let words = self.words();
        let mut current = words[0] as usize;
        let mut len = 1;
        while current != 0 {
            if len >= self.cells {
                return None;
            }
            current = words[current] as usize;
            len += 1;
        }
        Some(len)
    }

    /// Lengths of every cycle, largest first. Sums to `cells()` for a
    /// permutation.
    pub fn cycle_lengths(&self) -> Vec<usize> {
        let words = self.words();
        let mut visited = vec![false; self.cells];
        let mut lengths = Vec::new();
        for start in 0..self.cells {
            if visited[start] {
                continue;
            }
            let mut cell = start;
            let mut len = 0;
            while !visited[cell] {
                visited[cell] = true;
                len += 1;
                cell = words[cell * self.stride_words] as usize / self.stride_words;
                if cell >= self.cells {
                    break;
                }
            }
            lengths.push(len);
        }
        lengths.sort_unstable_by(|a, b| b.cmp(a));
        lengths
    }

    /// Fraction of cells on cell 0's cycle, in `(0, 1]`.
    pub fn main_cycle_coverage(&self) -> f64 {
        let len = self.cycle_len_from_start().unwrap_or(0);
        len as f64 / self.cells as f64
    }

    /// True if a chase from cell 0 covers less than `threshold` of the cells.
    pub fn is_degenerate(&self, threshold: f64) -> bool {
        self.main_cycle_coverage() < threshold
    }
}

impl fmt::Debug for PermutationArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermutationArray")
            .field("cells", &self.cells)
            .field("stride_words", &self.stride_words)
            .field("region", &self.region)
            .finish()
    }
}
