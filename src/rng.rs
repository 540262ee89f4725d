//! Seeded generator behind the chase shuffle.
//!
//! XorShift64 is plenty to defeat hardware prefetchers and keeps every array
//! reproducible: a step's shuffle depends only on the run seed and the
//! step's thread count (see [`XorShift64::for_step`]).
//!
//! Bounded draws use a widening multiply with rejection rather than `%`.
//! Shuffling a 1 GiB region takes ~16M draws, enough for the division to
//! show up in build time.
//!
//! The type is `Clone` but deliberately not `Copy`; an accidental copy would
//! replay the same stream.

/// Golden-ratio increment; spreads step indices across the seed space.
const SEED_SPREAD: u64 = 0x9E3779B97F4A7C15;

/// XorShift64 stream (Marsaglia 13/7/17 triple, period 2^64 - 1).
#[derive(Clone, Debug)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    /// Zero would lock the generator at zero, so it is remapped.
    #[inline]
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { SEED_SPREAD } else { seed },
        }
    }

    /// Stream for the sweep step with `bandwidth_threads` saturators.
    pub fn for_step(seed: u64, bandwidth_threads: usize) -> Self {
        let spread = (bandwidth_threads as u64).wrapping_mul(SEED_SPREAD);
        Self::new(splitmix64(seed ^ spread))
    }

    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let mut s = self.state;
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        self.state = s;
        s
    }

    /// Uniform index in `0..upper`. `upper` must be non-zero.
    #[inline]
    pub fn next_usize(&mut self, upper: usize) -> usize {
        debug_assert!(upper != 0, "empty range");
        if upper & (upper - 1) == 0 {
            return self.next_u64() as usize & (upper - 1);
        }
        self.below(upper as u64) as usize
    }

    /// Multiply-high reduction; draws landing in the short tail are redrawn.
    #[inline]
    fn below(&mut self, upper: u64) -> u64 {
        let tail = upper.wrapping_neg() % upper;
        loop {
            let wide = u128::from(self.next_u64()) * u128::from(upper);
            if (wide as u64) >= tail {
                return (wide >> 64) as u64;
            }
        }
    }

    /// Raw state, logged so a surprising array can be rebuilt by hand.
    #[inline]
    pub fn state(&self) -> u64 {
        self.state
    }
}

impl Default for XorShift64 {
    fn default() -> Self {
        Self::new(0)
    }
}

/// SplitMix64 output function; decorrelates adjacent seeds.
#[inline]
fn splitmix64(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(SEED_SPREAD);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}
