//! Property tests for permutation construction.
//!
//! Both shuffles must produce a permutation of cell offsets whose walk from
//! cell 0 visits every cell, for any seed and any region size.

use proptest::prelude::*;

use loaded_latency::{PermutationArray, ShuffleKind, CACHE_LINE};

fn kind_strategy() -> impl Strategy<Value = ShuffleKind> {
    prop_oneof![Just(ShuffleKind::Literal), Just(ShuffleKind::Sattolo)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn every_offset_appears_exactly_once(
        cells in 1usize..2048,
        seed in any::<u64>(),
        kind in kind_strategy(),
    ) {
        let array = PermutationArray::with_len(cells * CACHE_LINE, kind, seed).unwrap();
        prop_assert_eq!(array.cells(), cells);
        prop_assert!(array.is_permutation());

        let mut values: Vec<u32> = array.cell_values().collect();
        values.sort_unstable();
        let expected: Vec<u32> = (0..cells).map(|c| (c * array.stride_words()) as u32).collect();
        prop_assert_eq!(values, expected);
    }

    #[test]
    fn chase_from_start_covers_every_cell(
        cells in 1usize..2048,
        seed in any::<u64>(),
        kind in kind_strategy(),
    ) {
        let array = PermutationArray::with_len(cells * CACHE_LINE, kind, seed).unwrap();
        prop_assert_eq!(array.cycle_len_from_start(), Some(cells));
        prop_assert_eq!(array.cycle_lengths(), vec![cells]);
        prop_assert!(!array.is_degenerate(0.95));
    }

    #[test]
    fn same_seed_same_array(
        cells in 1usize..1024,
        seed in any::<u64>(),
        kind in kind_strategy(),
    ) {
        let a = PermutationArray::with_len(cells * CACHE_LINE, kind, seed).unwrap();
        let b = PermutationArray::with_len(cells * CACHE_LINE, kind, seed).unwrap();
        prop_assert_eq!(a.words(), b.words());
        prop_assert_eq!(a.cycle_lengths(), b.cycle_lengths());
    }
}
