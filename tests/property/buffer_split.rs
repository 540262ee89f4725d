//! Property tests for per-saturator buffer sizing.

use proptest::prelude::*;

use loaded_latency::{TestConfig, CACHE_LINE};

proptest! {
    #[test]
    fn split_covers_total_with_at_most_a_line_of_slack(
        total in 1usize..=u32::MAX as usize,
        threads in 1usize..256,
    ) {
        let cfg = TestConfig {
            bandwidth_memory_bytes: total,
            ..TestConfig::small()
        };
        let per = cfg.per_thread_buffer_bytes(threads);
        prop_assert_eq!(per % CACHE_LINE, 0);
        prop_assert!(per >= total.div_ceil(threads));
        prop_assert!(per < total.div_ceil(threads) + CACHE_LINE);
        prop_assert!(per * threads >= total);
    }

    #[test]
    fn zero_threads_never_divides(total in any::<usize>()) {
        let cfg = TestConfig {
            bandwidth_memory_bytes: total,
            ..TestConfig::small()
        };
        prop_assert_eq!(cfg.per_thread_buffer_bytes(0), 0);
    }

    #[test]
    fn any_total_splits_without_overflow(
        total in any::<usize>(),
        threads in 1usize..256,
    ) {
        let cfg = TestConfig {
            bandwidth_memory_bytes: total,
            ..TestConfig::small()
        };
        let per = cfg.per_thread_buffer_bytes(threads);
        prop_assert!(per >= total.div_ceil(threads));
        prop_assert!(per % CACHE_LINE == 0 || per == usize::MAX);
    }
}
