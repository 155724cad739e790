//! Property-based tests for stream metrics.

use proptest::prelude::*;
use std::time::Duration;
use studio_inference::{MetricsTracker, Usage};
use tokio::time::Instant;

proptest! {
    #[test]
    fn test_decoded_tokens_match_final_count(
        prompt in 0u64..4096,
        steps in proptest::collection::vec((0u64..4, 0u64..250), 1..40),
    ) {
        let t0 = Instant::now();
        let mut tracker = MetricsTracker::started_at(t0);
        let mut count = 0u64;
        let mut elapsed = 0u64;
        for (advance, gap_ms) in steps {
            count += advance;
            elapsed += gap_ms;
            tracker.observe_at(
                Usage { prompt_tokens: prompt, completion_tokens: count },
                t0 + Duration::from_millis(elapsed),
            );
        }

        let m = tracker.finish();
        prop_assert_eq!(m.tokens_decoded, count);
        if count > 0 {
            prop_assert_eq!(m.tokens_prefilled, prompt);
            prop_assert_eq!(m.context_length, prompt + count);
            prop_assert!(m.ttft.is_some());
        } else {
            prop_assert!(m.ttft.is_none());
        }
        prop_assert!(m.tpot_min <= m.tpot_median);
        prop_assert!(m.tpot_median <= m.tpot_max);
        prop_assert!(m.tpot_p95 <= m.tpot_p99);
        prop_assert!(m.tpot_p99 <= m.tpot_max);
        prop_assert!(m.tpot >= 0.0);
    }
}
