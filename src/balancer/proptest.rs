//! Property-Based Tests for the Circuit Breaker

#![cfg(test)]

use std::time::Duration;

use proptest::prelude::*;
use tokio::time::Instant;

use super::circuit::{CircuitBreaker, CircuitState};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Within one cooldown the breaker opens exactly when a run of
    /// `threshold` consecutive failures has been seen, and stays open
    #[test]
    fn prop_opens_on_consecutive_failures(
        threshold in 1u32..6,
        outcomes in prop::collection::vec(any::<bool>(), 0..40),
    ) {
        let mut breaker = CircuitBreaker::new(threshold, Duration::from_secs(3600));
        let now = Instant::now();
        let mut run = 0u32;
        let mut opened = false;

        for success in outcomes {
            if success {
                breaker.record_success(now);
                run = 0;
            } else {
                breaker.record_failure(now);
                run += 1;
                opened |= run >= threshold;
            }
            prop_assert_eq!(breaker.consecutive_failures(), run);
            let expected = if opened { CircuitState::Open } else { CircuitState::Closed };
            prop_assert_eq!(breaker.state(), expected);
            prop_assert_eq!(breaker.allows(now), !opened);
        }
        prop_assert_eq!(breaker.times_opened(), u64::from(opened));
    }

    /// After the cooldown a single success closes the breaker again
    #[test]
    fn prop_recovers_after_cooldown(threshold in 1u32..6, cooldown_ms in 1u64..10_000) {
        let cooldown = Duration::from_millis(cooldown_ms);
        let mut breaker = CircuitBreaker::new(threshold, cooldown);
        let start = Instant::now();
        for _ in 0..threshold {
            breaker.record_failure(start);
        }
        prop_assert_eq!(breaker.state(), CircuitState::Open);
        prop_assert_eq!(breaker.effective_state(start + cooldown), CircuitState::HalfOpen);

        breaker.record_success(start + cooldown);
        prop_assert_eq!(breaker.state(), CircuitState::Closed);
        prop_assert_eq!(breaker.consecutive_failures(), 0);
    }
}
