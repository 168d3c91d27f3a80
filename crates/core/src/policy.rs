//! Retry and backoff policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff configuration, fixed per job at enqueue time.
///
/// The delay before retry attempt `n` (1-indexed) is
/// `base_delay * multiplier^(n - 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor between successive retries.
    pub multiplier: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            multiplier: 2,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, multiplier: u32) -> Self {
        Self {
            base_delay,
            multiplier,
        }
    }

    /// Delay to wait after the given failed attempt (1-indexed).
    ///
    /// Saturates instead of overflowing for absurd attempt counts.
    pub fn delay_for_attempt(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1);
        let factor = (self.multiplier as u64)
            .checked_pow(exponent)
            .unwrap_or(u64::MAX);
        let millis = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis)
    }
}

/// What to do with a job whose processor just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return the job to waiting, claimable after `delay`.
    Retry { delay: Duration },
    /// The retry budget is exhausted; the failure is terminal.
    Fail,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_per_attempt() {
        let policy = BackoffPolicy::new(Duration::from_millis(1000), 2);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(8000));
    }

    #[test]
    fn multiplier_one_is_a_fixed_delay() {
        let policy = BackoffPolicy::new(Duration::from_secs(5), 1);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(5));
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        let policy = BackoffPolicy::new(Duration::from_secs(30), 2);
        // Must not panic; exact value is irrelevant once it saturates.
        let _ = policy.delay_for_attempt(u32::MAX);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 500,
                ..ProptestConfig::default()
            })]

            /// Property: delays never shrink as attempts grow.
            #[test]
            fn backoff_is_monotonic(
                base_ms in 1u64..60_000,
                multiplier in 1u32..8,
                attempt in 1u32..20
            ) {
                let policy = BackoffPolicy::new(Duration::from_millis(base_ms), multiplier);
                prop_assert!(
                    policy.delay_for_attempt(attempt + 1) >= policy.delay_for_attempt(attempt)
                );
            }

            /// Property: the first retry always waits exactly the base delay.
            #[test]
            fn first_retry_is_base_delay(
                base_ms in 1u64..60_000,
                multiplier in 1u32..8
            ) {
                let policy = BackoffPolicy::new(Duration::from_millis(base_ms), multiplier);
                prop_assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(base_ms));
            }
        }
    }
}
