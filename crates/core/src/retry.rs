//! Retry policy: exponential backoff between delivery attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How delivery failures the adapter classifies as fatal are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Fatal delivery errors consume the whole retry budget at once so they
    /// surface in the failed-entry listing without waiting through backoff.
    #[default]
    FailFast,
    /// Every failure is retried until the budget is exhausted.
    Uniform,
}

/// Retry policy configuration.
///
/// The backoff doubles with every attempt: attempt 1 waits `base_delay`,
/// attempt 2 waits `2 * base_delay`, attempt 3 `4 * base_delay`, and so on,
/// capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Attempt budget given to new entries
    pub default_max_retries: u32,
    /// Treatment of fatal delivery errors
    pub failure_policy: FailurePolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(24 * 60 * 60),
            default_max_retries: 5,
            failure_policy: FailurePolicy::FailFast,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, max_delay: Duration, default_max_retries: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            default_max_retries,
            ..Default::default()
        }
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    /// Calculate delay after a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        // 2^31 minutes is far past any sane cap; clamp the shift before multiplying.
        let factor = 1u32 << (attempt - 1).min(31);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Check if another attempt is allowed after `attempts` have been made.
    pub fn should_retry(attempts: u32, max_retries: u32) -> bool {
        attempts < max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn minutes(n: u64) -> Duration {
        Duration::from_secs(n * 60)
    }

    #[test]
    fn exponential_backoff_doubles_from_one_minute() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_attempt(1), minutes(1));
        assert_eq!(policy.delay_for_attempt(2), minutes(2));
        assert_eq!(policy.delay_for_attempt(3), minutes(4));
        assert_eq!(policy.delay_for_attempt(4), minutes(8));
        assert_eq!(policy.delay_for_attempt(5), minutes(16));
    }

    #[test]
    fn attempt_zero_has_no_delay() {
        assert_eq!(RetryPolicy::default().delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::exponential(minutes(1), minutes(10), 20);

        assert_eq!(policy.delay_for_attempt(4), minutes(8));
        assert_eq!(policy.delay_for_attempt(5), minutes(10));
        assert_eq!(policy.delay_for_attempt(40), minutes(10));
    }

    #[test]
    fn should_retry_respects_budget() {
        assert!(RetryPolicy::should_retry(0, 3));
        assert!(RetryPolicy::should_retry(2, 3));
        assert!(!RetryPolicy::should_retry(3, 3));
        assert!(!RetryPolicy::should_retry(4, 3));
    }

    proptest! {
        #[test]
        fn backoff_never_shrinks(attempt in 1u32..64) {
            let policy = RetryPolicy::default();
            prop_assert!(policy.delay_for_attempt(attempt + 1) >= policy.delay_for_attempt(attempt));
        }

        #[test]
        fn backoff_doubles_below_cap(attempt in 1u32..10) {
            let policy = RetryPolicy::default();
            let this = policy.delay_for_attempt(attempt);
            let next = policy.delay_for_attempt(attempt + 1);
            prop_assert_eq!(next, this * 2);
        }
    }
}
