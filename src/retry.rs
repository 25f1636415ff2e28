//! Retry policy engine for the device connection
//!
//! A closed set of policy variants sharing one pure decision function.
//! Policies are selected at configuration time and swappable per connection;
//! a swap takes effect on the next evaluation only.

use crate::fault::ErrorKind;
use rand::Rng;
use std::time::Duration;

/// Outcome of a retry evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then attempt again
    RetryAfter(Duration),
    /// Stop retrying and surface the failure
    GiveUp,
}

/// Pluggable retry policy for connection attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Never retry: any failure is final
    NoRetry,
    /// Retry at a fixed interval up to `max_retries` attempts
    FixedInterval {
        interval: Duration,
        max_retries: u32,
    },
    /// Exponential backoff with additive jitter, capped at `max_backoff`,
    /// giving up once `max_elapsed` has passed since the first failure
    ExponentialBackoffWithJitter {
        min_backoff: Duration,
        max_backoff: Duration,
        max_elapsed: Duration,
    },
}

impl RetryPolicy {
    /// Decide whether to retry after the `attempt_count`-th failed attempt.
    ///
    /// `attempt_count` is 1 on the first failure. `elapsed` measures time
    /// since the first failure of the current outage. Non-transient error
    /// kinds are an immediate `GiveUp` for every variant - a certificate or
    /// authentication failure must never enter a retry loop.
    pub fn should_retry(
        &self,
        kind: ErrorKind,
        is_transient: bool,
        attempt_count: u32,
        elapsed: Duration,
    ) -> RetryDecision {
        if !is_transient || kind == ErrorKind::TlsAuthenticationFailure {
            return RetryDecision::GiveUp;
        }

        match self {
            RetryPolicy::NoRetry => RetryDecision::GiveUp,

            RetryPolicy::FixedInterval {
                interval,
                max_retries,
            } => {
                if attempt_count > *max_retries {
                    RetryDecision::GiveUp
                } else {
                    RetryDecision::RetryAfter(*interval)
                }
            }

            RetryPolicy::ExponentialBackoffWithJitter {
                min_backoff,
                max_backoff,
                max_elapsed,
            } => {
                if elapsed >= *max_elapsed {
                    return RetryDecision::GiveUp;
                }
                let delay = backoff_with_jitter(*min_backoff, *max_backoff, attempt_count);
                RetryDecision::RetryAfter(delay)
            }
        }
    }

    /// Whether this policy will ever schedule a reconnect
    pub fn retries(&self) -> bool {
        !matches!(self, RetryPolicy::NoRetry)
    }
}

/// Base delay doubles per attempt; jitter only ever adds (up to a quarter of
/// the base) so successive delays are non-decreasing until capped.
fn backoff_with_jitter(min_backoff: Duration, max_backoff: Duration, attempt_count: u32) -> Duration {
    let min_ms = min_backoff.as_millis() as u64;
    let max_ms = max_backoff.as_millis() as u64;

    let exponent = attempt_count.saturating_sub(1).min(32);
    let base_ms = min_ms
        .saturating_mul(1u64 << exponent)
        .min(max_ms)
        .max(1);

    let jitter_cap = base_ms / 4;
    let jitter_ms = if jitter_cap == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_cap)
    };

    Duration::from_millis(base_ms.saturating_add(jitter_ms).min(max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TRANSIENT: (ErrorKind, bool) = (ErrorKind::NetworkTimeout, true);

    #[test]
    fn test_no_retry_always_gives_up() {
        let policy = RetryPolicy::NoRetry;
        assert_eq!(
            policy.should_retry(TRANSIENT.0, TRANSIENT.1, 1, Duration::ZERO),
            RetryDecision::GiveUp
        );
        assert_eq!(
            policy.should_retry(TRANSIENT.0, TRANSIENT.1, 100, Duration::from_secs(1)),
            RetryDecision::GiveUp
        );
        assert!(!policy.retries());
    }

    #[test]
    fn test_fixed_interval_respects_max_retries() {
        let policy = RetryPolicy::FixedInterval {
            interval: Duration::from_millis(250),
            max_retries: 3,
        };
        for attempt in 1..=3 {
            assert_eq!(
                policy.should_retry(TRANSIENT.0, TRANSIENT.1, attempt, Duration::ZERO),
                RetryDecision::RetryAfter(Duration::from_millis(250))
            );
        }
        assert_eq!(
            policy.should_retry(TRANSIENT.0, TRANSIENT.1, 4, Duration::ZERO),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_tls_failure_never_retried_by_any_policy() {
        let policies = [
            RetryPolicy::NoRetry,
            RetryPolicy::FixedInterval {
                interval: Duration::from_millis(10),
                max_retries: 100,
            },
            RetryPolicy::ExponentialBackoffWithJitter {
                min_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_secs(1),
                max_elapsed: Duration::from_secs(3600),
            },
        ];
        for policy in policies {
            assert_eq!(
                policy.should_retry(ErrorKind::TlsAuthenticationFailure, false, 1, Duration::ZERO),
                RetryDecision::GiveUp
            );
        }
    }

    #[test]
    fn test_non_transient_rejection_never_retried() {
        let policy = RetryPolicy::ExponentialBackoffWithJitter {
            min_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
            max_elapsed: Duration::from_secs(3600),
        };
        assert_eq!(
            policy.should_retry(ErrorKind::ServerRejected, false, 1, Duration::ZERO),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_exponential_gives_up_after_max_elapsed() {
        let policy = RetryPolicy::ExponentialBackoffWithJitter {
            min_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
            max_elapsed: Duration::from_secs(60),
        };
        assert!(matches!(
            policy.should_retry(TRANSIENT.0, TRANSIENT.1, 5, Duration::from_secs(30)),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(
            policy.should_retry(TRANSIENT.0, TRANSIENT.1, 5, Duration::from_secs(60)),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_backoff_delay_capped_at_max() {
        let max_backoff = Duration::from_millis(500);
        for attempt in 1..40 {
            let delay = backoff_with_jitter(Duration::from_millis(50), max_backoff, attempt);
            assert!(delay <= max_backoff, "attempt {attempt} exceeded cap: {delay:?}");
        }
    }

    proptest! {
        /// Successive delays are non-decreasing up to the configured maximum,
        /// for any jitter draw.
        #[test]
        fn prop_backoff_non_decreasing(min_ms in 1u64..500, cap_mult in 1u64..64) {
            let min_backoff = Duration::from_millis(min_ms);
            let max_backoff = Duration::from_millis(min_ms * cap_mult);

            let mut previous = Duration::ZERO;
            for attempt in 1..24 {
                let delay = backoff_with_jitter(min_backoff, max_backoff, attempt);
                prop_assert!(delay >= previous,
                    "attempt {}: {:?} < previous {:?}", attempt, delay, previous);
                prop_assert!(delay <= max_backoff);
                previous = delay;
            }
        }

        /// The exponential policy eventually gives up once max_elapsed passes.
        #[test]
        fn prop_exponential_eventually_gives_up(elapsed_secs in 0u64..1000) {
            let policy = RetryPolicy::ExponentialBackoffWithJitter {
                min_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_secs(1),
                max_elapsed: Duration::from_secs(500),
            };
            let decision = policy.should_retry(
                ErrorKind::NetworkTimeout, true, 3, Duration::from_secs(elapsed_secs));
            if elapsed_secs >= 500 {
                prop_assert_eq!(decision, RetryDecision::GiveUp);
            } else {
                prop_assert!(matches!(decision, RetryDecision::RetryAfter(_)));
            }
        }
    }
}
