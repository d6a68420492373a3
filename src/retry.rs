//! Retry policy configuration.

use std::time::Duration;

/// Policy for retrying operations that fail transiently.
///
/// `max_attempts` counts total executions, including the first. A policy
/// with `max_attempts: 3` allows two retries after the initial attempt.
#[derive(Debug, Clone)]
pub enum RetryPolicy {
    /// No retries, fail on the first transient error.
    None,

    /// Fixed delay between attempts.
    Fixed {
        /// Maximum number of execution attempts, including the first.
        max_attempts: u32,
        /// Delay between attempts.
        delay: Duration,
    },

    /// Exponential backoff between attempts.
    Exponential {
        /// Maximum number of execution attempts, including the first.
        max_attempts: u32,
        /// Delay before the first retry (doubles each retry).
        initial_delay: Duration,
        /// Per-delay cap.
        max_delay: Duration,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::None
    }
}

impl RetryPolicy {
    /// Create an exponential backoff policy with sensible defaults.
    ///
    /// - Initial delay: 500 milliseconds
    /// - Per-delay cap: 10 seconds
    pub fn exponential(max_attempts: u32) -> Self {
        Self::Exponential {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }

    /// Create a fixed delay policy.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::Fixed { max_attempts, delay }
    }

    /// Calculate the delay before executing `attempt` (attempts are
    /// 1-indexed, so the smallest meaningful input is 2).
    ///
    /// Returns `None` if `attempt` exceeds the attempt budget.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt < 2 {
            return None;
        }
        match self {
            Self::None => None,
            Self::Fixed { max_attempts, delay } => {
                if attempt <= *max_attempts {
                    Some(*delay)
                } else {
                    None
                }
            }
            Self::Exponential {
                max_attempts,
                initial_delay,
                max_delay,
            } => {
                if attempt <= *max_attempts {
                    // initial_delay * 2^(retries so far - 1), capped
                    let multiplier = 2u64.saturating_pow(attempt.saturating_sub(2));
                    let delay_ms = (initial_delay.as_millis() as u64).saturating_mul(multiplier);
                    let delay = Duration::from_millis(delay_ms.min(max_delay.as_millis() as u64));
                    Some(delay)
                } else {
                    None
                }
            }
        }
    }

    /// Returns the maximum number of attempts allowed.
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::None => 1,
            Self::Fixed { max_attempts, .. } => *max_attempts,
            Self::Exponential { max_attempts, .. } => *max_attempts,
        }
    }
}

/// Trim `delay` so that `waited + delay` stays under `ceiling`.
///
/// Returns `None` once the cumulative backoff budget for a task is spent,
/// which ends retrying even when attempts remain.
pub fn clamp_to_ceiling(delay: Duration, waited: Duration, ceiling: Duration) -> Option<Duration> {
    let remaining = ceiling.checked_sub(waited)?;
    if remaining.is_zero() {
        return None;
    }
    Some(delay.min(remaining))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_policy() {
        let policy = RetryPolicy::None;
        assert_eq!(policy.delay_for_attempt(2), None);
        assert_eq!(policy.max_attempts(), 1);
    }

    #[test]
    fn test_fixed_policy() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_for_attempt(3), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_for_attempt(4), None);
    }

    #[test]
    fn test_exponential_policy() {
        let policy = RetryPolicy::Exponential {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        };

        assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for_attempt(3), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_for_attempt(4), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay_for_attempt(5), Some(Duration::from_secs(8)));
        assert_eq!(policy.delay_for_attempt(6), None);
    }

    #[test]
    fn test_exponential_caps_at_max() {
        let policy = RetryPolicy::Exponential {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        };

        // 2^5 = 32 seconds, but capped at 10
        assert_eq!(policy.delay_for_attempt(7), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_first_attempt_has_no_delay() {
        let policy = RetryPolicy::exponential(3);
        assert_eq!(policy.delay_for_attempt(0), None);
        assert_eq!(policy.delay_for_attempt(1), None);
    }

    #[test]
    fn test_ceiling_trims_and_exhausts() {
        let ceiling = Duration::from_secs(60);

        // Plenty of budget left, delay passes through.
        assert_eq!(
            clamp_to_ceiling(Duration::from_secs(4), Duration::from_secs(10), ceiling),
            Some(Duration::from_secs(4))
        );

        // Partial budget left, delay is trimmed.
        assert_eq!(
            clamp_to_ceiling(Duration::from_secs(10), Duration::from_secs(55), ceiling),
            Some(Duration::from_secs(5))
        );

        // Budget spent, no more retries.
        assert_eq!(
            clamp_to_ceiling(Duration::from_secs(1), Duration::from_secs(60), ceiling),
            None
        );
        assert_eq!(
            clamp_to_ceiling(Duration::from_secs(1), Duration::from_secs(90), ceiling),
            None
        );
    }
}
