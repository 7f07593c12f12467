// Retry policy: decides whether a failed fetch attempt is retried and after how long.
//
// Exponential backoff with jitter and a max delay cap; attempts are bounded both by
// count and by total elapsed time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngExt;

use crate::error::FetchError;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not counting the initial attempt).
    pub max_retries: u32,
    /// Base delay between retries. Actual delay = base * 2^attempt + jitter.
    pub base_delay: Duration,
    /// Hard cap on the computed delay to prevent unbounded growth.
    pub max_delay: Duration,
    /// Give up once this much time has passed since the first attempt.
    pub max_elapsed: Duration,
    /// When true, adds random jitter of [0, base_delay/2) to prevent thundering herd.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(5 * 60),
            jitter: true,
        }
    }
}

/// What the producer should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { after: Duration },
    GiveUp,
}

/// Retry bookkeeping for one in-flight download.
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Retries scheduled so far
    pub attempt: u32,
    pub last_error: Option<Arc<FetchError>>,
    pub next_delay: Option<Duration>,
    started_at: Instant,
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            last_error: None,
            next_delay: None,
            started_at: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicy {
    /// Record `error` in `state` and decide whether to try again.
    pub fn decide(&self, state: &mut RetryState, error: Arc<FetchError>) -> RetryDecision {
        let transient = error.is_transient();
        state.last_error = Some(error);
        state.next_delay = None;

        if !transient || state.attempt >= self.max_retries {
            return RetryDecision::GiveUp;
        }

        let delay = self.delay_for_attempt(state.attempt);
        if state.elapsed() + delay > self.max_elapsed {
            return RetryDecision::GiveUp;
        }

        state.attempt += 1;
        state.next_delay = Some(delay);
        RetryDecision::Retry { after: delay }
    }

    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // 2^attempt is computed with a checked shift so attempts >= 32 saturate.
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exp_delay = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);
        let capped = exp_delay.min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        // Jitter is limited so the final delay never exceeds `max_delay`.
        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        if jitter_range_ms == 0 {
            return capped;
        }

        let remaining_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(60),
            jitter: false,
        }
    }

    fn transient() -> Arc<FetchError> {
        Arc::new(FetchError::Connection {
            reason: "connection reset".to_string(),
        })
    }

    #[test]
    fn delay_respects_max_cap() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            max_elapsed: Duration::from_secs(60),
            jitter: false,
        };
        // attempt 10: 500ms * 2^10 = 512_000ms, should be capped to 5s
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn delay_with_jitter_does_not_exceed_max_cap() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(1),
            max_elapsed: Duration::from_secs(60),
            jitter: true,
        };

        for _ in 0..32 {
            assert!(policy.delay_for_attempt(10) <= Duration::from_secs(1));
        }
    }

    #[test]
    fn delay_without_jitter_is_deterministic() {
        let policy = policy(3);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn delay_with_jitter_adds_random_component() {
        let policy = RetryPolicy {
            jitter: true,
            ..policy(3)
        };
        let delay = policy.delay_for_attempt(0);
        // Base is 100ms, jitter range is [0, 50ms)
        assert!(delay >= Duration::from_millis(100));
        assert!(delay < Duration::from_millis(150));
    }

    #[test]
    fn transient_errors_retry_until_exhausted() {
        let policy = policy(2);
        let mut state = RetryState::new();

        assert_eq!(
            policy.decide(&mut state, transient()),
            RetryDecision::Retry {
                after: Duration::from_millis(100)
            }
        );
        assert_eq!(state.next_delay, Some(Duration::from_millis(100)));
        assert_eq!(
            policy.decide(&mut state, transient()),
            RetryDecision::Retry {
                after: Duration::from_millis(200)
            }
        );
        assert_eq!(policy.decide(&mut state, transient()), RetryDecision::GiveUp);
        assert_eq!(state.attempt, 2);
        assert!(state.last_error.is_some());
        assert_eq!(state.next_delay, None);
    }

    #[test]
    fn terminal_errors_give_up_immediately() {
        let policy = policy(5);
        let mut state = RetryState::new();
        let err = Arc::new(FetchError::NotFound {
            resource: "R1".to_string(),
        });

        assert_eq!(policy.decide(&mut state, err), RetryDecision::GiveUp);
        assert_eq!(state.attempt, 0);
    }

    #[test]
    fn elapsed_budget_forces_give_up() {
        let policy = RetryPolicy {
            max_elapsed: Duration::from_millis(50),
            ..policy(5)
        };
        let mut state = RetryState::new();

        // first delay (100ms) alone would overrun the 50ms budget
        assert_eq!(policy.decide(&mut state, transient()), RetryDecision::GiveUp);
    }
}
