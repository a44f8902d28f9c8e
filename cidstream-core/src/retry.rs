//! Shared retry policy for chunk fetches, host resolution and load retries.
//!
//! One policy object describes the attempt budget and the exponential
//! backoff curve; callers only decide what counts as an attempt.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::clock::Clock;

/// Chunk fetch attempts per provider before escalating.
pub const CHUNK_FETCH_ATTEMPTS: u32 = 3;

/// Load attempts for next/previous navigation before giving up on a CID.
pub const LOAD_ATTEMPTS: u32 = 5;

/// Error returned when a backoff wait was interrupted by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Attempt budget plus capped exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Policy for one provider inside the chunk scheduler.
    pub fn chunk_fetch() -> Self {
        Self {
            max_attempts: CHUNK_FETCH_ATTEMPTS,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(8000),
        }
    }

    /// Caller-level policy for loading the next or previous video.
    pub fn caller_load() -> Self {
        Self {
            max_attempts: LOAD_ATTEMPTS,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
        }
    }

    /// Short policy for name resolution blips.
    pub fn host_resolution() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(1),
        }
    }

    /// Delay to wait after the failed attempt numbered `attempt` (0-based).
    ///
    /// `base_delay * 2^attempt`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Waits out the backoff for `attempt`, returning early on cancellation.
    ///
    /// # Errors
    ///
    /// - `Cancelled` - The token fired before the delay elapsed
    pub async fn backoff(
        &self,
        clock: &dyn Clock,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<(), Cancelled> {
        let delay = self.delay_for(attempt);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Cancelled),
            _ = clock.sleep(delay) => Ok(()),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::chunk_fetch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_chunk_fetch_delays_double_and_cap() {
        let policy = RetryPolicy::chunk_fetch();

        assert_eq!(policy.delay_for(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(8000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(8000)); // Capped
        assert_eq!(policy.delay_for(40), Duration::from_millis(8000));
    }

    #[test]
    fn test_caller_load_caps_at_ten_seconds() {
        let policy = RetryPolicy::caller_load();
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(10));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_records_sleep() {
        let clock = ManualClock::default();
        let policy = RetryPolicy::chunk_fetch();

        policy
            .backoff(&clock, 1, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(clock.recorded_sleeps(), vec![Duration::from_millis(2000)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_stops_on_cancel() {
        let clock = ManualClock::default();
        let policy = RetryPolicy::chunk_fetch();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = policy.backoff(&clock, 0, &cancel).await;
        assert_eq!(result, Err(Cancelled));
    }
}
