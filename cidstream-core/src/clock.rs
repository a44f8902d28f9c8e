//! Injectable time source.
//!
//! Wall-clock reads and sleeps go through [`Clock`] so invalidation windows,
//! backoff and command timeouts can be driven deterministically in tests.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;

/// Time capability shared by every timed component.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic reading for measuring elapsed time.
    ///
    /// Follows the tokio timer, so a paused test runtime controls it.
    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }

    /// Suspends the caller for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by the system time and the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Manually driven clock for reproducible tests.
///
/// Wall time only moves through [`ManualClock::advance`] or a completed
/// `sleep`, which waits on the tokio timer and then advances wall time by
/// the slept duration. A sleep dropped before it completes leaves wall time
/// untouched. Combined with a paused tokio runtime this keeps wall time and
/// timer time in step. Every requested sleep is recorded.
#[derive(Debug, Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualClockState>>,
}

#[derive(Debug)]
struct ManualClockState {
    now: DateTime<Utc>,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualClockState {
                now: start,
                sleeps: Vec::new(),
            })),
        }
    }

    /// Moves wall time forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let mut state = self.state.lock();
        state.now += to_time_delta(duration);
    }

    /// Sleeps requested so far, in request order.
    pub fn recorded_sleeps(&self) -> Vec<Duration> {
        self.state.lock().sleeps.clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().now
    }

    async fn sleep(&self, duration: Duration) {
        self.state.lock().sleeps.push(duration);
        tokio::time::sleep(duration).await;
        self.advance(duration);
    }
}

/// Runs `future` until it completes or `limit` elapses on `clock`.
///
/// Returns `None` when the limit won. The future is dropped in that case,
/// which cancels any work it still had pending.
pub async fn timeout<F>(clock: &dyn Clock, limit: Duration, future: F) -> Option<F::Output>
where
    F: Future,
{
    tokio::select! {
        biased;
        output = future => Some(output),
        _ = clock.sleep(limit) => None,
    }
}

/// Converts a std duration to a chrono delta, saturating on overflow.
pub fn to_time_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_manual_clock_sleep_advances_wall_time() {
        let start = Utc::now();
        let clock = ManualClock::new(start);

        clock.sleep(Duration::from_secs(3)).await;
        clock.advance(Duration::from_secs(7));

        assert_eq!(clock.now() - start, TimeDelta::seconds(10));
        assert_eq!(clock.recorded_sleeps(), vec![Duration::from_secs(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sleep_leaves_wall_time() {
        let start = Utc::now();
        let clock = ManualClock::new(start);

        let result = timeout(&clock, Duration::from_secs(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            "done"
        })
        .await;

        assert_eq!(result, Some("done"));
        assert_eq!(clock.now(), start);
        assert_eq!(clock.recorded_sleeps(), vec![Duration::from_secs(10)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monotonic_now_follows_paused_timer() {
        let clock = SystemClock;
        let started = clock.monotonic_now();
        tokio::time::sleep(Duration::from_millis(250)).await;
        let elapsed = clock.monotonic_now() - started;
        assert!(elapsed >= Duration::from_millis(250));
        assert!(elapsed < Duration::from_millis(260));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_prefers_ready_future() {
        let clock = SystemClock;
        let result = timeout(&clock, Duration::from_millis(10), async { 42 }).await;
        assert_eq!(result, Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_for_pending_future() {
        let clock = SystemClock;
        let result = timeout(
            &clock,
            Duration::from_millis(10),
            std::future::pending::<()>(),
        )
        .await;
        assert_eq!(result, None);
    }
}
