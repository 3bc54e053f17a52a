//! Poll-and-sleep waiting.
//!
//! Every suspension point in a checkout (provider configuration showing up,
//! the main suite being announced, resources becoming available) is the same
//! loop: try, sleep a fixed interval, try again until a deadline. This
//! module is that loop.
//!
//! Time is taken from [`tokio::time`], so tests can run the loops on a
//! paused clock.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Stand-in for deadlines too far away for the clock to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// The instant `timeout` from now, saturating at a far-future instant.
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
}

/// A fixed-interval retry policy bounded by a timeout.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use testbed::wait::RetryPolicy;
///
/// # tokio_test::block_on(async {
/// let policy = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(50));
/// let mut calls = 0;
/// let found = policy
///     .wait_for("counter", || {
///         calls += 1;
///         let done = calls == 3;
///         async move { done.then_some(calls) }
///     })
///     .await;
/// assert_eq!(found, Some(3));
/// # });
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    interval: Duration,
    timeout: Duration,
}

impl RetryPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns a copy whose timeout never reaches past `deadline`.
    pub fn capped_at(&self, deadline: Instant) -> Self {
        let remaining = deadline.saturating_duration_since(Instant::now());
        Self {
            interval: self.interval,
            timeout: self.timeout.min(remaining),
        }
    }

    /// Polls `probe` until it yields a value or the timeout elapses.
    ///
    /// The probe always runs at least once, even with a zero timeout. The
    /// final sleep is shortened so the loop never overshoots the deadline.
    pub async fn wait_for<T, F, Fut>(&self, what: &str, mut probe: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        let deadline = deadline_after(self.timeout);
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            if let Some(value) = probe().await {
                debug!("{} ready after {} attempt(s)", what, attempt);
                return Some(value);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("{} not ready after {} attempt(s), giving up", what, attempt);
                return None;
            }
            debug!("{} not ready (attempt {}), retrying", what, attempt);
            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_at_deadline() {
        let policy = RetryPolicy::new(Duration::from_secs(5), Duration::from_secs(30));
        let start = Instant::now();
        let mut attempts = 0;

        let result: Option<()> = policy
            .wait_for("nothing", || {
                attempts += 1;
                async { None }
            })
            .await;

        assert!(result.is_none());
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        // t = 0, 5, 10, ..., 30
        assert_eq!(attempts, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_probes_once() {
        let policy = RetryPolicy::new(Duration::from_secs(5), Duration::ZERO);
        let mut attempts = 0;
        let result: Option<()> = policy
            .wait_for("once", || {
                attempts += 1;
                async { None }
            })
            .await;
        assert!(result.is_none());
        assert_eq!(attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capped_at_deadline() {
        let policy = RetryPolicy::new(Duration::from_secs(5), Duration::from_secs(60));
        let capped = policy.capped_at(Instant::now() + Duration::from_secs(12));
        assert_eq!(capped.timeout(), Duration::from_secs(12));
        assert_eq!(capped.interval(), Duration::from_secs(5));

        let past = policy.capped_at(Instant::now() - Duration::from_secs(1));
        assert_eq!(past.timeout(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_timeout_still_waits() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(u64::MAX));
        let start = Instant::now();
        let mut attempts = 0;
        let result = policy
            .wait_for("eventually", || {
                attempts += 1;
                let done = attempts == 3;
                async move { done.then_some(attempts) }
            })
            .await;
        assert_eq!(result, Some(3));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[test]
    fn test_deadline_after_saturates() {
        let now = Instant::now();
        assert!(deadline_after(Duration::from_secs(u64::MAX)) > now + Duration::from_secs(86400));
        let soon = deadline_after(Duration::from_secs(5));
        assert!(soon >= now + Duration::from_secs(5));
    }
}
