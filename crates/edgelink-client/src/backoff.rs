//! Exponential backoff bounded by an elapsed budget

use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Exponential backoff helper. Callers run their own attempt loop and call
/// [`Backoff::wait`] between attempts; once the elapsed budget would be
/// exceeded the caller surfaces its last error.
pub(crate) struct Backoff {
    max_interval: Duration,
    multiplier: f64,
    deadline: Instant,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max_interval: Duration, budget: Duration) -> Self {
        Self {
            max_interval,
            multiplier: 2.0,
            deadline: Instant::now() + budget,
            current: initial,
        }
    }

    /// Backoff for session creation: 50ms initial, capped at 10s.
    pub fn session_create(budget: Duration) -> Self {
        Self::new(Duration::from_millis(50), Duration::from_secs(10), budget)
    }

    /// Backoff for authentication attempts, capped at 10s.
    pub fn authenticate(budget: Duration) -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(10), budget)
    }

    /// Sleep before the next attempt. Returns `false` when the budget would
    /// be exceeded.
    pub async fn wait(&mut self) -> bool {
        if Instant::now() + self.current > self.deadline {
            return false;
        }
        debug!("retrying after {:?}", self.current);
        sleep(self.current).await;
        self.current = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .min(self.max_interval);
        true
    }
}
