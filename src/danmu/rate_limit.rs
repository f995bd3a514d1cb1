//! Per-provider request pacing.
//!
//! Each provider client owns one [`RateLimiter`]. Callers queue on an async
//! mutex and wait until the configured interval has elapsed since the
//! previous request started, so requests from concurrently processed
//! entities still reach the remote service one interval apart.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

/// Minimum-interval gate shared by all callers of one provider instance.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait for this caller's turn.
    ///
    /// Returns once at least `min_interval` has passed since the previous
    /// caller was released. Dropping the future while it waits gives up the
    /// turn without recording a request.
    pub async fn acquire(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.min_interval;
            if ready_at > Instant::now() {
                trace!(wait_ms = (ready_at - Instant::now()).as_millis() as u64, "Rate limiter waiting");
                sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}
