//! Fixed-interval rate gate: ensures at least `interval` elapses between any
//! two calls to `wait()` across the process.
//!
//! Ported from `core/api_client.py::_enforce_rate_limit` (monotonic
//! last-request-time plus sleeping the remainder), matching spec §4.3(i)
//! and §5's "single token bucket... shared across tasks" requirement for
//! the single-process model this crate targets.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub struct RateGate {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// Blocks the calling task until `interval` has elapsed since the
    /// previous call returned, then records the new last-call time.
    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.interval {
                tokio::time::sleep(self.interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}
