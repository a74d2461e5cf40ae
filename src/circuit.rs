//! In-memory per-company circuit breaker: consecutive-failure counting and
//! a timeout blacklist.
//!
//! Narrowed from `keeper-rs/src/state.rs`'s `RetryInfo`/backoff bookkeeping
//! (`main.rs::compute_backoff_seconds`) to the simpler fixed policy the
//! specification asks for: 3 consecutive failures or an active 1h timeout
//! blacklist skips the company for the cycle.

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;
pub const TIMEOUT_BLACKLIST_DURATION: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Default)]
struct Entry {
    consecutive_failures: u32,
    timeout_blacklisted_until: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct CircuitBreaker {
    entries: HashMap<String, Entry>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the company should be skipped this cycle.
    pub fn is_open(&self, company: &str, now: Instant) -> bool {
        match self.entries.get(company) {
            Some(entry) => {
                entry.consecutive_failures >= MAX_CONSECUTIVE_FAILURES
                    || entry.timeout_blacklisted_until.map(|t| t > now).unwrap_or(false)
            }
            None => false,
        }
    }

    pub fn record_success(&mut self, company: &str) {
        self.entries.remove(company);
    }

    pub fn record_failure(&mut self, company: &str) {
        let entry = self.entries.entry(company.to_string()).or_default();
        entry.consecutive_failures += 1;
    }

    /// Arms the 1h timeout blacklist, as happens when a hard timeout occurs
    /// during previous-month processing.
    pub fn blacklist_for_timeout(&mut self, company: &str, now: Instant) {
        let entry = self.entries.entry(company.to_string()).or_default();
        entry.timeout_blacklisted_until = Some(now + TIMEOUT_BLACKLIST_DURATION);
    }
}
