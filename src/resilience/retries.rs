//! Retry budget.
//!
//! # Responsibilities
//! - Enforce a ceiling on retries relative to request volume
//!
//! # Design Decisions
//! - Only statements that never reached a backend are retried (see gateway executor)
//! - Jittered backoff prevents thundering herd
//! - Retry budget prevents retry storms under load

use std::sync::atomic::{AtomicU64, Ordering};

/// Allows `ratio` retries per request seen, plus a fixed floor.
#[derive(Debug)]
pub struct RetryBudget {
    ratio: f32,
    min_retries: u64,
    requests: AtomicU64,
    retries: AtomicU64,
}

impl RetryBudget {
    pub fn new(ratio: f32, min_retries: u64) -> Self {
        Self {
            ratio: ratio.max(0.0),
            min_retries,
            requests: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Withdraw one retry from the budget if any is left.
    pub fn can_retry(&self) -> bool {
        let requests = self.requests.load(Ordering::Relaxed);
        let allowed = self.min_retries + (requests as f64 * self.ratio as f64) as u64;
        self.retries
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |spent| (spent < allowed).then_some(spent + 1))
            .is_ok()
    }
}
