//! Peer abstraction.
//!
//! # Responsibilities
//! - Represent a single backend target inside an upstream
//! - Track in-flight requests (for Least Connections LB)
//! - Enforce the request limit the target's pool can absorb
//! - Track passive health state (Healthy/Unhealthy)

use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::upstream::shared::SharedPool;
use crate::upstream::target::BackendTarget;

/// Health State enum.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            1 => HealthState::Healthy,
            2 => HealthState::Unhealthy,
            _ => HealthState::Unknown,
        }
    }
}

impl HealthState {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

/// One backend target and its session pool.
pub struct Peer {
    pub pool: SharedPool,
    /// Requests admitted beyond this are rejected before touching the pool.
    pub max_requests: usize,
    /// Number of requests currently using this peer.
    pub active_requests: AtomicUsize,

    /// Current health state (0=Unknown, 1=Healthy, 2=Unhealthy).
    pub state: AtomicU8,
    /// Consecutive failure count.
    pub consecutive_failures: AtomicUsize,
    /// Consecutive success count.
    pub consecutive_successes: AtomicUsize,
}

impl Peer {
    pub fn new(pool: SharedPool) -> Self {
        let policy = &pool.target().policy;
        let max_requests = policy.max_sessions + if policy.queues() { policy.queue_depth } else { 0 };
        Self {
            pool,
            max_requests,
            active_requests: AtomicUsize::new(0),
            state: AtomicU8::new(HealthState::Unknown as u8),
            consecutive_failures: AtomicUsize::new(0),
            consecutive_successes: AtomicUsize::new(0),
        }
    }

    pub fn target(&self) -> &Arc<BackendTarget> {
        self.pool.target()
    }

    pub fn addr(&self) -> SocketAddr {
        self.pool.target().addr
    }

    /// Get the current number of in-flight requests.
    pub fn load(&self) -> usize {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn health(&self) -> HealthState {
        HealthState::from(self.state.load(Ordering::Relaxed))
    }

    /// Try to create a guard that counts one in-flight request.
    pub fn try_create_guard(self: &Arc<Self>) -> Option<PeerGuard> {
        let mut prev = self.active_requests.load(Ordering::Relaxed);
        loop {
            if prev >= self.max_requests {
                return None;
            }
            match self
                .active_requests
                .compare_exchange_weak(prev, prev + 1, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(x) => prev = x,
            }
        }
        Some(PeerGuard { peer: self.clone() })
    }

    // --- Health Logic ---

    /// Return true if peer is considered healthy (Healthy or Unknown).
    pub fn is_healthy(&self) -> bool {
        self.state.load(Ordering::Relaxed) != HealthState::Unhealthy as u8
    }

    /// Report a successful request. Returns true on a transition to Healthy.
    pub fn mark_success(&self, healthy_threshold: usize) -> bool {
        self.consecutive_failures.store(0, Ordering::Relaxed);

        if self.state.load(Ordering::Relaxed) == HealthState::Healthy as u8 {
            return false;
        }

        let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
        if successes >= healthy_threshold {
            self.state.store(HealthState::Healthy as u8, Ordering::Relaxed);
            self.consecutive_successes.store(0, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Report a failed request. Returns true on a transition to Unhealthy.
    pub fn mark_failure(&self, unhealthy_threshold: usize) -> bool {
        self.consecutive_successes.store(0, Ordering::Relaxed);

        if self.state.load(Ordering::Relaxed) == HealthState::Unhealthy as u8 {
            return false;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= unhealthy_threshold {
            self.state.store(HealthState::Unhealthy as u8, Ordering::Relaxed);
            self.consecutive_failures.store(0, Ordering::Relaxed);
            return true;
        }
        false
    }
}

/// A RAII guard that manages the in-flight request count.
pub struct PeerGuard {
    pub peer: Arc<Peer>,
}

impl Deref for PeerGuard {
    type Target = Peer;
    fn deref(&self) -> &Self::Target {
        &self.peer
    }
}

impl Drop for PeerGuard {
    fn drop(&mut self) {
        self.peer.active_requests.fetch_sub(1, Ordering::Relaxed);
    }
}
