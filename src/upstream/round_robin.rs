//! Round-robin peer selection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::upstream::peer::Peer;
use crate::upstream::LoadBalancer;

/// Stores an internal counter to rotate through peers.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn next_peer(&self, peers: &[Arc<Peer>]) -> Option<Arc<Peer>> {
        if peers.is_empty() {
            return None;
        }

        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        let len = peers.len();
        (0..len)
            .map(|i| &peers[(start + i) % len])
            .find(|peer| peer.is_healthy())
            .cloned()
    }
}
