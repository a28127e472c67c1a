//! Least-connections peer selection.

use std::sync::Arc;

use crate::upstream::peer::Peer;
use crate::upstream::LoadBalancer;

/// Selects the healthy peer with the fewest in-flight requests.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnections {
    fn next_peer(&self, peers: &[Arc<Peer>]) -> Option<Arc<Peer>> {
        // Ties go to the first peer.
        peers
            .iter()
            .filter(|p| p.is_healthy())
            .min_by_key(|p| p.load())
            .cloned()
    }
}
