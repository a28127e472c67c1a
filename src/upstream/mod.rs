//! Upstream subsystem: backend targets and their session pools.
//!
//! # Data Flow
//! ```text
//! Route resolved to an upstream name
//!     → manager.rs (SessionPeers for the upstream)
//!     → balancer (round_robin.rs / least_conn.rs) picks a Peer
//!     → shared.rs (async acquire, queue wait under deadline)
//!     → pool.rs (saved session | new connect | deferred | rejected)
//!     → Lease handed to the protocol machine
//!     → release: hand to waiter | save (LRU evict) | destroy
//! ```
//!
//! # Design Decisions
//! - One pool per resolved server address; failover moves across an upstream's peers
//! - A session is owned by exactly one of: its pool's saved set, a Checkout, or nothing
//! - Slot generations reject stale or double releases
//! - Unhealthy peers are skipped but still probed when nothing else is left

pub mod least_conn;
pub mod listen;
pub mod manager;
pub mod peer;
pub mod pool;
pub mod queue;
pub mod round_robin;
pub mod session;
pub mod shared;
pub mod target;

use std::sync::Arc;

use crate::upstream::peer::Peer;

pub use manager::{PeerLease, SessionPeers, Upstream, UpstreamManager};
pub use shared::{Lease, SharedPool};
pub use target::{BackendTarget, PoolPolicy};

/// Peer selection strategy.
pub trait LoadBalancer: Send + Sync {
    /// Pick a healthy peer, or `None` when none is healthy.
    fn next_peer(&self, peers: &[Arc<Peer>]) -> Option<Arc<Peer>>;
}
