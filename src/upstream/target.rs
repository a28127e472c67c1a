//! Backend targets and their pool policy.

use std::net::SocketAddr;
use std::time::Duration;

use crate::config::conninfo::ConnParams;
use crate::config::schema::{OverflowPolicy, PoolConfig};

/// Admission and lifetime rules for one target's pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolPolicy {
    /// Hard cap on active + saved sessions.
    pub max_sessions: usize,
    /// Cap on idle-saved sessions.
    pub max_saved: usize,
    pub overflow: OverflowPolicy,
    pub queue_depth: usize,
    pub queue_timeout: Duration,
    /// Idle lifetime of a saved session. Zero disables saving.
    pub keepalive: Duration,
    /// Requests served before a session is rotated out. Zero means unlimited.
    pub max_requests: u64,
    pub prepare: bool,
    pub connect_timeout: Duration,
    pub query_timeout: Duration,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self::from(&PoolConfig::default())
    }
}

impl From<&PoolConfig> for PoolPolicy {
    fn from(config: &PoolConfig) -> Self {
        Self {
            max_sessions: config.max_sessions,
            max_saved: config.max_saved.min(config.max_sessions),
            overflow: config.overflow,
            queue_depth: config.queue_depth,
            queue_timeout: Duration::from_millis(config.queue_timeout_ms),
            keepalive: Duration::from_secs(config.keepalive_secs),
            max_requests: config.max_requests,
            prepare: config.prepare,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            query_timeout: Duration::from_millis(config.query_timeout_ms),
        }
    }
}

impl PoolPolicy {
    pub fn saves_sessions(&self) -> bool {
        self.max_saved > 0 && !self.keepalive.is_zero()
    }

    pub fn queues(&self) -> bool {
        self.overflow == OverflowPolicy::Queue && self.queue_depth > 0
    }

    pub fn rotation_due(&self, requests: u64) -> bool {
        self.max_requests > 0 && requests >= self.max_requests
    }
}

/// One physical database endpoint. Immutable once built.
#[derive(Debug, Clone)]
pub struct BackendTarget {
    /// `upstream/host:port`, used in logs and metrics.
    pub name: String,
    pub upstream: String,
    pub addr: SocketAddr,
    pub params: ConnParams,
    pub policy: PoolPolicy,
}

impl BackendTarget {
    pub fn new(upstream: &str, addr: SocketAddr, params: ConnParams, policy: PoolPolicy) -> Self {
        Self {
            name: format!("{}/{}", upstream, addr),
            upstream: upstream.to_string(),
            addr,
            params,
            policy,
        }
    }
}
