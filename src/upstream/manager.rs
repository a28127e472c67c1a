//! Upstream management.
//!
//! # Responsibilities
//! - Build one [`SharedPool`] per resolved server address
//! - Group peers by upstream name and apply the configured balancer
//! - Provide request accounting guards and passive health updates
//! - Decorate the peer source with session acquire/release

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;

use crate::config::conninfo::{ConnParams, ConninfoError};
use crate::config::schema::{BalanceStrategy, HealthConfig, UpstreamConfig};
use crate::error::GatewayError;
use crate::relay::sink::PubSubSink;
use crate::upstream::least_conn::LeastConnections;
use crate::upstream::peer::{Peer, PeerGuard};
use crate::upstream::pool::ReleaseOutcome;
use crate::upstream::round_robin::RoundRobin;
use crate::upstream::shared::{Lease, SharedPool};
use crate::upstream::target::{BackendTarget, PoolPolicy};
use crate::upstream::LoadBalancer;
use crate::wire::Connector;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream \"{upstream}\": {source}")]
    Conninfo {
        upstream: String,
        #[source]
        source: ConninfoError,
    },
    #[error("upstream \"{upstream}\": cannot resolve {host}: {source}")]
    Resolve {
        upstream: String,
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("upstream \"{upstream}\" resolved to no addresses")]
    Empty { upstream: String },
}

/// A named group of peers behind one balancer.
pub struct Upstream {
    name: String,
    peers: Vec<Arc<Peer>>,
    balancer: Box<dyn LoadBalancer>,
}

impl Upstream {
    pub fn new(name: impl Into<String>, peers: Vec<Arc<Peer>>, strategy: BalanceStrategy) -> Self {
        let balancer: Box<dyn LoadBalancer> = match strategy {
            BalanceStrategy::RoundRobin => Box::new(RoundRobin::new()),
            BalanceStrategy::LeastConn => Box::new(LeastConnections::new()),
        };
        Self {
            name: name.into(),
            peers,
            balancer,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peers(&self) -> &[Arc<Peer>] {
        &self.peers
    }

    /// Select a peer not in `tried` and count the request against it.
    ///
    /// Every address handed out is appended to `tried`. When only unhealthy
    /// peers remain, the first of them is returned as a probe so a group
    /// whose servers all failed can still recover.
    pub fn get(&self, tried: &mut Vec<SocketAddr>) -> Option<PeerGuard> {
        loop {
            let candidates: Vec<Arc<Peer>> = self
                .peers
                .iter()
                .filter(|p| !tried.contains(&p.addr()))
                .cloned()
                .collect();
            if candidates.is_empty() {
                tracing::debug!(upstream = %self.name, peers = self.peers.len(), "No untried peers left");
                return None;
            }

            let peer = match self.balancer.next_peer(&candidates) {
                Some(peer) => peer,
                None => {
                    tracing::debug!(upstream = %self.name, "All remaining peers unhealthy, probing");
                    candidates[0].clone()
                }
            };
            tried.push(peer.addr());
            match peer.try_create_guard() {
                Some(guard) => return Some(guard),
                None => {
                    tracing::debug!(upstream = %self.name, addr = %peer.addr(), "Peer at request limit");
                }
            }
        }
    }

    /// Account the request's outcome against the peer and drop the guard.
    pub fn free(&self, guard: PeerGuard, failure: Option<&GatewayError>, health: &HealthConfig) {
        match failure {
            Some(e) if e.is_target_failure() => {
                if guard.mark_failure(health.unhealthy_threshold as usize) {
                    tracing::warn!(upstream = %self.name, addr = %guard.addr(), error = %e, "Peer marked unhealthy");
                }
            }
            Some(_) => {}
            None => {
                if guard.mark_success(health.healthy_threshold as usize) {
                    tracing::info!(upstream = %self.name, addr = %guard.addr(), "Peer marked healthy");
                }
            }
        }
    }
}

/// A peer and a session from its pool, held for one attempt.
pub struct PeerLease {
    pub guard: PeerGuard,
    pub lease: Lease,
}

/// Session-pool decorator over [`Upstream`].
pub struct SessionPeers {
    upstream: Upstream,
    health: HealthConfig,
}

impl SessionPeers {
    pub fn new(upstream: Upstream, health: HealthConfig) -> Self {
        Self { upstream, health }
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    /// Pick a peer and acquire a session from its pool.
    ///
    /// `Ok(None)` means every peer has been tried.
    pub async fn acquire(&self, tried: &mut Vec<SocketAddr>) -> Result<Option<PeerLease>, GatewayError> {
        let Some(guard) = self.upstream.get(tried) else {
            return Ok(None);
        };
        match guard.pool.acquire().await {
            Ok(lease) => Ok(Some(PeerLease { guard, lease })),
            Err(e) => {
                self.upstream.free(guard, Some(&e), &self.health);
                Err(e)
            }
        }
    }

    /// Return the session and account the attempt.
    pub fn release(&self, acquired: PeerLease, outcome: ReleaseOutcome, failure: Option<&GatewayError>) {
        let PeerLease { guard, lease } = acquired;
        lease.release(outcome);
        self.upstream.free(guard, failure, &self.health);
    }
}

/// All upstreams, by name.
pub struct UpstreamManager {
    upstreams: HashMap<String, Arc<SessionPeers>>,
}

impl UpstreamManager {
    pub fn from_config(
        configs: &[UpstreamConfig],
        health: &HealthConfig,
        connector: Arc<dyn Connector>,
        sink: Option<Arc<dyn PubSubSink>>,
    ) -> Result<Self, UpstreamError> {
        let mut upstreams = HashMap::new();
        for config in configs {
            let policy = PoolPolicy::from(&config.pool);
            let mut peers: Vec<Arc<Peer>> = Vec::new();

            for server in &config.servers {
                let params = ConnParams::parse(server).map_err(|source| UpstreamError::Conninfo {
                    upstream: config.name.clone(),
                    source,
                })?;
                let addrs = params.resolve().map_err(|source| UpstreamError::Resolve {
                    upstream: config.name.clone(),
                    host: params.host.clone(),
                    source,
                })?;
                for addr in addrs {
                    if peers.iter().any(|p| p.addr() == addr) {
                        continue;
                    }
                    let target = Arc::new(BackendTarget::new(&config.name, addr, params.clone(), policy.clone()));
                    tracing::info!(
                        pool = %target.name,
                        max_sessions = policy.max_sessions,
                        max_saved = policy.max_saved,
                        "Session pool created"
                    );
                    let pool = SharedPool::new(target, connector.clone(), sink.clone());
                    peers.push(Arc::new(Peer::new(pool)));
                }
            }

            if peers.is_empty() {
                return Err(UpstreamError::Empty {
                    upstream: config.name.clone(),
                });
            }
            let upstream = Upstream::new(&config.name, peers, config.balance);
            upstreams.insert(config.name.clone(), Arc::new(SessionPeers::new(upstream, health.clone())));
        }
        Ok(Self { upstreams })
    }

    pub fn get(&self, name: &str) -> Option<Arc<SessionPeers>> {
        self.upstreams.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.upstreams.keys().map(String::as_str)
    }

    /// Every peer of every upstream.
    pub fn all_peers(&self) -> Vec<Arc<Peer>> {
        self.upstreams
            .values()
            .flat_map(|u| u.upstream().peers().iter())
            .cloned()
            .collect()
    }

    /// Mark every pool terminating.
    pub fn shutdown_all(&self) {
        for peer in self.all_peers() {
            peer.pool.shutdown();
        }
        tracing::info!(upstreams = self.upstreams.len(), "All session pools shut down");
    }
}
