use axum::{extract::State, Json};
use serde::Serialize;

use crate::http::server::AppState;

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub upstreams: Vec<String>,
    pub routes: usize,
    pub channels: usize,
}

#[derive(Debug, Serialize)]
pub struct PoolStatus {
    pub upstream: String,
    pub target: String,
    pub address: String,
    pub health: &'static str,
    pub in_flight: usize,
    pub active: usize,
    pub saved: usize,
    pub free: usize,
    pub queued: usize,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let mut upstreams: Vec<String> = state.upstreams.names().map(str::to_string).collect();
    upstreams.sort();

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        uptime_secs: state.started.elapsed().as_secs(),
        upstreams,
        routes: state.router.len(),
        channels: state.hub.as_ref().map(|h| h.channel_count()).unwrap_or(0),
    })
}

pub async fn get_pools(State(state): State<AppState>) -> Json<Vec<PoolStatus>> {
    let mut pools: Vec<PoolStatus> = state
        .upstreams
        .all_peers()
        .into_iter()
        .map(|peer| {
            let target = peer.target();
            let stats = peer.pool.stats();
            PoolStatus {
                upstream: target.upstream.clone(),
                target: target.name.clone(),
                address: peer.addr().to_string(),
                health: peer.health().as_str(),
                in_flight: peer.load(),
                active: stats.active,
                saved: stats.saved,
                free: stats.free,
                queued: stats.queued,
            }
        })
        .collect();
    pools.sort_by(|a, b| (&a.upstream, &a.address).cmp(&(&b.upstream, &b.address)));
    Json(pools)
}
