//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize all subsystems in dependency order
//! - Start background tasks (metrics exporter)
//! - Bind listeners and begin accepting traffic
//! - Tear everything down on a shutdown signal
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - Listeners start last (traffic only when ready)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinSet;

use crate::admin::setup_admin_router;
use crate::config::schema::GatewayConfig;
use crate::gateway::Executor;
use crate::http::server::{AppState, GatewayServer};
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals::wait_for_signal;
use crate::observability::metrics;
use crate::relay::{ChannelHub, PubSubSink};
use crate::resilience::retries::RetryBudget;
use crate::routing::{RouteError, Router};
use crate::upstream::manager::UpstreamError;
use crate::upstream::UpstreamManager;
use crate::wire::pg::PgConnector;
use crate::wire::Connector;

/// Retries always allowed regardless of the budget ratio.
const MIN_RETRIES: u64 = 100;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error("invalid address \"{addr}\" for {field}")]
    Address { field: &'static str, addr: String },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("server failed: {0}")]
    Serve(#[source] std::io::Error),
}

fn parse_addr(field: &'static str, addr: &str) -> Result<SocketAddr, StartupError> {
    addr.parse().map_err(|_| StartupError::Address {
        field,
        addr: addr.to_string(),
    })
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, StartupError> {
    TcpListener::bind(addr).await.map_err(|source| StartupError::Bind { addr, source })
}

/// Build the shared handler state: hub, upstream pools, routes, executor.
pub fn build_state(config: GatewayConfig, connector: Arc<dyn Connector>) -> Result<AppState, StartupError> {
    let config = Arc::new(config);

    let hub = config.channels.enabled.then(|| ChannelHub::new(config.channels.capacity));
    let sink = hub.clone().map(|h| Arc::new(h) as Arc<dyn PubSubSink>);

    let upstreams = UpstreamManager::from_config(&config.upstreams, &config.health, connector, sink)?;
    let router = Router::from_config(&config.routes)?;
    tracing::info!(
        upstreams = config.upstreams.len(),
        routes = router.len(),
        channels = hub.is_some(),
        "Gateway initialized"
    );

    let budget = Arc::new(RetryBudget::new(config.retries.budget_ratio, MIN_RETRIES));
    let executor = Executor::new(config.retries.clone(), budget);

    Ok(AppState {
        router: Arc::new(router),
        upstreams: Arc::new(upstreams),
        executor: Arc::new(executor),
        hub,
        config,
        started: Instant::now(),
    })
}

/// Run the gateway until a shutdown signal or a server failure.
pub async fn run(config: GatewayConfig) -> Result<(), StartupError> {
    if config.observability.metrics_enabled {
        let addr = parse_addr("observability.metrics_address", &config.observability.metrics_address)?;
        metrics::init_metrics(addr);
    }

    let state = build_state(config, Arc::new(PgConnector))?;
    let config = state.config.clone();
    let shutdown = Shutdown::new();
    let mut servers: JoinSet<Result<(), std::io::Error>> = JoinSet::new();

    if config.admin.enabled {
        let addr = parse_addr("admin.bind_address", &config.admin.bind_address)?;
        let listener = bind(addr).await?;
        let app = setup_admin_router(state.clone());
        let mut rx = shutdown.subscribe();
        tracing::info!(address = %addr, "Admin API listening");
        servers.spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = rx.recv().await;
                })
                .await
        });
    }

    let addr = parse_addr("listener.bind_address", &config.listener.bind_address)?;
    let server = GatewayServer::new(state.clone());
    let rx = shutdown.subscribe();
    match config.listener.tls.clone() {
        Some(tls) => {
            servers.spawn(async move { server.run_tls(addr, &tls, rx).await });
        }
        None => {
            let listener = bind(addr).await?;
            servers.spawn(server.run(listener, rx));
        }
    }

    let mut failure = None;
    tokio::select! {
        _ = wait_for_signal() => {}
        Some(joined) = servers.join_next() => {
            failure = server_failure(joined);
        }
    }

    shutdown.trigger();
    state.upstreams.shutdown_all();
    if let Some(hub) = &state.hub {
        hub.close();
    }

    while let Some(joined) = servers.join_next().await {
        if let Some(e) = server_failure(joined) {
            failure.get_or_insert(e);
        }
    }
    tracing::info!("Gateway stopped");

    match failure {
        Some(e) => Err(StartupError::Serve(e)),
        None => Ok(()),
    }
}

fn server_failure(joined: Result<Result<(), std::io::Error>, tokio::task::JoinError>) -> Option<std::io::Error> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Server exited with error");
            Some(e)
        }
        Err(e) => {
            tracing::error!(error = %e, "Server task panicked");
            Some(std::io::Error::other(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::parse_config;
    use crate::wire::mock::MockConnector;

    const CONFIG: &str = r#"
[channels]
enabled = true

[[upstreams]]
name = "main"
servers = ["host=127.0.0.1 port=5432 dbname=app user=app"]

[[routes]]
name = "users"
path = "/users"
upstream = "main"
query = "SELECT * FROM users WHERE id = $arg_id::int4"
"#;

    #[test]
    fn test_build_state() {
        let config = parse_config(CONFIG).unwrap();
        let state = build_state(config, MockConnector::new()).unwrap();

        assert_eq!(state.router.len(), 1);
        assert!(state.upstreams.get("main").is_some());
        assert!(state.hub.is_some());
    }

    #[test]
    fn test_bad_address() {
        assert!(matches!(
            parse_addr("listener.bind_address", "not-an-address"),
            Err(StartupError::Address { .. })
        ));
    }
}
