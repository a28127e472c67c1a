//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with all handlers
//! - Wire up middleware (body limit, timeout, concurrency, request ID, tracing)
//! - Stream relayed notifications over server-sent events
//! - Bind server to a plain or TLS listener
//! - Stop on the shared shutdown signal

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower::ServiceBuilder;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::schema::{GatewayConfig, TlsConfig};
use crate::gateway::handler::MAX_BODY_BYTES;
use crate::gateway::{gateway_handler, Executor};
use crate::http::request::request_id_header;
use crate::relay::ChannelHub;
use crate::routing::Router as RouteTable;
use crate::upstream::UpstreamManager;

/// Time TLS connections get to finish after shutdown.
const TLS_DRAIN: Duration = Duration::from_secs(10);

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<RouteTable>,
    pub upstreams: Arc<UpstreamManager>,
    pub executor: Arc<Executor>,
    pub hub: Option<ChannelHub>,
    pub config: Arc<GatewayConfig>,
    pub started: Instant,
}

/// HTTP server for the gateway.
pub struct GatewayServer {
    router: Router,
}

impl GatewayServer {
    pub fn new(state: AppState) -> Self {
        Self {
            router: Self::build_router(state),
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(state: AppState) -> Router {
        let timeout = Duration::from_secs(state.config.timeouts.request_secs);
        let max_connections = state.config.listener.max_connections.max(1);
        let mut router = Router::new();
        if state.hub.is_some() {
            let path = format!("{}/{{name}}", state.config.channels.path.trim_end_matches('/'));
            router = router.route(&path, get(channel_stream));
        }

        router
            .fallback(gateway_handler)
            .with_state(state)
            .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
            .layer(TimeoutLayer::new(timeout))
            .layer(GlobalConcurrencyLimitLayer::new(max_connections))
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::new(request_id_header(), MakeRequestUuid))
                    .layer(PropagateRequestIdLayer::new(request_id_header()))
                    .layer(TraceLayer::new_for_http()),
            )
    }

    /// Run the server, accepting connections on the given listener.
    pub async fn run(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Run the server behind rustls.
    pub async fn run_tls(
        self,
        addr: SocketAddr,
        tls: &TlsConfig,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let config = load_tls_config(tls).await?;
        let handle = axum_server::Handle::new();
        let stopper = handle.clone();
        tokio::spawn(async move {
            let _ = shutdown.recv().await;
            stopper.graceful_shutdown(Some(TLS_DRAIN));
        });

        tracing::info!(address = %addr, "HTTPS server starting");
        axum_server::bind_rustls(addr, config)
            .handle(handle)
            .serve(self.router.into_make_service())
            .await?;

        tracing::info!("HTTPS server stopped");
        Ok(())
    }
}

/// Load TLS configuration from certificate and key files.
async fn load_tls_config(tls: &TlsConfig) -> Result<RustlsConfig, std::io::Error> {
    for path in [&tls.cert_path, &tls.key_path] {
        if !std::path::Path::new(path).exists() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("TLS file not found: {}", path),
            ));
        }
    }
    RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path).await
}

/// Server-sent-events stream of one notification channel.
async fn channel_stream(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let Some(hub) = state.hub.as_ref() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    tracing::debug!(channel = %name, "Channel subscriber connected");
    let rx = hub.subscribe(&name);
    let stream = futures_util::stream::unfold((rx, name), |(mut rx, name)| async move {
        loop {
            match rx.recv().await {
                Ok(payload) => {
                    let event = Event::default().event(name.as_str()).data(payload);
                    return Some((Ok::<_, Infallible>(event), (rx, name)));
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(channel = %name, skipped, "Channel subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}
