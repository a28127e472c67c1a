//! Request handler: route → statement → result → response.

use std::time::Instant;

use axum::{
    body::{self, Body},
    extract::State,
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
};

use crate::error::GatewayError;
use crate::gateway::output;
use crate::gateway::vars::RequestVars;
use crate::http::request::request_id;
use crate::http::server::AppState;
use crate::observability::metrics;
use crate::routing::{Route, UpstreamRef};

/// Largest request body read into `$request_body`.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Fallback handler for every path not claimed by another route.
pub async fn gateway_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let start = Instant::now();
    let request_id = request_id(&request);
    let method = request.method().clone();

    tracing::debug!(
        request_id = %request_id,
        method = %method,
        path = %request.uri().path(),
        "Handling request"
    );

    let Some(route) = state.router.match_request(&request) else {
        tracing::warn!(request_id = %request_id, path = %request.uri().path(), "No route matched");
        metrics::record_request("none", StatusCode::NOT_FOUND.as_u16(), start);
        return GatewayError::NoRoute.into_response();
    };

    if !route.allows(&method) {
        metrics::record_request(&route.name, StatusCode::METHOD_NOT_ALLOWED.as_u16(), start);
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            [(header::ALLOW, route.allow_header())],
            "method not allowed",
        )
            .into_response();
    }

    let response = match run(&state, &route, request, &request_id).await {
        Ok(response) => response,
        Err(Rejected::Body) => (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response(),
        Err(Rejected::Gateway(e)) => {
            match &e {
                GatewayError::Backend(_) => {
                    tracing::info!(request_id = %request_id, route = %route.name, error = %e, "Statement failed")
                }
                _ => tracing::warn!(
                    request_id = %request_id,
                    route = %route.name,
                    kind = e.kind(),
                    error = %e,
                    "Request failed"
                ),
            }
            e.into_response()
        }
    };

    metrics::record_request(&route.name, response.status().as_u16(), start);
    response
}

enum Rejected {
    Body,
    Gateway(GatewayError),
}

impl From<GatewayError> for Rejected {
    fn from(e: GatewayError) -> Self {
        Rejected::Gateway(e)
    }
}

async fn run(state: &AppState, route: &Route, request: Request<Body>, request_id: &str) -> Result<Response, Rejected> {
    let (parts, body) = request.into_parts();
    let body = body::to_bytes(body, MAX_BODY_BYTES).await.map_err(|_| Rejected::Body)?;
    let vars = RequestVars::new(
        &parts.method,
        &parts.uri,
        &parts.headers,
        String::from_utf8_lossy(&body).into_owned(),
    );

    let upstream = match &route.upstream {
        UpstreamRef::Static(name) => name.clone(),
        UpstreamRef::Variable(var) => vars
            .get(var)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| GatewayError::UpstreamNotFound(format!("${}", var)))?,
    };
    let peers = state
        .upstreams
        .get(&upstream)
        .ok_or_else(|| GatewayError::UpstreamNotFound(upstream.clone()))?;

    let statement = route.template.compile(|name| vars.get(name), route.binary);
    let result = state.executor.execute(&peers, &statement, request_id).await?;

    let rendered = output::render(&result, route.output)?;
    let custom = output::variables(&result, &route.variables)?;
    let meta = if route.meta_headers {
        output::meta(&result)
    } else {
        Vec::new()
    };

    tracing::debug!(
        request_id = %request_id,
        route = %route.name,
        upstream = %upstream,
        ntuples = result.ntuples(),
        "Statement complete"
    );
    Ok(output::into_response(rendered, &custom, &meta))
}
