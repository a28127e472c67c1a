//! Gateway error taxonomy.
//!
//! Every failure a request can hit maps onto one [`GatewayError`] variant,
//! and every variant maps onto one HTTP status.

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Which deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Connect,
    Query,
    QueueWait,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Connect => write!(f, "connect"),
            TimeoutKind::Query => write!(f, "query"),
            TimeoutKind::QueueWait => write!(f, "queue wait"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("failed to connect to {target}: {reason}")]
    ConnectFailed { target: String, reason: String },

    #[error("session pool exhausted for {target}")]
    PoolExhausted { target: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Backend(String),

    #[error("{0} timeout")]
    Timeout(TimeoutKind),

    #[error("unexpected extra result after command completion")]
    UnexpectedExtraResult,

    #[error("idle session address does not match target {target}")]
    AddressMismatch { target: String },

    #[error("no route matched")]
    NoRoute,

    #[error("upstream \"{0}\" not found")]
    UpstreamNotFound(String),

    #[error("{0}")]
    Output(String),
}

impl GatewayError {
    /// HTTP status reported to the client for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::PoolExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Timeout(TimeoutKind::QueueWait) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::ConnectFailed { .. }
            | GatewayError::Protocol(_)
            | GatewayError::UnexpectedExtraResult => StatusCode::BAD_GATEWAY,
            GatewayError::NoRoute => StatusCode::NOT_FOUND,
            GatewayError::Backend(_)
            | GatewayError::AddressMismatch { .. }
            | GatewayError::UpstreamNotFound(_)
            | GatewayError::Output(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether another target of the same upstream may be tried.
    ///
    /// Backend errors are answers from the database and are never retried.
    pub fn allows_failover(&self) -> bool {
        matches!(
            self,
            GatewayError::ConnectFailed { .. }
                | GatewayError::PoolExhausted { .. }
                | GatewayError::Protocol(_)
                | GatewayError::UnexpectedExtraResult
                | GatewayError::Timeout(TimeoutKind::Connect)
                | GatewayError::Timeout(TimeoutKind::Query)
        )
    }

    /// Whether the failure counts against the target's passive health.
    pub fn is_target_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::ConnectFailed { .. }
                | GatewayError::Timeout(TimeoutKind::Connect)
                | GatewayError::Timeout(TimeoutKind::Query)
        )
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::ConnectFailed { .. } => "connect_failed",
            GatewayError::PoolExhausted { .. } => "pool_exhausted",
            GatewayError::Protocol(_) => "protocol",
            GatewayError::Backend(_) => "backend",
            GatewayError::Timeout(_) => "timeout",
            GatewayError::UnexpectedExtraResult => "extra_result",
            GatewayError::AddressMismatch { .. } => "address_mismatch",
            GatewayError::NoRoute => "no_route",
            GatewayError::UpstreamNotFound(_) => "upstream_not_found",
            GatewayError::Output(_) => "output",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            GatewayError::Backend(message) => message.clone(),
            other => other.to_string(),
        };
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let exhausted = GatewayError::PoolExhausted { target: "db".into() };
        assert_eq!(exhausted.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(GatewayError::Timeout(TimeoutKind::QueueWait).status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(GatewayError::Timeout(TimeoutKind::Query).status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(GatewayError::UnexpectedExtraResult.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(GatewayError::Backend("boom".into()).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_backend_errors_never_fail_over() {
        assert!(!GatewayError::Backend("syntax error".into()).allows_failover());
        assert!(!GatewayError::Timeout(TimeoutKind::QueueWait).allows_failover());
        assert!(GatewayError::ConnectFailed { target: "a".into(), reason: "refused".into() }.allows_failover());
    }
}
