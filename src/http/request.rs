//! Request identification.
//!
//! # Responsibilities
//! - Name the request id header
//! - Read the id set by the request id layer
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing
//! - A client-supplied `x-request-id` is kept and echoed back

use axum::http::{HeaderName, Request};
use uuid::Uuid;

pub const X_REQUEST_ID: &str = "x-request-id";

pub fn request_id_header() -> HeaderName {
    HeaderName::from_static(X_REQUEST_ID)
}

/// The request's id, or a fresh one when no layer set it.
pub fn request_id<B>(request: &Request<B>) -> String {
    request
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id() {
        let req = Request::builder().header(X_REQUEST_ID, "abc-123").body(()).unwrap();
        assert_eq!(request_id(&req), "abc-123");

        let req = Request::builder().body(()).unwrap();
        assert!(Uuid::parse_str(&request_id(&req)).is_ok());
    }
}
