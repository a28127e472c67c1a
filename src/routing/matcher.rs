//! Route matching logic.
//!
//! # Responsibilities
//! - Match host header (exact match, case-insensitive, port ignored)
//! - Match exact path or path prefix (case-sensitive)
//! - Combine conditions with AND semantics
//!
//! # Design Decisions
//! - Empty condition = always matches (wildcard)
//! - No regex to guarantee O(n) matching

use axum::body::Body;
use axum::http::{header, Request};

/// Trait for matching requests against conditions.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    /// Returns true if the request matches this condition.
    fn matches(&self, req: &Request<Body>) -> bool;
}

/// One match condition of a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Host(String),
    Path(String),
    Prefix(String),
}

impl Condition {
    pub fn host(host: impl Into<String>) -> Self {
        Condition::Host(host.into().to_lowercase())
    }

    /// Sort key: exact paths before prefixes, longer prefixes first.
    pub fn specificity(&self) -> usize {
        match self {
            Condition::Host(_) => 0,
            Condition::Path(_) => usize::MAX,
            Condition::Prefix(prefix) => prefix.len(),
        }
    }
}

impl Matcher for Condition {
    fn matches(&self, req: &Request<Body>) -> bool {
        match self {
            Condition::Host(expected) => request_host(req)
                .map(|h| h.to_lowercase() == *expected)
                .unwrap_or(false),
            Condition::Path(path) => req.uri().path() == path,
            Condition::Prefix(prefix) => req.uri().path().starts_with(prefix.as_str()),
        }
    }
}

/// Host without the port, from the Host header or the absolute URI.
fn request_host<B>(req: &Request<B>) -> Option<&str> {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())?;
    Some(host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host))
}

/// Combines conditions with AND semantics.
#[derive(Debug, Clone, Default)]
pub struct AndMatcher {
    conditions: Vec<Condition>,
}

impl AndMatcher {
    pub fn new(conditions: Vec<Condition>) -> Self {
        Self { conditions }
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }
}

impl Matcher for AndMatcher {
    fn matches(&self, req: &Request<Body>) -> bool {
        self.conditions.iter().all(|c| c.matches(req))
    }
}
