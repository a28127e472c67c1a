//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (routes reference existing upstreams)
//! - Validate value ranges and connection strings
//! - Compile every statement template once up front
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::fmt;

use crate::config::conninfo::ConnParams;
use crate::config::schema::{GatewayConfig, OverflowPolicy};
use crate::gateway::template::Template;

/// One semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<std::net::SocketAddr>().is_err() {
        errors.push(ValidationError::new("listener.bind_address", "not a socket address"));
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be greater than 0"));
    }
    if config.retries.max_attempts == 0 {
        errors.push(ValidationError::new("retries.max_attempts", "must be at least 1"));
    }

    let mut upstreams = HashSet::new();
    for (i, upstream) in config.upstreams.iter().enumerate() {
        let field = format!("upstreams[{}]", i);
        if !upstreams.insert(upstream.name.as_str()) {
            errors.push(ValidationError::new(&field, format!("duplicate upstream name \"{}\"", upstream.name)));
        }
        if upstream.servers.is_empty() {
            errors.push(ValidationError::new(format!("{}.servers", field), "at least one server is required"));
        }
        for (j, server) in upstream.servers.iter().enumerate() {
            if let Err(e) = ConnParams::parse(server) {
                errors.push(ValidationError::new(format!("{}.servers[{}]", field, j), e.to_string()));
            }
        }

        let pool = &upstream.pool;
        if pool.max_sessions == 0 {
            errors.push(ValidationError::new(format!("{}.pool.max_sessions", field), "must be greater than 0"));
        }
        if pool.max_saved > pool.max_sessions {
            errors.push(ValidationError::new(
                format!("{}.pool.max_saved", field),
                "cannot exceed max_sessions",
            ));
        }
        if pool.connect_timeout_ms == 0 || pool.query_timeout_ms == 0 {
            errors.push(ValidationError::new(format!("{}.pool", field), "timeouts must be greater than 0"));
        }
        if pool.overflow == OverflowPolicy::Queue && pool.queue_depth == 0 {
            tracing::warn!(upstream = %upstream.name, "overflow = \"queue\" with queue_depth = 0 rejects like overflow = \"reject\"");
        }
    }

    let mut routes = HashSet::new();
    for (i, route) in config.routes.iter().enumerate() {
        let field = format!("routes[{}]", i);
        if !routes.insert(route.name.as_str()) {
            errors.push(ValidationError::new(&field, format!("duplicate route name \"{}\"", route.name)));
        }
        if route.path.is_some() && route.prefix.is_some() {
            errors.push(ValidationError::new(&field, "path and prefix are mutually exclusive"));
        }
        if !route.upstream.starts_with('$') && !upstreams.contains(route.upstream.as_str()) {
            errors.push(ValidationError::new(
                format!("{}.upstream", field),
                format!("unknown upstream \"{}\"", route.upstream),
            ));
        }
        if let Err(e) = Template::load(&route.query) {
            errors.push(ValidationError::new(format!("{}.query", field), e.to_string()));
        }
        for method in &route.methods {
            if method.parse::<axum::http::Method>().is_err() {
                errors.push(ValidationError::new(format!("{}.methods", field), format!("invalid method \"{}\"", method)));
            }
        }

        let mut names = HashSet::new();
        for variable in &route.variables {
            if !names.insert(variable.name.as_str()) {
                errors.push(ValidationError::new(
                    format!("{}.variables", field),
                    format!("duplicate variable \"{}\"", variable.name),
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{PoolConfig, RouteConfig, UpstreamConfig};

    fn upstream(name: &str) -> UpstreamConfig {
        UpstreamConfig {
            name: name.to_string(),
            balance: Default::default(),
            servers: vec!["host=127.0.0.1 dbname=test".to_string()],
            pool: PoolConfig::default(),
        }
    }

    fn route(name: &str, upstream: &str, query: &str) -> RouteConfig {
        RouteConfig {
            name: name.to_string(),
            host: None,
            path: Some(format!("/{}", name)),
            prefix: None,
            methods: Vec::new(),
            upstream: upstream.to_string(),
            query: query.to_string(),
            output: Default::default(),
            binary: false,
            meta_headers: false,
            priority: 0,
            variables: Vec::new(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = GatewayConfig {
            upstreams: vec![upstream("db")],
            routes: vec![route("users", "db", "SELECT * FROM users WHERE id = $arg_id::int4")],
            ..Default::default()
        };
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let mut bad_pool = upstream("db");
        bad_pool.pool.max_sessions = 0;
        let config = GatewayConfig {
            upstreams: vec![bad_pool, upstream("db")],
            routes: vec![
                route("a", "missing", "SELECT 1"),
                route("b", "db", "SELECT $x::wat"),
                route("b", "$arg_db", "SELECT 1"),
            ],
            ..Default::default()
        };

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"upstreams[0].pool.max_sessions"));
        assert!(fields.contains(&"upstreams[0].pool.max_saved"));
        assert!(fields.contains(&"upstreams[1]"));
        assert!(fields.contains(&"routes[0].upstream"));
        assert!(fields.contains(&"routes[1].query"));
        assert!(fields.contains(&"routes[2]"));
    }
}
