//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// Database upstreams, each a group of servers with one pool per address.
    pub upstreams: Vec<UpstreamConfig>,

    /// Route definitions mapping requests to SQL statements.
    pub routes: Vec<RouteConfig>,

    /// Passive health accounting thresholds.
    pub health: HealthConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Retry configuration.
    pub retries: RetryConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Notification channel subscription endpoint.
    pub channels: ChannelsConfig,

    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Maximum concurrent requests (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            tls: None,
            max_connections: 10_000,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Peer selection strategy inside an upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceStrategy {
    #[default]
    RoundRobin,
    LeastConn,
}

/// A named group of database servers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Name routes refer to.
    pub name: String,

    #[serde(default)]
    pub balance: BalanceStrategy,

    /// Connection strings, keyword/value or `postgres://` URI.
    pub servers: Vec<String>,

    #[serde(default)]
    pub pool: PoolConfig,
}

/// What to do with a request when every session slot is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    Reject,
    Queue,
}

/// Per-target session pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Hard cap on concurrent sessions (active + saved).
    pub max_sessions: usize,

    /// Idle sessions kept for reuse.
    pub max_saved: usize,

    pub overflow: OverflowPolicy,

    /// Requests allowed to wait for a session when `overflow = "queue"`.
    pub queue_depth: usize,

    pub queue_timeout_ms: u64,

    /// Idle lifetime of a saved session; 0 disables saving.
    pub keepalive_secs: u64,

    /// Requests per session before it is rotated out; 0 means unlimited.
    pub max_requests: u64,

    /// Cache prepared statements per session.
    pub prepare: bool,

    pub connect_timeout_ms: u64,

    pub query_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            max_saved: 10,
            overflow: OverflowPolicy::Reject,
            queue_depth: 0,
            queue_timeout_ms: 5_000,
            keepalive_secs: 60,
            max_requests: 0,
            prepare: true,
            connect_timeout_ms: 60_000,
            query_timeout_ms: 60_000,
        }
    }
}

/// Response body format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    None,
    #[default]
    Text,
    Value,
    Hex,
    Json,
}

/// Route configuration mapping requests to a SQL statement.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging/metrics.
    pub name: String,

    /// Host header to match (exact match).
    pub host: Option<String>,

    /// Exact path to match.
    pub path: Option<String>,

    /// Path prefix to match.
    pub prefix: Option<String>,

    /// Allowed methods; empty allows all.
    #[serde(default)]
    pub methods: Vec<String>,

    /// Upstream name, or `$variable` resolved per request.
    pub upstream: String,

    /// SQL template, or `file://path`.
    pub query: String,

    #[serde(default)]
    pub output: OutputFormat,

    /// Request binary result format.
    #[serde(default)]
    pub binary: bool,

    /// Expose `x-postgres-*` result metadata headers.
    #[serde(default)]
    pub meta_headers: bool,

    /// Route priority (higher = checked first).
    #[serde(default)]
    pub priority: u32,

    #[serde(default)]
    pub variables: Vec<VariableConfig>,
}

/// Column reference of a custom variable: position or name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ColumnRef {
    Index(usize),
    Name(String),
}

/// Value pulled out of the result into a response header.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VariableConfig {
    pub name: String,

    #[serde(default)]
    pub row: usize,

    pub column: ColumnRef,

    /// Fail the request when the value is missing, NULL or empty.
    #[serde(default)]
    pub required: bool,
}

/// Passive health accounting.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Number of consecutive failures before marking unhealthy.
    pub unhealthy_threshold: u32,

    /// Number of consecutive successes before marking healthy.
    pub healthy_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 30 }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries.
    pub enabled: bool,

    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Percentage of requests that can be retries (retry budget).
    /// e.g., 0.1 for 10% budget.
    pub budget_ratio: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2000,
            budget_ratio: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Server-sent-events endpoint streaming relayed notifications.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub enabled: bool,

    /// Path prefix; the channel name follows it.
    pub path: String,

    /// Per-channel broadcast buffer.
    pub capacity: usize,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/channels".to_string(),
            capacity: 256,
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
