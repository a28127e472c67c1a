//! PostgreSQL HTTP gateway library.
//!
//! HTTP requests are matched to routes, each route's statement template is
//! compiled with request variables, executed on a pooled backend session and
//! the result serialized into the response.

// Core subsystems
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod routing;

// Database sessions
pub mod protocol;
pub mod relay;
pub mod upstream;
pub mod wire;

// Cross-cutting concerns
pub mod admin;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::GatewayConfig;
pub use error::GatewayError;
pub use http::GatewayServer;
pub use lifecycle::Shutdown;
