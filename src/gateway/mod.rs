//! Statement gateway.
//!
//! # Data Flow
//! ```text
//! Matched route + request
//!     → vars.rs (request variables)
//!     → template.rs (bind parameters, escaped identifiers)
//!     → executor.rs (session acquire, protocol machine, failover)
//!     → output.rs (body format, variables, result headers)
//! ```
//!
//! `handler.rs` ties the steps together behind the axum fallback route.

pub mod executor;
pub mod handler;
pub mod output;
pub mod template;
pub mod vars;

pub use executor::Executor;
pub use handler::gateway_handler;
