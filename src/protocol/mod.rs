//! Per-request protocol state machine.
//!
//! # Data Flow
//! ```text
//! CompiledStatement + RequestContext
//!     → machine.rs: connect → prepare (cached per session) → execute
//!                   → fetch (accumulate result.rs) → acknowledge → idle
//!     → QueryResult for the output serializers
//! ```
//!
//! # Design Decisions
//! - The machine is re-entrant: every step either advances or names the
//!   readiness it waits for, never blocks
//! - One deadline per phase: connect timeout until ready, query timeout after
//! - Any wire failure closes the session; backend errors keep it usable

pub mod context;
pub mod machine;
pub mod result;
pub mod statement;
pub mod types;
