//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Statement fails before dispatch:
//!     → retries.rs (is there budget left?)
//!     → backoff.rs (exponential delay with jitter)
//!     → next target of the same upstream
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; connect, query and queue waits all have deadlines
//! - Retry budget prevents retry storms under load

pub mod backoff;
pub mod retries;
