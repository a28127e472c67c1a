//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validated config → Upstream pools → Routes → Listeners
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Pools terminating → Channel streams closed → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core, then listeners
//! - Ordered shutdown: stop accept, release pools, close
//! - Shutdown is idempotent

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
