//! Notification relay.
//!
//! # Data Flow
//! ```text
//! Session released and saved
//!     → watch.rs (task waits for readiness / keepalive / stop)
//!     → drain.rs (consume results, forward notifications)
//!         → sink.rs (PubSubSink::publish)
//!         → NoSuchChannel → registration slated for UNLISTEN
//!     → keepalive expiry or I/O error → session destroyed
//! ```
//!
//! # Design Decisions
//! - The watcher never owns the session; it drives it through the pool lock
//!   and stops as soon as the session leaves the saved set
//! - Errors on idle sessions are logged, never propagated
//! - UNLISTEN commands for dead channels go out in one batch
//! - `hub.rs` is the in-process sink behind the SSE endpoint

pub mod drain;
pub mod hub;
pub mod sink;
pub mod watch;

pub use hub::ChannelHub;
pub use sink::{PubSubSink, PublishOutcome};
