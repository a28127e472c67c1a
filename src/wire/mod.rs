//! Non-blocking database client interface.
//!
//! # Data Flow
//! ```text
//! Connector::connect(addr, params)        (non-blocking socket connect)
//!     → WireConnection::poll_connect      (startup + auth handshake, repeated)
//!     → send_prepare / send_query_*       (buffered frontend messages)
//!     → flush                             (on write readiness)
//!     → consume_input → is_busy → get_result / notifies
//!                                         (on read readiness)
//! ```
//!
//! # Design Decisions
//! - Poll-style API: nothing here ever awaits, the caller decides when to
//!   retry by waiting on [`Readiness`]
//! - One outstanding command per connection; `get_result` returns `None`
//!   once the command's ready-for-query acknowledgment has been consumed
//! - Readiness is a separate shareable handle so an idle session can be
//!   watched without holding the session itself

pub mod pg;

#[cfg(test)]
pub mod mock;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use postgres_protocol::message::frontend;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::config::conninfo::ConnParams;

pub use pg::PgConnector;

/// Type OID as reported by the backend.
pub type Oid = u32;

/// Readiness direction a suspended operation waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// Handle used to wait for socket readiness without owning the connection.
///
/// Several tasks may wait on the same handle at once (a request and the idle
/// watcher it took the session from); every waiter must be woken.
pub trait Readiness: Send + Sync {
    fn ready(&self, interest: Interest) -> BoxFuture<'_, io::Result<()>>;
}

/// Wait until `readiness` reports the requested direction.
pub async fn ready(readiness: &dyn Readiness, interest: Interest) -> io::Result<()> {
    readiness.ready(interest).await
}

/// Handshake progress reported by [`WireConnection::poll_connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectPoll {
    Reading,
    Writing,
    Ok,
    Failed(String),
}

/// Connection status, in handshake order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// Socket connect in progress.
    Started,
    /// Socket connected, startup packet not yet sent.
    Made,
    /// Startup sent, waiting for the server.
    AwaitingResponse,
    /// Authenticated, waiting for the first ready-for-query.
    AuthOk,
    Ok,
    Bad,
}

/// Transaction status from the last ready-for-query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    Failed,
    Unknown,
}

impl TransactionStatus {
    pub fn from_byte(b: u8) -> Self {
        match b {
            b'I' => TransactionStatus::Idle,
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    CommandOk,
    TuplesOk,
    EmptyQuery,
    FatalError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_oid: Oid,
    pub format: i16,
}

/// Error fields of a backend error response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendErrorInfo {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
}

impl fmt::Display for BackendErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:  {}", self.severity, self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL:  {}", detail)?;
        }
        Ok(())
    }
}

/// One complete result of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireResult {
    pub status: ResultStatus,
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Option<Bytes>>>,
    pub command_tag: String,
    pub error: Option<BackendErrorInfo>,
}

impl WireResult {
    pub fn command_ok(tag: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::CommandOk,
            columns: Vec::new(),
            rows: Vec::new(),
            command_tag: tag.into(),
            error: None,
        }
    }

    pub fn fatal(error: BackendErrorInfo) -> Self {
        Self {
            status: ResultStatus::FatalError,
            columns: Vec::new(),
            rows: Vec::new(),
            command_tag: String::new(),
            error: Some(error),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.status == ResultStatus::FatalError
    }

    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown backend error".to_string())
    }
}

/// Asynchronous notification pushed by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("server closed the connection unexpectedly")]
    Closed,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("another command is already in progress")]
    Busy,
    #[error("connection is not ready")]
    NotReady,
}

/// Out-of-band cancel request for the command running on a connection.
#[derive(Debug, Clone, Copy)]
pub struct CancelToken {
    pub addr: SocketAddr,
    pub process_id: i32,
    pub secret_key: i32,
}

impl CancelToken {
    /// Open a fresh connection and deliver the cancel request on it.
    pub async fn send(&self) -> io::Result<()> {
        let mut stream = tokio::net::TcpStream::connect(self.addr).await?;
        let mut buf = BytesMut::new();
        frontend::cancel_request(self.process_id, self.secret_key, &mut buf);
        stream.write_all(&buf).await?;
        stream.shutdown().await
    }
}

/// A physical connection driven through a poll-style API.
pub trait WireConnection: Send {
    /// Advance the connection handshake as far as currently possible.
    fn poll_connect(&mut self) -> ConnectPoll;

    fn status(&self) -> ConnStatus;

    /// Server-reported runtime parameter (e.g. `client_encoding`).
    fn parameter(&self, name: &str) -> Option<&str>;

    fn send_prepare(&mut self, name: &str, sql: &str, types: &[Oid]) -> Result<(), WireError>;

    fn send_query_prepared(
        &mut self,
        name: &str,
        params: &[Option<String>],
        binary: bool,
    ) -> Result<(), WireError>;

    fn send_query_params(
        &mut self,
        sql: &str,
        types: &[Oid],
        params: &[Option<String>],
        binary: bool,
    ) -> Result<(), WireError>;

    /// Simple-protocol command; may produce several results.
    fn send_query(&mut self, sql: &str) -> Result<(), WireError>;

    /// Write buffered output. `Ok(true)` once everything has been sent.
    fn flush(&mut self) -> Result<bool, WireError>;

    /// Read whatever the socket has and parse complete messages.
    fn consume_input(&mut self) -> Result<(), WireError>;

    /// True while a command is outstanding and no complete result is buffered.
    fn is_busy(&self) -> bool;

    fn get_result(&mut self) -> Option<WireResult>;

    fn notifies(&mut self) -> Option<Notification>;

    fn cancel_token(&self) -> Option<CancelToken>;

    fn readiness(&self) -> Arc<dyn Readiness>;

    fn transaction_status(&self) -> TransactionStatus;
}

/// Starts physical connections.
pub trait Connector: Send + Sync {
    fn connect(&self, addr: SocketAddr, params: &ConnParams) -> Result<Box<dyn WireConnection>, WireError>;
}
