//! Backend session record.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use crate::upstream::listen::{ListenRegistration, ListenSet};
use crate::wire::WireConnection;

/// Protocol state of a backend session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Preparing,
    Executing,
    Fetching,
    Acknowledging,
    Idle,
    Closed,
}

impl SessionState {
    /// A command has been handed to the backend and not yet acknowledged.
    pub fn has_command_in_flight(self) -> bool {
        matches!(
            self,
            SessionState::Preparing | SessionState::Executing | SessionState::Fetching | SessionState::Acknowledging
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Preparing => "preparing",
            SessionState::Executing => "executing",
            SessionState::Fetching => "fetching",
            SessionState::Acknowledging => "acknowledging",
            SessionState::Idle => "idle",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One physical connection and what it has negotiated and cached.
pub struct BackendSession {
    conn: Box<dyn WireConnection>,
    addr: SocketAddr,
    state: SessionState,
    charset: Option<String>,
    prepared: HashSet<String>,
    listens: ListenSet,
    /// Channels whose subscribers vanished, waiting for a batched UNLISTEN.
    stale_listens: Vec<ListenRegistration>,
    /// Registrations held here whose LISTEN waits for the outstanding command.
    pending_listens: Vec<ListenRegistration>,
    requests: u64,
}

impl BackendSession {
    pub fn new(conn: Box<dyn WireConnection>, addr: SocketAddr) -> Self {
        Self {
            conn,
            addr,
            state: SessionState::Connecting,
            charset: None,
            prepared: HashSet::new(),
            listens: ListenSet::default(),
            stale_listens: Vec::new(),
            pending_listens: Vec::new(),
            requests: 0,
        }
    }

    pub fn conn(&self) -> &dyn WireConnection {
        self.conn.as_ref()
    }

    pub fn conn_mut(&mut self) -> &mut dyn WireConnection {
        self.conn.as_mut()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn charset(&self) -> Option<&str> {
        self.charset.as_deref()
    }

    pub(crate) fn set_charset(&mut self, charset: Option<String>) {
        self.charset = charset;
    }

    pub fn is_prepared(&self, name: &str) -> bool {
        self.prepared.contains(name)
    }

    pub(crate) fn remember_prepared(&mut self, name: String) {
        self.prepared.insert(name);
    }

    pub(crate) fn forget_prepared(&mut self, name: &str) {
        self.prepared.remove(name);
    }

    pub fn listens(&self) -> &ListenSet {
        &self.listens
    }

    pub(crate) fn listens_mut(&mut self) -> &mut ListenSet {
        &mut self.listens
    }

    pub(crate) fn stale_listens_mut(&mut self) -> &mut Vec<ListenRegistration> {
        &mut self.stale_listens
    }

    pub(crate) fn pending_listens_mut(&mut self) -> &mut Vec<ListenRegistration> {
        &mut self.pending_listens
    }

    /// Forget a registration held but not yet subscribed.
    pub(crate) fn drop_listen(&mut self, channel: &str) {
        self.listens.remove(channel);
        self.pending_listens.retain(|r| r.channel() != channel);
    }

    pub fn requests(&self) -> u64 {
        self.requests
    }

    pub(crate) fn count_request(&mut self) {
        self.requests += 1;
    }
}

impl fmt::Debug for BackendSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSession")
            .field("addr", &self.addr)
            .field("state", &self.state)
            .field("charset", &self.charset)
            .field("prepared", &self.prepared.len())
            .field("listens", &self.listens.len())
            .field("requests", &self.requests)
            .finish()
    }
}
