//! Scripted in-memory connection for unit tests.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;

use crate::config::conninfo::ConnParams;
use crate::protocol::types;
use crate::wire::{
    BackendErrorInfo, CancelToken, Column, ConnStatus, ConnectPoll, Connector, Interest, Notification, Oid,
    Readiness, ResultStatus, TransactionStatus, WireConnection, WireError, WireResult,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCommand {
    Prepare { name: String, sql: String },
    Prepared { name: String, params: Vec<Option<String>> },
    Params { sql: String, params: Vec<Option<String>> },
    Simple(String),
}

#[derive(Debug, Clone)]
pub enum MockEvent {
    Result(WireResult),
    Ready,
}

#[derive(Default)]
pub struct MockState {
    pub status: Option<ConnStatus>,
    pub connect_script: VecDeque<(ConnectPoll, ConnStatus)>,
    pub connect_polls: usize,
    pub sent: Vec<MockCommand>,
    /// Scripted replies, consumed one per command sent.
    pub replies: VecDeque<Vec<MockEvent>>,
    /// Reply of the last command, delivered on the next `consume_input`.
    pub staged: VecDeque<MockEvent>,
    /// `consume_input` calls that deliver nothing before staged data shows up.
    pub busy_polls: usize,
    pub pending_notifications: VecDeque<Notification>,
    pub fail_input: bool,
    inbound: VecDeque<MockEvent>,
    notifies: VecDeque<Notification>,
    awaiting: bool,
    wakers: Vec<Waker>,
}

impl MockState {
    fn wake(&mut self) {
        for waker in self.wakers.drain(..) {
            waker.wake();
        }
    }

    fn has_input(&self) -> bool {
        !self.staged.is_empty() || !self.pending_notifications.is_empty() || self.fail_input
    }
}

/// Shared handle to a mock connection's state.
#[derive(Clone, Default)]
pub struct MockHandle(pub Arc<Mutex<MockState>>);

impl MockHandle {
    pub fn push_reply(&self, events: Vec<MockEvent>) {
        self.0.lock().replies.push_back(events);
    }

    pub fn push_notification(&self, channel: &str, payload: &str) {
        let mut state = self.0.lock();
        state.pending_notifications.push_back(Notification {
            process_id: 1,
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        state.wake();
    }

    pub fn break_connection(&self) {
        let mut state = self.0.lock();
        state.fail_input = true;
        state.wake();
    }

    pub fn sent(&self) -> Vec<MockCommand> {
        self.0.lock().sent.clone()
    }
}

pub fn rows_result(column: &str, type_oid: Oid, values: &[Option<&str>]) -> WireResult {
    WireResult {
        status: ResultStatus::TuplesOk,
        columns: vec![Column {
            name: column.to_string(),
            type_oid,
            format: 0,
        }],
        rows: values
            .iter()
            .map(|v| vec![v.map(|s| Bytes::copy_from_slice(s.as_bytes()))])
            .collect(),
        command_tag: format!("SELECT {}", values.len()),
        error: None,
    }
}

pub fn error_result(message: &str) -> WireResult {
    WireResult::fatal(BackendErrorInfo {
        severity: "ERROR".into(),
        code: "42601".into(),
        message: message.into(),
        detail: None,
    })
}

fn default_reply(command: &MockCommand) -> Vec<MockEvent> {
    match command {
        MockCommand::Prepare { .. } => vec![MockEvent::Result(WireResult::command_ok("")), MockEvent::Ready],
        MockCommand::Simple(sql) if sql.to_ascii_uppercase().contains("LISTEN") => {
            let tag = if sql.to_ascii_uppercase().starts_with("UNLISTEN") { "UNLISTEN" } else { "LISTEN" };
            let mut events: Vec<MockEvent> = sql
                .split(";\n")
                .map(|_| MockEvent::Result(WireResult::command_ok(tag)))
                .collect();
            events.push(MockEvent::Ready);
            events
        }
        _ => vec![
            MockEvent::Result(rows_result("?column?", types::INT4, &[Some("1")])),
            MockEvent::Ready,
        ],
    }
}

pub struct MockWire {
    handle: MockHandle,
}

impl MockWire {
    pub fn new(handle: MockHandle) -> Self {
        Self { handle }
    }

    fn send(&mut self, command: MockCommand) -> Result<(), WireError> {
        let mut state = self.handle.0.lock();
        if state.status != Some(ConnStatus::Ok) {
            return Err(WireError::NotReady);
        }
        if state.awaiting || !state.inbound.is_empty() {
            return Err(WireError::Busy);
        }
        let reply = state.replies.pop_front().unwrap_or_else(|| default_reply(&command));
        state.sent.push(command);
        state.staged.extend(reply);
        state.awaiting = true;
        state.wake();
        Ok(())
    }
}

struct MockReadiness(MockHandle);

impl MockReadiness {
    fn poll_ready(&self, cx: &mut Context<'_>, interest: Interest) -> Poll<io::Result<()>> {
        let mut state = self.0 .0.lock();
        if interest == Interest::Write || state.has_input() || !state.inbound.is_empty() {
            return Poll::Ready(Ok(()));
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl Readiness for MockReadiness {
    fn ready(&self, interest: Interest) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(std::future::poll_fn(move |cx| self.poll_ready(cx, interest)))
    }
}

impl WireConnection for MockWire {
    fn poll_connect(&mut self) -> ConnectPoll {
        let mut state = self.handle.0.lock();
        state.connect_polls += 1;
        let (poll, status) = state
            .connect_script
            .pop_front()
            .unwrap_or((ConnectPoll::Ok, ConnStatus::Ok));
        state.status = Some(status);
        poll
    }

    fn status(&self) -> ConnStatus {
        self.handle.0.lock().status.unwrap_or(ConnStatus::Started)
    }

    fn parameter(&self, name: &str) -> Option<&str> {
        match name {
            "client_encoding" => Some("UTF8"),
            _ => None,
        }
    }

    fn send_prepare(&mut self, name: &str, sql: &str, _types: &[Oid]) -> Result<(), WireError> {
        self.send(MockCommand::Prepare {
            name: name.to_string(),
            sql: sql.to_string(),
        })
    }

    fn send_query_prepared(&mut self, name: &str, params: &[Option<String>], _binary: bool) -> Result<(), WireError> {
        self.send(MockCommand::Prepared {
            name: name.to_string(),
            params: params.to_vec(),
        })
    }

    fn send_query_params(
        &mut self,
        sql: &str,
        _types: &[Oid],
        params: &[Option<String>],
        _binary: bool,
    ) -> Result<(), WireError> {
        self.send(MockCommand::Params {
            sql: sql.to_string(),
            params: params.to_vec(),
        })
    }

    fn send_query(&mut self, sql: &str) -> Result<(), WireError> {
        self.send(MockCommand::Simple(sql.to_string()))
    }

    fn flush(&mut self) -> Result<bool, WireError> {
        Ok(true)
    }

    fn consume_input(&mut self) -> Result<(), WireError> {
        let mut state = self.handle.0.lock();
        if state.fail_input {
            state.status = Some(ConnStatus::Bad);
            return Err(WireError::Closed);
        }
        if state.busy_polls > 0 {
            state.busy_polls -= 1;
            return Ok(());
        }
        let staged: Vec<MockEvent> = state.staged.drain(..).collect();
        state.inbound.extend(staged);
        let notes: Vec<Notification> = state.pending_notifications.drain(..).collect();
        state.notifies.extend(notes);
        Ok(())
    }

    fn is_busy(&self) -> bool {
        let state = self.handle.0.lock();
        state.awaiting && state.inbound.is_empty()
    }

    fn get_result(&mut self) -> Option<WireResult> {
        let mut state = self.handle.0.lock();
        match state.inbound.pop_front() {
            Some(MockEvent::Result(result)) => Some(result),
            Some(MockEvent::Ready) => {
                state.awaiting = false;
                None
            }
            None => None,
        }
    }

    fn notifies(&mut self) -> Option<Notification> {
        self.handle.0.lock().notifies.pop_front()
    }

    fn cancel_token(&self) -> Option<CancelToken> {
        None
    }

    fn readiness(&self) -> Arc<dyn Readiness> {
        Arc::new(MockReadiness(self.handle.clone()))
    }

    fn transaction_status(&self) -> TransactionStatus {
        TransactionStatus::Idle
    }
}

/// Connector handing out [`MockWire`]s and counting connection attempts.
#[derive(Default)]
pub struct MockConnector {
    pub attempts: AtomicUsize,
    pub refuse: std::sync::atomic::AtomicBool,
    handles: Mutex<Vec<MockHandle>>,
    scripted: Mutex<VecDeque<Vec<MockEvent>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Queue a reply for the first command of the next connection opened.
    pub fn script(&self, events: Vec<MockEvent>) {
        self.scripted.lock().push_back(events);
    }

    /// Handle of the n-th connection opened.
    pub fn handle(&self, n: usize) -> MockHandle {
        self.handles.lock()[n].clone()
    }
}

impl Connector for MockConnector {
    fn connect(&self, _addr: SocketAddr, _params: &ConnParams) -> Result<Box<dyn WireConnection>, WireError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(WireError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")));
        }
        let handle = MockHandle::default();
        if let Some(events) = self.scripted.lock().pop_front() {
            handle.push_reply(events);
        }
        self.handles.lock().push(handle.clone());
        Ok(Box::new(MockWire::new(handle)))
    }
}
