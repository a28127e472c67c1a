//! Re-entrant protocol state machine.
//!
//! [`ProtocolMachine::advance`] runs as far as the connection allows and
//! returns which readiness it needs next; [`ProtocolMachine::run`] is the
//! tokio driver that waits for that readiness under the active deadline.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::{GatewayError, TimeoutKind};
use crate::protocol::context::RequestContext;
use crate::relay::drain;
use crate::upstream::session::{BackendSession, SessionState};
use crate::upstream::target::PoolPolicy;
use crate::wire::{self, ConnStatus, ConnectPoll, Interest, ResultStatus, WireError};

/// What woke the machine up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Start,
    Readable,
    Writable,
}

/// Outcome of one `advance` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Wait(Interest),
    Done,
}

enum Transition {
    Continue,
    Wait(Interest),
    Finished,
}

#[derive(Debug)]
pub struct ProtocolMachine {
    prepare: bool,
    connect_timeout: Duration,
    query_timeout: Duration,
    deadline: Option<(Instant, TimeoutKind)>,
    /// Current state's command has been written to the connection buffer.
    sent: bool,
    /// The request's statement reached the backend.
    dispatched: bool,
    finished: bool,
    prepare_failed: bool,
}

impl ProtocolMachine {
    pub fn new(policy: &PoolPolicy) -> Self {
        Self {
            prepare: policy.prepare,
            connect_timeout: policy.connect_timeout,
            query_timeout: policy.query_timeout,
            deadline: None,
            sent: false,
            dispatched: false,
            finished: false,
            prepare_failed: false,
        }
    }

    pub fn deadline(&self) -> Option<(Instant, TimeoutKind)> {
        self.deadline
    }

    /// Whether the statement may already have run on the backend.
    pub fn dispatched(&self) -> bool {
        self.dispatched
    }

    /// Drive the session until the request completes.
    pub async fn run(&mut self, session: &mut BackendSession, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        let readiness = session.conn().readiness();
        let mut event = Event::Start;
        loop {
            let interest = match self.advance(session, ctx, event)? {
                Step::Done => return Ok(()),
                Step::Wait(interest) => interest,
            };

            let wait = wire::ready(readiness.as_ref(), interest);
            let outcome = match self.deadline {
                Some((at, kind)) => match tokio::time::timeout_at(at, wait).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        session.set_state(SessionState::Closed);
                        return Err(GatewayError::Timeout(kind));
                    }
                },
                None => wait.await,
            };
            if let Err(e) = outcome {
                session.set_state(SessionState::Closed);
                return Err(GatewayError::Protocol(e.to_string()));
            }

            event = match interest {
                Interest::Read => Event::Readable,
                Interest::Write => Event::Writable,
            };
        }
    }

    /// Advance as far as possible without blocking.
    pub fn advance(
        &mut self,
        session: &mut BackendSession,
        ctx: &mut RequestContext,
        event: Event,
    ) -> Result<Step, GatewayError> {
        if self.finished {
            return Ok(Step::Done);
        }
        let mut write_ready = event == Event::Writable;
        loop {
            let state = session.state();
            let transition = match state {
                SessionState::Connecting => self.connect(session, ctx, &mut write_ready),
                SessionState::Idle => self.resume(session, ctx),
                SessionState::Preparing => self.prepare(session, ctx),
                SessionState::Executing => self.execute(session, ctx),
                SessionState::Fetching => self.fetch(session, ctx),
                SessionState::Acknowledging => self.acknowledge(session),
                SessionState::Closed => Err(GatewayError::Protocol("session is closed".into())),
            };

            match transition {
                Ok(Transition::Continue) => continue,
                Ok(Transition::Wait(interest)) => return Ok(Step::Wait(interest)),
                Ok(Transition::Finished) => {
                    self.finished = true;
                    self.deadline = None;
                    session.set_state(SessionState::Idle);
                    return Ok(Step::Done);
                }
                Err(e) => {
                    tracing::debug!(addr = %session.addr(), state = %state, error = %e, "Session failed");
                    session.set_state(SessionState::Closed);
                    return Err(e);
                }
            }
        }
    }

    fn connect(
        &mut self,
        session: &mut BackendSession,
        ctx: &RequestContext,
        write_ready: &mut bool,
    ) -> Result<Transition, GatewayError> {
        if self.deadline.is_none() {
            self.deadline = Some((Instant::now() + self.connect_timeout, TimeoutKind::Connect));
        }

        loop {
            match session.conn_mut().poll_connect() {
                ConnectPoll::Ok => break,
                ConnectPoll::Failed(reason) => {
                    return Err(GatewayError::ConnectFailed {
                        target: session.addr().to_string(),
                        reason,
                    });
                }
                ConnectPoll::Reading | ConnectPoll::Writing
                    if *write_ready && session.conn().status() == ConnStatus::Made =>
                {
                    // The socket became writable while the handshake was between
                    // "connected" and "startup sent"; no further event will come.
                    *write_ready = false;
                    continue;
                }
                ConnectPoll::Reading => return Ok(Transition::Wait(Interest::Read)),
                ConnectPoll::Writing => return Ok(Transition::Wait(Interest::Write)),
            }
        }

        self.deadline = None;
        let charset = session.conn().parameter("client_encoding").map(normalize_charset);
        session.set_charset(charset);
        tracing::debug!(addr = %session.addr(), charset = ?session.charset(), "Backend connected");
        session.set_state(self.first_command_state(ctx));
        Ok(Transition::Continue)
    }

    /// Reused idle session: finish whatever an idle-time command left behind,
    /// including subscriptions the session adopted while it was busy.
    fn resume(&mut self, session: &mut BackendSession, ctx: &RequestContext) -> Result<Transition, GatewayError> {
        loop {
            let conn = session.conn_mut();
            if !conn.flush().map_err(protocol_error)? {
                return Ok(Transition::Wait(Interest::Write));
            }
            conn.consume_input().map_err(protocol_error)?;
            loop {
                if conn.is_busy() {
                    return Ok(Transition::Wait(Interest::Read));
                }
                match conn.get_result() {
                    Some(result) if result.is_fatal() => {
                        tracing::warn!(error = %result.error_message(), "Discarding idle-time error");
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            if !drain::send_listens(session).map_err(protocol_error)? {
                break;
            }
        }
        session.set_state(self.first_command_state(ctx));
        Ok(Transition::Continue)
    }

    fn first_command_state(&self, ctx: &RequestContext) -> SessionState {
        if self.prepare && ctx.statement().statement_name().is_some() {
            SessionState::Preparing
        } else {
            SessionState::Executing
        }
    }

    fn prepare(&mut self, session: &mut BackendSession, ctx: &mut RequestContext) -> Result<Transition, GatewayError> {
        let Some(name) = ctx.statement().statement_name() else {
            session.set_state(SessionState::Executing);
            return Ok(Transition::Continue);
        };

        if !self.sent {
            if session.is_prepared(&name) {
                session.set_state(SessionState::Executing);
                return Ok(Transition::Continue);
            }
            let statement = ctx.statement();
            session
                .conn_mut()
                .send_prepare(&name, statement.sql(), statement.types())
                .map_err(protocol_error)?;
            self.sent = true;
        }

        let conn = session.conn_mut();
        if !conn.flush().map_err(protocol_error)? {
            return Ok(Transition::Wait(Interest::Write));
        }
        conn.consume_input().map_err(protocol_error)?;
        loop {
            if conn.is_busy() {
                return Ok(Transition::Wait(Interest::Read));
            }
            match conn.get_result() {
                Some(result) if result.is_fatal() => {
                    self.prepare_failed = true;
                    ctx.fail_backend(result.error_message());
                }
                Some(_) => {}
                None => break,
            }
        }
        self.sent = false;

        if self.prepare_failed {
            return Ok(Transition::Finished);
        }
        session.remember_prepared(name);
        session.set_state(SessionState::Executing);
        Ok(Transition::Continue)
    }

    fn execute(&mut self, session: &mut BackendSession, ctx: &RequestContext) -> Result<Transition, GatewayError> {
        if !self.sent {
            let statement = ctx.statement();
            let prepared = statement
                .statement_name()
                .filter(|name| self.prepare && session.is_prepared(name));
            let conn = session.conn_mut();
            let sent = match (&prepared, statement.listen()) {
                (_, Some(_)) => conn.send_query(statement.sql()),
                (Some(name), None) => conn.send_query_prepared(name, statement.params(), statement.binary()),
                (None, None) => {
                    conn.send_query_params(statement.sql(), statement.types(), statement.params(), statement.binary())
                }
            };
            sent.map_err(protocol_error)?;
            self.sent = true;
            self.dispatched = true;
            self.deadline = Some((Instant::now() + self.query_timeout, TimeoutKind::Query));
            session.count_request();
        }

        if !session.conn_mut().flush().map_err(protocol_error)? {
            return Ok(Transition::Wait(Interest::Write));
        }
        self.sent = false;
        session.set_state(SessionState::Fetching);
        Ok(Transition::Continue)
    }

    fn fetch(&mut self, session: &mut BackendSession, ctx: &mut RequestContext) -> Result<Transition, GatewayError> {
        let conn = session.conn_mut();
        conn.consume_input().map_err(protocol_error)?;
        if conn.is_busy() {
            return Ok(Transition::Wait(Interest::Read));
        }
        let result = conn
            .get_result()
            .ok_or_else(|| GatewayError::Protocol("command finished without a result".into()))?;
        self.deadline = None;

        match result.status {
            ResultStatus::FatalError => {
                let message = result.error_message();
                tracing::debug!(addr = %session.addr(), error = %message, "Statement failed on backend");
                if let Some(name) = ctx.statement().statement_name() {
                    session.forget_prepared(&name);
                }
                ctx.fail_backend(message);
            }
            ResultStatus::CommandOk | ResultStatus::TuplesOk | ResultStatus::EmptyQuery => {
                if let Some(registration) = ctx.statement().listen().cloned() {
                    ctx.listens.push(registration);
                }
                ctx.result.absorb(result);
            }
        }
        ctx.result.charset = session.charset().map(str::to_string);
        session.set_state(SessionState::Acknowledging);
        Ok(Transition::Continue)
    }

    fn acknowledge(&mut self, session: &mut BackendSession) -> Result<Transition, GatewayError> {
        let addr = session.addr();
        let conn = session.conn_mut();
        conn.consume_input().map_err(protocol_error)?;
        if conn.is_busy() {
            return Ok(Transition::Wait(Interest::Read));
        }
        match conn.get_result() {
            None => Ok(Transition::Finished),
            Some(extra) => {
                tracing::error!(
                    addr = %addr,
                    status = ?extra.status,
                    tag = %extra.command_tag,
                    "Received a second result after the command completed; multiple statements in one query?"
                );
                Err(GatewayError::UnexpectedExtraResult)
            }
        }
    }
}

/// Drain a session whose request went away mid-command until the backend
/// acknowledges readiness, so it can go back to the pool clean.
pub async fn drain_to_idle(session: &mut BackendSession, deadline: Instant) -> Result<(), GatewayError> {
    let readiness = session.conn().readiness();
    loop {
        let conn = session.conn_mut();
        if !conn.flush().map_err(protocol_error)? {
            wait_until(readiness.as_ref(), Interest::Write, deadline).await?;
            continue;
        }
        conn.consume_input().map_err(protocol_error)?;
        loop {
            if conn.is_busy() {
                break;
            }
            if conn.get_result().is_none() {
                session.set_state(SessionState::Idle);
                return Ok(());
            }
        }
        wait_until(readiness.as_ref(), Interest::Read, deadline).await?;
    }
}

async fn wait_until(readiness: &dyn wire::Readiness, interest: Interest, deadline: Instant) -> Result<(), GatewayError> {
    match tokio::time::timeout_at(deadline, wire::ready(readiness, interest)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(GatewayError::Protocol(e.to_string())),
        Err(_) => Err(GatewayError::Timeout(TimeoutKind::Query)),
    }
}

fn protocol_error(e: WireError) -> GatewayError {
    GatewayError::Protocol(e.to_string())
}

fn normalize_charset(raw: &str) -> String {
    if raw.eq_ignore_ascii_case("UTF8") {
        "utf-8".to_string()
    } else {
        raw.to_ascii_lowercase()
    }
}
