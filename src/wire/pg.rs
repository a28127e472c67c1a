//! PostgreSQL implementation of [`WireConnection`].
//!
//! Message framing, authentication exchanges and escaping come from
//! `postgres-protocol`; this file only moves bytes between those codecs and
//! a non-blocking tokio socket.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use fallible_iterator::FallibleIterator;
use futures_util::future::BoxFuture;
use postgres_protocol::authentication::{self, sasl};
use postgres_protocol::message::backend::{self, ErrorFields, Message};
use postgres_protocol::message::frontend::{self, BindError};
use postgres_protocol::IsNull;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpStream;

use crate::config::conninfo::ConnParams;
use crate::wire::{
    BackendErrorInfo, CancelToken, Column, ConnStatus, ConnectPoll, Connector, Interest, Notification, Oid,
    Readiness, ResultStatus, TransactionStatus, WireConnection, WireError, WireResult,
};

const READ_CHUNK: usize = 8 * 1024;

/// Opens [`PgWire`] connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct PgConnector;

impl Connector for PgConnector {
    fn connect(&self, addr: SocketAddr, params: &ConnParams) -> Result<Box<dyn WireConnection>, WireError> {
        Ok(Box::new(PgWire::start(addr, params.clone())?))
    }
}

impl Readiness for TcpStream {
    fn ready(&self, interest: Interest) -> BoxFuture<'_, io::Result<()>> {
        match interest {
            Interest::Read => Box::pin(self.readable()),
            Interest::Write => Box::pin(self.writable()),
        }
    }
}

enum Inbound {
    Result(WireResult),
    Ready,
}

#[derive(Default)]
struct PartialResult {
    described: bool,
    columns: Vec<Column>,
    rows: Vec<Vec<Option<Bytes>>>,
}

impl PartialResult {
    fn finish(&mut self, status: Option<ResultStatus>, tag: String) -> WireResult {
        let described = std::mem::take(&mut self.described);
        let status = status.unwrap_or(if described {
            ResultStatus::TuplesOk
        } else {
            ResultStatus::CommandOk
        });
        WireResult {
            status,
            columns: std::mem::take(&mut self.columns),
            rows: std::mem::take(&mut self.rows),
            command_tag: tag,
            error: None,
        }
    }

    fn reset(&mut self) {
        *self = PartialResult::default();
    }
}

/// One PostgreSQL connection over a non-blocking TCP socket.
pub struct PgWire {
    stream: Arc<TcpStream>,
    addr: SocketAddr,
    params: ConnParams,
    status: ConnStatus,
    read_buf: BytesMut,
    write_buf: BytesMut,
    inbound: VecDeque<Inbound>,
    notifies: VecDeque<Notification>,
    server_params: HashMap<String, String>,
    backend_key: Option<(i32, i32)>,
    partial: PartialResult,
    /// Sync/Query messages sent whose ready-for-query has not arrived yet.
    pending_ready: usize,
    report_parse: bool,
    scram: Option<sasl::ScramSha256>,
    tx_status: TransactionStatus,
    failure: Option<String>,
}

impl PgWire {
    /// Begin a non-blocking connect. Must be called inside a tokio runtime.
    pub fn start(addr: SocketAddr, params: ConnParams) -> Result<Self, WireError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;
        socket.set_keepalive(true)?;
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if connect_in_progress(&e) => {}
            Err(e) => return Err(e.into()),
        }
        let stream = TcpStream::from_std(std::net::TcpStream::from(socket))?;

        Ok(Self {
            stream: Arc::new(stream),
            addr,
            params,
            status: ConnStatus::Started,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            inbound: VecDeque::new(),
            notifies: VecDeque::new(),
            server_params: HashMap::new(),
            backend_key: None,
            partial: PartialResult::default(),
            pending_ready: 0,
            report_parse: false,
            scram: None,
            tx_status: TransactionStatus::Unknown,
            failure: None,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn handshake(&mut self) -> Result<ConnectPoll, WireError> {
        match self.status {
            ConnStatus::Started => {
                if let Some(e) = self.stream.take_error()? {
                    return Err(e.into());
                }
                match self.stream.peer_addr() {
                    Ok(_) => {
                        frontend::startup_message(self.params.startup_params(), &mut self.write_buf)?;
                        self.status = ConnStatus::Made;
                        Ok(ConnectPoll::Writing)
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(ConnectPoll::Writing),
                    Err(e) => Err(e.into()),
                }
            }
            ConnStatus::Made => {
                if !self.flush()? {
                    return Ok(ConnectPoll::Writing);
                }
                self.status = ConnStatus::AwaitingResponse;
                Ok(ConnectPoll::Reading)
            }
            ConnStatus::AwaitingResponse | ConnStatus::AuthOk => {
                if !self.flush()? {
                    return Ok(ConnectPoll::Writing);
                }
                let eof = self.fill()?;
                self.parse_startup()?;
                if self.status == ConnStatus::Ok {
                    return Ok(ConnectPoll::Ok);
                }
                if eof {
                    return Err(WireError::Closed);
                }
                if !self.flush()? {
                    return Ok(ConnectPoll::Writing);
                }
                Ok(ConnectPoll::Reading)
            }
            ConnStatus::Ok => Ok(ConnectPoll::Ok),
            ConnStatus::Bad => Ok(ConnectPoll::Failed(
                self.failure.clone().unwrap_or_else(|| "connection is bad".to_string()),
            )),
        }
    }

    fn parse_startup(&mut self) -> Result<(), WireError> {
        while let Some(message) = Message::parse(&mut self.read_buf)? {
            match message {
                Message::AuthenticationOk => self.status = ConnStatus::AuthOk,
                Message::AuthenticationCleartextPassword => {
                    let password = password(&self.params)?;
                    frontend::password_message(password.as_bytes(), &mut self.write_buf)?;
                }
                Message::AuthenticationMd5Password(body) => {
                    let password = password(&self.params)?;
                    let hash = authentication::md5_hash(self.params.user.as_bytes(), password.as_bytes(), body.salt());
                    frontend::password_message(hash.as_bytes(), &mut self.write_buf)?;
                }
                Message::AuthenticationSasl(body) => {
                    let mut mechanisms = body.mechanisms();
                    let mut supported = false;
                    while let Some(mechanism) = mechanisms.next()? {
                        if mechanism == sasl::SCRAM_SHA_256 {
                            supported = true;
                        }
                    }
                    if !supported {
                        return Err(WireError::Auth("server offered no supported SASL mechanism".into()));
                    }
                    let password = password(&self.params)?;
                    let scram = sasl::ScramSha256::new(password.as_bytes(), sasl::ChannelBinding::unsupported());
                    frontend::sasl_initial_response(sasl::SCRAM_SHA_256, scram.message(), &mut self.write_buf)?;
                    self.scram = Some(scram);
                }
                Message::AuthenticationSaslContinue(body) => {
                    let scram = self
                        .scram
                        .as_mut()
                        .ok_or_else(|| WireError::Protocol("unexpected SASL continue".into()))?;
                    scram.update(body.data())?;
                    frontend::sasl_response(scram.message(), &mut self.write_buf)?;
                }
                Message::AuthenticationSaslFinal(body) => {
                    let scram = self
                        .scram
                        .as_mut()
                        .ok_or_else(|| WireError::Protocol("unexpected SASL final".into()))?;
                    scram.finish(body.data())?;
                }
                Message::BackendKeyData(body) => {
                    self.backend_key = Some((body.process_id(), body.secret_key()));
                }
                Message::ParameterStatus(body) => {
                    self.server_params.insert(body.name()?.to_string(), body.value()?.to_string());
                }
                Message::ReadyForQuery(body) => {
                    self.tx_status = TransactionStatus::from_byte(body.status());
                    self.scram = None;
                    self.status = ConnStatus::Ok;
                }
                Message::ErrorResponse(body) => {
                    let info = error_info(body.fields())?;
                    return Err(WireError::Auth(info.to_string()));
                }
                Message::NoticeResponse(_) => {}
                _ if self.status == ConnStatus::AwaitingResponse => {
                    return Err(WireError::Auth("unsupported authentication method".into()));
                }
                _ => return Err(WireError::Protocol("unexpected message during startup".into())),
            }
        }
        Ok(())
    }

    fn parse_messages(&mut self) -> Result<(), WireError> {
        while let Some(message) = Message::parse(&mut self.read_buf)? {
            match message {
                Message::RowDescription(body) => {
                    self.partial.columns.clear();
                    let mut fields = body.fields();
                    while let Some(field) = fields.next()? {
                        self.partial.columns.push(Column {
                            name: field.name().to_string(),
                            type_oid: field.type_oid(),
                            format: field.format(),
                        });
                    }
                    self.partial.described = true;
                }
                Message::DataRow(body) => {
                    let buffer = body.buffer();
                    let mut ranges = body.ranges();
                    let mut row = Vec::with_capacity(self.partial.columns.len());
                    while let Some(range) = ranges.next()? {
                        row.push(range.map(|r| Bytes::copy_from_slice(&buffer[r])));
                    }
                    self.partial.rows.push(row);
                }
                Message::CommandComplete(body) => {
                    let tag = body.tag()?.to_string();
                    let result = self.partial.finish(None, tag);
                    self.inbound.push_back(Inbound::Result(result));
                }
                Message::EmptyQueryResponse => {
                    let result = self.partial.finish(Some(ResultStatus::EmptyQuery), String::new());
                    self.inbound.push_back(Inbound::Result(result));
                }
                Message::ErrorResponse(body) => {
                    let info = error_info(body.fields())?;
                    self.partial.reset();
                    self.inbound.push_back(Inbound::Result(WireResult::fatal(info)));
                }
                Message::ParseComplete => {
                    if self.report_parse {
                        self.inbound.push_back(Inbound::Result(WireResult::command_ok("")));
                    }
                }
                Message::ReadyForQuery(body) => {
                    if self.pending_ready == 0 {
                        return Err(WireError::Protocol("unsolicited ready-for-query".into()));
                    }
                    self.pending_ready -= 1;
                    self.tx_status = TransactionStatus::from_byte(body.status());
                    self.inbound.push_back(Inbound::Ready);
                }
                Message::NotificationResponse(body) => {
                    self.notifies.push_back(Notification {
                        process_id: body.process_id(),
                        channel: body.channel()?.to_string(),
                        payload: body.message()?.to_string(),
                    });
                }
                Message::ParameterStatus(body) => {
                    self.server_params.insert(body.name()?.to_string(), body.value()?.to_string());
                }
                Message::NoticeResponse(body) => {
                    let info = error_info(body.fields())?;
                    tracing::debug!(addr = %self.addr, notice = %info, "Backend notice");
                }
                Message::BindComplete
                | Message::CloseComplete
                | Message::NoData
                | Message::PortalSuspended
                | Message::ParameterDescription(_) => {}
                _ => return Err(WireError::Protocol("unexpected message from backend".into())),
            }
        }
        Ok(())
    }

    /// Read until the socket would block. Returns true on EOF.
    fn fill(&mut self) -> Result<bool, WireError> {
        loop {
            self.read_buf.reserve(READ_CHUNK);
            match self.stream.try_read_buf(&mut self.read_buf) {
                Ok(0) => return Ok(true),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn ensure_idle(&self) -> Result<(), WireError> {
        if self.status != ConnStatus::Ok {
            return Err(WireError::NotReady);
        }
        if self.pending_ready > 0 || !self.inbound.is_empty() {
            return Err(WireError::Busy);
        }
        Ok(())
    }

    fn encode_bind(&mut self, statement: &str, params: &[Option<String>], binary: bool) -> Result<(), WireError> {
        let result_format: i16 = if binary { 1 } else { 0 };
        frontend::bind(
            "",
            statement,
            std::iter::empty::<i16>(),
            params.iter(),
            |param: &Option<String>, buf: &mut BytesMut| match param {
                Some(value) => {
                    buf.extend_from_slice(value.as_bytes());
                    Ok(IsNull::No)
                }
                None => Ok(IsNull::Yes),
            },
            std::iter::once(result_format),
            &mut self.write_buf,
        )
        .map_err(|e| match e {
            BindError::Conversion(e) => WireError::Protocol(e.to_string()),
            BindError::Serialization(e) => WireError::Io(e),
        })?;
        frontend::describe(b'P', "", &mut self.write_buf)?;
        frontend::execute("", 0, &mut self.write_buf)?;
        frontend::sync(&mut self.write_buf);
        Ok(())
    }

    fn mark_bad(&mut self, error: &WireError) {
        self.status = ConnStatus::Bad;
        self.failure = Some(error.to_string());
    }
}

impl WireConnection for PgWire {
    fn poll_connect(&mut self) -> ConnectPoll {
        match self.handshake() {
            Ok(poll) => poll,
            Err(e) => {
                self.mark_bad(&e);
                ConnectPoll::Failed(e.to_string())
            }
        }
    }

    fn status(&self) -> ConnStatus {
        self.status
    }

    fn parameter(&self, name: &str) -> Option<&str> {
        self.server_params.get(name).map(String::as_str)
    }

    fn send_prepare(&mut self, name: &str, sql: &str, types: &[Oid]) -> Result<(), WireError> {
        self.ensure_idle()?;
        frontend::parse(name, sql, types.iter().copied(), &mut self.write_buf)?;
        frontend::sync(&mut self.write_buf);
        self.report_parse = true;
        self.pending_ready += 1;
        Ok(())
    }

    fn send_query_prepared(&mut self, name: &str, params: &[Option<String>], binary: bool) -> Result<(), WireError> {
        self.ensure_idle()?;
        self.encode_bind(name, params, binary)?;
        self.report_parse = false;
        self.pending_ready += 1;
        Ok(())
    }

    fn send_query_params(
        &mut self,
        sql: &str,
        types: &[Oid],
        params: &[Option<String>],
        binary: bool,
    ) -> Result<(), WireError> {
        self.ensure_idle()?;
        frontend::parse("", sql, types.iter().copied(), &mut self.write_buf)?;
        self.encode_bind("", params, binary)?;
        self.report_parse = false;
        self.pending_ready += 1;
        Ok(())
    }

    fn send_query(&mut self, sql: &str) -> Result<(), WireError> {
        self.ensure_idle()?;
        frontend::query(sql, &mut self.write_buf)?;
        self.report_parse = false;
        self.pending_ready += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<bool, WireError> {
        while !self.write_buf.is_empty() {
            match self.stream.try_write(&self.write_buf) {
                Ok(0) => {
                    let e = WireError::Closed;
                    self.mark_bad(&e);
                    return Err(e);
                }
                Ok(n) => self.write_buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let e = WireError::Io(e);
                    self.mark_bad(&e);
                    return Err(e);
                }
            }
        }
        Ok(true)
    }

    fn consume_input(&mut self) -> Result<(), WireError> {
        if self.status != ConnStatus::Ok {
            return Err(WireError::NotReady);
        }
        let outcome = self.fill().and_then(|eof| {
            self.parse_messages()?;
            if eof {
                Err(WireError::Closed)
            } else {
                Ok(())
            }
        });
        if let Err(e) = &outcome {
            self.mark_bad(e);
        }
        outcome
    }

    fn is_busy(&self) -> bool {
        self.inbound.is_empty() && self.pending_ready > 0
    }

    fn get_result(&mut self) -> Option<WireResult> {
        match self.inbound.pop_front() {
            Some(Inbound::Result(result)) => Some(result),
            Some(Inbound::Ready) | None => None,
        }
    }

    fn notifies(&mut self) -> Option<Notification> {
        self.notifies.pop_front()
    }

    fn cancel_token(&self) -> Option<CancelToken> {
        self.backend_key.map(|(process_id, secret_key)| CancelToken {
            addr: self.addr,
            process_id,
            secret_key,
        })
    }

    fn readiness(&self) -> Arc<dyn Readiness> {
        self.stream.clone()
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.tx_status
    }
}

impl Drop for PgWire {
    fn drop(&mut self) {
        if self.status == ConnStatus::Ok {
            let mut buf = BytesMut::new();
            frontend::terminate(&mut buf);
            let _ = self.stream.try_write(&buf);
        }
    }
}

fn password(params: &ConnParams) -> Result<&str, WireError> {
    params
        .password
        .as_deref()
        .ok_or_else(|| WireError::Auth("server requested a password but none was configured".into()))
}

fn error_info(mut fields: ErrorFields<'_>) -> Result<BackendErrorInfo, WireError> {
    let mut info = BackendErrorInfo::default();
    while let Some(field) = fields.next()? {
        let value = String::from_utf8_lossy(field.value_bytes()).into_owned();
        match field.type_() {
            b'S' => info.severity = value,
            b'C' => info.code = value,
            b'M' => info.message = value,
            b'D' => info.detail = Some(value),
            _ => {}
        }
    }
    if info.severity.is_empty() {
        info.severity = "ERROR".to_string();
    }
    Ok(info)
}

fn connect_in_progress(e: &io::Error) -> bool {
    #[cfg(unix)]
    {
        if e.raw_os_error() == Some(libc::EINPROGRESS) {
            return true;
        }
    }
    e.kind() == io::ErrorKind::WouldBlock
}
