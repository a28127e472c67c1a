//! Shared utilities for integration testing: a fake PostgreSQL server and a
//! gateway started on ephemeral ports.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use pg_gateway::config::loader::parse_config;
use pg_gateway::http::{AppState, GatewayServer};
use pg_gateway::lifecycle::startup::build_state;
use pg_gateway::lifecycle::Shutdown;
use pg_gateway::wire::PgConnector;

pub const INT4: u32 = 23;
pub const TEXT: u32 = 25;
pub const BOOL: u32 = 16;

const CANCEL_REQUEST_CODE: i32 = 80877102;

/// What the fake server answers to one statement.
#[derive(Debug, Clone)]
pub enum Reply {
    Rows {
        columns: Vec<(&'static str, u32)>,
        rows: Vec<Vec<Option<String>>>,
    },
    Command(String),
    Error(String),
}

impl Reply {
    pub fn rows(columns: &[(&'static str, u32)], rows: &[&[Option<&str>]]) -> Self {
        Reply::Rows {
            columns: columns.to_vec(),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|v| v.map(str::to_string)).collect())
                .collect(),
        }
    }
}

type Responder = dyn Fn(&str, &[Option<String>]) -> Reply + Send + Sync;

/// Handle to a running fake server.
#[derive(Clone)]
pub struct FakePostgres {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    cancels: Arc<AtomicUsize>,
    statements: Arc<Mutex<Vec<(String, Vec<Option<String>>)>>>,
    listeners: Arc<Mutex<Vec<(String, mpsc::UnboundedSender<(String, String)>)>>>,
}

impl FakePostgres {
    /// Backend connections accepted so far (cancel requests excluded).
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    /// Every statement executed, with its bound parameters.
    pub fn statements(&self) -> Vec<(String, Vec<Option<String>>)> {
        self.statements.lock().unwrap().clone()
    }

    /// Send a notification to every connection listening on `channel`.
    pub fn notify(&self, channel: &str, payload: &str) -> usize {
        let listeners = self.listeners.lock().unwrap();
        listeners
            .iter()
            .filter(|(c, _)| c == channel)
            .filter(|(_, tx)| tx.send((channel.to_string(), payload.to_string())).is_ok())
            .count()
    }
}

/// Start a fake server answering every statement with `responder`.
pub async fn start_fake_postgres<F>(responder: F) -> FakePostgres
where
    F: Fn(&str, &[Option<String>]) -> Reply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fake = FakePostgres {
        addr: listener.local_addr().unwrap(),
        connections: Arc::new(AtomicUsize::new(0)),
        cancels: Arc::new(AtomicUsize::new(0)),
        statements: Arc::new(Mutex::new(Vec::new())),
        listeners: Arc::new(Mutex::new(Vec::new())),
    };
    let responder: Arc<Responder> = Arc::new(responder);

    let server = fake.clone();
    tokio::spawn(async move {
        let mut pid = 1000;
        while let Ok((socket, _)) = listener.accept().await {
            pid += 1;
            let fake = server.clone();
            let responder = responder.clone();
            tokio::spawn(async move {
                let _ = serve_connection(socket, fake, responder, pid).await;
            });
        }
    });
    fake
}

struct Portal {
    sql: String,
    params: Vec<Option<String>>,
    reply: Option<Reply>,
}

async fn serve_connection(
    mut socket: TcpStream,
    fake: FakePostgres,
    responder: Arc<Responder>,
    pid: i32,
) -> std::io::Result<()> {
    let len = socket.read_i32().await?;
    let mut startup = vec![0u8; (len - 4) as usize];
    socket.read_exact(&mut startup).await?;
    if (&startup[..4]).get_i32() == CANCEL_REQUEST_CODE {
        fake.cancels.fetch_add(1, Ordering::SeqCst);
        return Ok(());
    }
    fake.connections.fetch_add(1, Ordering::SeqCst);

    let mut out = BytesMut::new();
    message(&mut out, b'R', |b| b.put_i32(0));
    parameter_status(&mut out, "client_encoding", "UTF8");
    parameter_status(&mut out, "server_version", "16.0");
    message(&mut out, b'K', |b| {
        b.put_i32(pid);
        b.put_i32(42);
    });
    ready(&mut out);
    socket.write_all(&out).await?;

    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<(String, String)>();
    let mut prepared: HashMap<String, String> = HashMap::new();
    let mut portal: Option<Portal> = None;
    let mut buf = BytesMut::new();

    loop {
        tokio::select! {
            read = socket.read_buf(&mut buf) => {
                if read? == 0 {
                    return Ok(());
                }
            }
            Some((channel, payload)) = notify_rx.recv() => {
                let mut out = BytesMut::new();
                message(&mut out, b'A', |b| {
                    b.put_i32(pid);
                    put_cstr(b, &channel);
                    put_cstr(b, &payload);
                });
                socket.write_all(&out).await?;
                continue;
            }
        }

        let mut out = BytesMut::new();
        while let Some((tag, mut body)) = next_message(&mut buf) {
            match tag {
                b'Q' => {
                    let sql = get_cstr(&mut body);
                    track_listen(&fake, &sql, &notify_tx);
                    let reply = respond(&fake, &responder, &sql, Vec::new());
                    write_reply(&mut out, &reply, true);
                    ready(&mut out);
                }
                b'P' => {
                    let name = get_cstr(&mut body);
                    let sql = get_cstr(&mut body);
                    prepared.insert(name, sql);
                    message(&mut out, b'1', |_| {});
                }
                b'B' => {
                    let _portal = get_cstr(&mut body);
                    let statement = get_cstr(&mut body);
                    let formats = body.get_i16();
                    body.advance(formats as usize * 2);
                    let count = body.get_i16();
                    let params = (0..count)
                        .map(|_| {
                            let len = body.get_i32();
                            if len < 0 {
                                None
                            } else {
                                let value = body.split_to(len as usize);
                                Some(String::from_utf8_lossy(&value).into_owned())
                            }
                        })
                        .collect();
                    let sql = prepared.get(&statement).cloned().unwrap_or_default();
                    portal = Some(Portal { sql, params, reply: None });
                    message(&mut out, b'2', |_| {});
                }
                b'D' => {
                    let kind = body.get_u8();
                    match (kind, portal.as_mut()) {
                        (b'P', Some(p)) => {
                            track_listen(&fake, &p.sql, &notify_tx);
                            let reply = respond(&fake, &responder, &p.sql, p.params.clone());
                            match &reply {
                                Reply::Rows { columns, .. } => row_description(&mut out, columns),
                                _ => message(&mut out, b'n', |_| {}),
                            }
                            p.reply = Some(reply);
                        }
                        _ => message(&mut out, b'n', |_| {}),
                    }
                }
                b'E' => {
                    if let Some(p) = portal.take() {
                        let reply = match p.reply {
                            Some(reply) => reply,
                            None => respond(&fake, &responder, &p.sql, p.params),
                        };
                        write_reply(&mut out, &reply, false);
                    }
                }
                b'S' => ready(&mut out),
                b'C' => message(&mut out, b'3', |_| {}),
                b'X' => return Ok(()),
                _ => {}
            }
        }
        if !out.is_empty() {
            socket.write_all(&out).await?;
        }
    }
}

fn respond(fake: &FakePostgres, responder: &Arc<Responder>, sql: &str, params: Vec<Option<String>>) -> Reply {
    let reply = responder(sql, &params);
    fake.statements.lock().unwrap().push((sql.to_string(), params));
    reply
}

fn track_listen(fake: &FakePostgres, sql: &str, tx: &mpsc::UnboundedSender<(String, String)>) {
    let trimmed = sql.trim();
    if trimmed.len() > 7 && trimmed[..7].eq_ignore_ascii_case("listen ") {
        let channel = trimmed[7..].trim().trim_matches('"').to_string();
        fake.listeners.lock().unwrap().push((channel, tx.clone()));
    }
}

fn next_message(buf: &mut BytesMut) -> Option<(u8, Bytes)> {
    if buf.len() < 5 {
        return None;
    }
    let len = (&buf[1..5]).get_i32() as usize;
    if buf.len() < len + 1 {
        return None;
    }
    let tag = buf.get_u8();
    buf.advance(4);
    Some((tag, buf.split_to(len - 4).freeze()))
}

fn get_cstr(body: &mut Bytes) -> String {
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    let s = String::from_utf8_lossy(&body[..end]).into_owned();
    body.advance((end + 1).min(body.len()));
    s
}

fn put_cstr(b: &mut BytesMut, s: &str) {
    b.put_slice(s.as_bytes());
    b.put_u8(0);
}

fn message(out: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    let mut payload = BytesMut::new();
    body(&mut payload);
    out.put_u8(tag);
    out.put_i32(payload.len() as i32 + 4);
    out.put_slice(&payload);
}

fn parameter_status(out: &mut BytesMut, name: &str, value: &str) {
    message(out, b'S', |b| {
        put_cstr(b, name);
        put_cstr(b, value);
    });
}

fn ready(out: &mut BytesMut) {
    message(out, b'Z', |b| b.put_u8(b'I'));
}

fn row_description(out: &mut BytesMut, columns: &[(&'static str, u32)]) {
    message(out, b'T', |b| {
        b.put_i16(columns.len() as i16);
        for (name, oid) in columns {
            put_cstr(b, name);
            b.put_i32(0);
            b.put_i16(0);
            b.put_u32(*oid);
            b.put_i16(-1);
            b.put_i32(-1);
            b.put_i16(0);
        }
    });
}

fn write_reply(out: &mut BytesMut, reply: &Reply, describe: bool) {
    match reply {
        Reply::Rows { columns, rows } => {
            if describe {
                row_description(out, columns);
            }
            for row in rows {
                message(out, b'D', |b| {
                    b.put_i16(row.len() as i16);
                    for value in row {
                        match value {
                            Some(v) => {
                                b.put_i32(v.len() as i32);
                                b.put_slice(v.as_bytes());
                            }
                            None => b.put_i32(-1),
                        }
                    }
                });
            }
            message(out, b'C', |b| put_cstr(b, &format!("SELECT {}", rows.len())));
        }
        Reply::Command(tag) => message(out, b'C', |b| put_cstr(b, tag)),
        Reply::Error(msg) => message(out, b'E', |b| {
            b.put_u8(b'S');
            put_cstr(b, "ERROR");
            b.put_u8(b'C');
            put_cstr(b, "42P01");
            b.put_u8(b'M');
            put_cstr(b, msg);
            b.put_u8(0);
        }),
    }
}

/// A running gateway on an ephemeral port.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub state: AppState,
    pub shutdown: Shutdown,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Start the gateway from TOML. `{db}` is replaced by the fake server's
/// keyword/value connection string.
pub async fn start_gateway(config: &str, db: &FakePostgres) -> TestGateway {
    let conninfo = format!("host=127.0.0.1 port={} dbname=app user=app", db.addr.port());
    let config = parse_config(&config.replace("{db}", &conninfo)).unwrap();
    let state = build_state(config, Arc::new(PgConnector)).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let server = GatewayServer::new(state.clone());
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, rx).await;
    });

    TestGateway { addr, state, shutdown }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}
