//! Connection string parsing.
//!
//! Accepts the keyword/value form (`host=db port=5432 dbname=app`) and
//! `postgres://` URIs.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use thiserror::Error;
use url::Url;

pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_HOST: &str = "127.0.0.1";

#[derive(Debug, Error)]
pub enum ConninfoError {
    #[error("invalid connection string: {0}")]
    Syntax(String),
    #[error("invalid port \"{0}\"")]
    InvalidPort(String),
    #[error("invalid connection URI: {0}")]
    Uri(#[from] url::ParseError),
    #[error("unix-domain sockets are not supported: {0}")]
    UnixSocket(String),
}

/// Parsed connection parameters of one backend server entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub dbname: Option<String>,
    pub options: Option<String>,
    pub application_name: String,
    /// Unrecognised keywords, forwarded as startup parameters.
    pub extra: Vec<(String, String)>,
}

impl Default for ConnParams {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            user: "postgres".to_string(),
            password: None,
            dbname: None,
            options: None,
            application_name: env!("CARGO_PKG_NAME").to_string(),
            extra: Vec::new(),
        }
    }
}

impl ConnParams {
    pub fn parse(input: &str) -> Result<Self, ConninfoError> {
        let trimmed = input.trim();
        if trimmed.starts_with("postgres://") || trimmed.starts_with("postgresql://") {
            Self::parse_uri(trimmed)
        } else {
            Self::parse_keywords(trimmed)
        }
    }

    fn parse_uri(input: &str) -> Result<Self, ConninfoError> {
        let url = Url::parse(input)?;
        let mut params = ConnParams::default();

        if let Some(host) = url.host_str() {
            params.host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        }
        if let Some(port) = url.port() {
            params.port = port;
        }
        if !url.username().is_empty() {
            params.user = url.username().to_string();
        }
        params.password = url.password().map(str::to_string);
        let path = url.path().trim_start_matches('/');
        if !path.is_empty() {
            params.dbname = Some(path.to_string());
        }
        for (key, value) in url.query_pairs() {
            params.set(&key, value.into_owned())?;
        }
        Ok(params)
    }

    fn parse_keywords(input: &str) -> Result<Self, ConninfoError> {
        let mut params = ConnParams::default();
        let mut chars = input.chars().peekable();

        loop {
            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }
            if chars.peek().is_none() {
                break;
            }

            let mut key = String::new();
            while let Some(&c) = chars.peek() {
                if c == '=' || c.is_whitespace() {
                    break;
                }
                key.push(c);
                chars.next();
            }
            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }
            if chars.next() != Some('=') {
                return Err(ConninfoError::Syntax(format!("missing \"=\" after \"{}\"", key)));
            }
            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }

            let mut value = String::new();
            if chars.peek() == Some(&'\'') {
                chars.next();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        '\'' => {
                            closed = true;
                            break;
                        }
                        c => value.push(c),
                    }
                }
                if !closed {
                    return Err(ConninfoError::Syntax(format!("unterminated quoted value for \"{}\"", key)));
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() {
                        break;
                    }
                    if c == '\\' {
                        chars.next();
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                        continue;
                    }
                    value.push(c);
                    chars.next();
                }
            }

            params.set(&key, value)?;
        }

        Ok(params)
    }

    fn set(&mut self, key: &str, value: String) -> Result<(), ConninfoError> {
        match key {
            "host" | "hostaddr" => {
                if value.starts_with('/') || value.starts_with("unix:") {
                    return Err(ConninfoError::UnixSocket(value));
                }
                self.host = value;
            }
            "port" => {
                self.port = value.parse().map_err(|_| ConninfoError::InvalidPort(value))?;
            }
            "user" => self.user = value,
            "password" => self.password = Some(value),
            "dbname" => self.dbname = Some(value),
            "options" => self.options = Some(value),
            "application_name" | "fallback_application_name" => self.application_name = value,
            "connect_timeout" | "sslmode" => {
                tracing::debug!(keyword = %key, "Ignoring connection keyword");
            }
            other => self.extra.push((other.to_string(), value)),
        }
        Ok(())
    }

    /// Resolve the host into socket addresses. Each address becomes one target.
    pub fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        Ok((self.host.as_str(), self.port).to_socket_addrs()?.collect())
    }

    /// Parameters sent in the startup packet.
    pub fn startup_params(&self) -> Vec<(&str, &str)> {
        let mut out = vec![("user", self.user.as_str()), ("application_name", self.application_name.as_str())];
        if let Some(db) = &self.dbname {
            out.push(("database", db.as_str()));
        }
        if let Some(options) = &self.options {
            out.push(("options", options.as_str()));
        }
        for (k, v) in &self.extra {
            out.push((k.as_str(), v.as_str()));
        }
        out
    }
}
