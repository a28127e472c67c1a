//! Compiled statements.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::upstream::listen::ListenRegistration;
use crate::wire::Oid;

/// A statement ready to be sent: SQL text with identifiers already
/// substituted, positional parameter values and their type tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledStatement {
    sql: String,
    params: Vec<Option<String>>,
    types: Vec<Oid>,
    binary: bool,
    listen: Option<ListenRegistration>,
}

impl CompiledStatement {
    pub fn new(sql: impl Into<String>, params: Vec<Option<String>>, types: Vec<Oid>, binary: bool) -> Self {
        let sql = sql.into();
        let listen = ListenRegistration::from_statement(&sql);
        Self {
            sql,
            params,
            types,
            binary,
            listen,
        }
    }

    pub fn simple(sql: impl Into<String>) -> Self {
        Self::new(sql, Vec::new(), Vec::new(), false)
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Option<String>] {
        &self.params
    }

    pub fn types(&self) -> &[Oid] {
        &self.types
    }

    pub fn binary(&self) -> bool {
        self.binary
    }

    /// Registration this statement creates when it succeeds.
    pub fn listen(&self) -> Option<&ListenRegistration> {
        self.listen.as_ref()
    }

    /// Cache key of the SQL shape: text plus parameter types, never values.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.sql.hash(&mut hasher);
        self.types.hash(&mut hasher);
        hasher.finish()
    }

    /// Server-side prepared statement name, or `None` when the statement
    /// must not be prepared.
    pub fn statement_name(&self) -> Option<String> {
        if self.listen.is_some() {
            return None;
        }
        Some(format!("pgw_{:016x}", self.fingerprint()))
    }
}
