//! Accumulated query result.

use bytes::Bytes;

use crate::wire::{Column, WireResult};

/// Result data gathered for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Option<Bytes>>>,
    pub command_tag: String,
    /// Backend error text when the statement failed.
    pub error: Option<String>,
    /// Charset negotiated by the session that produced the result.
    pub charset: Option<String>,
    /// SQL text that was executed.
    pub sql: String,
}

impl QueryResult {
    pub fn absorb(&mut self, result: WireResult) {
        self.columns = result.columns;
        self.rows = result.rows;
        self.command_tag = result.command_tag;
    }

    pub fn nfields(&self) -> usize {
        self.columns.len()
    }

    pub fn ntuples(&self) -> usize {
        self.rows.len()
    }

    /// Rows affected, parsed from the command tag (`INSERT 0 5` → 5).
    pub fn cmd_tuples(&self) -> Option<u64> {
        let mut words = self.command_tag.split_whitespace();
        let verb = words.next()?;
        match verb {
            "INSERT" | "UPDATE" | "DELETE" | "SELECT" | "MOVE" | "FETCH" | "COPY" | "MERGE" => {
                words.last().and_then(|n| n.parse().ok())
            }
            _ => None,
        }
    }

    /// Command status word (`INSERT`, `SELECT`, `LISTEN`, ...).
    pub fn cmd_status(&self) -> &str {
        self.command_tag.split_whitespace().next().unwrap_or("")
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// `None` for out of range, `Some(None)` for SQL NULL.
    pub fn value(&self, row: usize, column: usize) -> Option<Option<&Bytes>> {
        self.rows.get(row).and_then(|r| r.get(column)).map(Option::as_ref)
    }
}
