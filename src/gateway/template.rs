//! SQL template compiler.
//!
//! `$name::type` becomes a positional bind parameter carrying the type OID,
//! `$name::id` is substituted as an escaped identifier. Anything else,
//! including `$1` style positional references and quoted text, is kept
//! verbatim.

use std::fs;
use std::path::PathBuf;

use postgres_protocol::escape::escape_identifier;
use thiserror::Error;

use crate::protocol::statement::CompiledStatement;
use crate::protocol::types::oid_by_name;
use crate::wire::Oid;

const FILE_SCHEME: &str = "file://";
const IDENTIFIER_TYPE: &str = "id";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to read query file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("query is empty")]
    Empty,
    #[error("unknown type \"{ty}\" for ${name}")]
    UnknownType { name: String, ty: String },
    #[error("${name} is used with different types")]
    ConflictingType { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Text(String),
    /// Index into `Template::params`.
    Param(usize),
    Identifier(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Param {
    name: String,
    oid: Oid,
}

/// A parsed statement template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    parts: Vec<Part>,
    params: Vec<Param>,
}

impl Template {
    /// Parse a template, reading it from disk for `file://` sources.
    pub fn load(source: &str) -> Result<Self, TemplateError> {
        match source.strip_prefix(FILE_SCHEME) {
            Some(path) => {
                let path = PathBuf::from(path);
                let text = fs::read_to_string(&path).map_err(|source| TemplateError::Io { path, source })?;
                Self::parse(&text)
            }
            None => Self::parse(source),
        }
    }

    pub fn parse(text: &str) -> Result<Self, TemplateError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(TemplateError::Empty);
        }

        let mut parts = Vec::new();
        let mut params: Vec<Param> = Vec::new();
        let mut literal = String::new();
        let mut chars = text.char_indices().peekable();
        let mut in_quote = false;

        while let Some((pos, c)) = chars.next() {
            if in_quote {
                literal.push(c);
                if c == '\'' {
                    in_quote = false;
                }
                continue;
            }
            if c == '\'' {
                in_quote = true;
                literal.push(c);
                continue;
            }
            if c != '$' {
                literal.push(c);
                continue;
            }

            let rest = &text[pos + 1..];
            let Some((name, ty, consumed)) = placeholder(rest) else {
                literal.push(c);
                continue;
            };
            for _ in 0..consumed {
                chars.next();
            }

            if !literal.is_empty() {
                parts.push(Part::Text(std::mem::take(&mut literal)));
            }
            if ty.eq_ignore_ascii_case(IDENTIFIER_TYPE) {
                parts.push(Part::Identifier(name.to_string()));
                continue;
            }

            let oid = oid_by_name(ty).ok_or_else(|| TemplateError::UnknownType {
                name: name.to_string(),
                ty: ty.to_string(),
            })?;
            let index = match params.iter().position(|p| p.name == name) {
                Some(index) if params[index].oid != oid => {
                    return Err(TemplateError::ConflictingType { name: name.to_string() });
                }
                Some(index) => index,
                None => {
                    params.push(Param {
                        name: name.to_string(),
                        oid,
                    });
                    params.len() - 1
                }
            };
            parts.push(Part::Param(index));
        }
        if !literal.is_empty() {
            parts.push(Part::Text(literal));
        }

        Ok(Self { parts, params })
    }

    /// Names of every variable the template reads.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        let identifiers = self.parts.iter().filter_map(|p| match p {
            Part::Identifier(name) => Some(name.as_str()),
            _ => None,
        });
        self.params.iter().map(|p| p.name.as_str()).chain(identifiers)
    }

    /// Render the statement for one request. Absent or empty values bind NULL.
    pub fn compile<F>(&self, lookup: F, binary: bool) -> CompiledStatement
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut sql = String::new();
        for part in &self.parts {
            match part {
                Part::Text(text) => sql.push_str(text),
                Part::Param(index) => {
                    sql.push('$');
                    sql.push_str(&(index + 1).to_string());
                }
                Part::Identifier(name) => match lookup(name).filter(|v| !v.is_empty()) {
                    Some(value) => sql.push_str(&escape_identifier(&value)),
                    None => sql.push_str("NULL"),
                },
            }
        }

        let values = self
            .params
            .iter()
            .map(|p| lookup(&p.name).filter(|v| !v.is_empty()))
            .collect();
        let types = self.params.iter().map(|p| p.oid).collect();
        CompiledStatement::new(sql, values, types, binary)
    }
}

/// Parse `name::type` at the start of `rest`, returning the char count consumed.
fn placeholder(rest: &str) -> Option<(&str, &str, usize)> {
    let name_len = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    let name = &rest[..name_len];
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    let after = rest[name_len..].strip_prefix("::")?;
    let ty_len = after
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(after.len());
    if ty_len == 0 {
        return None;
    }
    Some((name, &after[..ty_len], name_len + 2 + ty_len))
}
