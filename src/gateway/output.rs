//! Result serializers and response headers.
//!
//! # Formats
//! - `none`: empty body
//! - `text`: every value, row-major, one per line; NULL as `(null)`
//! - `value`: the single value of a 1×1 result
//! - `hex`: like `value`, hex-decoded after an optional `\x` prefix
//! - `json`: array of row objects keyed in column order, or a lone text-format
//!   json/jsonb value passed through; binary-format values become `\x` hex strings
//!
//! An empty result set yields an empty body for `text` and `json`.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;

use crate::config::schema::{ColumnRef, OutputFormat, VariableConfig};
use crate::error::GatewayError;
use crate::protocol::result::QueryResult;
use crate::protocol::types::{classify, ValueKind};
use crate::wire::Column;

const NULL_TEXT: &str = "(null)";
const CUSTOM_PREFIX: &str = "x-pg-";
const META_PREFIX: &str = "x-postgres-";
const TEXT_FORMAT: i16 = 0;

/// A rendered body and its content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub content_type: String,
    pub body: Bytes,
}

pub fn render(result: &QueryResult, format: OutputFormat) -> Result<Rendered, GatewayError> {
    let text_type = match result.charset.as_deref() {
        Some(charset) => format!("text/plain; charset={}", charset),
        None => "text/plain".to_string(),
    };
    let rendered = match format {
        OutputFormat::None => Rendered {
            content_type: text_type,
            body: Bytes::new(),
        },
        OutputFormat::Text => Rendered {
            content_type: text_type,
            body: text(result),
        },
        OutputFormat::Value => Rendered {
            content_type: text_type,
            body: single_value(result, "value")?.clone(),
        },
        OutputFormat::Hex => Rendered {
            content_type: "application/octet-stream".to_string(),
            body: hex(single_value(result, "hex")?)?,
        },
        OutputFormat::Json => Rendered {
            content_type: "application/json".to_string(),
            body: json(result)?,
        },
    };
    Ok(rendered)
}

fn text(result: &QueryResult) -> Bytes {
    let mut out = Vec::new();
    for (i, value) in result.rows.iter().flatten().enumerate() {
        if i > 0 {
            out.push(b'\n');
        }
        match value {
            Some(v) => out.extend_from_slice(v),
            None => out.extend_from_slice(NULL_TEXT.as_bytes()),
        }
    }
    Bytes::from(out)
}

fn single_value<'a>(result: &'a QueryResult, format: &str) -> Result<&'a Bytes, GatewayError> {
    if result.ntuples() != 1 || result.nfields() != 1 {
        return Err(GatewayError::Output(format!(
            "output {} received {} value(s) instead of expected single value",
            format,
            result.ntuples() * result.nfields()
        )));
    }
    match result.value(0, 0) {
        Some(Some(v)) if !v.is_empty() => Ok(v),
        Some(Some(_)) => Err(GatewayError::Output(format!("output {} received empty value", format))),
        _ => Err(GatewayError::Output(format!("output {} received NULL value", format))),
    }
}

fn hex(value: &[u8]) -> Result<Bytes, GatewayError> {
    let digits = value.strip_prefix(b"\\").unwrap_or(value);
    let digits = digits.strip_prefix(b"x").unwrap_or(digits);
    if digits.len() % 2 != 0 {
        return Err(GatewayError::Output("output hex received an odd number of digits".to_string()));
    }

    let mut out = Vec::with_capacity(digits.len() / 2);
    for pair in digits.chunks(2) {
        match (hex_digit(pair[0]), hex_digit(pair[1])) {
            (Some(hi), Some(lo)) => out.push(hi << 4 | lo),
            _ => return Err(GatewayError::Output("output hex received a non-hex digit".to_string())),
        }
    }
    Ok(Bytes::from(out))
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn json(result: &QueryResult) -> Result<Bytes, GatewayError> {
    if result.ntuples() == 0 {
        return Ok(Bytes::new());
    }
    if let [column] = result.columns.as_slice() {
        if result.ntuples() == 1 && column.format == TEXT_FORMAT && classify(column.type_oid) == ValueKind::Json {
            if let Some(Some(value)) = result.value(0, 0) {
                return Ok(value.clone());
            }
        }
    }

    serde_json::to_vec(&JsonRows(result))
        .map(Bytes::from)
        .map_err(|e| GatewayError::Output(format!("output json failed: {}", e)))
}

/// Rows as an array of objects, keys in column order.
struct JsonRows<'a>(&'a QueryResult);

struct JsonRow<'a> {
    columns: &'a [Column],
    values: &'a [Option<Bytes>],
}

impl Serialize for JsonRows<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let columns = self.0.columns.as_slice();
        serializer.collect_seq(self.0.rows.iter().map(|values| JsonRow { columns, values }))
    }
}

impl Serialize for JsonRow<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (column, value) in self.columns.iter().zip(self.values) {
            map.serialize_entry(&column.name, &json_value(column, value.as_deref()))?;
        }
        map.end()
    }
}

fn json_value(column: &Column, value: Option<&[u8]>) -> Value {
    let Some(value) = value else {
        return Value::Null;
    };
    if column.format != TEXT_FORMAT {
        return Value::String(hex_string(value));
    }
    let text = String::from_utf8_lossy(value);
    match classify(column.type_oid) {
        ValueKind::Integer => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(text.into_owned())),
        ValueKind::Json => serde_json::from_slice::<Value>(value).unwrap_or_else(|_| Value::String(text.into_owned())),
        ValueKind::Boolean if text.starts_with(['t', 'T']) => Value::Bool(true),
        ValueKind::Boolean if text.starts_with(['f', 'F']) => Value::Bool(false),
        _ => Value::String(text.into_owned()),
    }
}

/// Binary-format values in bytea text notation.
fn hex_string(value: &[u8]) -> String {
    let mut out = String::with_capacity(2 + value.len() * 2);
    out.push_str("\\x");
    for byte in value {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Evaluate custom variables against the result.
///
/// Optional variables that cannot be read are left out.
pub fn variables(result: &QueryResult, configs: &[VariableConfig]) -> Result<Vec<(String, String)>, GatewayError> {
    let mut out = Vec::with_capacity(configs.len());
    for var in configs {
        let column = match &var.column {
            ColumnRef::Index(i) => Some(*i),
            ColumnRef::Name(name) => result.column_index(name),
        };
        let value = column
            .and_then(|c| result.value(var.row, c))
            .flatten()
            .filter(|v| !v.is_empty());
        match value {
            Some(v) => out.push((var.name.clone(), String::from_utf8_lossy(v).into_owned())),
            None if var.required => {
                return Err(GatewayError::Output(format!(
                    "required variable \"{}\" has no value at row {}",
                    var.name, var.row
                )));
            }
            None => {}
        }
    }
    Ok(out)
}

/// Builtin result metadata: `nfields`, `ntuples`, `cmdtuples`, `cmdstatus`.
pub fn meta(result: &QueryResult) -> Vec<(String, String)> {
    let mut out = vec![
        ("nfields".to_string(), result.nfields().to_string()),
        ("ntuples".to_string(), result.ntuples().to_string()),
    ];
    if let Some(n) = result.cmd_tuples() {
        out.push(("cmdtuples".to_string(), n.to_string()));
    }
    if !result.cmd_status().is_empty() {
        out.push(("cmdstatus".to_string(), result.cmd_status().to_string()));
    }
    out
}

/// Assemble the HTTP response.
pub fn into_response(rendered: Rendered, custom: &[(String, String)], meta: &[(String, String)]) -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(v) = HeaderValue::from_str(&rendered.content_type) {
        headers.insert(header::CONTENT_TYPE, v);
    }
    append(&mut headers, CUSTOM_PREFIX, custom);
    append(&mut headers, META_PREFIX, meta);

    let mut response = Response::new(Body::from(rendered.body));
    *response.status_mut() = StatusCode::OK;
    *response.headers_mut() = headers;
    response
}

fn append(headers: &mut HeaderMap, prefix: &str, pairs: &[(String, String)]) {
    for (name, value) in pairs {
        let name = format!("{}{}", prefix, name.to_ascii_lowercase().replace('_', "-"));
        match (HeaderName::try_from(name.as_str()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!(header = %name, "Variable is not a valid header, skipped"),
        }
    }
}
