//! Built-in type OIDs and how result values are classified.

use crate::wire::Oid;

pub const BOOL: Oid = 16;
pub const BYTEA: Oid = 17;
pub const CHAR: Oid = 18;
pub const NAME: Oid = 19;
pub const INT8: Oid = 20;
pub const INT2: Oid = 21;
pub const INT4: Oid = 23;
pub const TEXT: Oid = 25;
pub const OID: Oid = 26;
pub const JSON: Oid = 114;
pub const XML: Oid = 142;
pub const FLOAT4: Oid = 700;
pub const FLOAT8: Oid = 701;
pub const INET: Oid = 869;
pub const BPCHAR: Oid = 1042;
pub const VARCHAR: Oid = 1043;
pub const DATE: Oid = 1082;
pub const TIME: Oid = 1083;
pub const TIMESTAMP: Oid = 1114;
pub const TIMESTAMPTZ: Oid = 1184;
pub const INTERVAL: Oid = 1186;
pub const NUMERIC: Oid = 1700;
pub const UUID: Oid = 2950;
pub const JSONB: Oid = 3802;
pub const UNKNOWN: Oid = 705;

const NAMED: &[(&str, Oid)] = &[
    ("bool", BOOL),
    ("boolean", BOOL),
    ("bytea", BYTEA),
    ("char", CHAR),
    ("name", NAME),
    ("int8", INT8),
    ("bigint", INT8),
    ("int2", INT2),
    ("smallint", INT2),
    ("int4", INT4),
    ("int", INT4),
    ("integer", INT4),
    ("text", TEXT),
    ("oid", OID),
    ("json", JSON),
    ("xml", XML),
    ("float4", FLOAT4),
    ("real", FLOAT4),
    ("float8", FLOAT8),
    ("inet", INET),
    ("bpchar", BPCHAR),
    ("varchar", VARCHAR),
    ("date", DATE),
    ("time", TIME),
    ("timestamp", TIMESTAMP),
    ("timestamptz", TIMESTAMPTZ),
    ("interval", INTERVAL),
    ("numeric", NUMERIC),
    ("uuid", UUID),
    ("jsonb", JSONB),
    ("unknown", UNKNOWN),
];

/// Look up a type OID by its SQL name (case-insensitive).
pub fn oid_by_name(name: &str) -> Option<Oid> {
    NAMED
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, oid)| *oid)
}

/// How a column value is rendered by structured serializers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// int2 / int4 / int8, emitted unquoted.
    Integer,
    /// Emitted as the literal tokens `true` / `false`.
    Boolean,
    /// json / jsonb, emitted verbatim.
    Json,
    Other,
}

pub fn classify(oid: Oid) -> ValueKind {
    match oid {
        INT2 | INT4 | INT8 => ValueKind::Integer,
        BOOL => ValueKind::Boolean,
        JSON | JSONB => ValueKind::Json,
        _ => ValueKind::Other,
    }
}
