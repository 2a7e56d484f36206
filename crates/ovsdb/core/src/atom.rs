//! OVSDB atoms: the scalar leaves of the wire value model.

use std::cmp::Ordering;
use std::fmt;

use serde_json::{Value as Json, json};
use uuid::Uuid;

use crate::error::{OvsdbError, Result};

/// Atomic type of a column or element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomKind {
    Integer,
    Real,
    Boolean,
    String,
    Uuid,
}

impl AtomKind {
    /// Parse a base-type key from a schema document.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "integer" => Ok(Self::Integer),
            "real" => Ok(Self::Real),
            "boolean" => Ok(Self::Boolean),
            "string" => Ok(Self::String),
            "uuid" => Ok(Self::Uuid),
            other => Err(OvsdbError::SchemaInvalid(format!(
                "unknown atomic type: {other}"
            ))),
        }
    }

    /// Wire name of the atomic type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Boolean => "boolean",
            Self::String => "string",
            Self::Uuid => "uuid",
        }
    }
}

impl fmt::Display for AtomKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single-valued OVSDB datum.
///
/// `NamedUuid` is the transaction-scoped reference form; it is emitted for
/// rows being inserted in the same transaction and never survives into
/// results surfaced to callers.
#[derive(Debug, Clone, PartialEq)]
pub enum Atom {
    Integer(i64),
    Real(f64),
    Boolean(bool),
    String(String),
    Uuid(Uuid),
    NamedUuid(String),
}

impl Eq for Atom {}

impl Atom {
    /// Atomic type of this atom. Named UUIDs count as `uuid`.
    #[must_use]
    pub fn kind(&self) -> AtomKind {
        match self {
            Self::Integer(_) => AtomKind::Integer,
            Self::Real(_) => AtomKind::Real,
            Self::Boolean(_) => AtomKind::Boolean,
            Self::String(_) => AtomKind::String,
            Self::Uuid(_) | Self::NamedUuid(_) => AtomKind::Uuid,
        }
    }

    /// Whether this atom is the zero of its atomic type.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        match self {
            Self::Integer(n) => *n == 0,
            Self::Real(r) => *r == 0.0,
            Self::Boolean(b) => !b,
            Self::String(s) => s.is_empty(),
            Self::Uuid(u) => u.is_nil(),
            Self::NamedUuid(_) => false,
        }
    }

    /// Zero atom for an atomic type.
    #[must_use]
    pub fn zero(kind: AtomKind) -> Self {
        match kind {
            AtomKind::Integer => Self::Integer(0),
            AtomKind::Real => Self::Real(0.0),
            AtomKind::Boolean => Self::Boolean(false),
            AtomKind::String => Self::String(String::new()),
            AtomKind::Uuid => Self::Uuid(Uuid::nil()),
        }
    }

    /// Encode into the RFC 7047 wire form.
    #[must_use]
    pub fn to_wire(&self) -> Json {
        match self {
            Self::Integer(n) => json!(n),
            Self::Real(r) => json!(r),
            Self::Boolean(b) => json!(b),
            Self::String(s) => json!(s),
            Self::Uuid(u) => json!(["uuid", u.to_string()]),
            Self::NamedUuid(token) => json!(["named-uuid", token]),
        }
    }

    /// Decode from the RFC 7047 wire form: a bare JSON scalar or a
    /// `["uuid", ...]` / `["named-uuid", ...]` pair.
    pub fn from_wire(wire: &Json) -> Result<Self> {
        match wire {
            Json::Bool(b) => Ok(Self::Boolean(*b)),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Integer(i))
                } else if let Some(r) = n.as_f64() {
                    Ok(Self::Real(r))
                } else {
                    Err(invalid(format!("number out of range: {n}")))
                }
            }
            Json::String(s) => Ok(Self::String(s.clone())),
            Json::Array(pair) if pair.len() == 2 => {
                let tag = pair[0].as_str().unwrap_or_default();
                let body = pair[1].as_str().unwrap_or_default();
                match tag {
                    "uuid" => Uuid::parse_str(body)
                        .map(Self::Uuid)
                        .map_err(|err| invalid(format!("bad uuid {body:?}: {err}"))),
                    "named-uuid" => {
                        if is_named_uuid_token(body) {
                            Ok(Self::NamedUuid(body.to_string()))
                        } else {
                            Err(invalid(format!("bad named-uuid token {body:?}")))
                        }
                    }
                    other => Err(invalid(format!("unknown atom tag {other:?}"))),
                }
            }
            other => Err(invalid(format!("not an atom: {other}"))),
        }
    }
}

impl serde::Serialize for Atom {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Atom {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let wire = Json::deserialize(deserializer)?;
        Self::from_wire(&wire).map_err(serde::de::Error::custom)
    }
}

fn invalid(reason: String) -> OvsdbError {
    OvsdbError::InvalidValue {
        context: "atom".to_string(),
        reason,
    }
}

/// Whether a string is a valid transaction-scoped UUID token
/// (`[A-Za-z_][A-Za-z0-9_]*`).
#[must_use]
pub fn is_named_uuid_token(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn rank(atom: &Atom) -> u8 {
    match atom {
        Atom::Integer(_) => 0,
        Atom::Real(_) => 1,
        Atom::Boolean(_) => 2,
        Atom::String(_) => 3,
        Atom::Uuid(_) => 4,
        Atom::NamedUuid(_) => 5,
    }
}

impl Ord for Atom {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            (Self::Real(a), Self::Real(b)) => a.total_cmp(b),
            (Self::Boolean(a), Self::Boolean(b)) => a.cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Uuid(a), Self::Uuid(b)) => a.cmp(b),
            (Self::NamedUuid(a), Self::NamedUuid(b)) => a.cmp(b),
            (a, b) => rank(a).cmp(&rank(b)),
        }
    }
}

impl PartialOrd for Atom {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<i64> for Atom {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for Atom {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<bool> for Atom {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<&str> for Atom {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Atom {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Uuid> for Atom {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}
