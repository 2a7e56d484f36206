//! Database, table, and column schemas parsed from `get_schema` replies.

use std::collections::BTreeMap;

use serde_json::Value as Json;

use crate::atom::{Atom, AtomKind};
use crate::error::{OvsdbError, Result};
use crate::value::Value;

/// Strength of a UUID reference column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefType {
    #[default]
    Strong,
    Weak,
}

/// Base atomic type of a column key or value, with its constraints.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseType {
    pub kind: AtomKind,
    pub enum_members: Option<Vec<Atom>>,
    pub min_integer: Option<i64>,
    pub max_integer: Option<i64>,
    pub min_real: Option<f64>,
    pub max_real: Option<f64>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub ref_table: Option<String>,
    pub ref_type: RefType,
}

impl BaseType {
    #[must_use]
    pub fn scalar(kind: AtomKind) -> Self {
        Self {
            kind,
            enum_members: None,
            min_integer: None,
            max_integer: None,
            min_real: None,
            max_real: None,
            min_length: None,
            max_length: None,
            ref_table: None,
            ref_type: RefType::Strong,
        }
    }

    fn parse(wire: &Json) -> Result<Self> {
        match wire {
            Json::String(name) => Ok(Self::scalar(AtomKind::parse(name)?)),
            Json::Object(object) => {
                let Some(type_name) = object.get("type").and_then(Json::as_str) else {
                    return Err(OvsdbError::SchemaInvalid(
                        "base type is missing its \"type\" key".to_string(),
                    ));
                };
                let kind = AtomKind::parse(type_name)?;
                let enum_members = match object.get("enum") {
                    None => None,
                    Some(wire) => Some(match Value::from_wire(wire)? {
                        Value::Set(atoms) => atoms,
                        Value::Atom(atom) => vec![atom],
                        Value::Map(_) => {
                            return Err(OvsdbError::SchemaInvalid(
                                "enum constraint cannot be a map".to_string(),
                            ));
                        }
                    }),
                };
                Ok(Self {
                    kind,
                    enum_members,
                    min_integer: object.get("minInteger").and_then(Json::as_i64),
                    max_integer: object.get("maxInteger").and_then(Json::as_i64),
                    min_real: object.get("minReal").and_then(Json::as_f64),
                    max_real: object.get("maxReal").and_then(Json::as_f64),
                    min_length: object
                        .get("minLength")
                        .and_then(Json::as_u64)
                        .map(|n| n as usize),
                    max_length: object
                        .get("maxLength")
                        .and_then(Json::as_u64)
                        .map(|n| n as usize),
                    ref_table: object
                        .get("refTable")
                        .and_then(Json::as_str)
                        .map(str::to_string),
                    ref_type: match object.get("refType").and_then(Json::as_str) {
                        Some("weak") => RefType::Weak,
                        _ => RefType::Strong,
                    },
                })
            }
            other => Err(OvsdbError::SchemaInvalid(format!(
                "malformed base type: {other}"
            ))),
        }
    }
}

/// Upper bound on the number of elements in a set or map column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Finite(usize),
    Unlimited,
}

impl Arity {
    #[must_use]
    pub fn admits(&self, len: usize) -> bool {
        match self {
            Self::Finite(max) => len <= *max,
            Self::Unlimited => true,
        }
    }
}

/// Full type descriptor of a column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnType {
    pub key: BaseType,
    pub value: Option<BaseType>,
    pub min: usize,
    pub max: Arity,
}

impl ColumnType {
    #[must_use]
    pub fn scalar(kind: AtomKind) -> Self {
        Self {
            key: BaseType::scalar(kind),
            value: None,
            min: 1,
            max: Arity::Finite(1),
        }
    }

    #[must_use]
    pub fn optional(kind: AtomKind) -> Self {
        Self {
            key: BaseType::scalar(kind),
            value: None,
            min: 0,
            max: Arity::Finite(1),
        }
    }

    #[must_use]
    pub fn set(kind: AtomKind) -> Self {
        Self {
            key: BaseType::scalar(kind),
            value: None,
            min: 0,
            max: Arity::Unlimited,
        }
    }

    #[must_use]
    pub fn map(key: AtomKind, value: AtomKind) -> Self {
        Self {
            key: BaseType::scalar(key),
            value: Some(BaseType::scalar(value)),
            min: 0,
            max: Arity::Unlimited,
        }
    }

    #[must_use]
    pub fn is_map(&self) -> bool {
        self.value.is_some()
    }

    /// A set in the wire sense: more than one element admitted, no values.
    #[must_use]
    pub fn is_set(&self) -> bool {
        !self.is_map() && self.max != Arity::Finite(1)
    }

    /// A column holding at most one atom.
    #[must_use]
    pub fn is_scalar(&self) -> bool {
        !self.is_map() && self.max == Arity::Finite(1)
    }

    /// A `0..1` column, absent on the wire as an empty set.
    #[must_use]
    pub fn is_optional(&self) -> bool {
        self.is_scalar() && self.min == 0
    }

    fn parse(wire: &Json) -> Result<Self> {
        match wire {
            Json::String(name) => Ok(Self::scalar(AtomKind::parse(name)?)),
            Json::Object(object) => {
                let Some(key) = object.get("key") else {
                    return Err(OvsdbError::SchemaInvalid(
                        "column type is missing its \"key\"".to_string(),
                    ));
                };
                let key = BaseType::parse(key)?;
                let value = object.get("value").map(BaseType::parse).transpose()?;
                let min = match object.get("min") {
                    None => 1,
                    Some(wire) => wire.as_u64().ok_or_else(|| {
                        OvsdbError::SchemaInvalid(format!("malformed min: {wire}"))
                    })? as usize,
                };
                let max = match object.get("max") {
                    None => Arity::Finite(1),
                    Some(Json::String(s)) if s == "unlimited" => Arity::Unlimited,
                    Some(wire) => Arity::Finite(wire.as_u64().ok_or_else(|| {
                        OvsdbError::SchemaInvalid(format!("malformed max: {wire}"))
                    })? as usize),
                };
                if let Arity::Finite(max) = max {
                    if min > max {
                        return Err(OvsdbError::SchemaInvalid(format!(
                            "column arity has min {min} > max {max}"
                        )));
                    }
                }
                Ok(Self {
                    key,
                    value,
                    min,
                    max,
                })
            }
            other => Err(OvsdbError::SchemaInvalid(format!(
                "malformed column type: {other}"
            ))),
        }
    }
}

/// One column of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    pub column_type: ColumnType,
    pub mutable: bool,
    pub ephemeral: bool,
}

impl ColumnSchema {
    #[must_use]
    pub fn new(column_type: ColumnType) -> Self {
        Self {
            column_type,
            mutable: true,
            ephemeral: false,
        }
    }

    /// Native shape this column projects to on a record.
    #[must_use]
    pub fn native_kind(&self) -> crate::native::NativeKind {
        crate::native::NativeKind::of_column(&self.column_type)
    }

    fn parse(wire: &Json) -> Result<Self> {
        let Json::Object(object) = wire else {
            return Err(OvsdbError::SchemaInvalid(format!(
                "malformed column schema: {wire}"
            )));
        };
        let Some(column_type) = object.get("type") else {
            return Err(OvsdbError::SchemaInvalid(
                "column schema is missing its \"type\"".to_string(),
            ));
        };
        Ok(Self {
            column_type: ColumnType::parse(column_type)?,
            mutable: object.get("mutable").and_then(Json::as_bool).unwrap_or(true),
            ephemeral: object
                .get("ephemeral")
                .and_then(Json::as_bool)
                .unwrap_or(false),
        })
    }
}

/// One table of a database.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub columns: BTreeMap<String, ColumnSchema>,
    pub indexes: Vec<Vec<String>>,
    pub is_root: bool,
    pub max_rows: Option<u64>,
}

impl TableSchema {
    /// Column lookup. The implicit `_uuid` and `_version` columns are
    /// injected at parse time, so they resolve like any other.
    pub fn column(&self, name: &str) -> Result<&ColumnSchema> {
        self.columns
            .get(name)
            .ok_or_else(|| OvsdbError::UnknownColumn {
                table: self.name.clone(),
                column: name.to_string(),
            })
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    fn parse(name: &str, wire: &Json) -> Result<Self> {
        let Json::Object(object) = wire else {
            return Err(OvsdbError::SchemaInvalid(format!(
                "malformed table schema for {name}"
            )));
        };
        let mut columns = BTreeMap::new();
        if let Some(Json::Object(column_objects)) = object.get("columns") {
            for (column_name, column_wire) in column_objects {
                let column = ColumnSchema::parse(column_wire)
                    .map_err(|err| rescope(err, name, column_name))?;
                columns.insert(column_name.clone(), column);
            }
        }
        for implicit in ["_uuid", "_version"] {
            columns
                .entry(implicit.to_string())
                .or_insert_with(|| ColumnSchema::new(ColumnType::scalar(AtomKind::Uuid)));
        }

        let mut indexes = Vec::new();
        if let Some(Json::Array(groups)) = object.get("indexes") {
            for group in groups {
                let Json::Array(names) = group else {
                    return Err(OvsdbError::SchemaInvalid(format!(
                        "malformed index group in table {name}"
                    )));
                };
                let mut group_columns = Vec::new();
                for column in names {
                    let Some(column) = column.as_str() else {
                        return Err(OvsdbError::SchemaInvalid(format!(
                            "malformed index group in table {name}"
                        )));
                    };
                    if !columns.contains_key(column) {
                        return Err(OvsdbError::SchemaInvalid(format!(
                            "index on table {name} references unknown column {column}"
                        )));
                    }
                    group_columns.push(column.to_string());
                }
                indexes.push(group_columns);
            }
        }

        Ok(Self {
            name: name.to_string(),
            columns,
            indexes,
            is_root: object.get("isRoot").and_then(Json::as_bool).unwrap_or(false),
            max_rows: object.get("maxRows").and_then(Json::as_u64),
        })
    }
}

fn rescope(err: OvsdbError, table: &str, column: &str) -> OvsdbError {
    match err {
        OvsdbError::SchemaInvalid(reason) => {
            OvsdbError::SchemaInvalid(format!("table {table}, column {column}: {reason}"))
        }
        other => other,
    }
}

/// A parsed database schema.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseSchema {
    pub name: String,
    pub version: String,
    pub cksum: Option<String>,
    pub tables: BTreeMap<String, TableSchema>,
}

impl DatabaseSchema {
    /// Parse a `get_schema` reply.
    pub fn parse(wire: &Json) -> Result<Self> {
        let Json::Object(object) = wire else {
            return Err(OvsdbError::SchemaInvalid(format!(
                "schema is not an object: {wire}"
            )));
        };
        let Some(name) = object.get("name").and_then(Json::as_str) else {
            return Err(OvsdbError::SchemaInvalid(
                "schema is missing its name".to_string(),
            ));
        };
        let version = object
            .get("version")
            .and_then(Json::as_str)
            .unwrap_or_default()
            .to_string();
        let mut tables = BTreeMap::new();
        if let Some(Json::Object(table_objects)) = object.get("tables") {
            for (table_name, table_wire) in table_objects {
                tables.insert(table_name.clone(), TableSchema::parse(table_name, table_wire)?);
            }
        }
        Ok(Self {
            name: name.to_string(),
            version,
            cksum: object
                .get("cksum")
                .and_then(Json::as_str)
                .map(str::to_string),
            tables,
        })
    }

    /// Table lookup.
    pub fn table(&self, name: &str) -> Result<&TableSchema> {
        self.tables
            .get(name)
            .ok_or_else(|| OvsdbError::UnknownTable(name.to_string()))
    }

    /// Column lookup through the table.
    pub fn column(&self, table: &str, column: &str) -> Result<&ColumnSchema> {
        self.table(table)?.column(column)
    }

    /// Index groups declared on a table.
    pub fn indexes(&self, table: &str) -> Result<&[Vec<String>]> {
        Ok(&self.table(table)?.indexes)
    }

    /// Whether rows of a table persist without incoming references.
    pub fn is_root(&self, table: &str) -> Result<bool> {
        Ok(self.table(table)?.is_root)
    }
}
