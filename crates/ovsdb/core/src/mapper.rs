//! Schema-validated mapping between records and rows.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use crate::atom::{Atom, AtomKind};
use crate::error::{OvsdbError, Result};
use crate::native::{self, NativeKind, NativeValue};
use crate::record::{FieldToken, Record};
use crate::schema::TableSchema;
use crate::value::Row;

/// A record type's validated binding against one table schema.
///
/// Construction checks every tagged field against the column's native shape
/// and precomputes the column-to-token fingerprint; all row/record traffic
/// then goes through it.
#[derive(Debug, Clone)]
pub struct Info<R: Record> {
    table: TableSchema,
    columns: BTreeMap<String, FieldToken>,
    _record: PhantomData<R>,
}

impl<R: Record> Info<R> {
    /// Validate `R` against a table schema.
    pub fn new(table: &TableSchema) -> Result<Self> {
        if R::table_name() != table.name {
            return Err(OvsdbError::SchemaMismatch(format!(
                "record for table {} bound against schema of {}",
                R::table_name(),
                table.name
            )));
        }
        let mut columns = BTreeMap::new();
        for (index, binding) in R::bindings().iter().enumerate() {
            let column = table.column(binding.column)?;
            if !binding_compatible(&column.column_type, binding.kind) {
                return Err(OvsdbError::MapperFieldType {
                    column: binding.column.to_string(),
                    expected: NativeKind::of_column(&column.column_type).to_string(),
                    field: binding.kind.to_string(),
                });
            }
            if columns
                .insert(binding.column.to_string(), FieldToken::new(index))
                .is_some()
            {
                return Err(OvsdbError::MapperAssign {
                    column: binding.column.to_string(),
                    reason: "column is bound by two fields".to_string(),
                });
            }
        }
        Ok(Self {
            table: table.clone(),
            columns,
            _record: PhantomData,
        })
    }

    #[must_use]
    pub fn table(&self) -> &TableSchema {
        &self.table
    }

    /// Whether the record binds a column.
    #[must_use]
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    /// Copy the field bound to `column` out of a record.
    pub fn field_by_column(&self, record: &R, column: &str) -> Result<NativeValue> {
        let token = self.token_by_column(column)?;
        record
            .field(token)
            .ok_or_else(|| OvsdbError::MapperFieldUnknown)
    }

    /// Assign a native value to the field bound to `column`, coercing
    /// between equivalent shapes where the value admits it.
    pub fn set_field(&self, record: &mut R, column: &str, value: NativeValue) -> Result<()> {
        let token = self.token_by_column(column)?;
        let binding = &R::bindings()[token.index()];
        let coerced =
            coerce_to_kind(value, &binding.kind).ok_or_else(|| OvsdbError::MapperAssign {
                column: column.to_string(),
                reason: format!("value does not convert to {}", binding.kind),
            })?;
        if record.set_field(token, coerced) {
            Ok(())
        } else {
            Err(OvsdbError::MapperAssign {
                column: column.to_string(),
                reason: "field rejected the value".to_string(),
            })
        }
    }

    /// Resolve a field selector back to its column name.
    pub fn column_by_token(&self, token: FieldToken) -> Result<&'static str> {
        let binding = R::bindings()
            .get(token.index())
            .ok_or(OvsdbError::MapperFieldUnknown)?;
        if self.columns.contains_key(binding.column) {
            Ok(binding.column)
        } else {
            Err(OvsdbError::MapperFieldUnknown)
        }
    }

    fn token_by_column(&self, column: &str) -> Result<FieldToken> {
        self.columns
            .get(column)
            .copied()
            .ok_or_else(|| OvsdbError::UnknownColumn {
                table: self.table.name.clone(),
                column: column.to_string(),
            })
    }

    /// Index groups for which every column carries a non-default value on
    /// this record. The `_uuid` pseudo-index comes first, then declared
    /// indexes in schema order.
    pub fn valid_indexes(&self, record: &R) -> Result<Vec<Vec<String>>> {
        let mut possible = vec![vec!["_uuid".to_string()]];
        possible.extend(self.table.indexes.iter().cloned());

        let mut valid = Vec::new();
        'groups: for group in possible {
            for column in &group {
                if !self.has_column(column) {
                    continue 'groups;
                }
                let schema = self.table.column(column)?;
                let field = self.field_by_column(record, column)?;
                if native::is_default(&schema.column_type, &field) {
                    continue 'groups;
                }
            }
            valid.push(group);
        }
        Ok(valid)
    }

    /// Project a record into a wire row.
    ///
    /// Without a projection, every bound data column with a non-default
    /// value is included (insert semantics: the server fills defaults).
    /// With a projection, exactly the named columns are included, defaults
    /// and all (update semantics: defaults must be writable).
    pub fn to_row(&self, record: &R, columns: Option<&[&str]>) -> Result<Row> {
        let mut row = Row::new();
        match columns {
            None => {
                for (column, _) in &self.columns {
                    if column == "_uuid" || column == "_version" {
                        continue;
                    }
                    let schema = self.table.column(column)?;
                    let field = self.field_by_column(record, column)?;
                    if native::is_default(&schema.column_type, &field) {
                        continue;
                    }
                    let wire = native::native_to_ovs(&schema.column_type, &field)
                        .map_err(|err| err.for_column(column))?;
                    row.insert(column.clone(), wire);
                }
            }
            Some(columns) => {
                for column in columns {
                    let schema = self.table.column(column)?;
                    let field = self.field_by_column(record, column)?;
                    let wire = native::native_to_ovs(&schema.column_type, &field)
                        .map_err(|err| err.for_column(column))?;
                    row.insert((*column).to_string(), wire);
                }
            }
        }
        Ok(row)
    }

    /// Copy a wire row into a record. Columns the record does not bind are
    /// ignored; bound columns absent from the row keep their value.
    pub fn from_row(&self, row: &Row, record: &mut R) -> Result<()> {
        for (column, value) in row.iter() {
            if !self.has_column(column) {
                continue;
            }
            let schema = self.table.column(column)?;
            let native = native::ovs_to_native(&schema.column_type, value)
                .map_err(|err| err.for_column(column))?;
            self.set_field(record, column, native)?;
        }
        Ok(())
    }

    /// Decode a wire row into a fresh record.
    pub fn to_record(&self, row: &Row) -> Result<R> {
        let mut record = R::default();
        self.from_row(row, &mut record)?;
        Ok(record)
    }
}

fn binding_compatible(column: &crate::schema::ColumnType, binding: NativeKind) -> bool {
    let expected = NativeKind::of_column(column);
    if binding == expected {
        return true;
    }
    // Enum columns admit only string-shaped fields of the matching arity.
    if column.key.enum_members.is_some() {
        return matches!(
            (expected, binding),
            (NativeKind::Scalar(_), NativeKind::Scalar(AtomKind::String))
                | (NativeKind::Optional(_), NativeKind::Optional(AtomKind::String))
                | (NativeKind::Set(_), NativeKind::Set(AtomKind::String))
        );
    }
    false
}

fn coerce_to_kind(value: NativeValue, kind: &NativeKind) -> Option<NativeValue> {
    if value.matches_kind(kind) {
        return Some(value);
    }
    match (value, kind) {
        // Wrap a scalar into an optional field.
        (NativeValue::Scalar(atom), NativeKind::Optional(want)) => {
            lift(atom, *want).map(|atom| NativeValue::Optional(Some(atom)))
        }
        // Unwrap a present optional into a scalar field.
        (NativeValue::Optional(Some(atom)), NativeKind::Scalar(want)) => {
            lift(atom, *want).map(NativeValue::Scalar)
        }
        (NativeValue::Scalar(atom), NativeKind::Scalar(want)) => {
            lift(atom, *want).map(NativeValue::Scalar)
        }
        (NativeValue::Optional(Some(atom)), NativeKind::Optional(want)) => {
            lift(atom, *want).map(|atom| NativeValue::Optional(Some(atom)))
        }
        (NativeValue::Set(atoms), NativeKind::Set(want)) => atoms
            .into_iter()
            .map(|atom| lift(atom, *want))
            .collect::<Option<Vec<_>>>()
            .map(NativeValue::Set),
        _ => None,
    }
}

fn lift(atom: Atom, want: AtomKind) -> Option<Atom> {
    if atom.kind() == want {
        Some(atom)
    } else if let (Atom::Integer(n), AtomKind::Real) = (&atom, want) {
        Some(Atom::Real(*n as f64))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::Info;
    use crate::atom::{Atom, AtomKind};
    use crate::error::OvsdbError;
    use crate::native::{NativeKind, NativeValue};
    use crate::record::{FieldBinding, FieldToken, IntoNative, Record, assign};
    use crate::schema::DatabaseSchema;
    use crate::value::Value;
    use serde_json::json;
    use uuid::Uuid;

    fn schema() -> DatabaseSchema {
        DatabaseSchema::parse(&json!({
            "name": "OVN_Northbound",
            "version": "5.16.0",
            "tables": {
                "Logical_Switch_Port": {
                    "columns": {
                        "name": {"type": "string"},
                        "type": {"type": {"key": {
                            "type": "string",
                            "enum": ["set", ["", "router", "localnet"]]
                        }}},
                        "tag": {"type": {"key": "integer", "min": 0, "max": 1}},
                        "addresses": {"type": {"key": "string", "min": 0, "max": "unlimited"}}
                    },
                    "indexes": [["name"]]
                }
            }
        }))
        .expect("schema")
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Port {
        uuid: Uuid,
        name: String,
        port_type: String,
        tag: Option<i64>,
        addresses: Vec<String>,
    }

    impl Record for Port {
        fn table_name() -> &'static str {
            "Logical_Switch_Port"
        }

        fn bindings() -> &'static [FieldBinding] {
            &[
                FieldBinding {
                    column: "_uuid",
                    kind: NativeKind::Scalar(AtomKind::Uuid),
                },
                FieldBinding {
                    column: "name",
                    kind: NativeKind::Scalar(AtomKind::String),
                },
                FieldBinding {
                    column: "type",
                    kind: NativeKind::Scalar(AtomKind::String),
                },
                FieldBinding {
                    column: "tag",
                    kind: NativeKind::Optional(AtomKind::Integer),
                },
                FieldBinding {
                    column: "addresses",
                    kind: NativeKind::Set(AtomKind::String),
                },
            ]
        }

        fn field(&self, token: FieldToken) -> Option<NativeValue> {
            match token.index() {
                0 => Some(self.uuid.into_native()),
                1 => Some(self.name.clone().into_native()),
                2 => Some(self.port_type.clone().into_native()),
                3 => Some(self.tag.into_native()),
                4 => Some(self.addresses.clone().into_native()),
                _ => None,
            }
        }

        fn set_field(&mut self, token: FieldToken, value: NativeValue) -> bool {
            match token.index() {
                0 => assign(&mut self.uuid, value),
                1 => assign(&mut self.name, value),
                2 => assign(&mut self.port_type, value),
                3 => assign(&mut self.tag, value),
                4 => assign(&mut self.addresses, value),
                _ => false,
            }
        }
    }

    fn info() -> Info<Port> {
        let schema = schema();
        Info::new(schema.table("Logical_Switch_Port").expect("table")).expect("info")
    }

    #[test]
    fn construction_validates_field_shapes() {
        info();

        #[derive(Debug, Clone, Default, PartialEq)]
        struct BadPort {
            name: i64,
        }
        impl Record for BadPort {
            fn table_name() -> &'static str {
                "Logical_Switch_Port"
            }
            fn bindings() -> &'static [FieldBinding] {
                &[FieldBinding {
                    column: "name",
                    kind: NativeKind::Scalar(AtomKind::Integer),
                }]
            }
            fn field(&self, token: FieldToken) -> Option<NativeValue> {
                match token.index() {
                    0 => Some(self.name.into_native()),
                    _ => None,
                }
            }
            fn set_field(&mut self, token: FieldToken, value: NativeValue) -> bool {
                match token.index() {
                    0 => assign(&mut self.name, value),
                    _ => false,
                }
            }
        }

        let schema = schema();
        let err = Info::<BadPort>::new(schema.table("Logical_Switch_Port").expect("table"))
            .expect_err("must reject integer field on string column");
        assert!(matches!(err, OvsdbError::MapperFieldType { .. }));
    }

    #[test]
    fn round_trip_record_to_row_and_back() {
        let info = info();
        let port = Port {
            uuid: Uuid::nil(),
            name: "lsp1".to_string(),
            port_type: "router".to_string(),
            tag: Some(7),
            addresses: vec!["aa:bb".to_string()],
        };
        let row = info.to_row(&port, None).expect("row");
        let back = info.to_record(&row).expect("record");
        assert_eq!(back, port);
    }

    #[test]
    fn to_row_skips_defaults_without_projection() {
        let info = info();
        let port = Port {
            name: "lsp1".to_string(),
            ..Port::default()
        };
        let row = info.to_row(&port, None).expect("row");
        assert!(row.contains("name"));
        assert!(!row.contains("tag"));
        assert!(!row.contains("addresses"));
        assert!(!row.contains("_uuid"));
    }

    #[test]
    fn to_row_projection_includes_defaults() {
        let info = info();
        let port = Port::default();
        let row = info.to_row(&port, Some(&["tag", "addresses"])).expect("row");
        assert_eq!(row.get("tag"), Some(&Value::empty_set()));
        assert_eq!(row.get("addresses"), Some(&Value::Set(vec![])));
    }

    #[test]
    fn set_field_wraps_and_unwraps_optionals() {
        let info = info();
        let mut port = Port::default();
        info.set_field(&mut port, "tag", NativeValue::Scalar(Atom::Integer(9)))
            .expect("wrap");
        assert_eq!(port.tag, Some(9));

        info.set_field(
            &mut port,
            "name",
            NativeValue::Optional(Some(Atom::String("lsp2".to_string()))),
        )
        .expect("unwrap");
        assert_eq!(port.name, "lsp2");
    }

    #[test]
    fn set_field_rejects_wrong_shape() {
        let info = info();
        let mut port = Port::default();
        let err = info
            .set_field(&mut port, "name", NativeValue::Scalar(Atom::Integer(3)))
            .expect_err("reject");
        assert!(matches!(err, OvsdbError::MapperAssign { .. }));
        assert_eq!(port.name, "");
    }

    #[test]
    fn column_by_token_resolves_field_selectors() {
        let info = info();
        let token = Port::token_of("tag").expect("token");
        assert_eq!(info.column_by_token(token).expect("column"), "tag");
        assert!(info.column_by_token(FieldToken::new(99)).is_err());
    }

    #[test]
    fn valid_indexes_orders_uuid_first() {
        let info = info();
        let port = Port {
            uuid: Uuid::parse_str("36bef046-7da7-43a5-905a-c17899216fcb").expect("uuid"),
            name: "lsp1".to_string(),
            ..Port::default()
        };
        assert_eq!(
            info.valid_indexes(&port).expect("indexes"),
            vec![vec!["_uuid".to_string()], vec!["name".to_string()]]
        );

        let unnamed = Port {
            uuid: port.uuid,
            ..Port::default()
        };
        assert_eq!(
            info.valid_indexes(&unnamed).expect("indexes"),
            vec![vec!["_uuid".to_string()]]
        );
    }

    #[test]
    fn unbound_column_fails_lookup() {
        let info = info();
        let port = Port::default();
        assert!(matches!(
            info.field_by_column(&port, "external_ids"),
            Err(OvsdbError::UnknownColumn { .. })
        ));
    }
}
