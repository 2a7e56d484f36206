//! Server-side in-place row mutations.

use serde_json::{Value as Json, json};

use crate::atom::AtomKind;
use crate::error::{OvsdbError, Result};
use crate::mapper::Info;
use crate::native::NativeValue;
use crate::record::{FieldToken, Record};
use crate::schema::{ColumnType, TableSchema};
use crate::value::Value;

/// Mutation operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Insert,
    Delete,
}

impl Mutator {
    /// Wire name of the mutator.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "+=",
            Self::Subtract => "-=",
            Self::Multiply => "*=",
            Self::Divide => "/=",
            Self::Modulo => "%=",
            Self::Insert => "insert",
            Self::Delete => "delete",
        }
    }

    fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            Self::Add | Self::Subtract | Self::Multiply | Self::Divide | Self::Modulo
        )
    }
}

/// A `(column, mutator, value)` mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub column: String,
    pub mutator: Mutator,
    pub value: Value,
}

impl Mutation {
    /// Build a schema-checked mutation from a wire value.
    pub fn new(
        table: &TableSchema,
        column: &str,
        mutator: Mutator,
        value: Value,
    ) -> Result<Self> {
        let schema = table.column(column)?;
        check_mutator(column, &schema.column_type, mutator, &value)?;
        Ok(Self {
            column: column.to_string(),
            mutator,
            value,
        })
    }

    /// Encode as the wire 3-tuple.
    #[must_use]
    pub fn to_wire(&self) -> Json {
        json!([self.column, self.mutator.as_str(), self.value.to_wire()])
    }
}

fn check_mutator(
    column: &str,
    column_type: &ColumnType,
    mutator: Mutator,
    value: &Value,
) -> Result<()> {
    let invalid = |reason: String| OvsdbError::InvalidValue {
        context: format!("column {column}"),
        reason,
    };
    if mutator.is_arithmetic() {
        if column_type.is_map() {
            return Err(invalid(format!(
                "{} cannot be applied to a map column",
                mutator.as_str()
            )));
        }
        let numeric = if mutator == Mutator::Modulo {
            column_type.key.kind == AtomKind::Integer
        } else {
            matches!(column_type.key.kind, AtomKind::Integer | AtomKind::Real)
        };
        if !numeric {
            return Err(invalid(format!(
                "{} requires a numeric column",
                mutator.as_str()
            )));
        }
        // The operand of an arithmetic mutator is one scalar.
        let Value::Atom(atom) = value else {
            return Err(invalid(format!(
                "{} takes a scalar operand",
                mutator.as_str()
            )));
        };
        let kind = atom.kind();
        if kind != column_type.key.kind
            && !(column_type.key.kind == AtomKind::Real && kind == AtomKind::Integer)
        {
            return Err(invalid(format!(
                "{} operand expects {} atoms, got {kind}",
                mutator.as_str(),
                column_type.key.kind
            )));
        }
        return Ok(());
    }

    // insert / delete apply to sets and maps only.
    if column_type.is_scalar() {
        return Err(invalid(format!(
            "{} requires a set or map column",
            mutator.as_str()
        )));
    }
    let element_check = |atom: &crate::atom::Atom| -> Result<()> {
        if atom.kind() == column_type.key.kind {
            Ok(())
        } else {
            Err(invalid(format!(
                "mutation operand expects {} atoms, got {}",
                column_type.key.kind,
                atom.kind()
            )))
        }
    };
    match value {
        Value::Atom(atom) => element_check(atom),
        Value::Set(atoms) => atoms.iter().try_for_each(element_check),
        Value::Map(pairs) => {
            if !column_type.is_map() {
                return Err(invalid("map operand on a set column".to_string()));
            }
            // delete on a map also admits a set of keys; a map operand is
            // checked pairwise.
            let value_base = column_type.value.as_ref().unwrap_or(&column_type.key);
            for (key, val) in pairs {
                element_check(key)?;
                if val.kind() != value_base.kind {
                    return Err(invalid(format!(
                        "mutation map value expects {} atoms, got {}",
                        value_base.kind,
                        val.kind()
                    )));
                }
            }
            Ok(())
        }
    }
}

impl<R: Record> Info<R> {
    /// Build a mutation against a field selector.
    pub fn mutation(
        &self,
        token: FieldToken,
        mutator: Mutator,
        value: NativeValue,
    ) -> Result<Mutation> {
        let column = self.column_by_token(token)?;
        let wire = match value {
            NativeValue::Scalar(atom) | NativeValue::Optional(Some(atom)) => Value::Atom(atom),
            NativeValue::Optional(None) => Value::empty_set(),
            NativeValue::Set(atoms) => Value::Set(atoms),
            NativeValue::Map(pairs) => Value::Map(pairs),
        };
        Mutation::new(self.table(), column, mutator, wire)
    }
}
