//! Server-side row predicates.

use serde_json::{Value as Json, json};

use crate::atom::AtomKind;
use crate::error::{OvsdbError, Result};
use crate::mapper::Info;
use crate::native::NativeValue;
use crate::record::{FieldToken, Record};
use crate::schema::{ColumnType, TableSchema};
use crate::value::Value;

/// Predicate function of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionFunction {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Includes,
    Excludes,
}

impl ConditionFunction {
    /// Wire name of the function.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::LessThan => "<",
            Self::LessThanOrEqual => "<=",
            Self::GreaterThan => ">",
            Self::GreaterThanOrEqual => ">=",
            Self::Includes => "includes",
            Self::Excludes => "excludes",
        }
    }

    fn is_relational(&self) -> bool {
        matches!(
            self,
            Self::LessThan | Self::LessThanOrEqual | Self::GreaterThan | Self::GreaterThanOrEqual
        )
    }

    fn is_membership(&self) -> bool {
        matches!(self, Self::Includes | Self::Excludes)
    }
}

/// A `(column, function, value)` predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: String,
    pub function: ConditionFunction,
    pub value: Value,
}

impl Condition {
    /// Build a schema-checked condition from a wire value.
    pub fn new(
        table: &TableSchema,
        column: &str,
        function: ConditionFunction,
        value: Value,
    ) -> Result<Self> {
        let schema = table.column(column)?;
        check_function(column, &schema.column_type, function)?;
        check_value_shape(column, &schema.column_type, &value)?;
        Ok(Self {
            column: column.to_string(),
            function,
            value,
        })
    }

    /// Condition selecting a row by UUID.
    #[must_use]
    pub fn uuid_equals(uuid: uuid::Uuid) -> Self {
        Self {
            column: "_uuid".to_string(),
            function: ConditionFunction::Equal,
            value: Value::Atom(crate::atom::Atom::Uuid(uuid)),
        }
    }

    /// Encode as the wire 3-tuple.
    #[must_use]
    pub fn to_wire(&self) -> Json {
        json!([self.column, self.function.as_str(), self.value.to_wire()])
    }
}

fn check_function(column: &str, column_type: &ColumnType, function: ConditionFunction) -> Result<()> {
    if function.is_relational() {
        let numeric = column_type.is_scalar()
            && matches!(column_type.key.kind, AtomKind::Integer | AtomKind::Real);
        if !numeric {
            return Err(OvsdbError::InvalidValue {
                context: format!("column {column}"),
                reason: format!(
                    "{} requires a numeric scalar column",
                    function.as_str()
                ),
            });
        }
    }
    if function.is_membership() && column_type.is_scalar() && !column_type.is_optional() {
        return Err(OvsdbError::InvalidValue {
            context: format!("column {column}"),
            reason: format!("{} requires a set or map column", function.as_str()),
        });
    }
    Ok(())
}

/// Element-level type check. Conditions may carry either a whole value or,
/// for membership functions, a bare element or subset of one.
fn check_value_shape(column: &str, column_type: &ColumnType, value: &Value) -> Result<()> {
    let check_atom = |atom: &crate::atom::Atom| -> Result<()> {
        let kind = atom.kind();
        let want = column_type.key.kind;
        if kind == want || (want == AtomKind::Real && kind == AtomKind::Integer) {
            Ok(())
        } else {
            Err(OvsdbError::InvalidValue {
                context: format!("column {column}"),
                reason: format!("condition value expects {want} atoms, got {kind}"),
            })
        }
    };
    match value {
        Value::Atom(atom) => check_atom(atom),
        Value::Set(atoms) => atoms.iter().try_for_each(check_atom),
        Value::Map(pairs) => {
            if !column_type.is_map() {
                return Err(OvsdbError::InvalidValue {
                    context: format!("column {column}"),
                    reason: "map condition value on a non-map column".to_string(),
                });
            }
            let value_base = column_type.value.as_ref().unwrap_or(&column_type.key);
            for (key, val) in pairs {
                check_atom(key)?;
                let kind = val.kind();
                if kind != value_base.kind
                    && !(value_base.kind == AtomKind::Real && kind == AtomKind::Integer)
                {
                    return Err(OvsdbError::InvalidValue {
                        context: format!("column {column}"),
                        reason: format!(
                            "condition map value expects {} atoms, got {kind}",
                            value_base.kind
                        ),
                    });
                }
            }
            Ok(())
        }
    }
}

impl<R: Record> Info<R> {
    /// Build a condition against a field selector, so callers never name
    /// columns as strings.
    pub fn condition(
        &self,
        token: FieldToken,
        function: ConditionFunction,
        value: NativeValue,
    ) -> Result<Condition> {
        let column = self.column_by_token(token)?;
        let schema = self.table().column(column)?;
        let wire = condition_value(&schema.column_type, value)
            .map_err(|err| err.for_column(column))?;
        Condition::new(self.table(), column, function, wire)
    }
}

/// Encode a native value for use in a condition. Unlike row encoding, a
/// bare scalar is admitted against set and map columns (membership tests
/// name single elements).
fn condition_value(column_type: &ColumnType, value: NativeValue) -> Result<Value> {
    let lift = |atom: crate::atom::Atom| match (column_type.key.kind, &atom) {
        (AtomKind::Real, crate::atom::Atom::Integer(n)) => crate::atom::Atom::Real(*n as f64),
        _ => atom,
    };
    Ok(match value {
        NativeValue::Scalar(atom) | NativeValue::Optional(Some(atom)) => Value::Atom(lift(atom)),
        NativeValue::Optional(None) => Value::empty_set(),
        NativeValue::Set(atoms) => Value::Set(atoms.into_iter().map(lift).collect()),
        NativeValue::Map(pairs) => Value::Map(pairs),
    })
}

#[cfg(test)]
mod tests {
    use super::{Condition, ConditionFunction};
    use crate::atom::Atom;
    use crate::schema::DatabaseSchema;
    use crate::value::Value;
    use serde_json::json;

    fn schema() -> DatabaseSchema {
        DatabaseSchema::parse(&json!({
            "name": "OVN_Northbound",
            "tables": {
                "ACL": {
                    "columns": {
                        "priority": {"type": "integer"},
                        "match": {"type": "string"},
                        "ports": {"type": {"key": "uuid", "min": 0, "max": "unlimited"}}
                    }
                }
            }
        }))
        .expect("schema")
    }

    #[test]
    fn conditions_encode_as_triples() {
        let schema = schema();
        let table = schema.table("ACL").expect("table");
        let condition = Condition::new(
            table,
            "priority",
            ConditionFunction::GreaterThanOrEqual,
            Value::Atom(Atom::Integer(1000)),
        )
        .expect("condition");
        assert_eq!(condition.to_wire(), json!(["priority", ">=", 1000]));
    }

    #[test]
    fn relational_functions_require_numeric_columns() {
        let schema = schema();
        let table = schema.table("ACL").expect("table");
        assert!(
            Condition::new(
                table,
                "match",
                ConditionFunction::LessThan,
                Value::Atom(Atom::String("ip".to_string())),
            )
            .is_err()
        );
    }

    #[test]
    fn membership_functions_require_container_columns() {
        let schema = schema();
        let table = schema.table("ACL").expect("table");
        assert!(
            Condition::new(
                table,
                "priority",
                ConditionFunction::Includes,
                Value::Atom(Atom::Integer(1)),
            )
            .is_err()
        );

        let uuid = uuid::Uuid::parse_str("36bef046-7da7-43a5-905a-c17899216fcb").expect("uuid");
        assert!(
            Condition::new(
                table,
                "ports",
                ConditionFunction::Includes,
                Value::Atom(Atom::Uuid(uuid)),
            )
            .is_ok()
        );
    }

    #[test]
    fn condition_values_type_check_against_the_column() {
        let schema = schema();
        let table = schema.table("ACL").expect("table");
        assert!(
            Condition::new(
                table,
                "priority",
                ConditionFunction::Equal,
                Value::Atom(Atom::String("high".to_string())),
            )
            .is_err()
        );
    }

    #[test]
    fn uuid_equality_shorthand() {
        let uuid = uuid::Uuid::parse_str("36bef046-7da7-43a5-905a-c17899216fcb").expect("uuid");
        let condition = Condition::uuid_equals(uuid);
        assert_eq!(
            condition.to_wire(),
            json!(["_uuid", "==", ["uuid", "36bef046-7da7-43a5-905a-c17899216fcb"]])
        );
    }
}
