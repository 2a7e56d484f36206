//! Transaction operations and their wire encoding.

use std::collections::BTreeMap;

use serde_json::{Map as JsonMap, Value as Json, json};
use uuid::Uuid;

use crate::atom::Atom;
use crate::condition::Condition;
use crate::error::{OvsdbError, Result};
use crate::mutation::Mutation;
use crate::value::{Row, Value};

/// Comparison used by a `wait` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitUntil {
    Equal,
    NotEqual,
}

impl WaitUntil {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
        }
    }
}

/// One operation of a transaction plan.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Insert {
        table: String,
        row: Row,
        uuid_name: Option<String>,
    },
    Select {
        table: String,
        conditions: Vec<Condition>,
        columns: Option<Vec<String>>,
    },
    Update {
        table: String,
        conditions: Vec<Condition>,
        row: Row,
    },
    Mutate {
        table: String,
        conditions: Vec<Condition>,
        mutations: Vec<Mutation>,
    },
    Delete {
        table: String,
        conditions: Vec<Condition>,
    },
    Wait {
        table: String,
        timeout_ms: Option<u64>,
        conditions: Vec<Condition>,
        columns: Vec<String>,
        until: WaitUntil,
        rows: Vec<Row>,
    },
    Commit {
        durable: bool,
    },
    Abort,
    Assert {
        lock: String,
    },
    Comment {
        comment: String,
    },
}

impl Operation {
    /// Encode as a wire operation object. UUID atoms matching a placeholder
    /// in `named` are rewritten to their `named-uuid` token.
    #[must_use]
    pub fn to_wire(&self, named: &BTreeMap<Uuid, String>) -> Json {
        match self {
            Self::Insert {
                table,
                row,
                uuid_name,
            } => {
                let mut object = JsonMap::new();
                object.insert("op".to_string(), json!("insert"));
                object.insert("table".to_string(), json!(table));
                object.insert("row".to_string(), row_wire(row, named));
                if let Some(uuid_name) = uuid_name {
                    object.insert("uuid-name".to_string(), json!(uuid_name));
                }
                Json::Object(object)
            }
            Self::Select {
                table,
                conditions,
                columns,
            } => {
                let mut object = JsonMap::new();
                object.insert("op".to_string(), json!("select"));
                object.insert("table".to_string(), json!(table));
                object.insert("where".to_string(), conditions_wire(conditions, named));
                if let Some(columns) = columns {
                    object.insert("columns".to_string(), json!(columns));
                }
                Json::Object(object)
            }
            Self::Update {
                table,
                conditions,
                row,
            } => json!({
                "op": "update",
                "table": table,
                "where": conditions_wire(conditions, named),
                "row": row_wire(row, named),
            }),
            Self::Mutate {
                table,
                conditions,
                mutations,
            } => json!({
                "op": "mutate",
                "table": table,
                "where": conditions_wire(conditions, named),
                "mutations": mutations
                    .iter()
                    .map(|mutation| {
                        json!([
                            mutation.column,
                            mutation.mutator.as_str(),
                            rewrite(&mutation.value, named).to_wire(),
                        ])
                    })
                    .collect::<Vec<_>>(),
            }),
            Self::Delete { table, conditions } => json!({
                "op": "delete",
                "table": table,
                "where": conditions_wire(conditions, named),
            }),
            Self::Wait {
                table,
                timeout_ms,
                conditions,
                columns,
                until,
                rows,
            } => {
                let mut object = JsonMap::new();
                object.insert("op".to_string(), json!("wait"));
                object.insert("table".to_string(), json!(table));
                if let Some(timeout_ms) = timeout_ms {
                    object.insert("timeout".to_string(), json!(timeout_ms));
                }
                object.insert("where".to_string(), conditions_wire(conditions, named));
                object.insert("columns".to_string(), json!(columns));
                object.insert("until".to_string(), json!(until.as_str()));
                object.insert(
                    "rows".to_string(),
                    Json::Array(rows.iter().map(|row| row_wire(row, named)).collect()),
                );
                Json::Object(object)
            }
            Self::Commit { durable } => json!({"op": "commit", "durable": durable}),
            Self::Abort => json!({"op": "abort"}),
            Self::Assert { lock } => json!({"op": "assert", "lock": lock}),
            Self::Comment { comment } => json!({"op": "comment", "comment": comment}),
        }
    }
}

fn row_wire(row: &Row, named: &BTreeMap<Uuid, String>) -> Json {
    let mut object = JsonMap::new();
    for (column, value) in row.iter() {
        object.insert(column.clone(), rewrite(value, named).to_wire());
    }
    Json::Object(object)
}

fn conditions_wire(conditions: &[Condition], named: &BTreeMap<Uuid, String>) -> Json {
    Json::Array(
        conditions
            .iter()
            .map(|condition| {
                json!([
                    condition.column,
                    condition.function.as_str(),
                    rewrite(&condition.value, named).to_wire(),
                ])
            })
            .collect(),
    )
}

/// Swap placeholder UUIDs for their transaction-scoped tokens.
fn rewrite(value: &Value, named: &BTreeMap<Uuid, String>) -> Value {
    if named.is_empty() {
        return value.clone();
    }
    let swap = |atom: &Atom| match atom {
        Atom::Uuid(uuid) => match named.get(uuid) {
            Some(token) => Atom::NamedUuid(token.clone()),
            None => atom.clone(),
        },
        other => other.clone(),
    };
    match value {
        Value::Atom(atom) => Value::Atom(swap(atom)),
        Value::Set(atoms) => Value::Set(atoms.iter().map(swap).collect()),
        Value::Map(pairs) => Value::Map(
            pairs
                .iter()
                .map(|(key, val)| (swap(key), swap(val)))
                .collect(),
        ),
    }
}

/// Decoded result slot of one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    /// The server allocated a UUID for an insert.
    Inserted { uuid: Uuid },
    /// Rows touched by an update, mutate, or delete.
    Updated { count: u64 },
    /// Rows returned by a select.
    Selected { rows: Vec<Row> },
    /// An operation with no payload result (commit, assert, comment).
    Done,
    /// The operation failed server-side.
    Failed { error: String, details: String },
    /// A later slot of a transaction that aborted earlier.
    Aborted,
}

impl OperationOutcome {
    /// Decode one result slot.
    pub fn from_wire(wire: &Json) -> Result<Self> {
        let object = match wire {
            Json::Null => return Ok(Self::Aborted),
            Json::Object(object) => object,
            other => {
                return Err(OvsdbError::InvalidValue {
                    context: "operation result".to_string(),
                    reason: format!("not an object: {other}"),
                });
            }
        };
        if let Some(error) = object.get("error").and_then(Json::as_str) {
            return Ok(Self::Failed {
                error: error.to_string(),
                details: object
                    .get("details")
                    .and_then(Json::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        if let Some(uuid) = object.get("uuid") {
            let atom = Atom::from_wire(uuid)?;
            let Atom::Uuid(uuid) = atom else {
                return Err(OvsdbError::InvalidValue {
                    context: "operation result".to_string(),
                    reason: format!("insert result carries a non-concrete uuid: {atom:?}"),
                });
            };
            return Ok(Self::Inserted { uuid });
        }
        if let Some(count) = object.get("count").and_then(Json::as_u64) {
            return Ok(Self::Updated { count });
        }
        if let Some(Json::Array(rows)) = object.get("rows") {
            let rows = rows.iter().map(Row::from_wire).collect::<Result<Vec<_>>>()?;
            return Ok(Self::Selected { rows });
        }
        Ok(Self::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::{Operation, OperationOutcome, WaitUntil};
    use crate::atom::Atom;
    use crate::value::{Row, Value};
    use serde_json::json;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    #[test]
    fn insert_encodes_with_uuid_name() {
        let mut row = Row::new();
        row.insert("name", Value::Atom(Atom::String("ls1".to_string())));
        let operation = Operation::Insert {
            table: "Logical_Switch".to_string(),
            row,
            uuid_name: Some("row0".to_string()),
        };
        assert_eq!(
            operation.to_wire(&BTreeMap::new()),
            json!({
                "op": "insert",
                "table": "Logical_Switch",
                "row": {"name": "ls1"},
                "uuid-name": "row0",
            })
        );
    }

    #[test]
    fn placeholder_uuids_rewrite_to_named_tokens() {
        let placeholder = Uuid::parse_str("36bef046-7da7-43a5-905a-c17899216fcb").expect("uuid");
        let mut named = BTreeMap::new();
        named.insert(placeholder, "row0".to_string());

        let mut row = Row::new();
        row.insert("ports", Value::Set(vec![Atom::Uuid(placeholder)]));
        let operation = Operation::Insert {
            table: "Logical_Switch".to_string(),
            row,
            uuid_name: Some("row1".to_string()),
        };
        assert_eq!(
            operation.to_wire(&named),
            json!({
                "op": "insert",
                "table": "Logical_Switch",
                "row": {"ports": ["set", [["named-uuid", "row0"]]]},
                "uuid-name": "row1",
            })
        );
    }

    #[test]
    fn wait_encodes_all_fields() {
        let operation = Operation::Wait {
            table: "Logical_Switch".to_string(),
            timeout_ms: Some(100),
            conditions: Vec::new(),
            columns: vec!["name".to_string()],
            until: WaitUntil::Equal,
            rows: vec![Row::from_iter([(
                "name".to_string(),
                Value::Atom(Atom::String("ls1".to_string())),
            )])],
        };
        assert_eq!(
            operation.to_wire(&BTreeMap::new()),
            json!({
                "op": "wait",
                "table": "Logical_Switch",
                "timeout": 100,
                "where": [],
                "columns": ["name"],
                "until": "==",
                "rows": [{"name": "ls1"}],
            })
        );
    }

    #[test]
    fn outcomes_decode_by_shape() {
        let inserted =
            OperationOutcome::from_wire(&json!({"uuid": ["uuid", "36bef046-7da7-43a5-905a-c17899216fcb"]}))
                .expect("inserted");
        assert!(matches!(inserted, OperationOutcome::Inserted { .. }));

        let updated = OperationOutcome::from_wire(&json!({"count": 2})).expect("updated");
        assert_eq!(updated, OperationOutcome::Updated { count: 2 });

        let selected =
            OperationOutcome::from_wire(&json!({"rows": [{"name": "ls1"}]})).expect("selected");
        assert!(matches!(selected, OperationOutcome::Selected { rows } if rows.len() == 1));

        let failed = OperationOutcome::from_wire(&json!({"error": "not owner", "details": "lock"}))
            .expect("failed");
        assert_eq!(
            failed,
            OperationOutcome::Failed {
                error: "not owner".to_string(),
                details: "lock".to_string(),
            }
        );

        assert_eq!(
            OperationOutcome::from_wire(&json!(null)).expect("aborted"),
            OperationOutcome::Aborted
        );
        assert_eq!(
            OperationOutcome::from_wire(&json!({})).expect("done"),
            OperationOutcome::Done
        );
    }
}
