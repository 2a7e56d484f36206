//! Transaction building and reply decoding.

use std::collections::BTreeMap;

use serde_json::Value as Json;
use uuid::Uuid;

use crate::atom::Atom;
use crate::condition::Condition;
use crate::error::{OvsdbError, Result};
use crate::mapper::Info;
use crate::mutation::Mutation;
use crate::native::NativeValue;
use crate::operation::{Operation, OperationOutcome, WaitUntil};
use crate::record::Record;
use crate::value::Row;

/// JSON-RPC method name for transactions.
pub const TRANSACT_METHOD: &str = "transact";

/// A transaction plan under construction.
///
/// Inserts are assigned monotonic `row{n}` tokens. A record inserted with a
/// non-nil `_uuid` registers that UUID as a placeholder: wherever another
/// operation in the same plan references it, the encoder emits
/// `["named-uuid", token]` instead.
#[derive(Debug, Clone)]
pub struct Transaction {
    database: String,
    operations: Vec<Operation>,
    named: BTreeMap<Uuid, String>,
    next_token: usize,
}

impl Transaction {
    #[must_use]
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            operations: Vec::new(),
            named: BTreeMap::new(),
            next_token: 0,
        }
    }

    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    #[must_use]
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Append a raw operation.
    pub fn push(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    /// Insert a wire row, returning the named-UUID token assigned to it.
    /// A non-nil placeholder UUID makes references to it from the rest of
    /// the plan resolve to this insert.
    pub fn insert_row(&mut self, table: &str, row: Row, placeholder: Option<Uuid>) -> String {
        let token = format!("row{}", self.next_token);
        self.next_token += 1;
        if let Some(placeholder) = placeholder {
            if !placeholder.is_nil() {
                self.named.insert(placeholder, token.clone());
            }
        }
        self.operations.push(Operation::Insert {
            table: table.to_string(),
            row,
            uuid_name: Some(token.clone()),
        });
        token
    }

    /// Insert a record, returning its named-UUID token.
    pub fn insert<R: Record>(&mut self, info: &Info<R>, record: &R) -> Result<String> {
        let row = info.to_row(record, None)?;
        let placeholder = record_uuid(info, record)?;
        let table = info.table().name.clone();
        Ok(self.insert_row(&table, row, placeholder))
    }

    /// Select rows matching conditions, optionally projecting columns.
    pub fn select(
        &mut self,
        table: &str,
        conditions: Vec<Condition>,
        columns: Option<Vec<String>>,
    ) {
        self.operations.push(Operation::Select {
            table: table.to_string(),
            conditions,
            columns,
        });
    }

    /// Update the rows selected by `conditions` with the record's columns.
    /// Without conditions, a non-nil record UUID synthesizes `_uuid ==`;
    /// otherwise the plan is rejected.
    pub fn update<R: Record>(
        &mut self,
        info: &Info<R>,
        record: &R,
        conditions: Vec<Condition>,
        columns: Option<&[&str]>,
    ) -> Result<()> {
        let conditions = self.require_conditions(info, record, conditions)?;
        let row = info.to_row(record, columns)?;
        self.operations.push(Operation::Update {
            table: info.table().name.clone(),
            conditions,
            row,
        });
        Ok(())
    }

    /// Mutate the rows selected by `conditions` in place.
    pub fn mutate<R: Record>(
        &mut self,
        info: &Info<R>,
        record: &R,
        conditions: Vec<Condition>,
        mutations: Vec<Mutation>,
    ) -> Result<()> {
        let conditions = self.require_conditions(info, record, conditions)?;
        self.operations.push(Operation::Mutate {
            table: info.table().name.clone(),
            conditions,
            mutations,
        });
        Ok(())
    }

    /// Delete the rows selected by `conditions`.
    pub fn delete<R: Record>(
        &mut self,
        info: &Info<R>,
        record: &R,
        conditions: Vec<Condition>,
    ) -> Result<()> {
        let conditions = self.require_conditions(info, record, conditions)?;
        self.operations.push(Operation::Delete {
            table: info.table().name.clone(),
            conditions,
        });
        Ok(())
    }

    /// Wait until the selected rows match (or stop matching) `rows`.
    pub fn wait(
        &mut self,
        table: &str,
        timeout_ms: Option<u64>,
        conditions: Vec<Condition>,
        columns: Vec<String>,
        until: WaitUntil,
        rows: Vec<Row>,
    ) {
        self.operations.push(Operation::Wait {
            table: table.to_string(),
            timeout_ms,
            conditions,
            columns,
            until,
            rows,
        });
    }

    pub fn commit(&mut self, durable: bool) {
        self.operations.push(Operation::Commit { durable });
    }

    pub fn abort(&mut self) {
        self.operations.push(Operation::Abort);
    }

    pub fn assert_lock(&mut self, lock: impl Into<String>) {
        self.operations.push(Operation::Assert { lock: lock.into() });
    }

    pub fn comment(&mut self, comment: impl Into<String>) {
        self.operations.push(Operation::Comment {
            comment: comment.into(),
        });
    }

    fn require_conditions<R: Record>(
        &self,
        info: &Info<R>,
        record: &R,
        given: Vec<Condition>,
    ) -> Result<Vec<Condition>> {
        if !given.is_empty() {
            return Ok(given);
        }
        if let Some(uuid) = record_uuid(info, record)? {
            return Ok(vec![Condition::uuid_equals(uuid)]);
        }
        Err(OvsdbError::NoCondition {
            table: info.table().name.clone(),
        })
    }

    /// Encode as `transact` params: the database name followed by the
    /// operation objects, with placeholder references rewritten.
    #[must_use]
    pub fn params(&self) -> Json {
        let mut params = vec![Json::String(self.database.clone())];
        params.extend(
            self.operations
                .iter()
                .map(|operation| operation.to_wire(&self.named)),
        );
        Json::Array(params)
    }

    /// Decode a `transact` reply against this plan.
    pub fn decode_reply(&self, reply: &Json) -> Result<TransactReply> {
        let Json::Array(slots) = reply else {
            return Err(OvsdbError::InvalidValue {
                context: "transact reply".to_string(),
                reason: format!("not an array: {reply}"),
            });
        };
        let requested = self.operations.len();
        if slots.len() > requested + 1 {
            return Err(OvsdbError::InvalidValue {
                context: "transact reply".to_string(),
                reason: format!("{} result slots for {requested} operations", slots.len()),
            });
        }

        let mut outcomes = Vec::with_capacity(requested);
        let mut abort: Option<(usize, String)> = None;
        for (index, slot) in slots.iter().take(requested).enumerate() {
            let outcome = OperationOutcome::from_wire(slot)?;
            if abort.is_none() {
                if let OperationOutcome::Failed { error, .. } = &outcome {
                    abort = Some((index, error.clone()));
                }
            }
            // Everything past the failing slot is aborted regardless of
            // what the server put there.
            if abort.as_ref().is_some_and(|(failed, _)| index > *failed) {
                outcomes.push(OperationOutcome::Aborted);
            } else {
                outcomes.push(outcome);
            }
        }
        while outcomes.len() < requested {
            outcomes.push(OperationOutcome::Aborted);
        }

        // A trailing slot carries a transaction-level error.
        if slots.len() == requested + 1 {
            if let OperationOutcome::Failed { error, .. } =
                OperationOutcome::from_wire(&slots[requested])?
            {
                if abort.is_none() {
                    abort = Some((requested, error));
                }
            }
        }

        let mut resolved = BTreeMap::new();
        for (operation, outcome) in self.operations.iter().zip(&outcomes) {
            if let (
                Operation::Insert {
                    uuid_name: Some(token),
                    ..
                },
                OperationOutcome::Inserted { uuid },
            ) = (operation, outcome)
            {
                resolved.insert(token.clone(), *uuid);
            }
        }
        let placeholders = self
            .named
            .iter()
            .filter_map(|(placeholder, token)| {
                resolved.get(token).map(|uuid| (*placeholder, *uuid))
            })
            .collect();

        Ok(TransactReply {
            outcomes,
            abort,
            resolved,
            placeholders,
        })
    }
}

fn record_uuid<R: Record>(info: &Info<R>, record: &R) -> Result<Option<Uuid>> {
    if !info.has_column("_uuid") {
        return Ok(None);
    }
    match info.field_by_column(record, "_uuid")? {
        NativeValue::Scalar(Atom::Uuid(uuid)) if !uuid.is_nil() => Ok(Some(uuid)),
        _ => Ok(None),
    }
}

/// Decoded transaction reply: per-operation outcomes plus the named-UUID
/// resolution table. No named-uuid token survives into the outcomes.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactReply {
    outcomes: Vec<OperationOutcome>,
    abort: Option<(usize, String)>,
    resolved: BTreeMap<String, Uuid>,
    placeholders: BTreeMap<Uuid, Uuid>,
}

impl TransactReply {
    #[must_use]
    pub fn outcomes(&self) -> &[OperationOutcome] {
        &self.outcomes
    }

    /// Server-allocated UUID for an insert token.
    #[must_use]
    pub fn uuid_of(&self, token: &str) -> Option<Uuid> {
        self.resolved.get(token).copied()
    }

    /// Server-allocated UUID for a placeholder UUID the caller put on an
    /// inserted record.
    #[must_use]
    pub fn uuid_for_placeholder(&self, placeholder: Uuid) -> Option<Uuid> {
        self.placeholders.get(&placeholder).copied()
    }

    /// Whether the transaction aborted, and at which operation.
    #[must_use]
    pub fn aborted_at(&self) -> Option<usize> {
        self.abort.as_ref().map(|(index, _)| *index)
    }

    /// Error for one operation slot, mapped to its kind. Server constraint
    /// failures (`constraint violation`, `not owner`) map to
    /// `ConstraintViolation`.
    #[must_use]
    pub fn operation_error(&self, index: usize) -> Option<OvsdbError> {
        match self.outcomes.get(index)? {
            OperationOutcome::Failed { error, details } => {
                Some(match error.as_str() {
                    "constraint violation" | "not owner" | "referential integrity violation" => {
                        OvsdbError::ConstraintViolation {
                            details: if details.is_empty() {
                                error.clone()
                            } else {
                                details.clone()
                            },
                        }
                    }
                    _ => OvsdbError::OperationError {
                        index,
                        error: error.clone(),
                        details: details.clone(),
                    },
                })
            }
            _ => None,
        }
    }

    /// Fail if the transaction did not fully commit.
    pub fn check(&self) -> Result<()> {
        match &self.abort {
            None => Ok(()),
            Some((index, error)) => Err(OvsdbError::TransactionAborted {
                index: *index,
                error: error.clone(),
            }),
        }
    }
}
