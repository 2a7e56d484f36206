//! Protocol-model error types.

use thiserror::Error;

/// Protocol-model error type.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OvsdbError {
    #[error("invalid value for {context}: {reason}")]
    InvalidValue { context: String, reason: String },

    #[error("invalid schema: {0}")]
    SchemaInvalid(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("unknown column: {table}.{column}")]
    UnknownColumn { table: String, column: String },

    #[error("enum value out of range for column {column}: {value}")]
    EnumOutOfRange { column: String, value: String },

    #[error("arity violation for column {column}: {reason}")]
    ArityViolation { column: String, reason: String },

    #[error("record field for column {column} does not match schema: expected {expected}, field is {field}")]
    MapperFieldType {
        column: String,
        expected: String,
        field: String,
    },

    #[error("cannot assign value to column {column}: {reason}")]
    MapperAssign { column: String, reason: String },

    #[error("field selector does not resolve to a mapped column")]
    MapperFieldUnknown,

    #[error("operation on table {table} requires at least one condition")]
    NoCondition { table: String },

    #[error("constraint violation: {details}")]
    ConstraintViolation { details: String },

    #[error("operation {index} failed: {error}: {details}")]
    OperationError {
        index: usize,
        error: String,
        details: String,
    },

    #[error("transaction aborted at operation {index}: {error}")]
    TransactionAborted { index: usize, error: String },
}

impl OvsdbError {
    /// Rebind a value-level error to the column it was encountered on.
    pub(crate) fn for_column(self, column: &str) -> Self {
        match self {
            Self::InvalidValue { reason, .. } => Self::InvalidValue {
                context: format!("column {column}"),
                reason,
            },
            Self::EnumOutOfRange { value, .. } => Self::EnumOutOfRange {
                column: column.to_string(),
                value,
            },
            Self::ArityViolation { reason, .. } => Self::ArityViolation {
                column: column.to_string(),
                reason,
            },
            other => other,
        }
    }
}

/// Protocol-model result type.
pub type Result<T> = std::result::Result<T, OvsdbError>;
