//! Client error types.

use thiserror::Error;
use uuid::Uuid;

use ovsdb::OvsdbError;

/// Client error type.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol framing error: {0}")]
    ProtocolFraming(String),

    #[error("not connected")]
    NotConnected,

    #[error("request canceled")]
    Canceled,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("lock contended: {0}")]
    LockContended(String),

    #[error("duplicate row {uuid} in table {table}")]
    DuplicateRow { table: String, uuid: Uuid },

    #[error("index violation on table {table} over {columns:?}")]
    IndexViolation { table: String, columns: Vec<String> },

    #[error("server error: {0}")]
    Rpc(String),

    #[error(transparent)]
    Ovsdb(#[from] OvsdbError),
}

/// Client result type.
pub type Result<T> = std::result::Result<T, ClientError>;
