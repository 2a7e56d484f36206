//! OVSDB protocol model: atoms, values, schemas, records, and transactions.
//!
//! This crate is the pure half of the client: everything here encodes to and
//! decodes from `serde_json` values without touching a socket. The network
//! half lives in `ovsdb-client`.

pub mod atom;
pub mod condition;
pub mod error;
pub mod mapper;
pub mod mutation;
pub mod native;
pub mod operation;
pub mod record;
pub mod schema;
pub mod transact;
pub mod value;

pub use atom::{Atom, AtomKind, is_named_uuid_token};
pub use condition::{Condition, ConditionFunction};
pub use error::{OvsdbError, Result};
pub use mapper::Info;
pub use mutation::{Mutation, Mutator};
pub use native::{NativeKind, NativeValue, equal, is_default, native_to_ovs, ovs_to_native, validate};
pub use operation::{Operation, OperationOutcome, WaitUntil};
pub use record::{FieldBinding, FieldToken, FromAtom, FromNative, IntoNative, Record, assign};
pub use schema::{Arity, BaseType, ColumnSchema, ColumnType, DatabaseSchema, RefType, TableSchema};
pub use transact::{TRANSACT_METHOD, TransactReply, Transaction};
pub use value::{Row, Value};
