//! OVSDB client: JSON-RPC endpoint, monitor cache, and connection
//! coordination over the `ovsdb` protocol model.

pub mod cache;
pub mod client;
pub mod error;
pub mod lock;
pub mod monitor;
pub mod rpc;

pub use cache::{
    CacheEvent, DEFAULT_EVENT_CAPACITY, EventStream, MonitorCache, RowChange, RowImage,
    TableEvents,
};
pub use client::{
    ClientConfig, ConnectionState, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_ECHO_INTERVAL, DEFAULT_MAX_MISSED_ECHOES, OvsdbClient,
};
pub use error::{ClientError, Result};
pub use lock::{LockHandle, LockRegistry, LockState};
pub use monitor::{MonitorRequest, MonitorSelect, RowUpdate, TableUpdates};
pub use rpc::{
    BoxedReader, BoxedWriter, DEFAULT_OUTBOUND_CAPACITY, Handlers, PendingCall, RpcConfig,
    RpcEndpoint, WireLog,
};
