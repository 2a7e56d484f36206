//! JSON-RPC 1.0 duplex endpoint.
//!
//! OVSDB frames are concatenated JSON values over a stream socket, so the
//! reader keeps a growable buffer and peels complete values off the front
//! with `serde_json`'s streaming deserializer. One reader task dispatches
//! inbound traffic; one writer task drains a bounded outbound queue.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde_json::{Value as Json, json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use crate::error::{ClientError, Result};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Default depth of the outbound frame queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Endpoint configuration.
#[derive(Debug, Clone, Default)]
pub struct RpcConfig {
    pub outbound_capacity: usize,
    pub wire_log: Option<WireLog>,
}

impl RpcConfig {
    #[must_use]
    pub fn outbound_capacity(&self) -> usize {
        if self.outbound_capacity == 0 {
            DEFAULT_OUTBOUND_CAPACITY
        } else {
            self.outbound_capacity
        }
    }
}

/// Append-only JSONL log of raw frames in both directions.
#[derive(Debug, Clone)]
pub struct WireLog {
    tx: mpsc::UnboundedSender<(&'static str, String)>,
}

impl WireLog {
    /// Log to a file, created on first entry.
    #[must_use]
    pub fn to_path(path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(&'static str, String)>();
        tokio::spawn(async move {
            let mut file: Option<tokio::fs::File> = None;
            while let Some((direction, raw)) = rx.recv().await {
                if file.is_none() {
                    if let Some(parent) = path.parent() {
                        let _ = tokio::fs::create_dir_all(parent).await;
                    }
                    match tokio::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)
                        .await
                    {
                        Ok(opened) => file = Some(opened),
                        Err(err) => {
                            tracing::warn!(error = %err, path = %path.display(), "failed to open wire log");
                            continue;
                        }
                    }
                }
                let line = json!({"direction": direction, "raw": raw}).to_string();
                if let Some(file) = file.as_mut() {
                    let _ = file.write_all(line.as_bytes()).await;
                    let _ = file.write_all(b"\n").await;
                }
            }
        });
        Self { tx }
    }

    fn log(&self, direction: &'static str, raw: &str) {
        let _ = self.tx.send((direction, raw.to_string()));
    }
}

type NotificationHandler = Box<dyn Fn(Json) + Send + Sync>;
type RequestHandler = Box<dyn Fn(Json) -> Json + Send + Sync>;
type ClosedHandler = Box<dyn Fn(ClientError) + Send + Sync>;

/// Dispatch table for server-initiated traffic. Handlers run on the reader
/// task in arrival order; replies to transactions complete only after every
/// earlier notification has been handled.
#[derive(Default)]
pub struct Handlers {
    notifications: HashMap<String, NotificationHandler>,
    requests: HashMap<String, RequestHandler>,
    closed: Option<ClosedHandler>,
}

impl Handlers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle a method-named notification (`id` null).
    pub fn on_notification(
        &mut self,
        method: impl Into<String>,
        handler: impl Fn(Json) + Send + Sync + 'static,
    ) {
        self.notifications.insert(method.into(), Box::new(handler));
    }

    /// Answer a server-initiated request (`echo`); the returned value is
    /// sent back as the response result.
    pub fn on_request(
        &mut self,
        method: impl Into<String>,
        handler: impl Fn(Json) -> Json + Send + Sync + 'static,
    ) {
        self.requests.insert(method.into(), Box::new(handler));
    }

    /// Observe the connection closing; all in-flight waiters are failed
    /// with the same error before this runs.
    pub fn on_closed(&mut self, handler: impl Fn(ClientError) + Send + Sync + 'static) {
        self.closed = Some(Box::new(handler));
    }
}

type Pending = Arc<StdMutex<HashMap<i64, oneshot::Sender<Result<Json>>>>>;

/// A dispatched request awaiting its reply.
pub struct PendingCall {
    id: i64,
    rx: oneshot::Receiver<Result<Json>>,
}

impl PendingCall {
    /// Request id, usable with [`RpcEndpoint::cancel`].
    #[must_use]
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Await the reply.
    pub async fn wait(self) -> Result<Json> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Canceled),
        }
    }
}

/// One JSON-RPC connection.
pub struct RpcEndpoint {
    outbound: mpsc::Sender<Json>,
    pending: Pending,
    next_id: AtomicI64,
    reader_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    writer_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RpcEndpoint {
    /// Start the reader and writer tasks over a stream pair.
    #[must_use]
    pub fn new(
        reader: BoxedReader,
        writer: BoxedWriter,
        handlers: Handlers,
        config: RpcConfig,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel::<Json>(config.outbound_capacity());
        let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));

        let writer_task = tokio::spawn(write_loop(writer, outbound_rx, config.wire_log.clone()));
        let reader_task = tokio::spawn(read_loop(
            reader,
            handlers,
            Arc::clone(&pending),
            outbound_tx.clone(),
            config.wire_log,
        ));

        Arc::new(Self {
            outbound: outbound_tx,
            pending,
            next_id: AtomicI64::new(1),
            reader_task: StdMutex::new(Some(reader_task)),
            writer_task: StdMutex::new(Some(writer_task)),
        })
    }

    /// Dispatch a request without awaiting it.
    pub async fn call(&self, method: &str, params: Json) -> Result<PendingCall> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }
        let frame = json!({"method": method, "params": params, "id": id});
        if self.outbound.send(frame).await.is_err() {
            self.detach(id);
            return Err(ClientError::Transport("connection closed".to_string()));
        }
        Ok(PendingCall { id, rx })
    }

    /// Issue a request and await its reply.
    pub async fn request(&self, method: &str, params: Json) -> Result<Json> {
        self.call(method, params).await?.wait().await
    }

    /// Issue a request with a deadline on the waiter. The wire carries no
    /// cancellation; a late reply is discarded.
    pub async fn request_deadline(
        &self,
        method: &str,
        params: Json,
        deadline: Duration,
    ) -> Result<Json> {
        let call = self.call(method, params).await?;
        let id = call.id();
        match tokio::time::timeout(deadline, call.wait()).await {
            Ok(result) => result,
            Err(_) => {
                self.cancel(id);
                Err(ClientError::Timeout(format!(
                    "{method} took longer than {deadline:?}"
                )))
            }
        }
    }

    /// Detach the waiter for a request id. Guaranteed non-blocking; an
    /// already-dispatched request still executes server-side and its reply
    /// is discarded.
    pub fn cancel(&self, id: i64) {
        self.detach(id);
    }

    fn detach(&self, id: i64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }
}

impl Drop for RpcEndpoint {
    fn drop(&mut self) {
        if let Ok(mut task) = self.reader_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
        if let Ok(mut task) = self.writer_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

async fn write_loop(
    mut writer: BoxedWriter,
    mut outbound: mpsc::Receiver<Json>,
    wire_log: Option<WireLog>,
) {
    while let Some(frame) = outbound.recv().await {
        let payload = frame.to_string();
        if let Some(log) = &wire_log {
            log.log("out", &payload);
        }
        if let Err(err) = writer.write_all(payload.as_bytes()).await {
            tracing::warn!(error = %err, "write failed");
            break;
        }
        if let Err(err) = writer.flush().await {
            tracing::warn!(error = %err, "flush failed");
            break;
        }
    }
}

async fn read_loop(
    mut reader: BoxedReader,
    handlers: Handlers,
    pending: Pending,
    outbound: mpsc::Sender<Json>,
    wire_log: Option<WireLog>,
) {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 8192];
    let close_error = loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break ClientError::Transport("connection closed by peer".to_string()),
            Ok(n) => n,
            Err(err) => break ClientError::Transport(err.to_string()),
        };
        buffer.extend_from_slice(&chunk[..n]);

        loop {
            match next_frame(&mut buffer) {
                Ok(Some(frame)) => {
                    if let Some(log) = &wire_log {
                        log.log("in", &frame.to_string());
                    }
                    dispatch(&frame, &handlers, &pending, &outbound).await;
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "inbound framing failed");
                    fail_pending(&pending, err.clone());
                    if let Some(closed) = &handlers.closed {
                        closed(err);
                    }
                    return;
                }
            }
        }
    };

    fail_pending(&pending, close_error.clone());
    if let Some(closed) = &handlers.closed {
        closed(close_error);
    }
}

/// Peel one complete JSON value off the front of the buffer.
fn next_frame(buffer: &mut Vec<u8>) -> Result<Option<Json>> {
    let start = match buffer.iter().position(|b| !b.is_ascii_whitespace()) {
        Some(start) => start,
        None => {
            buffer.clear();
            return Ok(None);
        }
    };
    let mut frames = serde_json::Deserializer::from_slice(&buffer[start..]).into_iter::<Json>();
    match frames.next() {
        Some(Ok(frame)) => {
            let consumed = start + frames.byte_offset();
            buffer.drain(..consumed);
            Ok(Some(frame))
        }
        Some(Err(err)) if err.is_eof() => Ok(None),
        Some(Err(err)) => Err(ClientError::ProtocolFraming(err.to_string())),
        None => Ok(None),
    }
}

async fn dispatch(frame: &Json, handlers: &Handlers, pending: &Pending, outbound: &mpsc::Sender<Json>) {
    if let Some(method) = frame.get("method").and_then(Json::as_str) {
        let params = frame.get("params").cloned().unwrap_or(Json::Null);
        match frame.get("id") {
            None | Some(Json::Null) => match handlers.notifications.get(method) {
                Some(handler) => handler(params),
                None => tracing::debug!(method, "unhandled notification"),
            },
            Some(id) => match handlers.requests.get(method) {
                Some(handler) => {
                    let result = handler(params);
                    let response = json!({"id": id, "result": result, "error": null});
                    if outbound.send(response).await.is_err() {
                        tracing::warn!(method, "failed to queue response");
                    }
                }
                None => {
                    let response = json!({
                        "id": id,
                        "result": null,
                        "error": format!("unknown method: {method}"),
                    });
                    let _ = outbound.send(response).await;
                }
            },
        }
        return;
    }

    let Some(id) = frame.get("id").and_then(Json::as_i64) else {
        tracing::warn!(frame = %frame, "frame has neither method nor integer id");
        return;
    };
    let result = match frame.get("error") {
        Some(error) if !error.is_null() => Err(ClientError::Rpc(error.to_string())),
        _ => Ok(frame.get("result").cloned().unwrap_or(Json::Null)),
    };
    let waiter = match pending.lock() {
        Ok(mut pending) => pending.remove(&id),
        Err(_) => None,
    };
    match waiter {
        Some(tx) => {
            let _ = tx.send(result);
        }
        None => tracing::debug!(id, "reply without waiter (canceled?)"),
    }
}

fn fail_pending(pending: &Pending, error: ClientError) {
    if let Ok(mut pending) = pending.lock() {
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(error.clone()));
        }
    }
}
