//! Connection coordination: handshake, monitors, keepalive, and reconnect.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use serde_json::{Value as Json, json};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use ovsdb::{DatabaseSchema, OvsdbError, TRANSACT_METHOD, TransactReply, Transaction};

use crate::cache::{DEFAULT_EVENT_CAPACITY, EventStream, MonitorCache};
use crate::error::{ClientError, Result};
use crate::lock::{LockHandle, LockRegistry, LockState};
use crate::monitor::{
    MonitorRequest, decode_table_updates1, decode_table_updates2, monitor_cond_params,
    monitor_cond_since_params, split_cond_since_reply, split_update2_params, split_update3_params,
};
use crate::rpc::{BoxedReader, BoxedWriter, Handlers, RpcConfig, RpcEndpoint, WireLog};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_ECHO_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_MISSED_ECHOES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(200);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub database: String,
    pub connect_timeout: Duration,
    /// Keepalive period. Zero disables echoes.
    pub echo_interval: Duration,
    pub max_missed_echoes: u32,
    pub reconnect_base_backoff: Duration,
    pub reconnect_max_backoff: Duration,
    pub event_capacity: usize,
    pub outbound_capacity: usize,
    pub wire_log: Option<WireLog>,
}

impl ClientConfig {
    #[must_use]
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            echo_interval: DEFAULT_ECHO_INTERVAL,
            max_missed_echoes: DEFAULT_MAX_MISSED_ECHOES,
            reconnect_base_backoff: DEFAULT_BACKOFF_BASE,
            reconnect_max_backoff: DEFAULT_BACKOFF_MAX,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            outbound_capacity: 0,
            wire_log: None,
        }
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Negotiating,
    SchemaFetch,
    Monitoring,
    Ready,
}

/// An OVSDB client for one database.
pub struct OvsdbClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    state: StdMutex<ConnectionState>,
    state_notify: Notify,
    endpoint: StdMutex<Option<Arc<RpcEndpoint>>>,
    schema: StdMutex<Option<Arc<DatabaseSchema>>>,
    cache: StdMutex<Option<Arc<MonitorCache>>>,
    monitors: StdMutex<BTreeMap<String, MonitorRequest>>,
    locks: LockRegistry,
    remote: StdMutex<Option<String>>,
    keepalive: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    reconnector: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    auto_reconnect: AtomicBool,
    /// Bumped on every attach; close handlers from older connections
    /// no-op against it.
    epoch: AtomicU64,
}

impl OvsdbClient {
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                state: StdMutex::new(ConnectionState::Disconnected),
                state_notify: Notify::new(),
                endpoint: StdMutex::new(None),
                schema: StdMutex::new(None),
                cache: StdMutex::new(None),
                monitors: StdMutex::new(BTreeMap::new()),
                locks: LockRegistry::new(),
                remote: StdMutex::new(None),
                keepalive: StdMutex::new(None),
                reconnector: StdMutex::new(None),
                auto_reconnect: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.connection_state()
    }

    /// Parsed schema of the connected database.
    #[must_use]
    pub fn schema(&self) -> Option<Arc<DatabaseSchema>> {
        self.inner.schema.lock().ok().and_then(|s| s.clone())
    }

    /// The monitor cache, once a monitor is registered.
    #[must_use]
    pub fn cache(&self) -> Option<Arc<MonitorCache>> {
        self.inner.cache.lock().ok().and_then(|c| c.clone())
    }

    /// Connect over TCP; the connection is redialed with backoff on
    /// failure.
    pub async fn connect_tcp(&self, remote: &str) -> Result<()> {
        if let Ok(mut stored) = self.inner.remote.lock() {
            *stored = Some(remote.to_string());
        }
        self.inner.auto_reconnect.store(true, Ordering::Release);
        let stream = tokio::time::timeout(
            self.inner.config.connect_timeout,
            TcpStream::connect(remote),
        )
        .await
        .map_err(|_| ClientError::Timeout(format!("connecting to {remote}")))?
        .map_err(|err| ClientError::Transport(err.to_string()))?;
        let (reader, writer) = stream.into_split();
        ClientInner::attach(&self.inner, Box::new(reader), Box::new(writer)).await
    }

    /// Connect over an externally established stream pair. No automatic
    /// redial: the caller owns reconnection (see [`Self::reconnect_with_io`]).
    pub async fn connect_with_io(&self, reader: BoxedReader, writer: BoxedWriter) -> Result<()> {
        ClientInner::attach(&self.inner, reader, writer).await
    }

    /// Re-attach after a transport failure, resuming monitors with
    /// `monitor_cond_since` from the last applied transaction id.
    pub async fn reconnect_with_io(&self, reader: BoxedReader, writer: BoxedWriter) -> Result<()> {
        ClientInner::attach(&self.inner, reader, writer).await
    }

    /// Wait until the coordinator reaches `Ready`.
    pub async fn await_ready(&self, deadline: Duration) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let ready = async move {
            loop {
                let notified = inner.state_notify.notified();
                if inner.connection_state() == ConnectionState::Ready {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(deadline, ready)
            .await
            .map_err(|_| ClientError::Timeout("waiting for ready".to_string()))
    }

    /// Drop the connection and stop redialing. The cache stays queryable
    /// but stale; subscriber streams end.
    pub async fn disconnect(&self) {
        self.inner.auto_reconnect.store(false, Ordering::Release);
        if let Ok(mut reconnector) = self.inner.reconnector.lock() {
            if let Some(task) = reconnector.take() {
                task.abort();
            }
        }
        let epoch = self.inner.epoch.load(Ordering::Acquire);
        ClientInner::handle_disconnect(
            &self.inner,
            epoch,
            &ClientError::Transport("disconnected by caller".to_string()),
        );
        if let Some(cache) = self.cache() {
            cache.close();
        }
    }

    /// Databases served by the peer.
    pub async fn list_dbs(&self) -> Result<Vec<String>> {
        let reply = self.inner.request("list_dbs", json!([])).await?;
        let Json::Array(names) = reply else {
            return Err(ClientError::ProtocolFraming(format!(
                "list_dbs reply is not an array: {reply}"
            )));
        };
        Ok(names
            .iter()
            .filter_map(Json::as_str)
            .map(str::to_string)
            .collect())
    }

    /// One echo round-trip.
    pub async fn echo(&self) -> Result<()> {
        let params = json!(["ping"]);
        let reply = self.inner.request("echo", params.clone()).await?;
        if reply == params {
            Ok(())
        } else {
            Err(ClientError::ProtocolFraming(format!(
                "echo reply {reply} does not match request"
            )))
        }
    }

    /// Register monitors and seed the cache. Tables monitored on a live
    /// connection start streaming immediately; otherwise they are picked up
    /// at the next connect.
    pub async fn monitor(
        &self,
        requests: BTreeMap<String, MonitorRequest>,
    ) -> Result<Arc<MonitorCache>> {
        if let Ok(mut monitors) = self.inner.monitors.lock() {
            monitors.extend(requests);
        }
        if self.inner.connection_state() == ConnectionState::Ready {
            self.inner.start_monitor(false).await?;
        }
        self.cache().ok_or(ClientError::NotConnected)
    }

    /// Cancel the running monitor. The cache keeps its last contents but
    /// goes stale.
    pub async fn cancel_monitor(&self) -> Result<()> {
        let id = self.inner.monitor_id();
        self.inner.request("monitor_cancel", json!([id])).await?;
        if let Ok(mut monitors) = self.inner.monitors.lock() {
            monitors.clear();
        }
        if let Some(cache) = self.cache() {
            cache.mark_stale();
        }
        Ok(())
    }

    /// Subscribe to cache events.
    pub fn events(&self) -> Result<EventStream> {
        let cache = self.cache().ok_or(ClientError::NotConnected)?;
        Ok(cache.subscribe(self.inner.config.event_capacity))
    }

    /// Submit a transaction plan and decode its reply. The reply completes
    /// only after monitor updates received before it have been applied.
    pub async fn transact(&self, txn: &Transaction) -> Result<TransactReply> {
        let reply = self.inner.request(TRANSACT_METHOD, txn.params()).await?;
        txn.decode_reply(&reply).map_err(ClientError::from)
    }

    /// Request a named lock. The returned handle goes `Held` now or when
    /// the server grants the lock later.
    pub async fn lock(&self, name: &str) -> Result<LockHandle> {
        let handle = self.inner.locks.handle(name);
        let reply = self.inner.request("lock", json!([name])).await?;
        let granted = reply.get("locked").and_then(Json::as_bool).unwrap_or(false);
        self.inner.locks.set_state(
            name,
            if granted {
                LockState::Held
            } else {
                LockState::Waiting
            },
        );
        Ok(handle)
    }

    /// Take a named lock away from its current owner.
    pub async fn steal(&self, name: &str) -> Result<LockHandle> {
        let handle = self.inner.locks.handle(name);
        let reply = self.inner.request("steal", json!([name])).await?;
        let granted = reply.get("locked").and_then(Json::as_bool).unwrap_or(false);
        self.inner.locks.set_state(
            name,
            if granted {
                LockState::Held
            } else {
                LockState::Waiting
            },
        );
        Ok(handle)
    }

    /// Release a named lock.
    pub async fn unlock(&self, name: &str) -> Result<()> {
        self.inner.request("unlock", json!([name])).await?;
        self.inner.locks.set_state(name, LockState::Released);
        Ok(())
    }
}

impl ClientInner {
    fn connection_state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
        self.state_notify.notify_waiters();
    }

    fn current_endpoint(&self) -> Result<Arc<RpcEndpoint>> {
        self.endpoint
            .lock()
            .ok()
            .and_then(|endpoint| endpoint.clone())
            .ok_or(ClientError::NotConnected)
    }

    async fn request(&self, method: &str, params: Json) -> Result<Json> {
        self.current_endpoint()?.request(method, params).await
    }

    fn monitor_id(&self) -> Json {
        Json::String(self.config.database.clone())
    }

    /// Full handshake: negotiate, fetch the schema, resume monitors.
    async fn attach(inner: &Arc<Self>, reader: BoxedReader, writer: BoxedWriter) -> Result<()> {
        let epoch = inner.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        inner.set_state(ConnectionState::Connecting);

        let mut handlers = Handlers::new();
        handlers.on_request("echo", |params| params);

        let weak = Arc::downgrade(inner);
        handlers.on_notification("update", notification_handler(weak.clone(), |inner, params| {
            let (_, body) = split_update2_params(&params)?;
            let updates = decode_table_updates1(body)?;
            inner.with_cache(|cache| cache.apply_updates(updates, None).map(|_| ()))
        }));
        handlers.on_notification("update2", notification_handler(weak.clone(), |inner, params| {
            let (_, body) = split_update2_params(&params)?;
            let updates = decode_table_updates2(body)?;
            inner.with_cache(|cache| cache.apply_updates(updates, None).map(|_| ()))
        }));
        handlers.on_notification("update3", notification_handler(weak.clone(), |inner, params| {
            let (_, txn, body) = split_update3_params(&params)?;
            let updates = decode_table_updates2(body)?;
            let txn = txn.to_string();
            inner.with_cache(|cache| cache.apply_updates(updates, Some(txn)).map(|_| ()))
        }));
        handlers.on_notification("locked", lock_handler(weak.clone(), LockState::Held));
        handlers.on_notification("stolen", lock_handler(weak.clone(), LockState::Stolen));

        let closed = weak.clone();
        handlers.on_closed(move |error| {
            if let Some(inner) = closed.upgrade() {
                Self::handle_disconnect(&inner, epoch, &error);
            }
        });

        let endpoint = RpcEndpoint::new(
            reader,
            writer,
            handlers,
            RpcConfig {
                outbound_capacity: inner.config.outbound_capacity,
                wire_log: inner.config.wire_log.clone(),
            },
        );
        if let Ok(mut stored) = inner.endpoint.lock() {
            *stored = Some(Arc::clone(&endpoint));
        }

        match Self::handshake(inner, &endpoint).await {
            Ok(()) => {
                inner.start_keepalive();
                inner.set_state(ConnectionState::Ready);
                Ok(())
            }
            Err(err) => {
                Self::handle_disconnect(inner, epoch, &err);
                Err(err)
            }
        }
    }

    async fn handshake(inner: &Arc<Self>, endpoint: &Arc<RpcEndpoint>) -> Result<()> {
        inner.set_state(ConnectionState::Negotiating);
        let reply = endpoint.request("list_dbs", json!([])).await?;
        let served = reply
            .as_array()
            .map(|names| {
                names
                    .iter()
                    .filter_map(Json::as_str)
                    .any(|name| name == inner.config.database)
            })
            .unwrap_or(false);
        if !served {
            return Err(ClientError::Ovsdb(OvsdbError::SchemaMismatch(format!(
                "peer does not serve database {}",
                inner.config.database
            ))));
        }

        inner.set_state(ConnectionState::SchemaFetch);
        let reply = endpoint
            .request("get_schema", json!([inner.config.database]))
            .await?;
        let schema = Arc::new(DatabaseSchema::parse(&reply).map_err(ClientError::from)?);
        if let Ok(previous) = inner.schema.lock() {
            if let Some(previous) = previous.as_ref() {
                if previous.version != schema.version {
                    return Err(ClientError::Ovsdb(OvsdbError::SchemaMismatch(format!(
                        "database {} moved from version {} to {}",
                        inner.config.database, previous.version, schema.version
                    ))));
                }
            }
        }
        if let Ok(mut stored) = inner.schema.lock() {
            *stored = Some(Arc::clone(&schema));
        }

        inner.set_state(ConnectionState::Monitoring);
        let resume = inner
            .cache
            .lock()
            .map(|cache| cache.is_some())
            .unwrap_or(false);
        let has_monitors = inner
            .monitors
            .lock()
            .map(|monitors| !monitors.is_empty())
            .unwrap_or(false);
        if has_monitors {
            inner.start_monitor(resume).await?;
        }
        Ok(())
    }

    fn with_cache(
        &self,
        apply: impl FnOnce(&MonitorCache) -> Result<()>,
    ) -> Result<()> {
        let cache = self.cache.lock().ok().and_then(|cache| cache.clone());
        match cache {
            Some(cache) => apply(&cache),
            None => {
                tracing::debug!("monitor update before any monitor was registered");
                Ok(())
            }
        }
    }

    /// Issue the monitor request and seed (or resync) the cache.
    async fn start_monitor(self: &Arc<Self>, resume: bool) -> Result<()> {
        let endpoint = self.current_endpoint()?;
        let schema = self
            .schema
            .lock()
            .ok()
            .and_then(|schema| schema.clone())
            .ok_or(ClientError::NotConnected)?;
        let cache = {
            let mut stored = self
                .cache
                .lock()
                .map_err(|_| ClientError::Transport("cache lock poisoned".to_string()))?;
            match stored.as_ref() {
                Some(cache) => Arc::clone(cache),
                None => {
                    let cache = Arc::new(MonitorCache::new(Arc::clone(&schema)));
                    *stored = Some(Arc::clone(&cache));
                    cache
                }
            }
        };
        let requests = self
            .monitors
            .lock()
            .map(|monitors| monitors.clone())
            .unwrap_or_default();
        let id = self.monitor_id();

        if resume {
            let last = cache.last_txn_id();
            let params =
                monitor_cond_since_params(&self.config.database, &id, &requests, last.as_deref());
            let reply = endpoint.request("monitor_cond_since", params).await?;
            let (found, txn, body) = split_cond_since_reply(&reply)?;
            let updates = decode_table_updates2(body)?;
            cache.resync(updates, !found, Some(txn.to_string()))?;
        } else {
            let params = monitor_cond_params(&self.config.database, &id, &requests);
            let reply = endpoint.request("monitor_cond", params).await?;
            let updates = decode_table_updates2(&reply)?;
            cache.apply_updates(updates, None)?;
        }
        Ok(())
    }

    fn start_keepalive(self: &Arc<Self>) {
        let interval = self.config.echo_interval;
        if interval.is_zero() {
            return;
        }
        let max_missed = self.config.max_missed_echoes.max(1);
        let weak = Arc::downgrade(self);
        let epoch = self.epoch.load(Ordering::Acquire);
        let task = tokio::spawn(async move {
            let mut missed = 0u32;
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else { return };
                let Ok(endpoint) = inner.current_endpoint() else { return };
                match endpoint.request_deadline("echo", json!([]), interval).await {
                    Ok(_) => missed = 0,
                    Err(err) => {
                        missed += 1;
                        tracing::warn!(error = %err, missed, "echo keepalive missed");
                        if missed >= max_missed {
                            Self::handle_disconnect(
                                &inner,
                                epoch,
                                &ClientError::Timeout(format!("{missed} echo replies missed")),
                            );
                            return;
                        }
                    }
                }
            }
        });
        if let Ok(mut keepalive) = self.keepalive.lock() {
            if let Some(previous) = keepalive.replace(task) {
                previous.abort();
            }
        }
    }

    /// Transition to `Disconnected`: fail-fast bookkeeping plus, when the
    /// connection is managed, the backoff redial loop.
    fn handle_disconnect(inner: &Arc<Self>, epoch: u64, error: &ClientError) {
        if inner.epoch.load(Ordering::Acquire) != epoch {
            return;
        }
        {
            let Ok(mut state) = inner.state.lock() else { return };
            if *state == ConnectionState::Disconnected {
                return;
            }
            *state = ConnectionState::Disconnected;
        }
        inner.state_notify.notify_waiters();
        tracing::warn!(error = %error, "connection lost");

        if let Ok(mut endpoint) = inner.endpoint.lock() {
            endpoint.take();
        }
        if let Ok(mut keepalive) = inner.keepalive.lock() {
            if let Some(task) = keepalive.take() {
                task.abort();
            }
        }
        inner.locks.reset();
        if let Ok(cache) = inner.cache.lock() {
            if let Some(cache) = cache.as_ref() {
                cache.mark_stale();
            }
        }

        if inner.auto_reconnect.load(Ordering::Acquire) {
            let redial = Arc::clone(inner);
            let task = tokio::spawn(async move { Self::reconnect_loop(redial).await });
            if let Ok(mut reconnector) = inner.reconnector.lock() {
                if let Some(previous) = reconnector.replace(task) {
                    previous.abort();
                }
            }
        }
    }

    /// Exponential backoff with jitter, capped.
    async fn reconnect_loop(inner: Arc<Self>) {
        let base = inner.config.reconnect_base_backoff;
        let cap = inner.config.reconnect_max_backoff;
        let mut backoff = base;
        loop {
            if !inner.auto_reconnect.load(Ordering::Acquire) {
                return;
            }
            tokio::time::sleep(backoff + jitter(backoff)).await;
            let remote = inner.remote.lock().ok().and_then(|remote| remote.clone());
            let Some(remote) = remote else { return };

            let attempt = tokio::time::timeout(
                inner.config.connect_timeout,
                TcpStream::connect(&remote),
            )
            .await;
            match attempt {
                Ok(Ok(stream)) => {
                    let (reader, writer) = stream.into_split();
                    match Self::attach(&inner, Box::new(reader), Box::new(writer)).await {
                        Ok(()) => return,
                        Err(err) => {
                            tracing::warn!(error = %err, remote = %remote, "reconnect handshake failed");
                        }
                    }
                }
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, remote = %remote, "reconnect failed");
                }
                Err(_) => {
                    tracing::warn!(remote = %remote, "reconnect timed out");
                }
            }
            backoff = (backoff * 2).min(cap);
        }
    }
}

fn notification_handler(
    weak: Weak<ClientInner>,
    handle: impl Fn(&ClientInner, Json) -> Result<()> + Send + Sync + 'static,
) -> impl Fn(Json) + Send + Sync + 'static {
    move |params| {
        let Some(inner) = weak.upgrade() else { return };
        if let Err(err) = handle(&inner, params) {
            tracing::warn!(error = %err, "monitor notification rejected");
        }
    }
}

fn lock_handler(
    weak: Weak<ClientInner>,
    state: LockState,
) -> impl Fn(Json) + Send + Sync + 'static {
    move |params| {
        let Some(inner) = weak.upgrade() else { return };
        let name = params
            .as_array()
            .and_then(|params| params.first())
            .and_then(Json::as_str);
        match name {
            Some(name) => inner.locks.set_state(name, state),
            None => tracing::warn!(params = %params, "malformed lock notification"),
        }
    }
}

/// Up to a quarter of the backoff, spread by the clock's subsecond nanos.
fn jitter(backoff: Duration) -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|since| since.subsec_nanos())
        .unwrap_or(0);
    (backoff / 4).mul_f64(f64::from(nanos % 1024) / 1024.0)
}
