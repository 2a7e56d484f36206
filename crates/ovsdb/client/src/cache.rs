//! The monitor cache: a per-database materialized view reconciled from
//! monitor updates.
//!
//! The reconciler is the unique writer; queriers and subscribers only read.
//! A whole update batch is applied inside one write-lock section, so readers
//! see either the pre-state or the post-state of a batch, never a mid-batch
//! interleaving. Subscribers receive events over per-listener bounded
//! queues; a full queue drops the oldest event and surfaces the loss as a
//! `Lagged` marker, so a slow listener never blocks the reconciler.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};

use serde_json::{Map as JsonMap, Value as Json};
use tokio::sync::Notify;
use uuid::Uuid;

use ovsdb::{
    Atom, DatabaseSchema, Info, NativeKind, NativeValue, Record, Row, TableSchema, Value,
};

use crate::error::{ClientError, Result};
use crate::monitor::{RowUpdate, TableUpdates};

/// Default depth of a subscriber's event queue.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A row with its UUID.
#[derive(Debug, Clone, PartialEq)]
pub struct RowImage {
    pub uuid: Uuid,
    pub row: Row,
}

/// A modified row with pre- and post-images.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub uuid: Uuid,
    pub pre: Row,
    pub post: Row,
}

/// Per-table slice of one event batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableEvents {
    pub table: String,
    pub added: Vec<RowImage>,
    pub modified: Vec<RowChange>,
    pub removed: Vec<RowImage>,
}

impl TableEvents {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Self::default()
        }
    }

    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

/// Event delivered to cache subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    /// One applied update batch, in table order.
    Batch(Vec<TableEvents>),
    /// The cache was rebuilt after a reconnect; the diff is relative to the
    /// pre-reconnect view.
    Resync(Vec<TableEvents>),
    /// Events were dropped because this listener fell behind.
    Lagged(u64),
}

struct ListenerShared {
    queue: StdMutex<VecDeque<CacheEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
    closed: AtomicBool,
}

impl ListenerShared {
    fn push(&self, event: CacheEvent) {
        if let Ok(mut queue) = self.queue.lock() {
            if queue.len() >= self.capacity {
                queue.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::AcqRel) + 1;
                tracing::warn!(dropped, "cache subscriber lagging, dropping oldest event");
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// A subscriber's end of the event queue.
pub struct EventStream {
    shared: Arc<ListenerShared>,
}

impl EventStream {
    /// Next event, or `None` once the cache shut down and the queue
    /// drained. A `Lagged` marker precedes events that follow a drop.
    pub async fn recv(&mut self) -> Option<CacheEvent> {
        loop {
            let dropped = self.shared.dropped.swap(0, Ordering::AcqRel);
            if dropped > 0 {
                return Some(CacheEvent::Lagged(dropped));
            }
            if let Ok(mut queue) = self.shared.queue.lock() {
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            self.shared.notify.notified().await;
        }
    }
}

type RefEdge = (String, Uuid, String);

#[derive(Debug, Clone, Default)]
struct TableState {
    rows: BTreeMap<Uuid, Row>,
    /// One key map per schema index group, in declared order.
    indexes: Vec<BTreeMap<Vec<Value>, Uuid>>,
}

#[derive(Debug, Clone, Default)]
struct CacheState {
    tables: BTreeMap<String, TableState>,
    /// Reverse adjacency: target row UUID to the (table, row, column)
    /// triples referencing it.
    refs: BTreeMap<Uuid, BTreeSet<RefEdge>>,
    last_txn_id: Option<String>,
}

/// The materialized view of one monitored database.
pub struct MonitorCache {
    schema: Arc<DatabaseSchema>,
    state: StdRwLock<CacheState>,
    listeners: StdMutex<Vec<Weak<ListenerShared>>>,
    stale: AtomicBool,
}

impl MonitorCache {
    #[must_use]
    pub fn new(schema: Arc<DatabaseSchema>) -> Self {
        Self {
            schema,
            state: StdRwLock::new(CacheState::default()),
            listeners: StdMutex::new(Vec::new()),
            stale: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn schema(&self) -> &DatabaseSchema {
        &self.schema
    }

    /// Transaction id of the last applied batch, for `monitor_cond_since`.
    #[must_use]
    pub fn last_txn_id(&self) -> Option<String> {
        self.state
            .read()
            .ok()
            .and_then(|state| state.last_txn_id.clone())
    }

    /// Whether the connection feeding this cache is down. A stale cache
    /// stays queryable.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    /// Register a subscriber with a bounded event queue.
    #[must_use]
    pub fn subscribe(&self, capacity: usize) -> EventStream {
        let shared = Arc::new(ListenerShared {
            queue: StdMutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(Arc::downgrade(&shared));
        }
        EventStream { shared }
    }

    /// Close every subscriber stream.
    pub fn close(&self) {
        if let Ok(listeners) = self.listeners.lock() {
            for listener in listeners.iter().filter_map(Weak::upgrade) {
                listener.close();
            }
        }
    }

    /// Row by UUID.
    #[must_use]
    pub fn get(&self, table: &str, uuid: Uuid) -> Option<Row> {
        let state = self.state.read().ok()?;
        state.tables.get(table)?.rows.get(&uuid).cloned()
    }

    /// Row count of a table.
    #[must_use]
    pub fn len(&self, table: &str) -> usize {
        self.state
            .read()
            .ok()
            .and_then(|state| state.tables.get(table).map(|t| t.rows.len()))
            .unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    /// Row by index key. `columns` must name a declared index group (or
    /// `["_uuid"]`); `key` carries the values in group order.
    pub fn find_by_index(
        &self,
        table: &str,
        columns: &[&str],
        key: &[Value],
    ) -> Result<Option<(Uuid, Row)>> {
        if columns == ["_uuid"] {
            let Some(Value::Atom(Atom::Uuid(uuid))) = key.first() else {
                return Ok(None);
            };
            return Ok(self.get(table, *uuid).map(|row| (*uuid, row)));
        }
        let table_schema = self.schema.table(table).map_err(ClientError::from)?;
        let group = table_schema
            .indexes
            .iter()
            .position(|group| group.iter().map(String::as_str).eq(columns.iter().copied()))
            .ok_or_else(|| {
                ClientError::Ovsdb(ovsdb::OvsdbError::SchemaInvalid(format!(
                    "table {table} declares no index over {columns:?}"
                )))
            })?;
        let state = self
            .state
            .read()
            .map_err(|_| ClientError::Transport("cache lock poisoned".to_string()))?;
        let Some(table_state) = state.tables.get(table) else {
            return Ok(None);
        };
        let Some(index) = table_state.indexes.get(group) else {
            return Ok(None);
        };
        Ok(index.get(key).and_then(|uuid| {
            table_state.rows.get(uuid).map(|row| (*uuid, row.clone()))
        }))
    }

    /// Scan a table, cloning the rows the filter keeps.
    #[must_use]
    pub fn scan(&self, table: &str, filter: impl Fn(&Uuid, &Row) -> bool) -> Vec<(Uuid, Row)> {
        let Ok(state) = self.state.read() else {
            return Vec::new();
        };
        let Some(table_state) = state.tables.get(table) else {
            return Vec::new();
        };
        table_state
            .rows
            .iter()
            .filter(|(uuid, row)| filter(uuid, row))
            .map(|(uuid, row)| (*uuid, row.clone()))
            .collect()
    }

    /// Typed read: decode a cached row into a record, UUID included.
    pub fn get_record<R: Record>(&self, info: &Info<R>, uuid: Uuid) -> Result<Option<R>> {
        let Some(row) = self.get(&info.table().name, uuid) else {
            return Ok(None);
        };
        let mut record = info.to_record(&row).map_err(ClientError::from)?;
        if info.has_column("_uuid") {
            info.set_field(&mut record, "_uuid", NativeValue::Scalar(Atom::Uuid(uuid)))
                .map_err(ClientError::from)?;
        }
        Ok(Some(record))
    }

    /// Rows whose back-pointer set names `target`: the (table, row, column)
    /// triples currently referencing it.
    #[must_use]
    pub fn referers(&self, target: Uuid) -> Vec<(String, Uuid, String)> {
        let Ok(state) = self.state.read() else {
            return Vec::new();
        };
        state
            .refs
            .get(&target)
            .map(|edges| edges.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Apply one update batch atomically. Rows the reconciler rejects
    /// (duplicate UUIDs, index collisions, malformed deltas) are returned
    /// and logged; the rest of the batch still applies.
    pub fn apply_updates(
        &self,
        updates: TableUpdates,
        txn_id: Option<String>,
    ) -> Result<Vec<ClientError>> {
        let (events, rejected) = {
            let mut state = self
                .state
                .write()
                .map_err(|_| ClientError::Transport("cache lock poisoned".to_string()))?;
            let outcome = apply_to_state(&self.schema, &mut state, updates);
            if let Some(txn_id) = txn_id {
                state.last_txn_id = Some(txn_id);
            }
            outcome
        };
        for error in &rejected {
            tracing::warn!(error = %error, "monitor update rejected");
        }
        if !events.is_empty() {
            self.deliver(CacheEvent::Batch(events));
        }
        Ok(rejected)
    }

    /// Rebuild from a reconnect resync: apply `updates` to a shadow copy
    /// (or to an empty shadow when the server re-seeded from scratch), swap
    /// it in atomically, and emit one `Resync` event with the diff.
    pub fn resync(
        &self,
        updates: TableUpdates,
        full: bool,
        txn_id: Option<String>,
    ) -> Result<Vec<ClientError>> {
        let old = self
            .state
            .read()
            .map_err(|_| ClientError::Transport("cache lock poisoned".to_string()))?
            .clone();
        let mut shadow = if full { CacheState::default() } else { old.clone() };
        let (_, rejected) = apply_to_state(&self.schema, &mut shadow, updates);
        if txn_id.is_some() {
            shadow.last_txn_id = txn_id;
        }

        let diff = diff_states(&old, &shadow);
        {
            let mut state = self
                .state
                .write()
                .map_err(|_| ClientError::Transport("cache lock poisoned".to_string()))?;
            *state = shadow;
        }
        self.stale.store(false, Ordering::Release);
        for error in &rejected {
            tracing::warn!(error = %error, "resync update rejected");
        }
        self.deliver(CacheEvent::Resync(diff));
        Ok(rejected)
    }

    fn deliver(&self, event: CacheEvent) {
        let Ok(mut listeners) = self.listeners.lock() else {
            return;
        };
        listeners.retain(|weak| match weak.upgrade() {
            Some(listener) => {
                listener.push(event.clone());
                true
            }
            None => false,
        });
    }
}

/// Apply a batch to a state, collecting events and per-row rejections.
fn apply_to_state(
    schema: &DatabaseSchema,
    state: &mut CacheState,
    updates: TableUpdates,
) -> (Vec<TableEvents>, Vec<ClientError>) {
    let mut events = Vec::new();
    let mut rejected = Vec::new();

    for (table, rows) in updates.0 {
        let Ok(table_schema) = schema.table(&table) else {
            tracing::warn!(table = %table, "update for unmonitored table");
            continue;
        };
        let mut table_events = TableEvents::new(&table);

        for (uuid, update) in rows {
            let result = match update {
                RowUpdate::Initial(row) => {
                    // Initial rows replace whatever image the cache held.
                    let _ = apply_delete(table_schema, state, &table, uuid);
                    apply_insert(table_schema, state, &table, uuid, &row).map(|row| {
                        table_events.added.push(RowImage { uuid, row });
                    })
                }
                RowUpdate::Insert(row) => {
                    apply_insert(table_schema, state, &table, uuid, &row).map(|row| {
                        table_events.added.push(RowImage { uuid, row });
                    })
                }
                RowUpdate::Modify(delta) => apply_modify(table_schema, state, &table, uuid, &delta)
                    .map(|change| {
                        if let Some((pre, post)) = change {
                            table_events.modified.push(RowChange { uuid, pre, post });
                        }
                    }),
                RowUpdate::Replace(row) => apply_replace(table_schema, state, &table, uuid, &row)
                    .map(|change| {
                        if let Some((pre, post)) = change {
                            table_events.modified.push(RowChange { uuid, pre, post });
                        }
                    }),
                RowUpdate::Delete(_) => {
                    apply_delete(table_schema, state, &table, uuid).map(|removed| {
                        if let Some(row) = removed {
                            table_events.removed.push(RowImage { uuid, row });
                        }
                    })
                }
            };
            if let Err(error) = result {
                rejected.push(error);
            }
        }

        if !table_events.is_empty() {
            events.push(table_events);
        }
    }

    (events, rejected)
}

/// Canonicalize an incoming wire row against the schema, dropping the
/// implicit columns.
fn canonicalize(table: &TableSchema, row: &Row) -> Result<Row> {
    let mut canonical = Row::new();
    for (column, value) in row.iter() {
        if column == "_uuid" || column == "_version" {
            continue;
        }
        let schema = table.column(column).map_err(ClientError::from)?;
        let native = ovsdb::ovs_to_native(&schema.column_type, value).map_err(ClientError::from)?;
        let wire =
            ovsdb::native_to_ovs(&schema.column_type, &native).map_err(ClientError::from)?;
        canonical.insert(column.clone(), wire);
    }
    Ok(canonical)
}

/// Canonical wire form of a column's default value.
fn default_wire(column_type: &ovsdb::ColumnType) -> Value {
    match NativeKind::of_column(column_type) {
        NativeKind::Scalar(kind) => Value::Atom(Atom::zero(kind)),
        NativeKind::Optional(_) | NativeKind::Set(_) => Value::empty_set(),
        NativeKind::Map(_, _) => Value::Map(BTreeMap::new()),
    }
}

fn index_key(table: &TableSchema, group: &[String], row: &Row) -> Vec<Value> {
    group
        .iter()
        .map(|column| match row.get(column) {
            Some(value) => value.clone(),
            None => table
                .column(column)
                .map(|schema| default_wire(&schema.column_type))
                .unwrap_or_else(|_| Value::empty_set()),
        })
        .collect()
}

fn forward_refs(row: &Row) -> Vec<(String, Vec<Uuid>)> {
    row.iter()
        .map(|(column, value)| (column.clone(), value.referenced_uuids()))
        .filter(|(_, uuids)| !uuids.is_empty())
        .collect()
}

fn add_ref_edges(state: &mut CacheState, table: &str, holder: Uuid, row: &Row) {
    for (column, targets) in forward_refs(row) {
        for target in targets {
            state
                .refs
                .entry(target)
                .or_default()
                .insert((table.to_string(), holder, column.clone()));
        }
    }
}

fn remove_ref_edges(state: &mut CacheState, table: &str, holder: Uuid, row: &Row) {
    for (column, targets) in forward_refs(row) {
        for target in targets {
            if let Some(edges) = state.refs.get_mut(&target) {
                edges.remove(&(table.to_string(), holder, column.clone()));
                if edges.is_empty() {
                    state.refs.remove(&target);
                }
            }
        }
    }
}

fn apply_insert(
    table: &TableSchema,
    state: &mut CacheState,
    table_name: &str,
    uuid: Uuid,
    row: &Row,
) -> Result<Row> {
    let row = canonicalize(table, row)?;
    let table_state = state.tables.entry(table_name.to_string()).or_default();
    table_state.indexes.resize_with(table.indexes.len(), BTreeMap::new);

    // A duplicate UUID is rejected and the first row retained.
    if table_state.rows.contains_key(&uuid) {
        return Err(ClientError::DuplicateRow {
            table: table_name.to_string(),
            uuid,
        });
    }
    let keys: Vec<Vec<Value>> = table
        .indexes
        .iter()
        .map(|group| index_key(table, group, &row))
        .collect();
    for (group, key) in keys.iter().enumerate() {
        if table_state.indexes[group].contains_key(key) {
            return Err(ClientError::DuplicateRow {
                table: table_name.to_string(),
                uuid,
            });
        }
    }

    for (group, key) in keys.into_iter().enumerate() {
        table_state.indexes[group].insert(key, uuid);
    }
    table_state.rows.insert(uuid, row.clone());
    add_ref_edges(state, table_name, uuid, &row);
    Ok(row)
}

/// Swap a changed row in, maintaining indexes and back-pointers. Returns
/// the pre/post pair, or `None` when nothing changed.
fn replace_row(
    table: &TableSchema,
    state: &mut CacheState,
    table_name: &str,
    uuid: Uuid,
    post: Row,
) -> Result<Option<(Row, Row)>> {
    let table_state = state
        .tables
        .get_mut(table_name)
        .ok_or_else(|| ClientError::ProtocolFraming(format!("modify for unknown table {table_name}")))?;
    let pre = table_state
        .rows
        .get(&uuid)
        .cloned()
        .ok_or_else(|| ClientError::ProtocolFraming(format!("modify for unknown row {uuid}")))?;
    if pre == post {
        return Ok(None);
    }

    let old_keys: Vec<Vec<Value>> = table
        .indexes
        .iter()
        .map(|group| index_key(table, group, &pre))
        .collect();
    let new_keys: Vec<Vec<Value>> = table
        .indexes
        .iter()
        .map(|group| index_key(table, group, &post))
        .collect();
    for (group, key) in new_keys.iter().enumerate() {
        if let Some(holder) = table_state.indexes[group].get(key) {
            if *holder != uuid {
                return Err(ClientError::IndexViolation {
                    table: table_name.to_string(),
                    columns: table.indexes[group].clone(),
                });
            }
        }
    }

    for (group, (old_key, new_key)) in old_keys.into_iter().zip(new_keys).enumerate() {
        if old_key != new_key {
            table_state.indexes[group].remove(&old_key);
            table_state.indexes[group].insert(new_key, uuid);
        }
    }
    table_state.rows.insert(uuid, post.clone());
    remove_ref_edges(state, table_name, uuid, &pre);
    add_ref_edges(state, table_name, uuid, &post);
    Ok(Some((pre, post)))
}

fn apply_replace(
    table: &TableSchema,
    state: &mut CacheState,
    table_name: &str,
    uuid: Uuid,
    row: &Row,
) -> Result<Option<(Row, Row)>> {
    let replacement = canonicalize(table, row)?;
    let pre = state
        .tables
        .get(table_name)
        .and_then(|t| t.rows.get(&uuid))
        .cloned()
        .ok_or_else(|| ClientError::ProtocolFraming(format!("update for unknown row {uuid}")))?;
    // Dialect-1 rows carry full values for the monitored columns only;
    // anything else keeps its prior value.
    let mut post = pre;
    for (column, value) in replacement.iter() {
        post.insert(column.clone(), value.clone());
    }
    replace_row(table, state, table_name, uuid, post)
}

fn apply_modify(
    table: &TableSchema,
    state: &mut CacheState,
    table_name: &str,
    uuid: Uuid,
    delta: &JsonMap<String, Json>,
) -> Result<Option<(Row, Row)>> {
    let pre = state
        .tables
        .get(table_name)
        .and_then(|t| t.rows.get(&uuid))
        .cloned()
        .ok_or_else(|| ClientError::ProtocolFraming(format!("modify for unknown row {uuid}")))?;

    let mut post = pre.clone();
    for (column, delta_value) in delta {
        if column == "_uuid" || column == "_version" {
            continue;
        }
        let schema = table.column(column).map_err(ClientError::from)?;
        let column_type = &schema.column_type;
        match NativeKind::of_column(column_type) {
            NativeKind::Set(_) => {
                let next = xor_delta(column, post.get(column), delta_value)?;
                post.insert(column.clone(), Value::Set(next));
            }
            // A 0-or-1 column is a set on the wire, so its delta is a
            // symmetric difference as well: 5 -> 7 arrives as [5, 7].
            NativeKind::Optional(_) => {
                let next = xor_delta(column, post.get(column), delta_value)?;
                let wire = match next.as_slice() {
                    [] => Value::empty_set(),
                    [atom] => Value::Atom(atom.clone()),
                    _ => {
                        return Err(ClientError::Ovsdb(ovsdb::OvsdbError::ArityViolation {
                            column: column.clone(),
                            reason: format!("{} elements after delta on a max-1 column", next.len()),
                        }));
                    }
                };
                post.insert(column.clone(), wire);
            }
            NativeKind::Map(_, _) => {
                let mut current = match post.get(column) {
                    Some(Value::Map(pairs)) => pairs.clone(),
                    _ => BTreeMap::new(),
                };
                for (key, value) in map_delta_pairs(column, delta_value)? {
                    match value {
                        Some(value) => {
                            current.insert(key, value);
                        }
                        None => {
                            current.remove(&key);
                        }
                    }
                }
                post.insert(column.clone(), Value::Map(current));
            }
            NativeKind::Scalar(_) => {
                let value = Value::from_wire(delta_value).map_err(ClientError::from)?;
                let native =
                    ovsdb::ovs_to_native(column_type, &value).map_err(ClientError::from)?;
                let wire =
                    ovsdb::native_to_ovs(column_type, &native).map_err(ClientError::from)?;
                post.insert(column.clone(), wire);
            }
        }
    }

    replace_row(table, state, table_name, uuid, post)
}

/// Toggle delta elements against the current membership.
fn xor_delta(column: &str, current: Option<&Value>, delta: &Json) -> Result<Vec<Atom>> {
    let current = match current {
        Some(Value::Set(atoms)) => atoms.clone(),
        Some(Value::Atom(atom)) => vec![atom.clone()],
        _ => Vec::new(),
    };
    let delta_atoms = match Value::from_wire(delta).map_err(ClientError::from)? {
        Value::Set(atoms) => atoms,
        Value::Atom(atom) => vec![atom],
        Value::Map(_) => {
            return Err(ClientError::ProtocolFraming(format!(
                "map delta for set column {column}"
            )));
        }
    };
    let mut next: BTreeSet<Atom> = current.into_iter().collect();
    for atom in delta_atoms {
        if !next.remove(&atom) {
            next.insert(atom);
        }
    }
    Ok(next.into_iter().collect())
}

/// Pairs of a map delta: `(key, Some(value))` replaces, `(key, None)`
/// (wire value `null`) deletes.
fn map_delta_pairs(column: &str, wire: &Json) -> Result<Vec<(Atom, Option<Atom>)>> {
    let malformed =
        |reason: String| ClientError::ProtocolFraming(format!("column {column}: {reason}"));
    let Json::Array(tagged) = wire else {
        return Err(malformed(format!("map delta is not an array: {wire}")));
    };
    if tagged.len() != 2 || tagged[0].as_str() != Some("map") {
        return Err(malformed(format!("map delta is not tagged: {wire}")));
    }
    let Json::Array(entries) = &tagged[1] else {
        return Err(malformed("map delta body is not an array".to_string()));
    };
    let mut pairs = Vec::with_capacity(entries.len());
    for entry in entries {
        let Json::Array(kv) = entry else {
            return Err(malformed(format!("malformed map delta entry: {entry}")));
        };
        if kv.len() != 2 {
            return Err(malformed(format!("malformed map delta entry: {entry}")));
        }
        let key = Atom::from_wire(&kv[0]).map_err(ClientError::from)?;
        let value = if kv[1].is_null() {
            None
        } else {
            Some(Atom::from_wire(&kv[1]).map_err(ClientError::from)?)
        };
        pairs.push((key, value));
    }
    Ok(pairs)
}

fn apply_delete(
    table: &TableSchema,
    state: &mut CacheState,
    table_name: &str,
    uuid: Uuid,
) -> Result<Option<Row>> {
    let Some(table_state) = state.tables.get_mut(table_name) else {
        return Ok(None);
    };
    let Some(row) = table_state.rows.remove(&uuid) else {
        tracing::debug!(%uuid, table = table_name, "delete for unknown row");
        return Ok(None);
    };
    let keys: Vec<Vec<Value>> = table
        .indexes
        .iter()
        .map(|group| index_key(table, group, &row))
        .collect();
    for (group, key) in keys.iter().enumerate() {
        if let Some(index) = table_state.indexes.get_mut(group) {
            index.remove(key);
        }
    }
    // Back-pointers held by this row go; pointers held by others at this
    // row stay until the server updates the holders.
    remove_ref_edges(state, table_name, uuid, &row);
    Ok(Some(row))
}

fn diff_states(old: &CacheState, new: &CacheState) -> Vec<TableEvents> {
    let mut tables: BTreeSet<&String> = old.tables.keys().collect();
    tables.extend(new.tables.keys());

    let empty = TableState::default();
    let mut events = Vec::new();
    for table in tables {
        let old_rows = old.tables.get(table).unwrap_or(&empty);
        let new_rows = new.tables.get(table).unwrap_or(&empty);
        let mut table_events = TableEvents::new(table);
        for (uuid, row) in &new_rows.rows {
            match old_rows.rows.get(uuid) {
                None => table_events.added.push(RowImage {
                    uuid: *uuid,
                    row: row.clone(),
                }),
                Some(old_row) if old_row != row => table_events.modified.push(RowChange {
                    uuid: *uuid,
                    pre: old_row.clone(),
                    post: row.clone(),
                }),
                Some(_) => {}
            }
        }
        for (uuid, row) in &old_rows.rows {
            if !new_rows.rows.contains_key(uuid) {
                table_events.removed.push(RowImage {
                    uuid: *uuid,
                    row: row.clone(),
                });
            }
        }
        if !table_events.is_empty() {
            events.push(table_events);
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::{CacheEvent, DEFAULT_EVENT_CAPACITY, MonitorCache};
    use crate::error::ClientError;
    use crate::monitor::{TableUpdates, decode_table_updates2};
    use ovsdb::{Atom, DatabaseSchema, Value};
    use serde_json::json;
    use std::sync::Arc;
    use uuid::Uuid;

    fn schema() -> Arc<DatabaseSchema> {
        Arc::new(
            DatabaseSchema::parse(&json!({
                "name": "OVN_Northbound",
                "tables": {
                    "Logical_Switch": {
                        "columns": {
                            "name": {"type": "string"},
                            "ports": {"type": {
                                "key": {"type": "uuid", "refTable": "Logical_Switch_Port"},
                                "min": 0, "max": "unlimited"
                            }},
                            "other_config": {"type": {
                                "key": "string", "value": "string",
                                "min": 0, "max": "unlimited"
                            }},
                            "tag": {"type": {"key": "integer", "min": 0, "max": 1}}
                        },
                        "indexes": [["name"]]
                    },
                    "ACL": {
                        "columns": {
                            "priority": {"type": "integer"},
                            "match": {"type": "string"}
                        },
                        "indexes": [["priority", "match"]]
                    }
                }
            }))
            .expect("schema"),
        )
    }

    fn updates(body: serde_json::Value) -> TableUpdates {
        decode_table_updates2(&body).expect("decode updates")
    }

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn insert_then_get_round_trips() {
        let cache = MonitorCache::new(schema());
        let u = uuid(1);
        let key = u.to_string();
        let rejected = cache
            .apply_updates(
                updates(json!({"Logical_Switch": {key: {"insert": {"name": "ls1"}}}})),
                Some("t1".to_string()),
            )
            .expect("apply");
        assert!(rejected.is_empty());

        let row = cache.get("Logical_Switch", u).expect("row");
        assert_eq!(row.get("name"), Some(&Value::Atom(Atom::String("ls1".to_string()))));
        assert_eq!(cache.last_txn_id().as_deref(), Some("t1"));
    }

    #[test]
    fn duplicate_uuid_is_rejected_and_first_row_retained() {
        let cache = MonitorCache::new(schema());
        let u = uuid(1);
        let key = u.to_string();
        cache
            .apply_updates(
                updates(json!({"Logical_Switch": {key: {"insert": {"name": "ls1"}}}})),
                None,
            )
            .expect("apply");

        let key = u.to_string();
        let rejected = cache
            .apply_updates(
                updates(json!({"Logical_Switch": {key: {"insert": {"name": "other"}}}})),
                None,
            )
            .expect("apply");
        assert!(matches!(rejected.as_slice(), [ClientError::DuplicateRow { .. }]));
        let row = cache.get("Logical_Switch", u).expect("row");
        assert_eq!(row.get("name"), Some(&Value::Atom(Atom::String("ls1".to_string()))));
    }

    #[test]
    fn index_collision_is_rejected() {
        let cache = MonitorCache::new(schema());
        let first = uuid(1).to_string();
        let second = uuid(2).to_string();
        cache
            .apply_updates(
                updates(json!({"ACL": {first: {"insert": {"priority": 1000, "match": "ip"}}}})),
                None,
            )
            .expect("apply");
        let rejected = cache
            .apply_updates(
                updates(json!({"ACL": {second: {"insert": {"priority": 1000, "match": "ip"}}}})),
                None,
            )
            .expect("apply");
        assert!(matches!(rejected.as_slice(), [ClientError::DuplicateRow { .. }]));
        assert_eq!(cache.len("ACL"), 1);
        assert!(cache.get("ACL", uuid(2)).is_none());
    }

    #[test]
    fn find_by_index_uses_declared_groups() {
        let cache = MonitorCache::new(schema());
        let key = uuid(1).to_string();
        cache
            .apply_updates(
                updates(json!({"ACL": {key: {"insert": {"priority": 1000, "match": "ip"}}}})),
                None,
            )
            .expect("apply");

        let found = cache
            .find_by_index(
                "ACL",
                &["priority", "match"],
                &[
                    Value::Atom(Atom::Integer(1000)),
                    Value::Atom(Atom::String("ip".to_string())),
                ],
            )
            .expect("lookup")
            .expect("hit");
        assert_eq!(found.0, uuid(1));

        assert!(cache.find_by_index("ACL", &["match"], &[]).is_err());
    }

    #[test]
    fn set_modify_applies_symmetric_difference() {
        let cache = MonitorCache::new(schema());
        let switch = uuid(1);
        let port_a = uuid(10);
        let port_b = uuid(11);

        let key = switch.to_string();
        cache
            .apply_updates(
                updates(json!({"Logical_Switch": {key: {"insert": {
                    "name": "ls1",
                    "ports": ["set", [["uuid", port_a.to_string()]]],
                }}}})),
                None,
            )
            .expect("apply");

        // Delta toggles port_a out and port_b in.
        let key = switch.to_string();
        cache
            .apply_updates(
                updates(json!({"Logical_Switch": {key: {"modify": {
                    "ports": ["set", [
                        ["uuid", port_a.to_string()],
                        ["uuid", port_b.to_string()],
                    ]],
                }}}})),
                None,
            )
            .expect("apply");

        let row = cache.get("Logical_Switch", switch).expect("row");
        assert_eq!(row.get("ports"), Some(&Value::Set(vec![Atom::Uuid(port_b)])));
    }

    #[test]
    fn optional_modify_is_a_symmetric_difference_too() {
        let cache = MonitorCache::new(schema());
        let switch = uuid(1);
        let key = switch.to_string();
        cache
            .apply_updates(
                updates(json!({"Logical_Switch": {key: {"insert": {
                    "name": "ls1",
                    "tag": 5,
                }}}})),
                None,
            )
            .expect("apply");

        // 5 -> 7 arrives as the two-element toggle set.
        let key = switch.to_string();
        cache
            .apply_updates(
                updates(json!({"Logical_Switch": {key: {"modify": {
                    "tag": ["set", [5, 7]],
                }}}})),
                None,
            )
            .expect("apply");
        let row = cache.get("Logical_Switch", switch).expect("row");
        assert_eq!(row.get("tag"), Some(&Value::Atom(Atom::Integer(7))));

        // 7 -> absent arrives as the one-element toggle.
        let key = switch.to_string();
        cache
            .apply_updates(
                updates(json!({"Logical_Switch": {key: {"modify": {
                    "tag": ["set", [7]],
                }}}})),
                None,
            )
            .expect("apply");
        let row = cache.get("Logical_Switch", switch).expect("row");
        assert_eq!(row.get("tag"), Some(&Value::empty_set()));
    }

    #[test]
    fn map_modify_replaces_and_deletes_keys() {
        let cache = MonitorCache::new(schema());
        let switch = uuid(1);
        let key = switch.to_string();
        cache
            .apply_updates(
                updates(json!({"Logical_Switch": {key: {"insert": {
                    "name": "ls1",
                    "other_config": ["map", [["subnet", "10.0.0.0/24"], ["mtu", "1400"]]],
                }}}})),
                None,
            )
            .expect("apply");

        let key = switch.to_string();
        cache
            .apply_updates(
                updates(json!({"Logical_Switch": {key: {"modify": {
                    "other_config": ["map", [["mtu", null], ["subnet", "10.1.0.0/24"]]],
                }}}})),
                None,
            )
            .expect("apply");

        let row = cache.get("Logical_Switch", switch).expect("row");
        let expected = Value::Map(
            [(
                Atom::String("subnet".to_string()),
                Atom::String("10.1.0.0/24".to_string()),
            )]
            .into_iter()
            .collect(),
        );
        assert_eq!(row.get("other_config"), Some(&expected));
    }

    #[tokio::test]
    async fn applying_a_delta_twice_is_a_visible_no_op() {
        let cache = MonitorCache::new(schema());
        let switch = uuid(1);
        let port = uuid(10);

        let key = switch.to_string();
        cache
            .apply_updates(
                updates(json!({"Logical_Switch": {key: {"insert": {"name": "ls1"}}}})),
                None,
            )
            .expect("apply");

        let mut events = cache.subscribe(DEFAULT_EVENT_CAPACITY);

        let key = switch.to_string();
        let delta = json!({"Logical_Switch": {key: {"modify": {
            "ports": ["set", [["uuid", port.to_string()]]],
        }}}});
        cache.apply_updates(updates(delta), None).expect("apply");

        // Re-applying against the post-state toggles the port back out;
        // applying that same post-state again must change nothing and emit
        // no event.
        let key = switch.to_string();
        let noop = json!({"Logical_Switch": {key: {"modify": {
            "ports": ["set", []],
        }}}});
        cache.apply_updates(updates(noop.clone()), None).expect("apply");
        cache.apply_updates(updates(noop), None).expect("apply");

        let first = events.recv().await.expect("event");
        match first {
            CacheEvent::Batch(tables) => {
                assert_eq!(tables.len(), 1);
                assert_eq!(tables[0].modified.len(), 1);
            }
            other => panic!("expected batch, got {other:?}"),
        }
        cache.close();
        assert_eq!(events.recv().await, None);
    }

    #[test]
    fn delete_removes_rows_indexes_and_held_back_pointers() {
        let cache = MonitorCache::new(schema());
        let switch = uuid(1);
        let port = uuid(10);

        let key = switch.to_string();
        cache
            .apply_updates(
                updates(json!({"Logical_Switch": {key: {"insert": {
                    "name": "ls1",
                    "ports": ["set", [["uuid", port.to_string()]]],
                }}}})),
                None,
            )
            .expect("apply");
        assert_eq!(
            cache.referers(port),
            vec![("Logical_Switch".to_string(), switch, "ports".to_string())]
        );

        let key = switch.to_string();
        cache
            .apply_updates(
                updates(json!({"Logical_Switch": {key: {"delete": null}}})),
                None,
            )
            .expect("apply");
        assert!(cache.get("Logical_Switch", switch).is_none());
        assert!(cache.referers(port).is_empty());
        assert_eq!(cache.len("Logical_Switch"), 0);
    }

    #[tokio::test]
    async fn resync_swaps_atomically_and_reports_the_diff() {
        let cache = MonitorCache::new(schema());
        let kept = uuid(1);
        let dropped = uuid(2);
        let added = uuid(3);

        let kept_key = kept.to_string();
        let dropped_key = dropped.to_string();
        cache
            .apply_updates(
                updates(json!({"Logical_Switch": {
                    kept_key: {"insert": {"name": "ls1"}},
                    dropped_key: {"insert": {"name": "ls2"}},
                }})),
                Some("t1".to_string()),
            )
            .expect("apply");
        cache.mark_stale();

        let mut events = cache.subscribe(DEFAULT_EVENT_CAPACITY);

        // Full reseed: the server no longer knows txn t1.
        let kept_key = kept.to_string();
        let added_key = added.to_string();
        cache
            .resync(
                updates(json!({"Logical_Switch": {
                    kept_key: {"initial": {"name": "ls1"}},
                    added_key: {"initial": {"name": "ls3"}},
                }})),
                true,
                Some("t9".to_string()),
            )
            .expect("resync");

        assert!(!cache.is_stale());
        assert_eq!(cache.last_txn_id().as_deref(), Some("t9"));
        assert!(cache.get("Logical_Switch", dropped).is_none());
        assert!(cache.get("Logical_Switch", added).is_some());

        match events.recv().await.expect("event") {
            CacheEvent::Resync(tables) => {
                assert_eq!(tables.len(), 1);
                assert_eq!(tables[0].added.len(), 1);
                assert_eq!(tables[0].added[0].uuid, added);
                assert_eq!(tables[0].removed.len(), 1);
                assert_eq!(tables[0].removed[0].uuid, dropped);
                assert!(tables[0].modified.is_empty());
            }
            other => panic!("expected resync, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_subscribers_drop_oldest_and_see_lag() {
        let cache = MonitorCache::new(schema());
        let mut events = cache.subscribe(2);

        for n in 0..5u128 {
            let key = uuid(n + 1).to_string();
            let name = format!("ls{n}");
            cache
                .apply_updates(
                    updates(json!({"Logical_Switch": {key: {"insert": {"name": name}}}})),
                    None,
                )
                .expect("apply");
        }

        match events.recv().await.expect("event") {
            CacheEvent::Lagged(n) => assert_eq!(n, 3),
            other => panic!("expected lag marker, got {other:?}"),
        }
        assert!(matches!(events.recv().await, Some(CacheEvent::Batch(_))));
        assert!(matches!(events.recv().await, Some(CacheEvent::Batch(_))));
    }

    #[test]
    fn bare_atoms_canonicalize_on_insert() {
        let cache = MonitorCache::new(schema());
        let key = uuid(1).to_string();
        cache
            .apply_updates(
                updates(json!({"Logical_Switch": {key: {"insert": {
                    "name": "ls1",
                    "ports": ["set", []],
                }}}})),
                None,
            )
            .expect("apply");
        let row = cache.get("Logical_Switch", uuid(1)).expect("row");
        assert_eq!(row.get("ports"), Some(&Value::Set(vec![])));
    }
}
