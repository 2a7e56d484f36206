//! Monitor requests and decoding of the three update dialects.

use std::collections::BTreeMap;

use serde_json::{Map as JsonMap, Value as Json, json};
use uuid::Uuid;

use ovsdb::{Condition, Row};

use crate::error::{ClientError, Result};

/// Which change kinds a monitor subscribes to. All of them by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSelect {
    pub initial: bool,
    pub insert: bool,
    pub delete: bool,
    pub modify: bool,
}

impl Default for MonitorSelect {
    fn default() -> Self {
        Self {
            initial: true,
            insert: true,
            delete: true,
            modify: true,
        }
    }
}

/// One monitored table: columns, change selection, and row conditions.
#[derive(Debug, Clone, Default)]
pub struct MonitorRequest {
    pub columns: Vec<String>,
    pub select: Option<MonitorSelect>,
    pub conditions: Vec<Condition>,
}

impl MonitorRequest {
    /// Monitor every change to the named columns.
    #[must_use]
    pub fn columns(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            select: None,
            conditions: Vec::new(),
        }
    }

    fn to_wire(&self, with_conditions: bool) -> Json {
        let mut object = JsonMap::new();
        if !self.columns.is_empty() {
            object.insert("columns".to_string(), json!(self.columns));
        }
        if let Some(select) = &self.select {
            object.insert(
                "select".to_string(),
                json!({
                    "initial": select.initial,
                    "insert": select.insert,
                    "delete": select.delete,
                    "modify": select.modify,
                }),
            );
        }
        if with_conditions && !self.conditions.is_empty() {
            object.insert(
                "where".to_string(),
                Json::Array(self.conditions.iter().map(Condition::to_wire).collect()),
            );
        }
        Json::Object(object)
    }
}

fn requests_wire(requests: &BTreeMap<String, MonitorRequest>, with_conditions: bool) -> Json {
    let mut object = JsonMap::new();
    for (table, request) in requests {
        object.insert(table.clone(), request.to_wire(with_conditions));
    }
    Json::Object(object)
}

/// Params for `monitor`.
#[must_use]
pub fn monitor_params(
    database: &str,
    monitor_id: &Json,
    requests: &BTreeMap<String, MonitorRequest>,
) -> Json {
    json!([database, monitor_id, requests_wire(requests, false)])
}

/// Params for `monitor_cond`.
#[must_use]
pub fn monitor_cond_params(
    database: &str,
    monitor_id: &Json,
    requests: &BTreeMap<String, MonitorRequest>,
) -> Json {
    json!([database, monitor_id, requests_wire(requests, true)])
}

/// Params for `monitor_cond_since`. An unknown last transaction id resumes
/// from scratch.
#[must_use]
pub fn monitor_cond_since_params(
    database: &str,
    monitor_id: &Json,
    requests: &BTreeMap<String, MonitorRequest>,
    last_txn_id: Option<&str>,
) -> Json {
    json!([
        database,
        monitor_id,
        requests_wire(requests, true),
        last_txn_id.unwrap_or("00000000-0000-0000-0000-000000000000"),
    ])
}

/// One row change from a monitor notification.
#[derive(Debug, Clone, PartialEq)]
pub enum RowUpdate {
    /// Full row present when the monitor started.
    Initial(Row),
    /// Full row of a new insert.
    Insert(Row),
    /// Column deltas, kept raw: sets are symmetric differences and map
    /// values may be `null` (deletion), so interpretation needs the schema.
    Modify(JsonMap<String, Json>),
    /// Full post-state of a changed row (`update` dialect).
    Replace(Row),
    /// Row removal; the pre-image when the dialect carries one.
    Delete(Option<Row>),
}

/// Decoded body of one update notification, keyed by table then row UUID.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableUpdates(pub BTreeMap<String, BTreeMap<Uuid, RowUpdate>>);

impl TableUpdates {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeMap::is_empty)
    }
}

fn malformed(reason: String) -> ClientError {
    ClientError::ProtocolFraming(reason)
}

fn parse_uuid(key: &str) -> Result<Uuid> {
    Uuid::parse_str(key).map_err(|err| malformed(format!("bad row uuid {key:?}: {err}")))
}

fn parse_row(wire: &Json) -> Result<Row> {
    Row::from_wire(wire).map_err(|err| malformed(err.to_string()))
}

/// Decode an `update2` / `update3` table-updates object.
pub fn decode_table_updates2(wire: &Json) -> Result<TableUpdates> {
    let Json::Object(tables) = wire else {
        return Err(malformed(format!("table updates is not an object: {wire}")));
    };
    let mut updates = TableUpdates::default();
    for (table, rows) in tables {
        let Json::Object(rows) = rows else {
            return Err(malformed(format!("updates for table {table} are not an object")));
        };
        let mut decoded = BTreeMap::new();
        for (key, update) in rows {
            let uuid = parse_uuid(key)?;
            let Json::Object(update) = update else {
                return Err(malformed(format!("row update for {key} is not an object")));
            };
            let row_update = if let Some(row) = update.get("initial") {
                RowUpdate::Initial(parse_row(row)?)
            } else if let Some(row) = update.get("insert") {
                RowUpdate::Insert(parse_row(row)?)
            } else if let Some(delta) = update.get("modify") {
                let Json::Object(delta) = delta else {
                    return Err(malformed(format!("modify delta for {key} is not an object")));
                };
                RowUpdate::Modify(delta.clone())
            } else if update.contains_key("delete") {
                RowUpdate::Delete(None)
            } else {
                return Err(malformed(format!("row update for {key} has no marker")));
            };
            decoded.insert(uuid, row_update);
        }
        updates.0.insert(table.clone(), decoded);
    }
    Ok(updates)
}

/// Decode an `update` (dialect 1) table-updates object with `old`/`new`
/// row pairs into the common representation.
pub fn decode_table_updates1(wire: &Json) -> Result<TableUpdates> {
    let Json::Object(tables) = wire else {
        return Err(malformed(format!("table updates is not an object: {wire}")));
    };
    let mut updates = TableUpdates::default();
    for (table, rows) in tables {
        let Json::Object(rows) = rows else {
            return Err(malformed(format!("updates for table {table} are not an object")));
        };
        let mut decoded = BTreeMap::new();
        for (key, update) in rows {
            let uuid = parse_uuid(key)?;
            let old = update.get("old").filter(|v| !v.is_null());
            let new = update.get("new").filter(|v| !v.is_null());
            let row_update = match (old, new) {
                (None, Some(new)) => RowUpdate::Insert(parse_row(new)?),
                (Some(_), Some(new)) => RowUpdate::Replace(parse_row(new)?),
                (Some(old), None) => RowUpdate::Delete(Some(parse_row(old)?)),
                (None, None) => {
                    return Err(malformed(format!("row update for {key} has neither old nor new")));
                }
            };
            decoded.insert(uuid, row_update);
        }
        updates.0.insert(table.clone(), decoded);
    }
    Ok(updates)
}

/// Split `update2` notification params into monitor id and body.
pub fn split_update2_params(params: &Json) -> Result<(&Json, &Json)> {
    let Json::Array(params) = params else {
        return Err(malformed(format!("update params are not an array: {params}")));
    };
    match params.as_slice() {
        [id, body] => Ok((id, body)),
        _ => Err(malformed(format!("update params carry {} elements", params.len()))),
    }
}

/// Split `update3` notification params into monitor id, transaction id,
/// and body.
pub fn split_update3_params(params: &Json) -> Result<(&Json, &str, &Json)> {
    let Json::Array(params) = params else {
        return Err(malformed(format!("update params are not an array: {params}")));
    };
    match params.as_slice() {
        [id, txn, body] => {
            let txn = txn
                .as_str()
                .ok_or_else(|| malformed(format!("transaction id is not a string: {txn}")))?;
            Ok((id, txn, body))
        }
        _ => Err(malformed(format!("update3 params carry {} elements", params.len()))),
    }
}

/// Split a `monitor_cond_since` reply into (found, last transaction id,
/// initial updates body).
pub fn split_cond_since_reply(reply: &Json) -> Result<(bool, &str, &Json)> {
    let Json::Array(reply) = reply else {
        return Err(malformed(format!("monitor_cond_since reply is not an array: {reply}")));
    };
    match reply.as_slice() {
        [found, txn, body] => {
            let found = found
                .as_bool()
                .ok_or_else(|| malformed(format!("found flag is not a bool: {found}")))?;
            let txn = txn
                .as_str()
                .ok_or_else(|| malformed(format!("transaction id is not a string: {txn}")))?;
            Ok((found, txn, body))
        }
        _ => Err(malformed(format!(
            "monitor_cond_since reply carries {} elements",
            reply.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        MonitorRequest, RowUpdate, decode_table_updates1, decode_table_updates2,
        monitor_cond_since_params, split_cond_since_reply, split_update3_params,
    };
    use serde_json::json;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    #[test]
    fn cond_since_params_carry_the_last_txn_id() {
        let mut requests = BTreeMap::new();
        requests.insert(
            "Logical_Switch".to_string(),
            MonitorRequest::columns(&["name", "ports"]),
        );
        let params = monitor_cond_since_params(
            "OVN_Northbound",
            &json!("cache"),
            &requests,
            Some("t1"),
        );
        assert_eq!(
            params,
            json!([
                "OVN_Northbound",
                "cache",
                {"Logical_Switch": {"columns": ["name", "ports"]}},
                "t1",
            ])
        );
    }

    #[test]
    fn update2_markers_decode() {
        let uuid = Uuid::parse_str("36bef046-7da7-43a5-905a-c17899216fcb").expect("uuid");
        let key = uuid.to_string();
        let updates = decode_table_updates2(&json!({
            "Logical_Switch": {
                key: {"insert": {"name": "ls1"}},
            }
        }))
        .expect("decode");
        let row = updates.0["Logical_Switch"].get(&uuid).expect("row");
        assert!(matches!(row, RowUpdate::Insert(_)));

        let key = uuid.to_string();
        let updates = decode_table_updates2(&json!({
            "Logical_Switch": {
                key: {"delete": null},
            }
        }))
        .expect("decode");
        assert!(matches!(
            updates.0["Logical_Switch"].get(&uuid),
            Some(RowUpdate::Delete(None))
        ));
    }

    #[test]
    fn modify_deltas_stay_raw() {
        let uuid = Uuid::parse_str("36bef046-7da7-43a5-905a-c17899216fcb").expect("uuid");
        let key = uuid.to_string();
        let updates = decode_table_updates2(&json!({
            "Logical_Switch": {
                key: {"modify": {"ports": ["set", [["uuid", "36bef046-7da7-43a5-905a-c17899216fcb"]]]}},
            }
        }))
        .expect("decode");
        match updates.0["Logical_Switch"].get(&uuid) {
            Some(RowUpdate::Modify(delta)) => assert!(delta.contains_key("ports")),
            other => panic!("expected modify, got {other:?}"),
        }
    }

    #[test]
    fn dialect1_old_new_pairs_map_to_common_updates() {
        let uuid = Uuid::parse_str("36bef046-7da7-43a5-905a-c17899216fcb").expect("uuid");
        let key = uuid.to_string();
        let updates = decode_table_updates1(&json!({
            "Logical_Switch": {
                key: {"old": {"name": "ls1"}, "new": {"name": "ls2"}},
            }
        }))
        .expect("decode");
        assert!(matches!(
            updates.0["Logical_Switch"].get(&uuid),
            Some(RowUpdate::Replace(_))
        ));
    }

    #[test]
    fn update3_params_split() {
        let value = json!(["cache", "t42", {"Logical_Switch": {}}]);
        let (id, txn, body) = split_update3_params(&value).expect("split");
        assert_eq!(id, &json!("cache"));
        assert_eq!(txn, "t42");
        assert!(body.is_object());
    }

    #[test]
    fn cond_since_reply_splits() {
        let value = json!([false, "t9", {}]);
        let (found, txn, _) = split_cond_since_reply(&value).expect("split");
        assert!(!found);
        assert_eq!(txn, "t9");
    }
}
