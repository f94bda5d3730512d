//! Helpers over cached JSON payloads.
//!
//! Detail entries hold a record object. List entries hold either a bare array
//! of records or the list envelope `{ "data": [...], "total": n, "pagingParams": {...} }`.
//! Records are identified by their `id` field.

use coherence_wire::ReadResponse;
use serde_json::{Map, Value};

pub const ID_FIELD: &str = "id";

/// Id of a record; numeric ids are rendered as strings.
pub fn row_id(row: &Value) -> Option<String> {
    match row.get(ID_FIELD)? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

pub fn row_has_id(row: &Value, id: &str) -> bool {
    row_id(row).as_deref() == Some(id)
}

pub fn list_rows(value: &Value) -> Option<&Vec<Value>> {
    match value {
        Value::Array(rows) => Some(rows),
        Value::Object(map) => map.get("data").and_then(Value::as_array),
        _ => None,
    }
}

pub fn list_rows_mut(value: &mut Value) -> Option<&mut Vec<Value>> {
    match value {
        Value::Array(rows) => Some(rows),
        Value::Object(map) => map.get_mut("data").and_then(Value::as_array_mut),
        _ => None,
    }
}

/// Shallow field merge; non-object targets are replaced by the changes.
pub fn merge_fields(target: &mut Value, changes: &Map<String, Value>) {
    match target {
        Value::Object(fields) => {
            for (name, value) in changes {
                fields.insert(name.clone(), value.clone());
            }
        }
        other => *other = Value::Object(changes.clone()),
    }
}

/// Value cached for a list query, without the reference names.
pub fn list_envelope(response: &ReadResponse) -> Value {
    let mut envelope = Map::new();
    envelope.insert("data".to_string(), response.data.clone());
    if let Some(total) = response.total {
        envelope.insert("total".to_string(), Value::from(total));
    }
    if let Some(paging) = &response.paging_params {
        envelope.insert("pagingParams".to_string(), paging.clone());
    }
    Value::Object(envelope)
}

/// Adjusts the `total` of a list envelope, if it carries one.
pub fn adjust_total(value: &mut Value, delta: i64) {
    if let Some(total) = value.get_mut("total")
        && let Some(current) = total.as_u64()
    {
        let next = (current as i64 + delta).max(0);
        *total = Value::from(next as u64);
    }
}
