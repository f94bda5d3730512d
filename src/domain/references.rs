//! Reference lookup tables: instance id → display name for one resource kind.
//!
//! Updates are always merges. Ordering between a bulk load and incidental
//! writes can only add entries, never lose them; on a colliding id the last
//! merge wins.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::payload::row_id;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceTable {
    names: BTreeMap<String, String>,
}

impl ReferenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a cached table value. Non-string names and non-object values are ignored.
    pub fn from_value(value: &Value) -> Self {
        let names = value
            .as_object()
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(|(id, name)| name.as_str().map(|n| (id.clone(), n.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        Self { names }
    }

    pub fn to_value(&self) -> Value {
        let mut fields = Map::new();
        for (id, name) in &self.names {
            fields.insert(id.clone(), Value::String(name.clone()));
        }
        Value::Object(fields)
    }

    pub fn merge<I, K, V>(&mut self, incoming: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (id, name) in incoming {
            self.names.insert(id.into(), name.into());
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<String> {
        self.names.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.names.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Names carried by a bulk reference payload.
///
/// Accepts an `{ id: name }` object or an array of `{ "id", "name" }` rows.
pub fn names_from_payload(payload: &Value) -> BTreeMap<String, String> {
    match payload {
        Value::Object(_) => ReferenceTable::from_value(payload).names,
        Value::Array(rows) => rows
            .iter()
            .filter_map(|row| {
                let id = row_id(row)?;
                let name = row.get("name")?.as_str()?;
                Some((id, name.to_string()))
            })
            .collect(),
        _ => BTreeMap::new(),
    }
}

/// Merges `incoming` names into a cached table value.
pub fn merge_into_value(current: Value, incoming: &BTreeMap<String, String>) -> Value {
    let mut table = ReferenceTable::from_value(&current);
    table.merge(incoming.iter().map(|(id, name)| (id.clone(), name.clone())));
    table.to_value()
}

/// Drops one id from a cached table value.
pub fn remove_from_value(current: Value, id: &str) -> Value {
    let mut table = ReferenceTable::from_value(&current);
    table.remove(id);
    table.to_value()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn names(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(id, name)| (id.to_string(), name.to_string()))
            .collect()
    }

    #[test]
    fn merge_is_union_with_last_merge_winning() {
        let a = names(&[("E1", "Ada"), ("E2", "Grace")]);
        let b = names(&[("E2", "Grace H."), ("E3", "Linus")]);

        let ab = merge_into_value(merge_into_value(json!({}), &a), &b);
        let ba = merge_into_value(merge_into_value(json!({}), &b), &a);

        let ab = ReferenceTable::from_value(&ab);
        let ba = ReferenceTable::from_value(&ba);

        assert_eq!(ab.len(), 3);
        assert_eq!(ba.len(), 3);
        assert_eq!(ab.get("E2"), Some("Grace H."));
        assert_eq!(ba.get("E2"), Some("Grace"));
    }

    #[test]
    fn merge_never_drops_existing_entries() {
        let bulk: BTreeMap<String, String> = (0..250)
            .map(|i| (format!("E{i}"), format!("Employee {i}")))
            .collect();
        let incidental = names(&[("E7", "Employee 7")]);

        let after_bulk = merge_into_value(json!({}), &bulk);
        let after_both = merge_into_value(after_bulk, &incidental);

        assert_eq!(ReferenceTable::from_value(&after_both).len(), 250);
    }

    #[test]
    fn remove_drops_single_entry() {
        let value = merge_into_value(json!({}), &names(&[("T9", "Ship"), ("T1", "Plan")]));
        let value = remove_from_value(value, "T9");
        let table = ReferenceTable::from_value(&value);
        assert!(!table.contains("T9"));
        assert!(table.contains("T1"));
    }

    #[test]
    fn bulk_payload_accepts_objects_and_rows() {
        let object = names_from_payload(&json!({ "E1": "Ada" }));
        let rows = names_from_payload(&json!([
            { "id": "E1", "name": "Ada" },
            { "id": 2, "name": "Grace" },
            { "id": "E3" }
        ]));

        assert_eq!(object, names(&[("E1", "Ada")]));
        assert_eq!(rows, names(&[("E1", "Ada"), ("2", "Grace")]));
    }

    #[test]
    fn malformed_values_read_as_empty() {
        assert!(ReferenceTable::from_value(&json!([1, 2])).is_empty());
        let mixed = ReferenceTable::from_value(&json!({ "A": "ok", "B": 3 }));
        assert_eq!(mixed.len(), 1);
    }
}
