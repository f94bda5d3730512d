//! Cache key definitions.
//!
//! A [`CacheKey`] is the ordered tuple (resource kind, identifying parameters).
//! Parameter objects are canonicalised (object fields sorted by name,
//! recursively) before comparison, so two keys built from differently ordered
//! JSON objects are equal.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use super::error::DomainError;

/// Name of a remote resource type (`project`, `task`, `employee`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKind(String);

impl ResourceKind {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Validated kind name: lowercase ASCII letters, digits, `_` and `-`,
    /// starting with a letter. Kind names double as durable table names.
    pub fn parse(name: &str) -> Result<Self, DomainError> {
        let valid = name.len() <= 64
            && name.starts_with(|c: char| c.is_ascii_lowercase())
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if !valid {
            return Err(DomainError::validation(format!(
                "invalid resource kind `{name}`"
            )));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKind {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ResourceKind {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifying parameters of a list query, kept in canonical form.
#[derive(Debug, Clone)]
pub struct QueryParams {
    value: Value,
    canonical: String,
}

impl QueryParams {
    pub fn new(value: Value) -> Self {
        let value = canonicalize(value);
        let canonical = value.to_string();
        Self { value, canonical }
    }

    pub fn empty() -> Self {
        Self::new(Value::Object(Map::new()))
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Deterministic serialisation used for equality, ordering and storage ids.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

impl Default for QueryParams {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for QueryParams {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for QueryParams {}

impl Hash for QueryParams {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl PartialOrd for QueryParams {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueryParams {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl Serialize for QueryParams {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for QueryParams {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::new)
    }
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<(String, Value)> = map.into_iter().collect();
            fields.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (name, inner) in fields {
                sorted.insert(name, canonicalize(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Which query of a resource kind a key addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum KeyScope {
    /// One instance by id.
    Detail { id: String },
    /// A (possibly filtered, paged) collection.
    List { params: QueryParams },
    /// The reference lookup table (instance id → display name).
    References,
    /// A kind-wide document: catalogs, display options, global configuration.
    Singleton,
}

/// Structured key of a reactive query cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub kind: ResourceKind,
    pub scope: KeyScope,
}

impl CacheKey {
    pub fn detail(kind: impl Into<ResourceKind>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            scope: KeyScope::Detail { id: id.into() },
        }
    }

    pub fn list(kind: impl Into<ResourceKind>, params: Value) -> Self {
        Self {
            kind: kind.into(),
            scope: KeyScope::List {
                params: QueryParams::new(params),
            },
        }
    }

    pub fn references(kind: impl Into<ResourceKind>) -> Self {
        Self {
            kind: kind.into(),
            scope: KeyScope::References,
        }
    }

    pub fn singleton(kind: impl Into<ResourceKind>) -> Self {
        Self {
            kind: kind.into(),
            scope: KeyScope::Singleton,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self.scope, KeyScope::List { .. })
    }

    pub fn detail_id(&self) -> Option<&str> {
        match &self.scope {
            KeyScope::Detail { id } => Some(id),
            _ => None,
        }
    }

    pub fn is_list_of(&self, kind: &ResourceKind) -> bool {
        &self.kind == kind && self.is_list()
    }

    pub fn is_detail_of(&self, kind: &ResourceKind, id: &str) -> bool {
        &self.kind == kind && self.detail_id() == Some(id)
    }

    /// Deterministic primary key used by the durable store.
    pub fn storage_id(&self) -> String {
        match &self.scope {
            KeyScope::Detail { id } => format!("{}/detail/{}", self.kind, id),
            KeyScope::List { params } => format!("{}/list/{}", self.kind, params.canonical()),
            KeyScope::References => format!("{}/references", self.kind),
            KeyScope::Singleton => format!("{}/singleton", self.kind),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_id())
    }
}
