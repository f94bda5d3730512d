//! Wire types shared between the coherence engine and the services it talks to.
//!
//! - [`ChangeNotification`]: pushed by the change transport.
//! - [`ReadResponse`]: envelope returned by remote read endpoints.
//! - [`WriteRequest`]: partial-update, create or remove payload sent to remote write endpoints.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Instance id → display name, grouped by resource kind.
pub type ReferenceNames = BTreeMap<String, BTreeMap<String, String>>;

/// What happened to a single resource instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Created,
    Updated,
    Removed,
}

impl ChangeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Removed => "removed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub id: String,
    pub action: ChangeAction,
}

/// Change notification delivered at-least-once by the external transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    pub resource_kind: String,
    #[serde(default)]
    pub changes: Vec<Change>,
}

impl ChangeNotification {
    pub fn new(resource_kind: impl Into<String>, changes: Vec<Change>) -> Self {
        Self {
            resource_kind: resource_kind.into(),
            changes,
        }
    }

    /// Single-change convenience constructor.
    pub fn single(resource_kind: impl Into<String>, id: impl Into<String>, action: ChangeAction) -> Self {
        Self::new(
            resource_kind,
            vec![Change {
                id: id.into(),
                action,
            }],
        )
    }
}

/// Envelope returned by every remote read endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResponse {
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_names: Option<ReferenceNames>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paging_params: Option<Value>,
}

impl ReadResponse {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            reference_names: None,
            total: None,
            paging_params: None,
        }
    }

    pub fn with_reference_names(mut self, names: ReferenceNames) -> Self {
        self.reference_names = Some(names);
        self
    }

    pub fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOperation {
    Create,
    Update,
    Remove,
}

/// Payload sent to a remote write endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRequest {
    pub resource_kind: String,
    /// Absent for creates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub operation: WriteOperation,
    pub payload: Value,
}
