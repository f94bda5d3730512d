//! Optimistic mutations.
//!
//! Each mutation walks `Idle → Applying → (Committing | RollingBack) → Idle`.
//! Applying snapshots and rewrites every list and detail entry of the target
//! resource in one cache step, mirrors the change to the durable store, and
//! only then dispatches the remote write. Mutations on the same resource id
//! queue behind each other; mutations on different ids run independently.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use coherence_wire::{WriteOperation, WriteRequest};
use metrics::counter;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::application::repos::{RemoteError, RemoteSource};
use crate::domain::keys::{CacheKey, ResourceKind};
use crate::domain::payload::{
    ID_FIELD, adjust_total, list_rows, list_rows_mut, merge_fields, row_has_id, row_id,
};

use super::fetch::QueryClient;
use super::lock::mutex_lock;
use super::store::{Edit, Snapshot};

const SOURCE: &str = "cache::optimistic";

const METRIC_MUTATION_ROLLBACK: &str = "coherence_mutation_rollback_total";

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("remote rejected mutation of {kind}/{id}; changes rolled back: {source}")]
    Remote {
        kind: String,
        id: String,
        #[source]
        source: RemoteError,
    },
    #[error("mutation of {kind}/{id} timed out; changes rolled back")]
    Timeout { kind: String, id: String },
    #[error("invalid mutation: {message}")]
    Invalid { message: String },
}

impl MutationError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    pub fn rolled_back(&self) -> bool {
        !matches!(self, Self::Invalid { .. })
    }
}

/// A speculative change to one resource.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Partial update of an existing record.
    Update { id: String, changes: Map<String, Value> },
    /// New record shown under `temp_id` until the server assigns the real id.
    Create { temp_id: String, record: Value },
    Remove { id: String },
}

impl Mutation {
    pub fn target_id(&self) -> &str {
        match self {
            Self::Update { id, .. } | Self::Remove { id } => id,
            Self::Create { temp_id, .. } => temp_id,
        }
    }

    fn validate(&self) -> Result<(), MutationError> {
        if self.target_id().is_empty() {
            return Err(MutationError::invalid("target id must not be empty"));
        }
        match self {
            Self::Update { changes, .. } if changes.is_empty() => {
                Err(MutationError::invalid("update carries no changes"))
            }
            Self::Create { record, .. } if !record.is_object() => {
                Err(MutationError::invalid("created record must be an object"))
            }
            _ => Ok(()),
        }
    }

    fn request(&self, kind: &ResourceKind) -> WriteRequest {
        let (id, operation, payload) = match self {
            Self::Update { id, changes } => (
                Some(id.clone()),
                WriteOperation::Update,
                Value::Object(changes.clone()),
            ),
            Self::Create { record, .. } => {
                let mut payload = record.clone();
                if let Some(fields) = payload.as_object_mut() {
                    fields.remove(ID_FIELD);
                }
                (None, WriteOperation::Create, payload)
            }
            Self::Remove { id } => (Some(id.clone()), WriteOperation::Remove, Value::Null),
        };
        WriteRequest {
            resource_kind: kind.to_string(),
            id,
            operation,
            payload,
        }
    }

    /// Row inserted into lists for a create.
    fn synthetic_row(&self) -> Option<Value> {
        let Self::Create { temp_id, record } = self else {
            return None;
        };
        let mut row = record.clone();
        if let Some(fields) = row.as_object_mut() {
            fields.insert(ID_FIELD.to_string(), Value::String(temp_id.clone()));
        }
        Some(row)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationOptions {
    /// Keep the optimistic value after success instead of writing the server's record.
    pub keep_optimistic: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Applied,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpPhase {
    Idle,
    Applying,
    Committing,
    RollingBack,
}

/// Bookkeeping for one in-flight mutation; dropped once it resolves.
#[derive(Debug, Clone)]
pub struct PendingOptimisticOp {
    pub id: Uuid,
    pub kind: ResourceKind,
    pub target_id: String,
    pub affected_keys: BTreeSet<CacheKey>,
    pub snapshots: Vec<Snapshot>,
    pub mutation: Mutation,
    pub status: OpStatus,
    pub phase: OpPhase,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
    pub op_id: Uuid,
    pub kind: ResourceKind,
    /// Final id of the resource; the server id for creates.
    pub id: String,
    /// Canonical record returned by the server.
    pub value: Value,
    pub affected_keys: BTreeSet<CacheKey>,
}

type ResourceLocks = HashMap<(ResourceKind, String), Arc<tokio::sync::Mutex<()>>>;

pub struct OptimisticEngine {
    client: QueryClient,
    remote: Arc<dyn RemoteSource>,
    locks: Mutex<ResourceLocks>,
    pending: Mutex<HashMap<Uuid, PendingOptimisticOp>>,
}

impl OptimisticEngine {
    pub fn new(client: QueryClient, remote: Arc<dyn RemoteSource>) -> Self {
        Self {
            client,
            remote,
            locks: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Mutations still awaiting their remote outcome.
    pub fn pending(&self) -> Vec<PendingOptimisticOp> {
        mutex_lock(&self.pending, SOURCE, "pending")
            .values()
            .cloned()
            .collect()
    }

    #[instrument(skip(self, kind, mutation, options), fields(kind = %kind, id = mutation.target_id()))]
    pub async fn mutate(
        &self,
        kind: ResourceKind,
        mutation: Mutation,
        options: MutationOptions,
    ) -> Result<MutationOutcome, MutationError> {
        mutation.validate()?;
        let target = mutation.target_id().to_string();

        let lock = self.resource_lock(&kind, &target);
        let guard = lock.lock().await;
        let outcome = self.run(&kind, mutation, options).await;
        drop(guard);
        drop(lock);
        self.release_lock(&kind, &target);

        outcome
    }

    async fn run(
        &self,
        kind: &ResourceKind,
        mutation: Mutation,
        options: MutationOptions,
    ) -> Result<MutationOutcome, MutationError> {
        let cache = self.client.cache();
        let memory = cache.memory();
        let config = cache.config();
        let policy = config.entry_policy(kind);
        let target = mutation.target_id().to_string();
        let detail = CacheKey::detail(kind.clone(), target.clone());
        let op_id = Uuid::new_v4();

        // Applying: snapshot and rewrite in one cache step, then mirror.
        let snapshots = memory.apply_optimistic(
            |key| key.is_list_of(kind) || key == &detail,
            &[],
            policy,
            |key, current| optimistic_edit(&mutation, key, current),
        );
        let affected: BTreeSet<CacheKey> = snapshots.iter().map(|s| s.key.clone()).collect();
        self.track(PendingOptimisticOp {
            id: op_id,
            kind: kind.clone(),
            target_id: target.clone(),
            affected_keys: affected.clone(),
            snapshots: snapshots.clone(),
            mutation: mutation.clone(),
            status: OpStatus::Applied,
            phase: OpPhase::Applying,
        });
        cache.persist_keys(&affected).await;
        debug!(op_id = %op_id, affected = affected.len(), "Optimistic change applied");

        let request = mutation.request(kind);
        let response = tokio::time::timeout(config.remote_timeout(), self.remote.write(&request))
            .await
            .unwrap_or(Err(RemoteError::Timeout));

        let result = match response {
            Ok(canonical) => {
                self.set_phase(op_id, OpPhase::Committing);
                let id = self
                    .commit(kind, &mutation, &canonical, options, &affected)
                    .await;
                info!(op_id = %op_id, id = %id, "Mutation committed");
                Ok(MutationOutcome {
                    op_id,
                    kind: kind.clone(),
                    id,
                    value: canonical,
                    affected_keys: affected.clone(),
                })
            }
            Err(error) => {
                self.set_phase(op_id, OpPhase::RollingBack);
                self.roll_back(&mutation, &snapshots, &affected).await;
                counter!(METRIC_MUTATION_ROLLBACK, "kind" => kind.to_string()).increment(1);
                warn!(op_id = %op_id, error = %error, "Mutation failed; rolled back");
                Err(match error {
                    RemoteError::Timeout => MutationError::Timeout {
                        kind: kind.to_string(),
                        id: target.clone(),
                    },
                    source => MutationError::Remote {
                        kind: kind.to_string(),
                        id: target.clone(),
                        source,
                    },
                })
            }
        };

        for key in &affected {
            memory.unpin(key);
        }
        mutex_lock(&self.pending, SOURCE, "finish").remove(&op_id);
        result
    }

    /// Lands the server's answer; returns the final resource id.
    async fn commit(
        &self,
        kind: &ResourceKind,
        mutation: &Mutation,
        canonical: &Value,
        options: MutationOptions,
        affected: &BTreeSet<CacheKey>,
    ) -> String {
        let cache = self.client.cache();
        let memory = cache.memory();
        let policy = cache.config().entry_policy(kind);

        match mutation {
            Mutation::Update { id, .. } => {
                if options.keep_optimistic {
                    return id.clone();
                }
                let detail = CacheKey::detail(kind.clone(), id.clone());
                let lists = memory.edit_where(
                    |key| key.is_list_of(kind),
                    &[],
                    policy,
                    |_, current| match (current, canonical.as_object()) {
                        (Some(value), Some(fields)) => {
                            replace_row(value, id, |row| merge_fields(row, fields))
                        }
                        _ => Edit::Keep,
                    },
                );
                if affected.contains(&detail) && memory.contains(&detail) {
                    cache.write(detail, canonical.clone()).await;
                }
                cache.persist_keys(&lists).await;
                id.clone()
            }
            Mutation::Create { temp_id, .. } => {
                let final_id = row_id(canonical).unwrap_or_else(|| {
                    warn!(temp_id = %temp_id, "Created record came back without an id");
                    temp_id.clone()
                });
                let lists = memory.edit_where(
                    |key| key.is_list_of(kind),
                    &[],
                    policy,
                    |_, current| match current {
                        Some(value) => replace_row(value, temp_id, |row| {
                            if options.keep_optimistic || !canonical.is_object() {
                                if let Some(fields) = row.as_object_mut() {
                                    fields.insert(
                                        ID_FIELD.to_string(),
                                        Value::String(final_id.clone()),
                                    );
                                }
                            } else {
                                *row = canonical.clone();
                            }
                        }),
                        None => Edit::Keep,
                    },
                );
                cache.persist_keys(&lists).await;
                if !options.keep_optimistic {
                    cache
                        .write(CacheKey::detail(kind.clone(), final_id.clone()), canonical.clone())
                        .await;
                }
                final_id
            }
            Mutation::Remove { id } => {
                cache.purge_reference(kind, id).await;
                id.clone()
            }
        }
    }

    async fn roll_back(
        &self,
        mutation: &Mutation,
        snapshots: &[Snapshot],
        affected: &BTreeSet<CacheKey>,
    ) {
        let cache = self.client.cache();
        let memory = cache.memory();

        for snapshot in snapshots {
            memory.rollback(snapshot, |current| repair(mutation, snapshot, current));
        }
        cache.persist_keys(affected).await;

        if cache.config().invalidate_on_rollback {
            let refetch = memory.invalidate(|key| affected.contains(key));
            self.client.spawn_refetches(refetch);
        }
    }

    fn resource_lock(&self, kind: &ResourceKind, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        mutex_lock(&self.locks, SOURCE, "resource_lock")
            .entry((kind.clone(), id.to_string()))
            .or_default()
            .clone()
    }

    fn release_lock(&self, kind: &ResourceKind, id: &str) {
        let mut locks = mutex_lock(&self.locks, SOURCE, "release_lock");
        let key = (kind.clone(), id.to_string());
        if locks
            .get(&key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&key);
        }
    }

    fn track(&self, op: PendingOptimisticOp) {
        mutex_lock(&self.pending, SOURCE, "track").insert(op.id, op);
    }

    fn set_phase(&self, op_id: Uuid, phase: OpPhase) {
        if let Some(op) = mutex_lock(&self.pending, SOURCE, "set_phase").get_mut(&op_id) {
            op.phase = phase;
            op.status = match phase {
                OpPhase::Committing => OpStatus::Committed,
                OpPhase::RollingBack => OpStatus::RolledBack,
                OpPhase::Idle | OpPhase::Applying => op.status,
            };
        }
    }
}

/// The speculative change for one cached key.
fn optimistic_edit(mutation: &Mutation, key: &CacheKey, current: Option<&Value>) -> Edit {
    let Some(current) = current else {
        return Edit::Keep;
    };
    match mutation {
        Mutation::Update { id, changes } => {
            if key.is_list() {
                replace_row(current, id, |row| merge_fields(row, changes))
            } else {
                let mut next = current.clone();
                merge_fields(&mut next, changes);
                Edit::Replace(next)
            }
        }
        Mutation::Create { .. } => {
            let Some(row) = mutation.synthetic_row() else {
                return Edit::Keep;
            };
            if !key.is_list() {
                return Edit::Keep;
            }
            let mut next = current.clone();
            let Some(rows) = list_rows_mut(&mut next) else {
                return Edit::Keep;
            };
            rows.push(row);
            adjust_total(&mut next, 1);
            Edit::Replace(next)
        }
        Mutation::Remove { id } => {
            if !key.is_list() {
                return Edit::Remove;
            }
            let mut next = current.clone();
            let Some(rows) = list_rows_mut(&mut next) else {
                return Edit::Keep;
            };
            let before = rows.len();
            rows.retain(|row| !row_has_id(row, id));
            if rows.len() == before {
                return Edit::Keep;
            }
            adjust_total(&mut next, -1);
            Edit::Replace(next)
        }
    }
}

/// Undoes only this mutation on top of a value something else has since rewritten.
fn repair(mutation: &Mutation, snapshot: &Snapshot, current: &Value) -> Edit {
    if !snapshot.key.is_list() {
        // A detail rewritten since apply holds newer server data.
        return Edit::Keep;
    }
    let prior_rows = snapshot
        .prior
        .as_ref()
        .and_then(|entry| list_rows(&entry.value));

    match mutation {
        Mutation::Update { id, .. } => {
            let Some(prior_row) = prior_rows.and_then(|rows| rows.iter().find(|r| row_has_id(r, id)))
            else {
                return Edit::Keep;
            };
            replace_row(current, id, |row| *row = prior_row.clone())
        }
        Mutation::Create { temp_id, .. } => {
            let mut next = current.clone();
            let Some(rows) = list_rows_mut(&mut next) else {
                return Edit::Keep;
            };
            let before = rows.len();
            rows.retain(|row| !row_has_id(row, temp_id));
            if rows.len() == before {
                return Edit::Keep;
            }
            adjust_total(&mut next, -1);
            Edit::Replace(next)
        }
        Mutation::Remove { id } => {
            let Some((index, prior_row)) = prior_rows.and_then(|rows| {
                rows.iter()
                    .enumerate()
                    .find(|(_, row)| row_has_id(row, id))
            }) else {
                return Edit::Keep;
            };
            let mut next = current.clone();
            let Some(rows) = list_rows_mut(&mut next) else {
                return Edit::Keep;
            };
            if rows.iter().any(|row| row_has_id(row, id)) {
                return Edit::Keep;
            }
            rows.insert(index.min(rows.len()), prior_row.clone());
            adjust_total(&mut next, 1);
            Edit::Replace(next)
        }
    }
}

/// Rewrites the row with `id` in a list value; `Keep` when the list lacks it.
fn replace_row(list: &Value, id: &str, update: impl FnOnce(&mut Value)) -> Edit {
    let mut next = list.clone();
    let Some(row) = list_rows_mut(&mut next).and_then(|rows| rows.iter_mut().find(|row| row_has_id(row, id)))
    else {
        return Edit::Keep;
    };
    update(row);
    Edit::Replace(next)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn changes(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn validation_rejects_empty_updates_and_non_object_creates() {
        let empty = Mutation::Update {
            id: "P1".into(),
            changes: Map::new(),
        };
        let scalar = Mutation::Create {
            temp_id: "tmp-1".into(),
            record: json!(3),
        };
        let blank = Mutation::Remove { id: String::new() };

        assert!(matches!(empty.validate(), Err(MutationError::Invalid { .. })));
        assert!(matches!(scalar.validate(), Err(MutationError::Invalid { .. })));
        assert!(matches!(blank.validate(), Err(MutationError::Invalid { .. })));
    }

    #[test]
    fn create_request_drops_temporary_id() {
        let mutation = Mutation::Create {
            temp_id: "tmp-1".into(),
            record: json!({ "id": "tmp-1", "name": "Gamma" }),
        };
        let request = mutation.request(&ResourceKind::from("project"));
        assert_eq!(request.id, None);
        assert_eq!(request.operation, WriteOperation::Create);
        assert_eq!(request.payload, json!({ "name": "Gamma" }));
    }

    #[test]
    fn update_edits_matching_row_only() {
        let mutation = Mutation::Update {
            id: "P1".into(),
            changes: changes(json!({ "name": "Beta" })),
        };
        let list = CacheKey::list("project", json!({}));
        let value = json!({ "data": [{ "id": "P1", "name": "Alpha" }, { "id": "P2", "name": "Other" }] });

        let Edit::Replace(next) = optimistic_edit(&mutation, &list, Some(&value)) else {
            panic!("row should be edited");
        };
        assert_eq!(next["data"][0]["name"], "Beta");
        assert_eq!(next["data"][1]["name"], "Other");

        let unrelated = json!([{ "id": "P3" }]);
        assert_eq!(optimistic_edit(&mutation, &list, Some(&unrelated)), Edit::Keep);
    }

    #[test]
    fn create_appends_synthetic_row_and_bumps_total() {
        let mutation = Mutation::Create {
            temp_id: "tmp-1".into(),
            record: json!({ "name": "Gamma" }),
        };
        let list = CacheKey::list("project", json!({}));
        let value = json!({ "data": [{ "id": "P1" }], "total": 1 });

        let Edit::Replace(next) = optimistic_edit(&mutation, &list, Some(&value)) else {
            panic!("row should be inserted");
        };
        assert_eq!(next["data"][1], json!({ "id": "tmp-1", "name": "Gamma" }));
        assert_eq!(next["total"], 2);
    }

    #[test]
    fn remove_drops_detail_and_row() {
        let mutation = Mutation::Remove { id: "T9".into() };
        let detail = CacheKey::detail("task", "T9");
        let list = CacheKey::list("task", json!({}));

        assert_eq!(
            optimistic_edit(&mutation, &detail, Some(&json!({ "id": "T9" }))),
            Edit::Remove
        );
        let Edit::Replace(next) =
            optimistic_edit(&mutation, &list, Some(&json!([{ "id": "T1" }, { "id": "T9" }])))
        else {
            panic!("row should be removed");
        };
        assert_eq!(next, json!([{ "id": "T1" }]));
    }

    #[test]
    fn repair_reinserts_removed_row_at_prior_position() {
        use time::macros::datetime;

        use crate::domain::entry::{CacheEntry, EntryPolicy};

        let list = CacheKey::list("task", json!({}));
        let prior = CacheEntry::fresh(
            list.clone(),
            json!([{ "id": "T1" }, { "id": "T9" }, { "id": "T2" }]),
            EntryPolicy {
                stale_after: std::time::Duration::from_secs(1),
                evict_after: std::time::Duration::from_secs(2),
            },
            datetime!(2026-01-01 0:00 UTC),
        );
        let snapshot = Snapshot {
            key: list,
            prior: Some(prior),
            applied: Some(json!([{ "id": "T1" }, { "id": "T2" }])),
        };
        let mutation = Mutation::Remove { id: "T9".into() };

        let current = json!([{ "id": "T1" }, { "id": "T2" }, { "id": "T3" }]);
        let Edit::Replace(next) = repair(&mutation, &snapshot, &current) else {
            panic!("row should be restored");
        };
        assert_eq!(
            next,
            json!([{ "id": "T1" }, { "id": "T9" }, { "id": "T2" }, { "id": "T3" }])
        );
    }
}
