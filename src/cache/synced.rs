//! Memory tier plus its durable mirror.
//!
//! Every durable write goes through here, after the in-memory change it
//! mirrors. Durable failures are logged and flip the session into degraded
//! (memory-only) mode; they never fail the caller.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use metrics::counter;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::application::repos::{DurableStore, StoreError};
use crate::domain::entry::CacheEntry;
use crate::domain::keys::{CacheKey, ResourceKind};
use crate::domain::records::DurableRecord;
use crate::domain::references::{merge_into_value, remove_from_value};

use super::config::CacheConfig;
use super::store::{Edit, QueryCache};

const METRIC_STORE_ERROR: &str = "coherence_store_error_total";

pub struct SyncedCache {
    memory: QueryCache,
    store: Arc<dyn DurableStore>,
    config: Arc<CacheConfig>,
    degraded: AtomicBool,
}

impl SyncedCache {
    pub fn new(memory: QueryCache, store: Arc<dyn DurableStore>, config: Arc<CacheConfig>) -> Self {
        Self {
            memory,
            store,
            config,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn memory(&self) -> &QueryCache {
        &self.memory
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// True once a durable operation failed during this session.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub(crate) fn reset_degraded(&self) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            info!("Durable store re-enabled for new session");
        }
    }

    pub(crate) fn record_store_failure(&self, op: &'static str, table: &str, error: &StoreError) {
        counter!(METRIC_STORE_ERROR, "op" => op).increment(1);
        let first = !self.degraded.swap(true, Ordering::AcqRel);
        warn!(
            op,
            table,
            error = %error,
            degraded = true,
            first_failure = first,
            "Durable store operation failed; continuing in memory only"
        );
    }

    fn mirrors(&self, kind: &ResourceKind) -> bool {
        self.config.is_persisted(kind) && !self.is_degraded()
    }

    // ========================================================================
    // Mirrored writes
    // ========================================================================

    pub async fn write(&self, key: CacheKey, value: Value) -> CacheEntry {
        let policy = self.config.entry_policy(&key.kind);
        let entry = self.memory.write(key, value, policy);
        self.persist_entry(&entry).await;
        entry
    }

    pub async fn patch(
        &self,
        key: CacheKey,
        default: Value,
        updater: impl FnOnce(Value) -> Value,
    ) -> CacheEntry {
        let policy = self.config.entry_policy(&key.kind);
        let entry = self.memory.patch(key, policy, default, updater);
        self.persist_entry(&entry).await;
        entry
    }

    pub async fn remove(&self, key: &CacheKey) -> Option<CacheEntry> {
        let removed = self.memory.remove(key);
        self.delete_record(key).await;
        removed
    }

    /// Writes the current memory state of `key` through: its entry, or a delete when absent.
    pub async fn persist_key(&self, key: &CacheKey) {
        match self.memory.entry(key) {
            Some(entry) => self.persist_entry(&entry).await,
            None => self.delete_record(key).await,
        }
    }

    pub async fn persist_keys<'a>(&self, keys: impl IntoIterator<Item = &'a CacheKey>) {
        for key in keys {
            self.persist_key(key).await;
        }
    }

    pub(crate) async fn persist_entry(&self, entry: &CacheEntry) {
        if !self.mirrors(&entry.key.kind) {
            return;
        }
        let record = DurableRecord::from_entry(entry, self.memory.now());
        let table = record.table().to_string();
        if let Err(error) = self.store.put(&table, record).await {
            self.record_store_failure("put", &table, &error);
        }
    }

    async fn delete_record(&self, key: &CacheKey) {
        if !self.mirrors(&key.kind) {
            return;
        }
        if let Err(error) = self.store.delete(key.kind.as_str(), &key.storage_id()).await {
            self.record_store_failure("delete", key.kind.as_str(), &error);
        }
    }

    // ========================================================================
    // Reference lookup tables
    // ========================================================================

    /// Merges names into the reference table of `kind`. Never replaces.
    pub async fn merge_references(
        &self,
        kind: &ResourceKind,
        names: &BTreeMap<String, String>,
    ) -> CacheEntry {
        self.patch(CacheKey::references(kind.clone()), json!({}), |current| {
            merge_into_value(current, names)
        })
        .await
    }

    /// Drops `id` from the reference table of `kind`, if that table is cached.
    pub async fn purge_reference(&self, kind: &ResourceKind, id: &str) {
        let key = CacheKey::references(kind.clone());
        let policy = self.config.entry_policy(kind);
        let changed = self.memory.edit_where(
            |_| false,
            std::slice::from_ref(&key),
            policy,
            |_, current| match current {
                Some(value) if value.get(id).is_some() => {
                    Edit::Replace(remove_from_value(value.clone(), id))
                }
                _ => Edit::Keep,
            },
        );
        self.persist_keys(&changed).await;
    }

    // ========================================================================
    // Session teardown
    // ========================================================================

    /// Clears both tiers except the drafts kind.
    ///
    /// Durable clearing is attempted even in degraded mode.
    pub async fn clear_session(&self) -> Vec<CacheKey> {
        let drafts = self.config.drafts_kind.clone();
        let removed = self
            .memory
            .clear_where(|key| key.kind.as_str() != drafts);

        match self.store.tables().await {
            Ok(tables) => {
                for table in tables.iter().filter(|table| **table != drafts) {
                    if let Err(error) = self.store.delete_all(table).await {
                        self.record_store_failure("delete_all", table, &error);
                    }
                }
            }
            Err(error) => self.record_store_failure("tables", "*", &error),
        }

        debug!(removed = removed.len(), drafts_kind = %drafts, "Session caches cleared");
        removed
    }
}
