//! Non-reactive reads for call sites that cannot subscribe.
//!
//! Before the session gate opens `None` is a legitimate answer for
//! session-level keys. After it opens every required key is present; a miss
//! there means the gate invariant was broken and is logged as an error.

use std::sync::Arc;

use serde_json::Value;
use tracing::error;

use crate::domain::keys::{CacheKey, ResourceKind};

use super::gate::SessionGate;
use super::store::QueryCache;
use super::synced::SyncedCache;

#[derive(Clone)]
pub struct SyncAccessor {
    cache: Arc<SyncedCache>,
    gate: Arc<SessionGate>,
}

impl SyncAccessor {
    pub fn new(cache: Arc<SyncedCache>, gate: Arc<SessionGate>) -> Self {
        Self { cache, gate }
    }

    fn memory(&self) -> &QueryCache {
        self.cache.memory()
    }

    pub fn is_open(&self) -> bool {
        self.gate.is_open()
    }

    pub fn get_sync(&self, key: &CacheKey) -> Option<Value> {
        let value = self.memory().value(key);
        if value.is_none() && self.gate.is_open() && self.gate.is_required(key) {
            error!(key = %key, "Required session key missing after gate opened");
        }
        value
    }

    /// Display name of `id` from the reference table of `kind`.
    pub fn reference_name(&self, kind: &ResourceKind, id: &str) -> Option<String> {
        let table = self.get_sync(&CacheKey::references(kind.clone()))?;
        table.get(id)?.as_str().map(str::to_string)
    }
}
