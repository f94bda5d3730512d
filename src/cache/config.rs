//! Cache configuration.
//!
//! Per-resource-kind staleness, eviction and hydration windows plus the
//! knobs of the fetch, invalidation and sweep machinery. Loaded from the
//! `[cache]` section of `coherence.toml`.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::domain::entry::EntryPolicy;
use crate::domain::keys::{CacheKey, ResourceKind};

// Default values for cache configuration
const DEFAULT_STALE_AFTER_SECS: u64 = 30;
const DEFAULT_EVICT_AFTER_SECS: u64 = 5 * 60;
const DEFAULT_MAX_HYDRATION_AGE_SECS: u64 = 24 * 60 * 60;
const DEFAULT_FETCH_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_FETCH_RETRY_BACKOFF_MS: u64 = 250;
const DEFAULT_REMOTE_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_NOTIFICATION_QUEUE_CAPACITY: usize = 256;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 100;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_DRAFTS_KIND: &str = "draft";

/// Which query of a session-level kind the session prefetches.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionScope {
    /// Catalogs and global configuration.
    #[default]
    Singleton,
    /// Bulk reference-name lookup for the kind.
    References,
}

/// Overrides for one resource kind. Unset durations fall back to the cache-wide defaults.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KindSettings {
    pub stale_after_secs: Option<u64>,
    pub evict_after_secs: Option<u64>,
    pub max_hydration_age_secs: Option<u64>,
    /// Prefetched at session start and required by the session gate.
    pub session_level: bool,
    pub session_scope: SessionScope,
    /// `None` inherits `CacheConfig::persist_by_default`.
    pub persisted: Option<bool>,
}

/// Resolved policy for one resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindPolicy {
    pub stale_after: Duration,
    pub evict_after: Duration,
    pub max_hydration_age: Duration,
    pub session_level: bool,
    pub persisted: bool,
}

impl KindPolicy {
    pub fn entry_policy(&self) -> EntryPolicy {
        EntryPolicy {
            stale_after: self.stale_after,
            evict_after: self.evict_after,
        }
    }
}

/// Cache configuration from `coherence.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Staleness window for kinds without an override.
    pub default_stale_after_secs: u64,
    /// Eviction window for kinds without an override.
    pub default_evict_after_secs: u64,
    /// Global bound on the age of durable records loaded at startup.
    pub max_hydration_age_secs: u64,
    /// Whether kinds without an explicit setting are mirrored to the durable store.
    pub persist_by_default: bool,
    /// Attempts per read before the failure is surfaced.
    pub fetch_retry_attempts: u32,
    /// Linear backoff step between read attempts (ms).
    pub fetch_retry_backoff_ms: u64,
    /// Upper bound on a single remote call (ms); elapsed calls count as failures.
    pub remote_timeout_ms: u64,
    /// Capacity of the inbound change-notification channel.
    pub notification_queue_capacity: usize,
    /// Maximum notifications folded into one invalidation plan.
    pub consume_batch_limit: usize,
    /// Period of the background eviction sweep (ms).
    pub sweep_interval_ms: u64,
    /// Mark rolled-back queries stale so the next read reconciles with the server.
    pub invalidate_on_rollback: bool,
    /// Kind holding user drafts; exempt from logout-time clearing.
    pub drafts_kind: String,
    /// Per-kind overrides keyed by resource kind name.
    pub kinds: HashMap<String, KindSettings>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            default_evict_after_secs: DEFAULT_EVICT_AFTER_SECS,
            max_hydration_age_secs: DEFAULT_MAX_HYDRATION_AGE_SECS,
            persist_by_default: true,
            fetch_retry_attempts: DEFAULT_FETCH_RETRY_ATTEMPTS,
            fetch_retry_backoff_ms: DEFAULT_FETCH_RETRY_BACKOFF_MS,
            remote_timeout_ms: DEFAULT_REMOTE_TIMEOUT_MS,
            notification_queue_capacity: DEFAULT_NOTIFICATION_QUEUE_CAPACITY,
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            invalidate_on_rollback: true,
            drafts_kind: DEFAULT_DRAFTS_KIND.to_string(),
            kinds: HashMap::new(),
        }
    }
}

impl CacheConfig {
    /// Adds or replaces the override for `kind`.
    pub fn with_kind(mut self, kind: impl Into<String>, settings: KindSettings) -> Self {
        self.kinds.insert(kind.into(), settings);
        self
    }

    pub fn policy(&self, kind: &ResourceKind) -> KindPolicy {
        let settings = self.kinds.get(kind.as_str());
        let secs = |pick: fn(&KindSettings) -> Option<u64>, default: u64| {
            Duration::from_secs(settings.and_then(pick).unwrap_or(default))
        };

        KindPolicy {
            stale_after: secs(|s| s.stale_after_secs, self.default_stale_after_secs),
            evict_after: secs(|s| s.evict_after_secs, self.default_evict_after_secs),
            max_hydration_age: secs(|s| s.max_hydration_age_secs, self.max_hydration_age_secs),
            session_level: settings.is_some_and(|s| s.session_level),
            persisted: settings
                .and_then(|s| s.persisted)
                .unwrap_or(self.persist_by_default),
        }
    }

    pub fn entry_policy(&self, kind: &ResourceKind) -> EntryPolicy {
        self.policy(kind).entry_policy()
    }

    pub fn is_persisted(&self, kind: &ResourceKind) -> bool {
        self.policy(kind).persisted
    }

    pub fn is_drafts(&self, kind: &ResourceKind) -> bool {
        kind.as_str() == self.drafts_kind
    }

    /// Kinds flagged as session-level, in name order.
    pub fn session_kinds(&self) -> Vec<ResourceKind> {
        let mut kinds: Vec<ResourceKind> = self
            .kinds
            .iter()
            .filter(|(_, settings)| settings.session_level)
            .map(|(name, _)| ResourceKind::from(name.as_str()))
            .collect();
        kinds.sort();
        kinds
    }

    /// Keys a session must prefetch before its gate may open, in key order.
    pub fn session_keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self
            .kinds
            .iter()
            .filter(|(_, settings)| settings.session_level)
            .map(|(name, settings)| match settings.session_scope {
                SessionScope::Singleton => CacheKey::singleton(name.as_str()),
                SessionScope::References => CacheKey::references(name.as_str()),
            })
            .collect();
        keys.sort();
        keys
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.fetch_retry_backoff_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
