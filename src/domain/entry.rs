//! Cache entries and their freshness bookkeeping.

use std::time::Duration;

use serde_json::Value;
use time::OffsetDateTime;

use super::keys::CacheKey;

/// Lifecycle status of a cache entry.
///
/// Transitions: Fresh → Stale (time or invalidation), Fresh/Stale → Fetching
/// (refetch issued), Fetching → Fresh (refetch resolved) or Stale (refetch failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryStatus {
    Fresh,
    Stale,
    Fetching,
}

impl EntryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::Fetching => "fetching",
        }
    }
}

/// Staleness and eviction windows applied when an entry is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPolicy {
    pub stale_after: Duration,
    pub evict_after: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: Value,
    pub fetched_at: OffsetDateTime,
    pub stale_after: Duration,
    pub evict_after: Duration,
    pub status: EntryStatus,
    /// Message of the last failed refetch; cleared by the next successful write.
    pub last_error: Option<String>,
}

impl CacheEntry {
    pub fn fresh(key: CacheKey, value: Value, policy: EntryPolicy, now: OffsetDateTime) -> Self {
        Self {
            key,
            value,
            fetched_at: now,
            stale_after: policy.stale_after,
            evict_after: policy.evict_after,
            status: EntryStatus::Fresh,
            last_error: None,
        }
    }

    pub fn age(&self, now: OffsetDateTime) -> Duration {
        Duration::try_from(now - self.fetched_at).unwrap_or(Duration::ZERO)
    }

    /// Status as observed at `now`: a Fresh entry past `stale_after` reads as Stale.
    pub fn effective_status(&self, now: OffsetDateTime) -> EntryStatus {
        match self.status {
            EntryStatus::Fresh if self.age(now) > self.stale_after => EntryStatus::Stale,
            status => status,
        }
    }

    pub fn is_stale(&self, now: OffsetDateTime) -> bool {
        self.effective_status(now) == EntryStatus::Stale
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.age(now) > self.evict_after
    }

    pub fn policy(&self) -> EntryPolicy {
        EntryPolicy {
            stale_after: self.stale_after,
            evict_after: self.evict_after,
        }
    }
}
