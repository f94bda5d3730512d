//! Durable counterparts of cache entries.

use serde_json::Value;
use time::OffsetDateTime;

use super::entry::CacheEntry;
use super::keys::CacheKey;

/// Persisted copy of a cache entry. One logical table per resource kind,
/// primary-keyed by [`CacheKey::storage_id`].
#[derive(Debug, Clone, PartialEq)]
pub struct DurableRecord {
    pub id: String,
    pub key: CacheKey,
    pub value: Value,
    pub fetched_at: OffsetDateTime,
    /// When this record was last written to durable storage; drives the hydration age filter.
    pub synced_at: OffsetDateTime,
}

impl DurableRecord {
    pub fn from_entry(entry: &CacheEntry, synced_at: OffsetDateTime) -> Self {
        Self {
            id: entry.key.storage_id(),
            key: entry.key.clone(),
            value: entry.value.clone(),
            fetched_at: entry.fetched_at,
            synced_at,
        }
    }

    /// Logical table this record belongs to.
    pub fn table(&self) -> &str {
        self.key.kind.as_str()
    }
}

/// Row filter for durable scans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Only records with `synced_at >= synced_since`.
    pub synced_since: Option<OffsetDateTime>,
}

impl ScanFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn synced_since(since: OffsetDateTime) -> Self {
        Self {
            synced_since: Some(since),
        }
    }

    pub fn accepts(&self, record: &DurableRecord) -> bool {
        self.synced_since
            .is_none_or(|since| record.synced_at >= since)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use time::macros::datetime;

    use super::*;
    use crate::domain::entry::EntryPolicy;

    #[test]
    fn record_mirrors_entry() {
        let now = datetime!(2026-03-01 08:00 UTC);
        let entry = CacheEntry::fresh(
            CacheKey::detail("project", "P1"),
            json!({ "id": "P1" }),
            EntryPolicy {
                stale_after: Duration::from_secs(1),
                evict_after: Duration::from_secs(2),
            },
            now,
        );

        let record = DurableRecord::from_entry(&entry, now);
        assert_eq!(record.id, "project/detail/P1");
        assert_eq!(record.table(), "project");
        assert_eq!(record.value, entry.value);
    }

    #[test]
    fn filter_bounds_on_synced_at() {
        let now = datetime!(2026-03-01 08:00 UTC);
        let record = DurableRecord {
            id: "x".to_string(),
            key: CacheKey::singleton("config"),
            value: json!({}),
            fetched_at: now,
            synced_at: now,
        };

        assert!(ScanFilter::all().accepts(&record));
        assert!(ScanFilter::synced_since(now).accepts(&record));
        assert!(!ScanFilter::synced_since(now + Duration::from_secs(1)).accepts(&record));
    }
}
