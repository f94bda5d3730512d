//! Startup hydration from the durable store.
//!
//! Loads every persisted record still inside its kind's hydration window into
//! memory with its original fetch time, so a record past its stale window
//! comes back Stale and is refreshed on first read. Older records stay on disk untouched and are refetched on
//! demand. Hydration writes memory only; re-persisting would reset `synced_at`
//! and defeat the age bound.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use time::OffsetDateTime;
use tracing::{info, instrument, warn};

use crate::domain::keys::ResourceKind;
use crate::domain::records::{DurableRecord, ScanFilter};

use super::synced::SyncedCache;

/// Per-kind outcome of one hydration pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HydrationReport {
    pub loaded: BTreeMap<String, usize>,
    pub expired: BTreeMap<String, usize>,
    /// Tables present on disk for kinds that are no longer persisted.
    pub skipped: Vec<String>,
    /// Tables that could not be read; their kinds fall back to on-demand fetches.
    pub failed: Vec<String>,
    /// False when this call found hydration already done and did nothing.
    pub ran: bool,
}

impl HydrationReport {
    pub fn total_loaded(&self) -> usize {
        self.loaded.values().sum()
    }

    pub fn total_expired(&self) -> usize {
        self.expired.values().sum()
    }
}

pub struct HydrationCoordinator {
    cache: Arc<SyncedCache>,
    done: AtomicBool,
}

impl HydrationCoordinator {
    pub fn new(cache: Arc<SyncedCache>) -> Self {
        Self {
            cache,
            done: AtomicBool::new(false),
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Hydrates memory once per process; later calls return an empty report.
    #[instrument(skip(self))]
    pub async fn hydrate(&self) -> HydrationReport {
        if self.done.swap(true, Ordering::AcqRel) {
            return HydrationReport::default();
        }
        let report = self.pass(true).await;
        info!(
            loaded = report.total_loaded(),
            expired = report.total_expired(),
            failed = report.failed.len(),
            "Hydration complete"
        );
        report
    }

    /// Counts what a hydration would load without touching memory.
    pub async fn inspect(&self) -> HydrationReport {
        self.pass(false).await
    }

    async fn pass(&self, apply: bool) -> HydrationReport {
        let mut report = HydrationReport {
            ran: true,
            ..HydrationReport::default()
        };
        let store = self.cache.store();
        let config = self.cache.config();
        let now = self.cache.memory().now();

        let tables = match store.tables().await {
            Ok(tables) => tables,
            Err(error) => {
                self.cache.record_store_failure("tables", "*", &error);
                report.failed.push("*".to_string());
                return report;
            }
        };

        for table in tables {
            let kind = ResourceKind::from(table.as_str());
            let policy = config.policy(&kind);
            if !policy.persisted {
                report.skipped.push(table);
                continue;
            }

            let records = match store.scan(&table, ScanFilter::all()).await {
                Ok(records) => records,
                Err(error) => {
                    self.cache.record_store_failure("scan", &table, &error);
                    report.failed.push(table);
                    continue;
                }
            };

            let (fresh, expired): (Vec<DurableRecord>, Vec<DurableRecord>) = records
                .into_iter()
                .partition(|record| within_window(record, now, policy.max_hydration_age));

            if !expired.is_empty() {
                report.expired.insert(table.clone(), expired.len());
            }
            if fresh.is_empty() {
                continue;
            }
            report.loaded.insert(table.clone(), fresh.len());

            if apply {
                let entry_policy = policy.entry_policy();
                for record in fresh {
                    if record.key.kind != kind {
                        warn!(
                            table = %table,
                            key = %record.key,
                            "Durable record filed under the wrong table; skipping"
                        );
                        continue;
                    }
                    self.cache.memory().hydrate(
                        record.key,
                        record.value,
                        entry_policy,
                        record.fetched_at,
                    );
                }
            }
        }

        report
    }
}

fn within_window(
    record: &DurableRecord,
    now: OffsetDateTime,
    max_age: std::time::Duration,
) -> bool {
    // Records synced "in the future" (clock skew) count as age zero.
    let age = std::time::Duration::try_from(now - record.synced_at).unwrap_or_default();
    age <= max_age
}
