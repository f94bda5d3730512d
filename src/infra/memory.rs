//! Process-local durable store.
//!
//! Backs tests and `store.url = "memory://"` runs. Records survive only as
//! long as the store value, which is enough to exercise hydration across
//! engine instances sharing one store.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::application::repos::{DurableStore, StoreError};
use crate::cache::lock::{rw_read, rw_write};
use crate::domain::records::{DurableRecord, ScanFilter};

const SOURCE: &str = "infra::memory";

type Tables = BTreeMap<String, BTreeMap<String, DurableRecord>>;

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every mutating call fail with a backend error until switched off.
    pub fn fail_next_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        rw_read(&self.tables, SOURCE, "len")
            .values()
            .map(BTreeMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(StoreError::backend("memory store is failing writes"));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, table: &str, id: &str) -> Result<Option<DurableRecord>, StoreError> {
        Ok(rw_read(&self.tables, SOURCE, "get")
            .get(table)
            .and_then(|rows| rows.get(id))
            .cloned())
    }

    async fn put(&self, table: &str, record: DurableRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        rw_write(&self.tables, SOURCE, "put")
            .entry(table.to_string())
            .or_default()
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut tables = rw_write(&self.tables, SOURCE, "delete");
        if let Some(rows) = tables.get_mut(table) {
            rows.remove(id);
            if rows.is_empty() {
                tables.remove(table);
            }
        }
        Ok(())
    }

    async fn delete_all(&self, table: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        rw_write(&self.tables, SOURCE, "delete_all").remove(table);
        Ok(())
    }

    async fn scan(
        &self,
        table: &str,
        filter: ScanFilter,
    ) -> Result<Vec<DurableRecord>, StoreError> {
        Ok(rw_read(&self.tables, SOURCE, "scan")
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|record| filter.accepts(record))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn tables(&self) -> Result<Vec<String>, StoreError> {
        Ok(rw_read(&self.tables, SOURCE, "tables")
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(name, _)| name.clone())
            .collect())
    }
}
