use async_trait::async_trait;
use time::OffsetDateTime;

use crate::{
    application::repos::{DurableStore, StoreError},
    domain::{
        keys::CacheKey,
        records::{DurableRecord, ScanFilter},
    },
};

use super::{SqliteStore, from_millis, map_sqlx_error, to_millis, util::record_table};

#[derive(sqlx::FromRow)]
struct RecordRow {
    id: String,
    cache_key: String,
    value: String,
    fetched_at: i64,
    synced_at: i64,
}

impl TryFrom<RecordRow> for DurableRecord {
    type Error = StoreError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        let key: CacheKey =
            serde_json::from_str(&row.cache_key).map_err(StoreError::serialization)?;
        Ok(Self {
            id: row.id,
            key,
            value: serde_json::from_str(&row.value).map_err(StoreError::serialization)?,
            fetched_at: from_millis(row.fetched_at)?,
            synced_at: from_millis(row.synced_at)?,
        })
    }
}

impl SqliteStore {
    /// Creates the record table for `table` and registers it.
    async fn ensure_table(&self, table: &str) -> Result<String, StoreError> {
        let ident = record_table(table)?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {ident} (
                id TEXT PRIMARY KEY NOT NULL,
                cache_key TEXT NOT NULL,
                value TEXT NOT NULL,
                fetched_at INTEGER NOT NULL,
                synced_at INTEGER NOT NULL
            )"
        ))
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        sqlx::query("INSERT OR IGNORE INTO coherence_tables (name, created_at) VALUES (?, ?)")
            .bind(table)
            .bind(to_millis(OffsetDateTime::now_utc())?)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(ident)
    }

    async fn is_registered(&self, table: &str) -> Result<bool, StoreError> {
        let found: Option<(String,)> =
            sqlx::query_as("SELECT name FROM coherence_tables WHERE name = ?")
                .bind(table)
                .fetch_optional(self.pool())
                .await
                .map_err(map_sqlx_error)?;
        Ok(found.is_some())
    }

    async fn registered_tables(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM coherence_tables ORDER BY name")
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn get(&self, table: &str, id: &str) -> Result<Option<DurableRecord>, StoreError> {
        let ident = record_table(table)?;
        if !self.is_registered(table).await? {
            return Ok(None);
        }

        let row: Option<RecordRow> = sqlx::query_as(&format!(
            "SELECT id, cache_key, value, fetched_at, synced_at FROM {ident} WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        row.map(DurableRecord::try_from).transpose()
    }

    async fn put(&self, table: &str, record: DurableRecord) -> Result<(), StoreError> {
        let ident = self.ensure_table(table).await?;
        let cache_key = serde_json::to_string(&record.key).map_err(StoreError::serialization)?;
        let value = serde_json::to_string(&record.value).map_err(StoreError::serialization)?;

        sqlx::query(&format!(
            "INSERT INTO {ident} (id, cache_key, value, fetched_at, synced_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET
                cache_key = excluded.cache_key,
                value = excluded.value,
                fetched_at = excluded.fetched_at,
                synced_at = excluded.synced_at"
        ))
        .bind(&record.id)
        .bind(cache_key)
        .bind(value)
        .bind(to_millis(record.fetched_at)?)
        .bind(to_millis(record.synced_at)?)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), StoreError> {
        let ident = record_table(table)?;
        if !self.is_registered(table).await? {
            return Ok(());
        }

        sqlx::query(&format!("DELETE FROM {ident} WHERE id = ?"))
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn delete_all(&self, table: &str) -> Result<(), StoreError> {
        let ident = record_table(table)?;
        if !self.is_registered(table).await? {
            return Ok(());
        }

        sqlx::query(&format!("DELETE FROM {ident}"))
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn scan(
        &self,
        table: &str,
        filter: ScanFilter,
    ) -> Result<Vec<DurableRecord>, StoreError> {
        let ident = record_table(table)?;
        if !self.is_registered(table).await? {
            return Ok(Vec::new());
        }

        let since = filter.synced_since.map(to_millis).transpose()?;
        let rows: Vec<RecordRow> = sqlx::query_as(&format!(
            "SELECT id, cache_key, value, fetched_at, synced_at FROM {ident}
             WHERE ?1 IS NULL OR synced_at >= ?1
             ORDER BY id"
        ))
        .bind(since)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(DurableRecord::try_from).collect()
    }

    async fn tables(&self) -> Result<Vec<String>, StoreError> {
        let mut tables = Vec::new();
        for table in self.registered_tables().await? {
            let ident = record_table(&table)?;
            let (populated,): (i64,) =
                sqlx::query_as(&format!("SELECT EXISTS (SELECT 1 FROM {ident})"))
                    .fetch_one(self.pool())
                    .await
                    .map_err(map_sqlx_error)?;
            if populated != 0 {
                tables.push(table);
            }
        }
        Ok(tables)
    }
}
