//! SQLite-backed durable store.
//!
//! Each persisted resource kind gets its own record table, created on first
//! write and listed in the `coherence_tables` registry. Timestamps are stored
//! as unix milliseconds.

mod records;
mod util;

pub use util::map_sqlx_error;

use std::str::FromStr;
use std::sync::Arc;

use sqlx::{
    query,
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
};
use time::OffsetDateTime;

use crate::application::repos::StoreError;

const MEMORY_URL: &str = "sqlite::memory:";

#[derive(Clone)]
pub struct SqliteStore {
    pool: Arc<SqlitePool>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Opens (creating if missing) the database at `url` and applies migrations.
    pub async fn open(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = Self::connect(url, max_connections).await?;
        Self::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(max_connections);
        // Every connection to an in-memory database sees its own database, and
        // the database is gone once its connection closes.
        let pool = if url == MEMORY_URL {
            pool.max_connections(1).idle_timeout(None).max_lifetime(None)
        } else {
            pool
        };
        pool.connect_with(options).await
    }

    /// Private in-memory database, for tests and throwaway runs.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        Self::open(MEMORY_URL, 1).await
    }

    pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        query("SELECT 1").execute(self.pool()).await.map(|_| ())
    }
}

fn to_millis(at: OffsetDateTime) -> Result<i64, StoreError> {
    i64::try_from(at.unix_timestamp_nanos() / 1_000_000)
        .map_err(|_| StoreError::serialization(format!("timestamp {at} out of range")))
}

fn from_millis(millis: i64) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(StoreError::serialization)
}
