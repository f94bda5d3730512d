//! Collaborator traits: the durable store and the remote service.

use async_trait::async_trait;
use coherence_wire::{ReadResponse, WriteRequest};
use serde_json::Value;
use thiserror::Error;

use crate::domain::keys::CacheKey;
use crate::domain::records::{DurableRecord, ScanFilter};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("durable store i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to (de)serialize durable record: {0}")]
    Serialization(String),
    #[error("durable store backend error: {0}")]
    Backend(String),
    #[error("invalid durable table name `{table}`")]
    InvalidTable { table: String },
}

impl StoreError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }

    pub fn serialization(err: impl std::fmt::Display) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Keyed persistent store with one logical table per persisted resource kind.
///
/// Only single-record atomicity is required.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, table: &str, id: &str) -> Result<Option<DurableRecord>, StoreError>;

    async fn put(&self, table: &str, record: DurableRecord) -> Result<(), StoreError>;

    async fn delete(&self, table: &str, id: &str) -> Result<(), StoreError>;

    async fn delete_all(&self, table: &str) -> Result<(), StoreError>;

    async fn scan(&self, table: &str, filter: ScanFilter)
    -> Result<Vec<DurableRecord>, StoreError>;

    /// Names of every table holding at least one record.
    async fn tables(&self) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote responded with status {code}")]
    Status { code: u16 },
    #[error("remote transport failure: {0}")]
    Transport(String),
    #[error("remote call timed out")]
    Timeout,
    #[error("failed to decode remote response: {0}")]
    Decode(String),
    #[error("remote source unavailable: {0}")]
    Unavailable(String),
}

impl RemoteError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn decode(err: impl std::fmt::Display) -> Self {
        Self::Decode(err.to_string())
    }

    /// True for non-2xx responses and timeouts: both mean "the server did not accept this".
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Status { .. } | Self::Timeout)
    }

    /// Reads retry on transport trouble and server-side errors, not on client errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { code } => *code >= 500 || *code == 429,
            Self::Transport(_) | Self::Timeout | Self::Unavailable(_) => true,
            Self::Decode(_) => false,
        }
    }
}

/// Remote read and write endpoints.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Runs the query addressed by `key`.
    async fn read(&self, key: &CacheKey) -> Result<ReadResponse, RemoteError>;

    /// Applies a create, partial update or removal and returns the canonical record.
    async fn write(&self, request: &WriteRequest) -> Result<Value, RemoteError>;
}
