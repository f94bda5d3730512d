//! Fetch and refetch through the remote source.
//!
//! Reads return cached data immediately and refresh stale entries in the
//! background; only a read with nothing cached awaits the remote. Every fetch
//! carries a generation ticket so a superseded result never overwrites a
//! newer one. Reference names from any response are merged, never replaced.

use std::sync::Arc;

use coherence_wire::ReadResponse;
use metrics::counter;
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::application::repos::{RemoteError, RemoteSource};
use crate::domain::entry::{CacheEntry, EntryStatus};
use crate::domain::keys::{CacheKey, KeyScope, ResourceKind};
use crate::domain::payload::list_envelope;
use crate::domain::references::{merge_into_value, names_from_payload};

use super::synced::SyncedCache;

const METRIC_REFETCH: &str = "coherence_refetch_total";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetching {key} failed after {attempts} attempt(s): {source}")]
    Remote {
        key: String,
        attempts: u32,
        #[source]
        source: RemoteError,
    },
    #[error("fetch of {key} was superseded and nothing is cached")]
    Superseded { key: String },
}

impl FetchError {
    pub fn remote_error(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote { source, .. } => Some(source),
            Self::Superseded { .. } => None,
        }
    }
}

#[derive(Clone)]
pub struct QueryClient {
    cache: Arc<SyncedCache>,
    remote: Arc<dyn RemoteSource>,
}

impl QueryClient {
    pub fn new(cache: Arc<SyncedCache>, remote: Arc<dyn RemoteSource>) -> Self {
        Self { cache, remote }
    }

    pub fn cache(&self) -> &Arc<SyncedCache> {
        &self.cache
    }

    /// Reactive read.
    ///
    /// Fresh and in-flight entries are returned as is. Stale entries are
    /// returned and refreshed in the background. Absent entries are fetched
    /// and awaited.
    pub async fn read(&self, key: &CacheKey) -> Result<CacheEntry, FetchError> {
        match self.cache.memory().read(key) {
            Some(entry) if entry.status == EntryStatus::Stale => {
                self.spawn_refetch(key.clone());
                Ok(entry)
            }
            Some(entry) => Ok(entry),
            None => self.fetch(key).await,
        }
    }

    /// Fetches `key` now and lands the result.
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn fetch(&self, key: &CacheKey) -> Result<CacheEntry, FetchError> {
        let memory = self.cache.memory();
        let ticket = memory.begin_fetch(key);
        counter!(METRIC_REFETCH, "kind" => key.kind.to_string()).increment(1);

        let response = match self.read_with_retry(key).await {
            Ok(response) => response,
            Err((attempts, source)) => {
                let flagged = memory.fail_fetch(&ticket, &source.to_string());
                warn!(
                    attempts,
                    error = %source,
                    kept_stale = flagged.is_some(),
                    "Fetch failed"
                );
                return Err(FetchError::Remote {
                    key: key.to_string(),
                    attempts,
                    source,
                });
            }
        };

        self.merge_response_references(&response).await;

        let policy = self.cache.config().entry_policy(&key.kind);
        let landed = match &key.scope {
            KeyScope::References => {
                let names = names_from_payload(&response.data);
                Some(memory.complete_merge(&ticket, policy, json!({}), |current| {
                    merge_into_value(current, &names)
                }))
            }
            KeyScope::List { .. } => {
                memory.complete_fetch(&ticket, list_envelope(&response), policy)
            }
            KeyScope::Detail { .. } | KeyScope::Singleton => {
                memory.complete_fetch(&ticket, response.data, policy)
            }
        };

        match landed {
            Some(entry) => {
                self.cache.persist_entry(&entry).await;
                Ok(entry)
            }
            None => memory
                .entry(key)
                .ok_or_else(|| FetchError::Superseded {
                    key: key.to_string(),
                }),
        }
    }

    /// Refetches `key` on a background task; failures are logged.
    pub fn spawn_refetch(&self, key: CacheKey) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(error) = client.fetch(&key).await {
                debug!(key = %key, error = %error, "Background refetch failed");
            }
        })
    }

    pub fn spawn_refetches(&self, keys: Vec<CacheKey>) -> Vec<JoinHandle<()>> {
        keys.into_iter().map(|key| self.spawn_refetch(key)).collect()
    }

    async fn merge_response_references(&self, response: &ReadResponse) {
        let Some(reference_names) = &response.reference_names else {
            return;
        };
        for (kind, names) in reference_names {
            if names.is_empty() {
                continue;
            }
            self.cache
                .merge_references(&ResourceKind::from(kind.as_str()), names)
                .await;
        }
    }

    /// Bounded attempts with linear backoff; each attempt is capped by the remote timeout.
    async fn read_with_retry(&self, key: &CacheKey) -> Result<ReadResponse, (u32, RemoteError)> {
        let config = self.cache.config();
        let attempts = config.fetch_retry_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = tokio::time::timeout(config.remote_timeout(), self.remote.read(key))
                .await
                .unwrap_or(Err(RemoteError::Timeout));
            match outcome {
                Ok(response) => return Ok(response),
                Err(error) if attempt < attempts && error.is_retryable() => {
                    debug!(attempt, error = %error, "Retrying remote read");
                    tokio::time::sleep(config.retry_backoff() * attempt).await;
                }
                Err(error) => return Err((attempt, error)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use coherence_wire::WriteRequest;
    use serde_json::{Value, json};
    use time::macros::datetime;

    use super::*;
    use crate::application::clock::ManualClock;
    use crate::cache::config::CacheConfig;
    use crate::cache::store::QueryCache;
    use crate::domain::references::ReferenceTable;
    use crate::infra::memory::MemoryStore;

    #[derive(Default)]
    struct ScriptedRemote {
        responses: Mutex<VecDeque<Result<ReadResponse, RemoteError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedRemote {
        fn push(&self, response: Result<ReadResponse, RemoteError>) {
            self.responses.lock().expect("lock").push_back(response);
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().expect("lock")
        }
    }

    #[async_trait]
    impl RemoteSource for ScriptedRemote {
        async fn read(&self, _key: &CacheKey) -> Result<ReadResponse, RemoteError> {
            *self.calls.lock().expect("lock") += 1;
            self.responses
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or(Err(RemoteError::Unavailable("script exhausted".into())))
        }

        async fn write(&self, _request: &WriteRequest) -> Result<Value, RemoteError> {
            Err(RemoteError::Unavailable("read-only".into()))
        }
    }

    fn client(config: CacheConfig) -> (Arc<ScriptedRemote>, QueryClient) {
        let clock = Arc::new(ManualClock::new(datetime!(2026-05-01 09:00 UTC)));
        let cache = Arc::new(SyncedCache::new(
            QueryCache::new(clock),
            Arc::new(MemoryStore::new()),
            Arc::new(config),
        ));
        let remote = Arc::new(ScriptedRemote::default());
        (remote.clone(), QueryClient::new(cache, remote))
    }

    fn fast_retries() -> CacheConfig {
        CacheConfig {
            fetch_retry_backoff_ms: 1,
            ..CacheConfig::default()
        }
    }

    #[tokio::test]
    async fn absent_read_awaits_fetch_and_stores_list_envelope() {
        let (remote, client) = client(fast_retries());
        remote.push(Ok(
            ReadResponse::new(json!([{ "id": "P1", "name": "Alpha" }])).with_total(1)
        ));
        let key = CacheKey::list("project", json!({ "page": 1 }));

        let entry = client.read(&key).await.expect("fetched");

        assert_eq!(entry.status, EntryStatus::Fresh);
        assert_eq!(
            entry.value,
            json!({ "data": [{ "id": "P1", "name": "Alpha" }], "total": 1 })
        );
    }

    #[tokio::test]
    async fn reference_names_are_merged_from_any_response() {
        let (remote, client) = client(fast_retries());
        let mut employees = BTreeMap::new();
        employees.insert("E1".to_string(), "Ada".to_string());
        let mut names = BTreeMap::new();
        names.insert("employee".to_string(), employees);
        remote.push(Ok(ReadResponse::new(json!({ "id": "T1" })).with_reference_names(names)));

        client
            .fetch(&CacheKey::detail("task", "T1"))
            .await
            .expect("fetched");

        let table = client
            .cache()
            .memory()
            .value(&CacheKey::references("employee"))
            .map(|value| ReferenceTable::from_value(&value))
            .expect("table merged");
        assert_eq!(table.get("E1"), Some("Ada"));
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let (remote, client) = client(fast_retries());
        remote.push(Err(RemoteError::transport("reset")));
        remote.push(Ok(ReadResponse::new(json!({ "id": "P1" }))));

        let entry = client
            .fetch(&CacheKey::detail("project", "P1"))
            .await
            .expect("second attempt lands");
        assert_eq!(entry.value, json!({ "id": "P1" }));
        assert_eq!(remote.calls(), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (remote, client) = client(fast_retries());
        remote.push(Err(RemoteError::Status { code: 404 }));

        let err = client
            .fetch(&CacheKey::detail("project", "missing"))
            .await
            .expect_err("404 surfaces");
        assert!(matches!(err, FetchError::Remote { attempts: 1, .. }));
        assert_eq!(remote.calls(), 1);
    }

    #[tokio::test]
    async fn failure_keeps_last_good_value_flagged() {
        let (remote, client) = client(fast_retries());
        let key = CacheKey::detail("project", "P1");
        remote.push(Ok(ReadResponse::new(json!({ "name": "Alpha" }))));
        client.fetch(&key).await.expect("first fetch");

        for _ in 0..3 {
            remote.push(Err(RemoteError::transport("offline")));
        }
        let err = client.fetch(&key).await.expect_err("bounded retries surface");
        assert!(matches!(err, FetchError::Remote { attempts: 3, .. }));

        let entry = client.cache().memory().read(&key).expect("kept");
        assert_eq!(entry.value, json!({ "name": "Alpha" }));
        assert_eq!(entry.status, EntryStatus::Stale);
        assert!(entry.last_error.is_some());
    }

    #[tokio::test]
    async fn stale_read_returns_cached_value_and_refreshes() {
        let (remote, client) = client(fast_retries());
        let key = CacheKey::detail("project", "P1");
        remote.push(Ok(ReadResponse::new(json!({ "v": 1 }))));
        client.fetch(&key).await.expect("first fetch");
        client.cache().memory().invalidate(|k| k == &key);

        remote.push(Ok(ReadResponse::new(json!({ "v": 2 }))));
        let entry = client.read(&key).await.expect("served from cache");
        assert_eq!(entry.value, json!({ "v": 1 }));

        tokio::time::timeout(Duration::from_secs(1), async {
            while client.cache().memory().value(&key) != Some(json!({ "v": 2 })) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("background refetch lands");
    }

    #[tokio::test]
    async fn bulk_reference_fetch_merges_into_existing_table() {
        let (remote, client) = client(fast_retries());
        let key = CacheKey::references("employee");
        let mut incidental = BTreeMap::new();
        incidental.insert("E999".to_string(), "Late Hire".to_string());
        client
            .cache()
            .merge_references(&ResourceKind::from("employee"), &incidental)
            .await;

        remote.push(Ok(ReadResponse::new(json!({ "E1": "Ada", "E2": "Grace" }))));
        let entry = client.fetch(&key).await.expect("bulk fetch");

        assert_eq!(ReferenceTable::from_value(&entry.value).len(), 3);
    }
}
