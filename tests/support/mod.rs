#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use coherence::application::clock::ManualClock;
use coherence::application::engine::CoherenceEngine;
use coherence::application::repos::{DurableStore, RemoteError, RemoteSource};
use coherence::cache::CacheConfig;
use coherence::domain::keys::CacheKey;
use coherence::domain::payload::{list_rows, row_has_id};
use coherence_wire::{ReadResponse, WriteRequest};
use serde_json::Value;
use time::macros::datetime;
use tokio::sync::oneshot;

/// Remote double answering reads per key and writes in order.
///
/// Reads and writes can be held until the test releases them, which is how
/// tests pick the completion order of concurrent calls.
#[derive(Default)]
pub struct ScriptedRemote {
    reads: Mutex<HashMap<CacheKey, VecDeque<Result<ReadResponse, RemoteError>>>>,
    read_holds: Mutex<HashMap<CacheKey, oneshot::Receiver<()>>>,
    writes: Mutex<VecDeque<Result<Value, RemoteError>>>,
    write_hold: Mutex<Option<oneshot::Receiver<()>>>,
    write_log: Mutex<Vec<WriteRequest>>,
}

impl ScriptedRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on_read(&self, key: CacheKey, response: Result<ReadResponse, RemoteError>) {
        self.reads
            .lock()
            .expect("reads lock")
            .entry(key)
            .or_default()
            .push_back(response);
    }

    /// The next read of `key` waits until the returned sender fires or drops.
    pub fn hold_read(&self, key: CacheKey) -> oneshot::Sender<()> {
        let (release, held) = oneshot::channel();
        self.read_holds
            .lock()
            .expect("holds lock")
            .insert(key, held);
        release
    }

    pub fn on_write(&self, response: Result<Value, RemoteError>) {
        self.writes.lock().expect("writes lock").push_back(response);
    }

    /// The next write waits until the returned sender fires or drops.
    pub fn hold_write(&self) -> oneshot::Sender<()> {
        let (release, held) = oneshot::channel();
        *self.write_hold.lock().expect("hold lock") = Some(held);
        release
    }

    pub fn write_log(&self) -> Vec<WriteRequest> {
        self.write_log.lock().expect("log lock").clone()
    }
}

#[async_trait]
impl RemoteSource for ScriptedRemote {
    async fn read(&self, key: &CacheKey) -> Result<ReadResponse, RemoteError> {
        let held = self.read_holds.lock().expect("holds lock").remove(key);
        if let Some(held) = held {
            let _ = held.await;
        }
        self.reads
            .lock()
            .expect("reads lock")
            .get_mut(key)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(RemoteError::Status { code: 404 }))
    }

    async fn write(&self, request: &WriteRequest) -> Result<Value, RemoteError> {
        self.write_log
            .lock()
            .expect("log lock")
            .push(request.clone());
        let held = self.write_hold.lock().expect("hold lock").take();
        if let Some(held) = held {
            let _ = held.await;
        }
        self.writes
            .lock()
            .expect("writes lock")
            .pop_front()
            .unwrap_or_else(|| Err(RemoteError::Status { code: 500 }))
    }
}

pub fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(datetime!(2026-05-01 09:00 UTC)))
}

/// Single attempt per read, so scripted failures surface immediately.
pub fn test_config() -> CacheConfig {
    CacheConfig {
        fetch_retry_attempts: 1,
        fetch_retry_backoff_ms: 1,
        ..CacheConfig::default()
    }
}

pub fn engine(
    config: CacheConfig,
    store: Arc<dyn DurableStore>,
    remote: Arc<ScriptedRemote>,
    clock: Arc<ManualClock>,
) -> CoherenceEngine {
    CoherenceEngine::new(config, store, remote, clock)
}

/// Field `field` of the row with id `id` in a cached list value.
pub fn row_field(list: &Value, id: &str, field: &str) -> Option<Value> {
    list_rows(list)?
        .iter()
        .find(|row| row_has_id(row, id))
        .and_then(|row| row.get(field).cloned())
}

/// Polls `condition` until it holds; panics after one second.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition reached within a second");
}
