//! The coherence engine: one instance owns every cache component for a process.
//!
//! Construction wires the memory tier, the durable mirror, the remote client,
//! the session gate and the notification queue together. Session start and
//! end are the only lifecycle operations; everything else is a read, a
//! mutation or a notification.

use std::sync::{Arc, Mutex};

use coherence_wire::ChangeAction;
use futures::future::join_all;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::cache::lock::mutex_lock;
use crate::cache::{
    CacheConfig, FetchError, GateState, HydrationCoordinator, HydrationReport,
    InvalidationHandler, InvalidationOutcome, Mutation, MutationError, MutationOptions,
    MutationOutcome, NotificationReceiver, NotificationSender, OptimisticEngine,
    PendingOptimisticOp, QueryCache, QueryClient, SessionGate, Subscription, SyncAccessor,
    SyncedCache, channel,
};
use crate::domain::entry::CacheEntry;
use crate::domain::keys::{CacheKey, ResourceKind};

use super::clock::Clock;
use super::error::SessionError;
use super::repos::{DurableStore, RemoteSource};

const SOURCE: &str = "application::engine";

/// Queries a session must load before its gate opens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPlan {
    pub required: Vec<CacheKey>,
}

impl SessionPlan {
    pub fn new(required: impl IntoIterator<Item = CacheKey>) -> Self {
        Self {
            required: required.into_iter().collect(),
        }
    }

    /// Session-level kinds from configuration.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.session_keys())
    }

    pub fn with(mut self, key: CacheKey) -> Self {
        if !self.required.contains(&key) {
            self.required.push(key);
        }
        self
    }
}

pub struct CoherenceEngine {
    config: Arc<CacheConfig>,
    cache: Arc<SyncedCache>,
    client: QueryClient,
    hydration: HydrationCoordinator,
    gate: Arc<SessionGate>,
    accessor: SyncAccessor,
    optimistic: OptimisticEngine,
    invalidation: Arc<InvalidationHandler>,
    notifier: NotificationSender,
    receiver: tokio::sync::Mutex<Option<NotificationReceiver>>,
    session_pins: Mutex<Vec<CacheKey>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl CoherenceEngine {
    pub fn new(
        config: CacheConfig,
        store: Arc<dyn DurableStore>,
        remote: Arc<dyn RemoteSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = Arc::new(config);
        let memory = QueryCache::new(clock.clone());
        let cache = Arc::new(SyncedCache::new(memory, store, config.clone()));
        let client = QueryClient::new(cache.clone(), remote.clone());
        let gate = Arc::new(SessionGate::new());
        let (notifier, receiver) = channel(config.notification_queue_capacity, clock);

        Self {
            hydration: HydrationCoordinator::new(cache.clone()),
            accessor: SyncAccessor::new(cache.clone(), gate.clone()),
            optimistic: OptimisticEngine::new(client.clone(), remote),
            invalidation: Arc::new(InvalidationHandler::new(
                client.clone(),
                config.consume_batch_limit,
            )),
            notifier,
            receiver: tokio::sync::Mutex::new(Some(receiver)),
            session_pins: Mutex::new(Vec::new()),
            background: Mutex::new(Vec::new()),
            config,
            cache,
            client,
            gate,
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Process start: hydrates memory from the durable store once.
    pub async fn start(&self) -> HydrationReport {
        self.hydration.hydrate().await
    }

    /// Opens a session.
    ///
    /// Every required query is fetched unconditionally and concurrently; keys
    /// are marked satisfied only after all of them resolved. Bulk reference
    /// loads merge into whatever incidental names already arrived, so the
    /// open gate never hides a partially written table.
    #[instrument(skip(self, plan), fields(required = plan.required.len()))]
    pub async fn start_session(&self, plan: SessionPlan) -> Result<(), SessionError> {
        self.release_session_pins();
        self.cache.reset_degraded();

        let epoch = self.gate.begin(plan.required.iter().cloned());
        {
            let mut pins = mutex_lock(&self.session_pins, SOURCE, "start_session");
            for key in &plan.required {
                self.cache.memory().pin(key);
                pins.push(key.clone());
            }
        }

        let results = join_all(plan.required.iter().map(|key| self.client.fetch(key))).await;

        if self.gate.epoch() != epoch {
            return Err(SessionError::Superseded);
        }

        let mut first_failure = None;
        for (key, result) in plan.required.iter().zip(results) {
            match result {
                Ok(_) => {
                    self.gate.satisfy(epoch, key);
                }
                Err(source) => {
                    warn!(key = %key, error = %source, "Session prefetch failed");
                    first_failure.get_or_insert(SessionError::Prefetch {
                        key: key.to_string(),
                        source,
                    });
                }
            }
        }

        match first_failure {
            Some(error) => Err(error),
            None => {
                info!(epoch, "Session started");
                Ok(())
            }
        }
    }

    /// Closes the session and clears both tiers, except drafts.
    #[instrument(skip(self))]
    pub async fn end_session(&self) {
        self.gate.close();
        self.release_session_pins();
        let removed = self.cache.clear_session().await;
        info!(removed = removed.len(), "Session ended");
    }

    fn release_session_pins(&self) {
        let pins: Vec<CacheKey> =
            std::mem::take(&mut *mutex_lock(&self.session_pins, SOURCE, "release_pins"));
        for key in &pins {
            self.cache.memory().unpin(key);
        }
    }

    /// Spawns the invalidation consumer and the periodic eviction sweep.
    ///
    /// The consumer takes the notification receiver; afterwards
    /// [`CoherenceEngine::consume_notifications`] finds nothing to drain.
    pub async fn spawn_background(&self) {
        let mut handles = Vec::new();

        if let Some(receiver) = self.receiver.lock().await.take() {
            let handler = self.invalidation.clone();
            handles.push(tokio::spawn(async move { handler.run(receiver).await }));
        }

        let cache = self.cache.clone();
        let period = self.config.sweep_interval();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                cache.memory().sweep();
            }
        }));

        mutex_lock(&self.background, SOURCE, "spawn_background").extend(handles);
    }

    /// Aborts background tasks.
    pub fn shutdown(&self) {
        for handle in mutex_lock(&self.background, SOURCE, "shutdown").drain(..) {
            handle.abort();
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn read(&self, key: &CacheKey) -> Result<CacheEntry, FetchError> {
        self.client.read(key).await
    }

    pub async fn fetch(&self, key: &CacheKey) -> Result<CacheEntry, FetchError> {
        self.client.fetch(key).await
    }

    pub fn get_sync(&self, key: &CacheKey) -> Option<Value> {
        self.accessor.get_sync(key)
    }

    pub fn reference_name(&self, kind: &ResourceKind, id: &str) -> Option<String> {
        self.accessor.reference_name(kind, id)
    }

    pub fn subscribe(&self, key: CacheKey) -> Subscription {
        self.cache.memory().subscribe(key)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    pub async fn mutate(
        &self,
        kind: ResourceKind,
        mutation: Mutation,
        options: MutationOptions,
    ) -> Result<MutationOutcome, MutationError> {
        self.optimistic.mutate(kind, mutation, options).await
    }

    pub fn pending_mutations(&self) -> Vec<PendingOptimisticOp> {
        self.optimistic.pending()
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    /// Sender for the external transport.
    pub fn notifier(&self) -> NotificationSender {
        self.notifier.clone()
    }

    pub async fn on_notification(
        &self,
        kind: &ResourceKind,
        id: Option<&str>,
        action: ChangeAction,
    ) -> InvalidationOutcome {
        self.invalidation.on_notification(kind, id, action).await
    }

    /// Drains queued notifications when no background consumer runs.
    pub async fn consume_notifications(&self) -> bool {
        let mut receiver = self.receiver.lock().await;
        match receiver.as_mut() {
            Some(receiver) => self.invalidation.consume(receiver).await,
            None => false,
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn sweep(&self) -> Vec<CacheKey> {
        self.cache.memory().sweep()
    }

    pub fn is_open(&self) -> bool {
        self.gate.is_open()
    }

    pub fn gate_state(&self) -> GateState {
        self.gate.state()
    }

    pub async fn wait_open(&self) {
        self.gate.wait_open().await
    }

    pub fn is_degraded(&self) -> bool {
        self.cache.is_degraded()
    }

    pub fn cache(&self) -> &QueryCache {
        self.cache.memory()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub async fn inspect_durable(&self) -> HydrationReport {
        self.hydration.inspect().await
    }
}

impl Drop for CoherenceEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use coherence_wire::{ReadResponse, WriteRequest};
    use serde_json::json;
    use time::macros::datetime;

    use super::*;
    use crate::application::clock::ManualClock;
    use crate::application::repos::RemoteError;
    use crate::infra::memory::MemoryStore;

    struct CatalogRemote;

    #[async_trait]
    impl RemoteSource for CatalogRemote {
        async fn read(&self, key: &CacheKey) -> Result<ReadResponse, RemoteError> {
            match key.kind.as_str() {
                "broken" => Err(RemoteError::Status { code: 400 }),
                _ => Ok(ReadResponse::new(json!({ "catalog": key.kind.as_str() }))),
            }
        }

        async fn write(&self, _request: &WriteRequest) -> Result<Value, RemoteError> {
            Ok(json!({}))
        }
    }

    fn engine() -> CoherenceEngine {
        CoherenceEngine::new(
            CacheConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(CatalogRemote),
            Arc::new(ManualClock::new(datetime!(2026-05-01 09:00 UTC))),
        )
    }

    #[tokio::test]
    async fn session_opens_after_prefetch() {
        let engine = engine();
        let plan = SessionPlan::new([
            CacheKey::singleton("entity_types"),
            CacheKey::singleton("display_options"),
        ]);

        engine.start_session(plan.clone()).await.expect("session opens");

        assert!(engine.is_open());
        for key in &plan.required {
            assert!(engine.get_sync(key).is_some());
            assert!(engine.cache().is_pinned(key));
        }
    }

    #[tokio::test]
    async fn failed_prefetch_keeps_gate_closed() {
        let engine = engine();
        let plan = SessionPlan::new([
            CacheKey::singleton("entity_types"),
            CacheKey::singleton("broken"),
        ]);

        let err = engine.start_session(plan).await.expect_err("prefetch fails");

        assert!(matches!(err, SessionError::Prefetch { .. }));
        assert!(!engine.is_open());
        assert_eq!(
            engine.gate_state().missing(),
            vec![CacheKey::singleton("broken")]
        );
    }

    #[tokio::test]
    async fn end_session_clears_all_but_drafts() {
        let engine = engine();
        engine
            .start_session(SessionPlan::new([CacheKey::singleton("entity_types")]))
            .await
            .expect("session opens");
        engine
            .fetch(&CacheKey::detail("draft", "D1"))
            .await
            .expect("draft cached");

        engine.end_session().await;

        assert!(!engine.is_open());
        assert!(engine.get_sync(&CacheKey::singleton("entity_types")).is_none());
        assert!(engine.get_sync(&CacheKey::detail("draft", "D1")).is_some());
        assert!(!engine.cache().is_pinned(&CacheKey::singleton("entity_types")));
    }

    #[tokio::test]
    async fn queued_notifications_are_consumed_on_demand() {
        let engine = engine();
        let key = CacheKey::detail("task", "T9");
        engine.fetch(&key).await.expect("cached");

        engine
            .notifier()
            .try_publish(coherence_wire::ChangeNotification::single(
                "task",
                "T9",
                ChangeAction::Removed,
            ))
            .expect("queued");
        assert!(engine.consume_notifications().await);
        assert!(engine.get_sync(&key).is_none());
    }

    #[test]
    fn plan_from_config_lists_session_kinds() {
        let config = CacheConfig::default().with_kind(
            "entity_types",
            crate::cache::KindSettings {
                session_level: true,
                ..Default::default()
            },
        );
        let plan = SessionPlan::from_config(&config)
            .with(CacheKey::references("employee"))
            .with(CacheKey::references("employee"));

        assert_eq!(
            plan.required,
            vec![
                CacheKey::singleton("entity_types"),
                CacheKey::references("employee"),
            ]
        );
    }
}
