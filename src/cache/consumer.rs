//! Invalidation handler.
//!
//! Consumes change notifications and keeps the cache coherent with the server:
//! - affected detail and list queries are marked stale
//! - removed resources are deleted outright and purged from their reference table
//! - stale queries with an active subscriber are refetched in the background
//!
//! Stale-marking and deletion are both idempotent, so at-least-once delivery
//! converges to the same state as exactly-once.

use std::time::Instant;

use coherence_wire::{ChangeAction, ChangeNotification};
use metrics::histogram;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::domain::keys::{CacheKey, ResourceKind};

use super::events::{InboundEvent, NotificationReceiver};
use super::fetch::QueryClient;
use super::planner::InvalidationPlan;

const METRIC_CONSUME_MS: &str = "coherence_invalidation_consume_ms";

/// What one invalidation pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InvalidationOutcome {
    pub removed: Vec<CacheKey>,
    /// Stale keys with subscribers; a background refetch was started for each.
    pub refetching: Vec<CacheKey>,
}

pub struct InvalidationHandler {
    client: QueryClient,
    batch_limit: usize,
}

impl InvalidationHandler {
    pub fn new(client: QueryClient, batch_limit: usize) -> Self {
        Self {
            client,
            batch_limit: batch_limit.max(1),
        }
    }

    /// Handles one change for `kind`; without an id every query of the kind goes stale.
    pub async fn on_notification(
        &self,
        kind: &ResourceKind,
        id: Option<&str>,
        action: ChangeAction,
    ) -> InvalidationOutcome {
        let notification = match id {
            Some(id) => ChangeNotification::single(kind.as_str(), id, action),
            None => ChangeNotification::new(kind.as_str(), Vec::new()),
        };
        self.handle(notification).await
    }

    /// Handles one full transport message.
    pub async fn handle(&self, notification: ChangeNotification) -> InvalidationOutcome {
        let event = InboundEvent {
            id: Uuid::new_v4(),
            epoch: 0,
            notification,
            received_at: self.client.cache().memory().now(),
        };
        self.apply(&InvalidationPlan::from_events(vec![event])).await
    }

    /// Drains whatever is queued, up to the batch limit, without waiting.
    ///
    /// Returns true if any events were processed.
    #[instrument(skip(self, receiver))]
    pub async fn consume(&self, receiver: &mut NotificationReceiver) -> bool {
        let events = receiver.drain(self.batch_limit);
        if events.is_empty() {
            return false;
        }
        self.consume_events(events).await;
        true
    }

    /// Processes batches until every sender is dropped.
    pub async fn run(&self, mut receiver: NotificationReceiver) {
        loop {
            let events = receiver.recv_batch(self.batch_limit).await;
            if events.is_empty() {
                break;
            }
            self.consume_events(events).await;
        }
        info!("Notification channel closed; invalidation consumer stopping");
    }

    async fn consume_events(&self, events: Vec<InboundEvent>) -> InvalidationOutcome {
        let started_at = Instant::now();
        let event_count = events.len();
        let event_ids: Vec<Uuid> = events.iter().map(|e| e.id).collect();
        let plan = InvalidationPlan::from_events(events);

        info!(
            event_count,
            event_ids = ?event_ids,
            plan = %plan,
            "Invalidation consumption starting"
        );

        let outcome = self.apply(&plan).await;

        info!(
            event_count,
            removed = outcome.removed.len(),
            refetching = outcome.refetching.len(),
            "Invalidation consumption complete"
        );
        histogram!(METRIC_CONSUME_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        outcome
    }

    /// Executes a plan: deletions first, then staleness, then refetches.
    pub async fn apply(&self, plan: &InvalidationPlan) -> InvalidationOutcome {
        let cache = self.client.cache();
        let mut outcome = InvalidationOutcome::default();

        for (kind, id) in &plan.removals {
            let key = CacheKey::detail(kind.clone(), id.clone());
            if cache.remove(&key).await.is_some() {
                outcome.removed.push(key);
            }
            cache.purge_reference(kind, id).await;
        }

        let refetch = cache.memory().invalidate(|key| {
            if plan.stale_kinds.contains(&key.kind) {
                return true;
            }
            if key.is_list() {
                return plan.stale_lists.contains(&key.kind);
            }
            key.detail_id()
                .is_some_and(|id| plan.stale_details.contains(&(key.kind.clone(), id.to_string())))
        });

        self.client.spawn_refetches(refetch.clone());
        outcome.refetching = refetch;
        outcome
    }
}
