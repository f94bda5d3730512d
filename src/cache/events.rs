//! Inbound change-notification queue.
//!
//! The external transport publishes [`ChangeNotification`]s into a bounded
//! channel; the invalidation consumer drains it on a single task so cache
//! mutations never run concurrently with each other.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use coherence_wire::ChangeNotification;
use metrics::counter;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::application::clock::Clock;

const METRIC_NOTIFICATION_DROPPED: &str = "coherence_notification_dropped_total";

/// Monotonic receive order within this process.
pub type Epoch = u64;

/// One notification as received, with idempotency and ordering metadata.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    /// Delivery id; duplicates of the same delivery share it.
    pub id: Uuid,
    pub epoch: Epoch,
    pub notification: ChangeNotification,
    pub received_at: OffsetDateTime,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("notification queue is full")]
    Full,
    #[error("notification queue is closed")]
    Closed,
}

/// Publishing half; cheap to clone into transport callbacks.
#[derive(Clone)]
pub struct NotificationSender {
    tx: mpsc::Sender<InboundEvent>,
    epoch: Arc<AtomicU64>,
    clock: Arc<dyn Clock>,
}

pub struct NotificationReceiver {
    rx: mpsc::Receiver<InboundEvent>,
}

pub fn channel(capacity: usize, clock: Arc<dyn Clock>) -> (NotificationSender, NotificationReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        NotificationSender {
            tx,
            epoch: Arc::new(AtomicU64::new(0)),
            clock,
        },
        NotificationReceiver { rx },
    )
}

impl NotificationSender {
    fn event(&self, id: Uuid, notification: ChangeNotification) -> InboundEvent {
        InboundEvent {
            id,
            epoch: self.epoch.fetch_add(1, Ordering::SeqCst),
            notification,
            received_at: self.clock.now(),
        }
    }

    /// Enqueues without waiting. A full queue drops the notification.
    pub fn try_publish(&self, notification: ChangeNotification) -> Result<Uuid, PublishError> {
        self.try_publish_with_id(Uuid::new_v4(), notification)
    }

    /// Like [`NotificationSender::try_publish`] with a caller-chosen delivery id.
    pub fn try_publish_with_id(
        &self,
        id: Uuid,
        notification: ChangeNotification,
    ) -> Result<Uuid, PublishError> {
        let event = self.event(id, notification);
        let kind = event.notification.resource_kind.clone();
        match self.tx.try_send(event) {
            Ok(()) => {
                info!(event_id = %id, resource_kind = %kind, "Change notification enqueued");
                Ok(id)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                counter!(METRIC_NOTIFICATION_DROPPED, "reason" => "full").increment(1);
                warn!(event_id = %id, resource_kind = %kind, "Notification queue full; dropping");
                Err(PublishError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                counter!(METRIC_NOTIFICATION_DROPPED, "reason" => "closed").increment(1);
                Err(PublishError::Closed)
            }
        }
    }

    /// Enqueues, waiting for capacity.
    pub async fn publish(&self, notification: ChangeNotification) -> Result<Uuid, PublishError> {
        let id = Uuid::new_v4();
        let event = self.event(id, notification);
        let kind = event.notification.resource_kind.clone();
        self.tx.send(event).await.map_err(|_| {
            counter!(METRIC_NOTIFICATION_DROPPED, "reason" => "closed").increment(1);
            PublishError::Closed
        })?;
        info!(event_id = %id, resource_kind = %kind, "Change notification enqueued");
        Ok(id)
    }
}

impl NotificationReceiver {
    /// Waits for at least one event, then takes up to `limit` without waiting.
    ///
    /// Returns an empty batch once every sender is gone.
    pub async fn recv_batch(&mut self, limit: usize) -> Vec<InboundEvent> {
        let mut batch = Vec::new();
        self.rx.recv_many(&mut batch, limit.max(1)).await;
        batch
    }

    /// Takes up to `limit` queued events without waiting.
    pub fn drain(&mut self, limit: usize) -> Vec<InboundEvent> {
        let mut batch = Vec::new();
        while batch.len() < limit {
            match self.rx.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
