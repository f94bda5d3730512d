//! Change subscriptions on individual cache keys.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::domain::entry::CacheEntry;
use crate::domain::keys::CacheKey;

/// What a subscriber observes for its key.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheChange {
    /// The entry was written or patched.
    Updated(CacheEntry),
    /// The entry was marked stale; a refetch may follow.
    Stale(CacheEntry),
    /// The entry is gone (removal, eviction or session reset).
    Removed(CacheKey),
}

impl CacheChange {
    pub fn key(&self) -> &CacheKey {
        match self {
            Self::Updated(entry) | Self::Stale(entry) => &entry.key,
            Self::Removed(key) => key,
        }
    }

    pub fn entry(&self) -> Option<&CacheEntry> {
        match self {
            Self::Updated(entry) | Self::Stale(entry) => Some(entry),
            Self::Removed(_) => None,
        }
    }
}

/// Receiving end of a key subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    key: CacheKey,
    receiver: mpsc::UnboundedReceiver<CacheChange>,
}

impl Subscription {
    pub(crate) fn new(key: CacheKey, receiver: mpsc::UnboundedReceiver<CacheChange>) -> Self {
        Self { key, receiver }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Waits for the next change. `None` once the cache is gone.
    pub async fn changed(&mut self) -> Option<CacheChange> {
        self.receiver.recv().await
    }

    /// Next already-delivered change, if any.
    pub fn try_changed(&mut self) -> Option<CacheChange> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(self) {}

    /// Drives `callback` for every change on a background task.
    pub fn for_each<F>(mut self, mut callback: F) -> CallbackSubscription
    where
        F: FnMut(CacheChange) + Send + 'static,
    {
        let key = self.key.clone();
        let task = tokio::spawn(async move {
            while let Some(change) = self.changed().await {
                callback(change);
            }
        });
        CallbackSubscription { key, task }
    }
}

/// Callback-style subscription; aborting the task unsubscribes.
#[derive(Debug)]
pub struct CallbackSubscription {
    key: CacheKey,
    task: JoinHandle<()>,
}

impl CallbackSubscription {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn unsubscribe(self) {}
}

impl Drop for CallbackSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
