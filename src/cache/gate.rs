//! Session gate.
//!
//! A latch over the set of session-level queries. It opens exactly when every
//! required key has been satisfied in the current session epoch and closes on
//! session end. Satisfactions carrying an older epoch are ignored, so a
//! prefetch that outlives its session cannot open the next one.

use std::collections::BTreeSet;
use std::sync::RwLock;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::domain::keys::CacheKey;

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::gate";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateState {
    pub is_open: bool,
    pub required: BTreeSet<CacheKey>,
    pub satisfied: BTreeSet<CacheKey>,
    /// Incremented on every begin and close.
    pub epoch: u64,
    /// False outside a session.
    pub active: bool,
}

impl GateState {
    fn recompute(&mut self) -> bool {
        let open = self.active && self.satisfied.is_superset(&self.required);
        let changed = open != self.is_open;
        self.is_open = open;
        changed
    }

    pub fn missing(&self) -> Vec<CacheKey> {
        self.required.difference(&self.satisfied).cloned().collect()
    }
}

pub struct SessionGate {
    state: RwLock<GateState>,
    open_tx: watch::Sender<bool>,
}

impl SessionGate {
    pub fn new() -> Self {
        let (open_tx, _) = watch::channel(false);
        Self {
            state: RwLock::new(GateState::default()),
            open_tx,
        }
    }

    /// Starts a session requiring `required`. Returns the session epoch.
    pub fn begin(&self, required: impl IntoIterator<Item = CacheKey>) -> u64 {
        let mut state = rw_write(&self.state, SOURCE, "begin");
        state.epoch += 1;
        state.active = true;
        state.required = required.into_iter().collect();
        state.satisfied.clear();
        state.is_open = false;
        state.recompute();
        self.open_tx.send_replace(state.is_open);
        info!(
            epoch = state.epoch,
            required = state.required.len(),
            "Session gate armed"
        );
        state.epoch
    }

    /// Marks `key` satisfied for session `epoch`.
    ///
    /// Returns true when this call opened the gate.
    pub fn satisfy(&self, epoch: u64, key: &CacheKey) -> bool {
        let mut state = rw_write(&self.state, SOURCE, "satisfy");
        if state.epoch != epoch || !state.active {
            debug!(key = %key, epoch, current = state.epoch, "Ignoring satisfaction from stale session");
            return false;
        }
        if !state.required.contains(key) {
            return false;
        }
        state.satisfied.insert(key.clone());
        let opened = state.recompute() && state.is_open;
        if opened {
            self.open_tx.send_replace(true);
            info!(epoch, "Session gate open");
        }
        opened
    }

    /// Ends the session; the gate reads closed until the next `begin` completes.
    pub fn close(&self) {
        let mut state = rw_write(&self.state, SOURCE, "close");
        state.epoch += 1;
        state.active = false;
        state.required.clear();
        state.satisfied.clear();
        state.is_open = false;
        self.open_tx.send_replace(false);
        info!(epoch = state.epoch, "Session gate closed");
    }

    pub fn is_open(&self) -> bool {
        rw_read(&self.state, SOURCE, "is_open").is_open
    }

    pub fn epoch(&self) -> u64 {
        rw_read(&self.state, SOURCE, "epoch").epoch
    }

    pub fn is_required(&self, key: &CacheKey) -> bool {
        rw_read(&self.state, SOURCE, "is_required")
            .required
            .contains(key)
    }

    pub fn state(&self) -> GateState {
        rw_read(&self.state, SOURCE, "state").clone()
    }

    /// Receiver tracking `is_open`.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.open_tx.subscribe()
    }

    /// Waits until the gate is open.
    pub async fn wait_open(&self) {
        let mut receiver = self.watch();
        // The sender lives as long as `self`, so this only ends by opening.
        let _ = receiver.wait_for(|open| *open).await;
    }
}

impl Default for SessionGate {
    fn default() -> Self {
        Self::new()
    }
}
