//! Reactive query cache.
//!
//! In-memory map from [`CacheKey`] to [`CacheEntry`] with per-key subscribers,
//! fetch generations and pins. Every operation runs to completion under one
//! lock and never awaits, so two cache mutations never interleave.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use metrics::{counter, gauge};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::debug;

use crate::application::clock::Clock;
use crate::domain::entry::{CacheEntry, EntryPolicy, EntryStatus};
use crate::domain::keys::CacheKey;

use super::lock::mutex_lock;
use super::subscription::{CacheChange, Subscription};

const SOURCE: &str = "cache::store";

const METRIC_CACHE_HIT: &str = "coherence_cache_hit_total";
const METRIC_CACHE_MISS: &str = "coherence_cache_miss_total";
const METRIC_CACHE_EVICT: &str = "coherence_cache_evict_total";
const METRIC_CACHE_ENTRIES: &str = "coherence_cache_entries";
const METRIC_REFETCH_DISCARDED: &str = "coherence_refetch_discarded_total";

/// Proof that a fetch was started for a key at a given generation.
///
/// A ticket lands its result unless a fetch of the same or a newer
/// generation already landed, or the key was superseded since.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    key: CacheKey,
    generation: u64,
}

impl FetchTicket {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Outcome of an edit callback for one key.
#[derive(Debug, Clone, PartialEq)]
pub enum Edit {
    Keep,
    Replace(Value),
    Remove,
}

/// Prior state of one key captured before an optimistic change.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub key: CacheKey,
    pub prior: Option<CacheEntry>,
    /// Value written by the optimistic change; `None` when it removed the entry.
    pub applied: Option<Value>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    subscribers: HashMap<CacheKey, Vec<mpsc::UnboundedSender<CacheChange>>>,
    /// Newest generation issued per key.
    generations: HashMap<CacheKey, u64>,
    /// Newest generation that landed or superseded the key.
    landed: HashMap<CacheKey, u64>,
    /// Generations still running per key.
    pending: HashMap<CacheKey, BTreeSet<u64>>,
    /// Fetches at or below this generation started before an invalidation.
    stale_through: HashMap<CacheKey, u64>,
    pins: HashMap<CacheKey, usize>,
}

impl CacheState {
    fn notify(&mut self, key: &CacheKey, change: CacheChange) {
        if let Some(senders) = self.subscribers.get_mut(key) {
            senders.retain(|sender| sender.send(change.clone()).is_ok());
            if senders.is_empty() {
                self.subscribers.remove(key);
            }
        }
    }

    fn active_subscribers(&self, key: &CacheKey) -> usize {
        self.subscribers
            .get(key)
            .map(|senders| senders.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }

    fn next_generation(&mut self, key: &CacheKey) -> u64 {
        let generation = self.generations.entry(key.clone()).or_insert(0);
        *generation += 1;
        *generation
    }

    /// Retires every fetch issued so far for `key`; none of them can land.
    fn supersede(&mut self, key: &CacheKey) {
        let generation = self.next_generation(key);
        self.landed.insert(key.clone(), generation);
        self.pending.remove(key);
        self.stale_through.remove(key);
    }

    fn landed_generation(&self, key: &CacheKey) -> u64 {
        self.landed.get(key).copied().unwrap_or(0)
    }

    fn can_land(&self, ticket: &FetchTicket) -> bool {
        ticket.generation > self.landed_generation(&ticket.key)
    }

    fn is_fetching(&self, key: &CacheKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Marks `ticket` as finished; returns whether a newer fetch is still running.
    fn resolve(&mut self, ticket: &FetchTicket) -> bool {
        let Some(running) = self.pending.get_mut(&ticket.key) else {
            return false;
        };
        running.remove(&ticket.generation);
        let newer = running
            .last()
            .is_some_and(|generation| *generation > ticket.generation);
        if running.is_empty() {
            self.pending.remove(&ticket.key);
        }
        newer
    }

    /// Records `ticket` as landed and picks the status its result lands with.
    fn land(&mut self, ticket: &FetchTicket, newer_running: bool) -> EntryStatus {
        if ticket.generation > self.landed_generation(&ticket.key) {
            self.landed.insert(ticket.key.clone(), ticket.generation);
        }
        let through = self.stale_through.get(&ticket.key).copied();
        let invalidated = through.is_some_and(|through| ticket.generation <= through);
        if through.is_some() && !invalidated {
            self.stale_through.remove(&ticket.key);
        }
        if newer_running {
            EntryStatus::Fetching
        } else if invalidated {
            EntryStatus::Stale
        } else {
            EntryStatus::Fresh
        }
    }

    fn put(&mut self, entry: CacheEntry) {
        let key = entry.key.clone();
        self.entries.insert(key.clone(), entry.clone());
        self.notify(&key, CacheChange::Updated(entry));
        gauge!(METRIC_CACHE_ENTRIES).set(self.entries.len() as f64);
    }

    fn drop_entry(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.notify(key, CacheChange::Removed(key.clone()));
            gauge!(METRIC_CACHE_ENTRIES).set(self.entries.len() as f64);
        }
        removed
    }

    /// Runs `edit` over the selected keys; returns `(key, prior, applied)` for every changed key.
    fn edit_keys(
        &mut self,
        keys: Vec<CacheKey>,
        policy: EntryPolicy,
        now: OffsetDateTime,
        edit: &mut dyn FnMut(&CacheKey, Option<&Value>) -> Edit,
    ) -> Vec<Snapshot> {
        let mut changed = Vec::new();
        for key in keys {
            let prior = self.entries.get(&key).cloned();
            match edit(&key, prior.as_ref().map(|entry| &entry.value)) {
                Edit::Keep => continue,
                Edit::Remove => {
                    if prior.is_none() {
                        continue;
                    }
                    self.drop_entry(&key);
                    changed.push(Snapshot {
                        key,
                        prior,
                        applied: None,
                    });
                }
                Edit::Replace(value) => {
                    let next = match &prior {
                        Some(entry) => {
                            let mut next = entry.clone();
                            next.value = value.clone();
                            next
                        }
                        None => CacheEntry::fresh(key.clone(), value.clone(), policy, now),
                    };
                    self.put(next);
                    changed.push(Snapshot {
                        key,
                        prior,
                        applied: Some(value),
                    });
                }
            }
        }
        changed
    }

    fn selected_keys(
        &self,
        selector: &dyn Fn(&CacheKey) -> bool,
        extra: &[CacheKey],
    ) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self
            .entries
            .keys()
            .filter(|key| selector(key))
            .cloned()
            .chain(extra.iter().cloned())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

/// In-memory tier of the coherence engine.
pub struct QueryCache {
    state: Mutex<CacheState>,
    clock: Arc<dyn Clock>,
}

impl QueryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            clock,
        }
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Current entry with its effective status, if present.
    pub fn read(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = self.now();
        let state = mutex_lock(&self.state, SOURCE, "read");
        match state.entries.get(key) {
            Some(entry) => {
                counter!(METRIC_CACHE_HIT).increment(1);
                let mut entry = entry.clone();
                entry.status = entry.effective_status(now);
                Some(entry)
            }
            None => {
                counter!(METRIC_CACHE_MISS).increment(1);
                None
            }
        }
    }

    /// Stored entry as is, without touching hit/miss accounting.
    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        mutex_lock(&self.state, SOURCE, "entry").entries.get(key).cloned()
    }

    pub fn value(&self, key: &CacheKey) -> Option<Value> {
        mutex_lock(&self.state, SOURCE, "value")
            .entries
            .get(key)
            .map(|entry| entry.value.clone())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        mutex_lock(&self.state, SOURCE, "contains")
            .entries
            .contains_key(key)
    }

    /// Keys of present entries matching `predicate`, in key order.
    pub fn keys_where(&self, predicate: impl Fn(&CacheKey) -> bool) -> Vec<CacheKey> {
        let state = mutex_lock(&self.state, SOURCE, "keys_where");
        let mut keys: Vec<CacheKey> = state
            .entries
            .keys()
            .filter(|key| predicate(key))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Replaces the entry (status Fresh, fetched now) and notifies subscribers.
    pub fn write(&self, key: CacheKey, value: Value, policy: EntryPolicy) -> CacheEntry {
        let entry = CacheEntry::fresh(key, value, policy, self.now());
        mutex_lock(&self.state, SOURCE, "write").put(entry.clone());
        entry
    }

    /// Loads a value an earlier process fetched at `fetched_at`.
    ///
    /// A value still inside its stale window keeps its fetch time. An older
    /// one lands Stale with its eviction window starting now, so it is served
    /// until a read refreshes it instead of being swept straight away.
    pub fn hydrate(
        &self,
        key: CacheKey,
        value: Value,
        policy: EntryPolicy,
        fetched_at: OffsetDateTime,
    ) -> CacheEntry {
        let now = self.now();
        let mut entry = CacheEntry::fresh(key, value, policy, fetched_at);
        if entry.is_stale(now) {
            entry.fetched_at = now;
            entry.status = EntryStatus::Stale;
        }
        mutex_lock(&self.state, SOURCE, "hydrate").put(entry.clone());
        entry
    }

    /// Applies `updater` to the current value, or to `default` when absent.
    ///
    /// An existing entry keeps its fetch time and status; an absent one is
    /// created Fresh with `policy`.
    pub fn patch(
        &self,
        key: CacheKey,
        policy: EntryPolicy,
        default: Value,
        updater: impl FnOnce(Value) -> Value,
    ) -> CacheEntry {
        let now = self.now();
        let mut state = mutex_lock(&self.state, SOURCE, "patch");
        let entry = match state.entries.get(&key) {
            Some(existing) => {
                let mut next = existing.clone();
                next.value = updater(existing.value.clone());
                next
            }
            None => CacheEntry::fresh(key, updater(default), policy, now),
        };
        state.put(entry.clone());
        entry
    }

    /// Puts back an exact prior state: the captured entry, or absence.
    pub fn restore(&self, snapshot: &Snapshot) {
        let mut state = mutex_lock(&self.state, SOURCE, "restore");
        Self::restore_locked(&mut state, snapshot);
    }

    fn restore_locked(state: &mut CacheState, snapshot: &Snapshot) {
        match &snapshot.prior {
            Some(entry) => {
                let mut entry = entry.clone();
                // The fetch that was running at snapshot time may have landed since.
                if entry.status == EntryStatus::Fetching && !state.is_fetching(&entry.key) {
                    entry.status = EntryStatus::Stale;
                }
                state.put(entry);
            }
            None => {
                state.drop_entry(&snapshot.key);
            }
        }
    }

    /// Undoes one optimistic change.
    ///
    /// When the key still holds exactly what the change wrote, the snapshot is
    /// restored as is. Otherwise something else landed in between and `repair`
    /// undoes only this change on top of the current value.
    pub fn rollback(&self, snapshot: &Snapshot, repair: impl FnOnce(&Value) -> Edit) {
        let mut state = mutex_lock(&self.state, SOURCE, "rollback");
        let current = state.entries.get(&snapshot.key).map(|entry| entry.value.clone());
        if current == snapshot.applied {
            Self::restore_locked(&mut state, snapshot);
            return;
        }
        let Some(current) = current else {
            Self::restore_locked(&mut state, snapshot);
            return;
        };
        match repair(&current) {
            Edit::Keep => {}
            Edit::Remove => {
                state.drop_entry(&snapshot.key);
            }
            Edit::Replace(value) => {
                if let Some(entry) = state.entries.get(&snapshot.key) {
                    let mut next = entry.clone();
                    next.value = value;
                    state.put(next);
                }
            }
        }
    }

    /// Deletes the entry outright; subscribers observe [`CacheChange::Removed`].
    pub fn remove(&self, key: &CacheKey) -> Option<CacheEntry> {
        let mut state = mutex_lock(&self.state, SOURCE, "remove");
        state.supersede(key);
        state.drop_entry(key)
    }

    /// Drops every entry matching `predicate` and supersedes their in-flight fetches.
    pub fn clear_where(&self, predicate: impl Fn(&CacheKey) -> bool) -> Vec<CacheKey> {
        let mut state = mutex_lock(&self.state, SOURCE, "clear_where");
        let mut keys: Vec<CacheKey> = state
            .entries
            .keys()
            .chain(state.generations.keys())
            .filter(|key| predicate(key))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();

        let mut removed = Vec::new();
        for key in keys {
            state.supersede(&key);
            if state.drop_entry(&key).is_some() {
                removed.push(key);
            }
        }
        removed
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    pub fn subscribe(&self, key: CacheKey) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        mutex_lock(&self.state, SOURCE, "subscribe")
            .subscribers
            .entry(key.clone())
            .or_default()
            .push(sender);
        Subscription::new(key, receiver)
    }

    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        mutex_lock(&self.state, SOURCE, "subscriber_count").active_subscribers(key)
    }

    // ========================================================================
    // Staleness and fetch generations
    // ========================================================================

    /// Flips matching entries to Stale.
    ///
    /// A key with a fetch running stays Fetching; the fetches already running
    /// land Stale instead of Fresh. Returns the matching present keys that
    /// have at least one active subscriber; those are the ones the caller
    /// must refetch.
    pub fn invalidate(&self, predicate: impl Fn(&CacheKey) -> bool) -> Vec<CacheKey> {
        let mut state = mutex_lock(&self.state, SOURCE, "invalidate");
        let running: Vec<CacheKey> = state
            .pending
            .keys()
            .filter(|key| predicate(key))
            .cloned()
            .collect();
        for key in running {
            let issued = state.generations.get(&key).copied().unwrap_or(0);
            state.stale_through.insert(key, issued);
        }

        let mut keys: Vec<CacheKey> = state
            .entries
            .keys()
            .filter(|key| predicate(key))
            .cloned()
            .collect();
        keys.sort();

        let mut subscribed = Vec::new();
        for key in keys {
            let fetching = state.is_fetching(&key);
            let Some(entry) = state.entries.get_mut(&key) else {
                continue;
            };
            if !fetching {
                entry.status = EntryStatus::Stale;
                let change = CacheChange::Stale(entry.clone());
                state.notify(&key, change);
            }
            if state.active_subscribers(&key) > 0 {
                subscribed.push(key);
            }
        }
        subscribed
    }

    /// Starts a fetch: issues the key's next generation and marks a present entry Fetching.
    pub fn begin_fetch(&self, key: &CacheKey) -> FetchTicket {
        let mut state = mutex_lock(&self.state, SOURCE, "begin_fetch");
        let generation = state.next_generation(key);
        state
            .pending
            .entry(key.clone())
            .or_default()
            .insert(generation);
        if let Some(entry) = state.entries.get_mut(key) {
            entry.status = EntryStatus::Fetching;
        }
        FetchTicket {
            key: key.clone(),
            generation,
        }
    }

    pub fn can_land(&self, ticket: &FetchTicket) -> bool {
        mutex_lock(&self.state, SOURCE, "can_land").can_land(ticket)
    }

    pub fn is_fetching(&self, key: &CacheKey) -> bool {
        mutex_lock(&self.state, SOURCE, "is_fetching").is_fetching(key)
    }

    /// Lands a fetch result unless a result at least as new already landed.
    ///
    /// An older fetch resolving first still lands; while a newer one runs
    /// the entry stays Fetching and the newer result replaces it later.
    pub fn complete_fetch(
        &self,
        ticket: &FetchTicket,
        value: Value,
        policy: EntryPolicy,
    ) -> Option<CacheEntry> {
        let now = self.now();
        let mut state = mutex_lock(&self.state, SOURCE, "complete_fetch");
        let newer_running = state.resolve(ticket);
        if !state.can_land(ticket) {
            counter!(METRIC_REFETCH_DISCARDED).increment(1);
            debug!(
                key = %ticket.key,
                generation = ticket.generation,
                "Discarding superseded fetch result"
            );
            return None;
        }
        let status = state.land(ticket, newer_running);
        let mut entry = CacheEntry::fresh(ticket.key.clone(), value, policy, now);
        entry.status = status;
        state.put(entry.clone());
        Some(entry)
    }

    /// Lands a fetch result by merging it into the current value.
    ///
    /// Unlike [`QueryCache::complete_fetch`] this never discards: merges only
    /// add to what is there, so a superseded generation cannot lose data.
    pub fn complete_merge(
        &self,
        ticket: &FetchTicket,
        policy: EntryPolicy,
        default: Value,
        merge: impl FnOnce(Value) -> Value,
    ) -> CacheEntry {
        let now = self.now();
        let mut state = mutex_lock(&self.state, SOURCE, "complete_merge");
        let newer_running = state.resolve(ticket);
        let status = state.land(ticket, newer_running);
        let current = state
            .entries
            .get(&ticket.key)
            .map(|entry| entry.value.clone())
            .unwrap_or(default);
        let mut entry = CacheEntry::fresh(ticket.key.clone(), merge(current), policy, now);
        entry.status = status;
        state.put(entry.clone());
        entry
    }

    /// Records a failed fetch: the last good value stays, now Stale with an error flag.
    ///
    /// Ignored while a newer fetch is still running or once a newer result landed.
    pub fn fail_fetch(&self, ticket: &FetchTicket, error: &str) -> Option<CacheEntry> {
        let mut state = mutex_lock(&self.state, SOURCE, "fail_fetch");
        let newer_running = state.resolve(ticket);
        if newer_running || !state.can_land(ticket) {
            return None;
        }
        let entry = state.entries.get_mut(&ticket.key)?;
        entry.status = EntryStatus::Stale;
        entry.last_error = Some(error.to_string());
        let entry = entry.clone();
        state.notify(&ticket.key, CacheChange::Stale(entry.clone()));
        Some(entry)
    }

    // ========================================================================
    // Optimistic changes
    // ========================================================================

    /// Snapshots and rewrites every selected key in one uninterrupted step.
    ///
    /// `edit` sees the current value (absent for `extra` keys without an
    /// entry). Changed keys are pinned; the caller unpins them once the
    /// operation resolves. Fetches running for a changed key are superseded
    /// so an outdated result cannot overwrite the optimistic value.
    pub fn apply_optimistic(
        &self,
        selector: impl Fn(&CacheKey) -> bool,
        extra: &[CacheKey],
        policy: EntryPolicy,
        mut edit: impl FnMut(&CacheKey, Option<&Value>) -> Edit,
    ) -> Vec<Snapshot> {
        let now = self.now();
        let mut state = mutex_lock(&self.state, SOURCE, "apply_optimistic");
        let keys = state.selected_keys(&selector, extra);
        let snapshots = state.edit_keys(keys, policy, now, &mut edit);
        for snapshot in &snapshots {
            *state.pins.entry(snapshot.key.clone()).or_insert(0) += 1;
            if !state.is_fetching(&snapshot.key) {
                continue;
            }
            state.supersede(&snapshot.key);
            debug!(key = %snapshot.key, "Optimistic change superseded running fetch");
            if let Some(entry) = state.entries.get_mut(&snapshot.key) {
                entry.status = EntryStatus::Stale;
                let change = CacheChange::Stale(entry.clone());
                state.notify(&snapshot.key, change);
            }
        }
        snapshots
    }

    /// Rewrites every selected key without snapshots or pins; returns changed keys.
    pub fn edit_where(
        &self,
        selector: impl Fn(&CacheKey) -> bool,
        extra: &[CacheKey],
        policy: EntryPolicy,
        mut edit: impl FnMut(&CacheKey, Option<&Value>) -> Edit,
    ) -> Vec<CacheKey> {
        let now = self.now();
        let mut state = mutex_lock(&self.state, SOURCE, "edit_where");
        let keys = state.selected_keys(&selector, extra);
        state
            .edit_keys(keys, policy, now, &mut edit)
            .into_iter()
            .map(|snapshot| snapshot.key)
            .collect()
    }

    pub fn pin(&self, key: &CacheKey) {
        *mutex_lock(&self.state, SOURCE, "pin")
            .pins
            .entry(key.clone())
            .or_insert(0) += 1;
    }

    pub fn unpin(&self, key: &CacheKey) {
        let mut state = mutex_lock(&self.state, SOURCE, "unpin");
        if let Some(count) = state.pins.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.pins.remove(key);
            }
        }
    }

    pub fn is_pinned(&self, key: &CacheKey) -> bool {
        mutex_lock(&self.state, SOURCE, "is_pinned")
            .pins
            .contains_key(key)
    }

    // ========================================================================
    // Eviction
    // ========================================================================

    /// Removes entries past `evict_after` that nobody observes.
    ///
    /// Fetching entries, pinned entries and entries with active subscribers stay.
    pub fn sweep(&self) -> Vec<CacheKey> {
        let now = self.now();
        let mut state = mutex_lock(&self.state, SOURCE, "sweep");
        let mut expired: Vec<CacheKey> = state
            .entries
            .values()
            .filter(|entry| entry.status != EntryStatus::Fetching && entry.is_expired(now))
            .map(|entry| entry.key.clone())
            .filter(|key| !state.pins.contains_key(key) && state.active_subscribers(key) == 0)
            .collect();
        expired.sort();

        for key in &expired {
            state.drop_entry(key);
        }
        if !expired.is_empty() {
            counter!(METRIC_CACHE_EVICT).increment(expired.len() as u64);
            debug!(evicted = expired.len(), "Cache sweep evicted entries");
        }
        expired
    }
}
