//! Cache storage.
//!
//! Entries live in an ordered map keyed by [`CacheKey`]; keys sharing a
//! prefix are therefore contiguous, which keeps prefix invalidation a range
//! scan. Every mutation goes through `set`, `invalidate`, `remove` or
//! `evict`. Changes are queued for subscribers under the write lock and
//! delivered after it is released.

use std::any::Any;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::CacheError;

use super::entry::{CacheEntry, cached};
use super::keys::CacheKey;
use super::lock::{read_lock, write_lock};
use super::subscription::{Listener, ListenerRegistry, SubscriberId, Subscription};

const COMPONENT: &str = "cache::store";
const METRIC_EVICT_TOTAL: &str = "tidecache_evict_total";

type EntryMap = BTreeMap<CacheKey, Arc<CacheEntry>>;

/// Shared cache store.
pub struct CacheStore {
    entries: RwLock<EntryMap>,
    listeners: ListenerRegistry,
    default_gc_time: Duration,
}

impl CacheStore {
    pub fn new(default_gc_time: Duration) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            listeners: ListenerRegistry::default(),
            default_gc_time,
        }
    }

    /// Pure lookup.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        read_lock(&self.entries, COMPONENT, "get").get(key).cloned()
    }

    /// Typed lookup of the cached data.
    pub fn get_data<T: Any + Send + Sync>(&self, key: &CacheKey) -> Result<Option<Arc<T>>, CacheError> {
        match self.get(key) {
            Some(entry) => entry.try_data::<T>(),
            None => Ok(None),
        }
    }

    /// Apply `updater` to the entry for `key`, creating it if absent, then
    /// notify the key's subscribers.
    pub fn set<F>(&self, key: &CacheKey, updater: F) -> Arc<CacheEntry>
    where
        F: FnOnce(&mut CacheEntry),
    {
        self.set_with_gc(key, self.default_gc_time, updater)
    }

    /// Like [`set`](Self::set), raising the entry's gc time to `gc_time`.
    pub fn set_with_gc<F>(&self, key: &CacheKey, gc_time: Duration, updater: F) -> Arc<CacheEntry>
    where
        F: FnOnce(&mut CacheEntry),
    {
        let snapshot = {
            let mut entries = write_lock(&self.entries, COMPONENT, "set");
            self.write_entry(&mut entries, key, gc_time, updater)
        };
        self.listeners.flush(key);
        snapshot
    }

    /// Derive a value from the current entry and write it, under one lock.
    ///
    /// When `compute` fails nothing is written: no entry is created, the
    /// version is not bumped and nobody is notified.
    pub(crate) fn try_set<T, E, C, A>(&self, key: &CacheKey, compute: C, apply: A) -> Result<T, E>
    where
        C: FnOnce(Option<&CacheEntry>) -> Result<T, E>,
        A: FnOnce(&mut CacheEntry, &T),
    {
        let value = {
            let mut entries = write_lock(&self.entries, COMPONENT, "try_set");
            let value = compute(entries.get(key).map(Arc::as_ref))?;
            self.write_entry(&mut entries, key, self.default_gc_time, |entry| apply(entry, &value));
            value
        };
        self.listeners.flush(key);
        Ok(value)
    }

    /// Update an existing entry only when `predicate` accepts it.
    ///
    /// The check and the write happen under one lock, so nothing can slip in
    /// between them.
    pub(crate) fn update_if<P, F>(&self, key: &CacheKey, predicate: P, updater: F) -> Option<Arc<CacheEntry>>
    where
        P: FnOnce(&CacheEntry) -> bool,
        F: FnOnce(&mut CacheEntry),
    {
        let snapshot = {
            let mut entries = write_lock(&self.entries, COMPONENT, "update_if");
            let slot = entries.get_mut(key)?;
            if !predicate(slot) {
                return None;
            }
            let entry = Arc::make_mut(slot);
            updater(entry);
            entry.touch();
            let snapshot = Arc::clone(slot);
            self.listeners.enqueue(key, Some(Arc::clone(&snapshot)));
            snapshot
        };
        self.listeners.flush(key);
        Some(snapshot)
    }

    /// Remove an entry only when `predicate` accepts it.
    pub(crate) fn remove_if<P>(&self, key: &CacheKey, predicate: P) -> bool
    where
        P: FnOnce(&CacheEntry) -> bool,
    {
        let removed = {
            let mut entries = write_lock(&self.entries, COMPONENT, "remove_if");
            let removed = match entries.get(key) {
                Some(entry) if predicate(entry) => entries.remove(key).is_some(),
                _ => false,
            };
            if removed {
                self.listeners.enqueue(key, None);
            }
            removed
        };
        self.listeners.flush(key);
        removed
    }

    /// Write authoritative data directly, as if it had just been fetched.
    pub fn set_data<T: Any + Send + Sync>(
        &self,
        key: &CacheKey,
        value: T,
        stale_time: Duration,
    ) -> Arc<CacheEntry> {
        let now = Instant::now();
        self.set(key, |entry| entry.set_success(cached(value), now, stale_time))
    }

    /// Mark every entry under `prefix` stale, keeping its data. Nothing is
    /// fetched here; readers and observers refetch on their next access.
    pub fn invalidate(&self, prefix: &CacheKey) -> usize {
        let now = Instant::now();
        let touched: Vec<CacheKey> = {
            let mut entries = write_lock(&self.entries, COMPONENT, "invalidate");
            prefix_range_mut(&mut entries, prefix)
                .map(|(key, slot)| {
                    let entry = Arc::make_mut(slot);
                    entry.mark_stale(now);
                    entry.touch();
                    self.listeners.enqueue(key, Some(Arc::clone(slot)));
                    key.clone()
                })
                .collect()
        };

        debug!(prefix = %prefix, invalidated = touched.len(), "Cache prefix invalidated");
        for key in &touched {
            self.listeners.flush(key);
        }
        touched.len()
    }

    /// Delete one entry unconditionally.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let removed = {
            let mut entries = write_lock(&self.entries, COMPONENT, "remove");
            let removed = entries.remove(key).is_some();
            if removed {
                self.listeners.enqueue(key, None);
            }
            removed
        };
        self.listeners.flush(key);
        removed
    }

    /// Delete every entry under `prefix`.
    pub fn remove_prefix(&self, prefix: &CacheKey) -> usize {
        let removed: Vec<CacheKey> = {
            let mut entries = write_lock(&self.entries, COMPONENT, "remove_prefix");
            let keys: Vec<CacheKey> = prefix_range(&entries, prefix).map(|(key, _)| key.clone()).collect();
            for key in &keys {
                entries.remove(key);
                self.listeners.enqueue(key, None);
            }
            keys
        };
        for key in &removed {
            self.listeners.flush(key);
        }
        removed.len()
    }

    /// Garbage-collection pass: drop unobserved entries whose gc deadline
    /// has passed.
    pub fn evict(&self) -> usize {
        let now = Instant::now();
        let evicted = {
            let mut entries = write_lock(&self.entries, COMPONENT, "evict");
            let before = entries.len();
            entries.retain(|_, entry| !entry.is_collectable(now));
            before - entries.len()
        };

        if evicted > 0 {
            counter!(METRIC_EVICT_TOTAL).increment(evicted as u64);
            info!(evicted, "Cache entries evicted");
        }
        evicted
    }

    /// Keys currently cached, in canonical order.
    pub fn keys(&self) -> Vec<CacheKey> {
        read_lock(&self.entries, COMPONENT, "keys").keys().cloned().collect()
    }

    /// Keys currently cached under `prefix`, in canonical order.
    pub fn keys_with_prefix(&self, prefix: &CacheKey) -> Vec<CacheKey> {
        let entries = read_lock(&self.entries, COMPONENT, "keys_with_prefix");
        prefix_range(&entries, prefix).map(|(key, _)| key.clone()).collect()
    }

    pub fn len(&self) -> usize {
        read_lock(&self.entries, COMPONENT, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry, notifying subscribers of each removal.
    pub fn clear(&self) {
        let keys: Vec<CacheKey> = {
            let mut entries = write_lock(&self.entries, COMPONENT, "clear");
            let keys: Vec<CacheKey> = entries.keys().cloned().collect();
            entries.clear();
            for key in &keys {
                self.listeners.enqueue(key, None);
            }
            keys
        };
        for key in &keys {
            self.listeners.flush(key);
        }
    }

    /// Observe `key`. The entry is created `Idle` when absent so its
    /// subscriber count is tracked from the start.
    pub fn subscribe<F>(self: &Arc<Self>, key: &CacheKey, listener: F) -> Subscription
    where
        F: Fn(Option<&Arc<CacheEntry>>) + Send + Sync + 'static,
    {
        self.subscribe_listener(key, Arc::new(listener))
    }

    pub(crate) fn subscribe_listener(self: &Arc<Self>, key: &CacheKey, listener: Listener) -> Subscription {
        let mut entries = write_lock(&self.entries, COMPONENT, "subscribe");
        let (id, count) = self.listeners.add(key, listener);
        let slot = self.slot(&mut entries, key, self.default_gc_time);
        Arc::make_mut(slot).subscriber_count = count;
        drop(entries);

        debug!(key = %key, subscribers = count, "Cache key subscribed");
        Subscription::new(key.clone(), id, Arc::clone(self))
    }

    /// Returns the number of subscribers left on `key`.
    pub(crate) fn unsubscribe(&self, key: &CacheKey, id: SubscriberId) -> usize {
        let now = Instant::now();
        let mut entries = write_lock(&self.entries, COMPONENT, "unsubscribe");
        let Some(remaining) = self.listeners.remove(key, id) else {
            return self.listeners.count(key);
        };
        if let Some(slot) = entries.get_mut(key) {
            let entry = Arc::make_mut(slot);
            entry.subscriber_count = remaining;
            if remaining == 0 {
                entry.arm_gc(now);
            }
        }
        remaining
    }

    /// Apply `updater` under the held write lock and queue the change.
    fn write_entry<F>(&self, entries: &mut EntryMap, key: &CacheKey, gc_time: Duration, updater: F) -> Arc<CacheEntry>
    where
        F: FnOnce(&mut CacheEntry),
    {
        let slot = self.slot(entries, key, gc_time);
        let entry = Arc::make_mut(slot);
        entry.raise_gc_time(gc_time);
        updater(entry);
        if entry.subscriber_count == 0 {
            entry.arm_gc(Instant::now());
        }
        entry.touch();
        let snapshot = Arc::clone(slot);
        self.listeners.enqueue(key, Some(Arc::clone(&snapshot)));
        snapshot
    }

    fn slot<'a>(&self, entries: &'a mut EntryMap, key: &CacheKey, gc_time: Duration) -> &'a mut Arc<CacheEntry> {
        entries.entry(key.clone()).or_insert_with(|| {
            let mut entry = CacheEntry::new(key.clone(), gc_time, Instant::now());
            entry.subscriber_count = self.listeners.count(key);
            Arc::new(entry)
        })
    }
}

fn prefix_range<'a>(
    entries: &'a EntryMap,
    prefix: &'a CacheKey,
) -> impl Iterator<Item = (&'a CacheKey, &'a Arc<CacheEntry>)> + 'a {
    entries
        .range((Bound::Included(prefix), Bound::Unbounded))
        .take_while(move |(key, _)| key.starts_with(prefix))
}

fn prefix_range_mut<'a>(
    entries: &'a mut EntryMap,
    prefix: &'a CacheKey,
) -> impl Iterator<Item = (&'a CacheKey, &'a mut Arc<CacheEntry>)> + 'a {
    entries
        .range_mut((Bound::Included(prefix), Bound::Unbounded))
        .take_while(move |(key, _)| key.starts_with(prefix))
}
