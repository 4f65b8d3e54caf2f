//! Listener registry.
//!
//! Listeners observe exactly one key. They run after every change of that
//! key's entry, outside the store lock, in subscription order.
//!
//! Changes are queued per key while the store lock is held, so the queue is
//! in version order. One caller at a time drains a key's queue; a writer that
//! finds the queue already being drained leaves its change to that drainer.
//! A listener that writes to its own key therefore sees the change delivered
//! after it returns, not re-entrantly.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use super::entry::CacheEntry;
use super::keys::CacheKey;
use super::lock::{mutex_lock, read_lock, write_lock};
use super::store::CacheStore;

const COMPONENT: &str = "cache::subscription";

/// Called with the new entry snapshot, or `None` once the entry is removed.
pub type Listener = Arc<dyn Fn(Option<&Arc<CacheEntry>>) + Send + Sync>;

type ReleaseHook = Box<dyn FnOnce(usize) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type Change = Option<Arc<CacheEntry>>;

#[derive(Default)]
struct Outbox {
    pending: VecDeque<Change>,
    draining: bool,
}

#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<CacheKey, Vec<(SubscriberId, Listener)>>>,
    outboxes: Mutex<HashMap<CacheKey, Outbox>>,
}

impl ListenerRegistry {
    pub(crate) fn add(&self, key: &CacheKey, listener: Listener) -> (SubscriberId, usize) {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = write_lock(&self.listeners, COMPONENT, "add");
        let slot = listeners.entry(key.clone()).or_default();
        slot.push((id, listener));
        (id, slot.len())
    }

    /// Returns the number of listeners left on `key`, or `None` if `id` was
    /// not registered there.
    pub(crate) fn remove(&self, key: &CacheKey, id: SubscriberId) -> Option<usize> {
        let mut listeners = write_lock(&self.listeners, COMPONENT, "remove");
        let slot = listeners.get_mut(key)?;
        let position = slot.iter().position(|(existing, _)| *existing == id)?;
        slot.remove(position);
        let remaining = slot.len();
        if remaining == 0 {
            listeners.remove(key);
        }
        Some(remaining)
    }

    pub(crate) fn count(&self, key: &CacheKey) -> usize {
        read_lock(&self.listeners, COMPONENT, "count")
            .get(key)
            .map_or(0, Vec::len)
    }

    /// Queue a change of `key`. Must be called while the store's write lock
    /// is held, so queued changes follow version order.
    pub(crate) fn enqueue(&self, key: &CacheKey, change: Change) {
        if self.count(key) == 0 {
            return;
        }
        mutex_lock(&self.outboxes, COMPONENT, "enqueue")
            .entry(key.clone())
            .or_default()
            .pending
            .push_back(change);
    }

    /// Deliver queued changes of `key` unless another caller is already
    /// delivering them. Called after the store lock is released.
    pub(crate) fn flush(&self, key: &CacheKey) {
        {
            let mut outboxes = mutex_lock(&self.outboxes, COMPONENT, "flush");
            match outboxes.get_mut(key) {
                Some(outbox) if !outbox.draining => outbox.draining = true,
                _ => return,
            }
        }

        let _draining = Draining { registry: self, key };
        while let Some(change) = self.next_change(key) {
            self.deliver(key, change.as_ref());
        }
    }

    /// Pop the oldest queued change; the outbox is dropped once empty.
    fn next_change(&self, key: &CacheKey) -> Option<Change> {
        let mut outboxes = mutex_lock(&self.outboxes, COMPONENT, "next_change");
        let outbox = outboxes.get_mut(key)?;
        let next = outbox.pending.pop_front();
        if next.is_none() {
            outboxes.remove(key);
        }
        next
    }

    fn deliver(&self, key: &CacheKey, entry: Option<&Arc<CacheEntry>>) {
        let targets: Vec<Listener> = read_lock(&self.listeners, COMPONENT, "deliver")
            .get(key)
            .map(|slot| slot.iter().map(|(_, listener)| Arc::clone(listener)).collect())
            .unwrap_or_default();

        for listener in targets {
            listener(entry);
        }
    }
}

/// Hands a key's outbox back when a listener panics mid-delivery, so the
/// next writer resumes draining it.
struct Draining<'a> {
    registry: &'a ListenerRegistry,
    key: &'a CacheKey,
}

impl Drop for Draining<'_> {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }
        let mut outboxes = mutex_lock(&self.registry.outboxes, COMPONENT, "drain_abort");
        if let Some(outbox) = outboxes.get_mut(self.key) {
            outbox.draining = false;
        }
    }
}

/// Active subscription to one key. Dropping it unsubscribes.
pub struct Subscription {
    key: CacheKey,
    id: SubscriberId,
    store: Arc<CacheStore>,
    on_release: Option<ReleaseHook>,
    active: bool,
}

impl Subscription {
    pub(crate) fn new(key: CacheKey, id: SubscriberId, store: Arc<CacheStore>) -> Self {
        Self {
            key,
            id,
            store,
            on_release: None,
            active: true,
        }
    }

    /// Run `hook` with the remaining subscriber count once this
    /// subscription ends.
    pub(crate) fn on_release(mut self, hook: impl FnOnce(usize) + Send + Sync + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Latest snapshot of the observed entry.
    pub fn current(&self) -> Option<Arc<CacheEntry>> {
        self.store.get(&self.key)
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let remaining = self.store.unsubscribe(&self.key, self.id);
        if let Some(hook) = self.on_release.take() {
            hook(remaining);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}
