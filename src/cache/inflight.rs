//! In-flight request registry.
//!
//! Holds at most one request per cache key. Every caller awaiting a request
//! holds a [`WaiterGuard`]; the last guard to drop aborts a request nobody
//! else depends on, neither a waiter nor a subscriber of the key. Background
//! (detached) requests survive their waiters and are aborted only through
//! [`InFlightRequests::cancel_detached`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::gauge;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;

use crate::error::{CacheError, TransportError};

use super::entry::{CachedValue, FetchStatus};
use super::keys::CacheKey;
use super::store::CacheStore;

const METRIC_INFLIGHT: &str = "tidecache_inflight";

pub(crate) type FetchResult = Result<CachedValue, CacheError>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

struct Request {
    id: u64,
    shared: SharedFetch,
    abort: AbortHandle,
    waiters: usize,
    detached: bool,
}

/// How a caller attaches to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Attach {
    /// The caller awaits the result and keeps the request alive meanwhile.
    Waiter,
    /// The request keeps running without anyone awaiting it.
    Detached,
}

#[derive(Clone)]
pub(crate) struct InFlightRequests {
    requests: Arc<DashMap<CacheKey, Request>>,
    next_id: Arc<AtomicU64>,
    store: Arc<CacheStore>,
}

impl InFlightRequests {
    pub(crate) fn new(store: Arc<CacheStore>) -> Self {
        Self {
            requests: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(0)),
            store,
        }
    }

    /// Attach to the request for `key`, calling `start` with a fresh request
    /// id when there is none.
    ///
    /// `start` runs under the registry's entry lock and must only spawn the
    /// fetch task; it must not touch the store.
    pub(crate) fn acquire<S>(&self, key: &CacheKey, attach: Attach, start: S) -> Ticket
    where
        S: FnOnce(u64) -> JoinHandle<FetchResult>,
    {
        let (id, shared, joined) = match self.requests.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let request = occupied.get_mut();
                match attach {
                    Attach::Waiter => request.waiters += 1,
                    Attach::Detached => request.detached = true,
                }
                (request.id, request.shared.clone(), true)
            }
            Entry::Vacant(vacant) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let handle = start(id);
                let abort = handle.abort_handle();
                let shared = join_shared(handle);
                vacant.insert(Request {
                    id,
                    shared: shared.clone(),
                    abort,
                    waiters: usize::from(attach == Attach::Waiter),
                    detached: attach == Attach::Detached,
                });
                (id, shared, false)
            }
        };

        if !joined {
            gauge!(METRIC_INFLIGHT).increment(1.0);
        }

        let guard = (attach == Attach::Waiter).then(|| WaiterGuard {
            requests: self.clone(),
            key: key.clone(),
            id,
        });
        Ticket {
            shared,
            joined,
            guard,
        }
    }

    /// Drop the record of a settled request.
    pub(crate) fn finish(&self, key: &CacheKey, id: u64) {
        if self.requests.remove_if(key, |_, request| request.id == id).is_some() {
            gauge!(METRIC_INFLIGHT).decrement(1.0);
        }
    }

    /// Abort a background request that nobody awaits. Returns whether a
    /// request was aborted.
    pub(crate) fn cancel_detached(&self, key: &CacheKey) -> bool {
        let removed = self
            .requests
            .remove_if(key, |_, request| request.detached && request.waiters == 0);
        let Some((_, request)) = removed else {
            return false;
        };
        request.abort.abort();
        gauge!(METRIC_INFLIGHT).decrement(1.0);
        debug!(key = %key, "Background fetch cancelled");
        self.settle_cancelled(key);
        true
    }

    pub(crate) fn contains(&self, key: &CacheKey) -> bool {
        self.requests.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }

    /// A request left without waiters is aborted only when nobody observes
    /// the key; otherwise it keeps running detached and the last unsubscribe
    /// cancels it.
    fn release_waiter(&self, key: &CacheKey, id: u64) {
        // Read before taking the registry entry: the store lock is never
        // acquired while a registry shard is held.
        let observed = self
            .store
            .get(key)
            .is_some_and(|entry| entry.subscriber_count() > 0);

        let cancelled = match self.requests.entry(key.clone()) {
            Entry::Occupied(mut occupied) if occupied.get().id == id => {
                let request = occupied.get_mut();
                request.waiters = request.waiters.saturating_sub(1);
                if request.waiters > 0 || request.detached {
                    false
                } else if observed {
                    request.detached = true;
                    debug!(key = %key, "Fetch kept for subscribers; no waiter left");
                    false
                } else {
                    request.abort.abort();
                    occupied.remove();
                    true
                }
            }
            _ => false,
        };

        if cancelled {
            gauge!(METRIC_INFLIGHT).decrement(1.0);
            debug!(key = %key, "Fetch cancelled; no waiter left");
            self.settle_cancelled(key);
        }
    }

    /// Take an aborted fetch's entry out of `Pending`, unless a newer request
    /// for the key has already been registered.
    fn settle_cancelled(&self, key: &CacheKey) {
        self.store.update_if(
            key,
            |entry| entry.status() == FetchStatus::Pending && !self.requests.contains_key(key),
            |entry| entry.settle_cancelled(),
        );
    }
}

fn join_shared(handle: JoinHandle<FetchResult>) -> SharedFetch {
    async move {
        match handle.await {
            Ok(result) => result,
            Err(error) if error.is_panic() => {
                Err(TransportError::network("fetch task panicked").into())
            }
            Err(_) => Err(TransportError::Cancelled.into()),
        }
    }
    .boxed()
    .shared()
}

/// Handle on a registered request.
pub(crate) struct Ticket {
    shared: SharedFetch,
    joined: bool,
    guard: Option<WaiterGuard>,
}

impl Ticket {
    /// Whether the caller attached to a request that was already running.
    pub(crate) fn joined(&self) -> bool {
        self.joined
    }

    pub(crate) async fn wait(self) -> FetchResult {
        let Self { shared, guard, .. } = self;
        let result = shared.await;
        drop(guard);
        result
    }
}

/// Keeps a request alive while its holder awaits it.
pub(crate) struct WaiterGuard {
    requests: InFlightRequests,
    key: CacheKey,
    id: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.requests.release_waiter(&self.key, self.id);
    }
}
