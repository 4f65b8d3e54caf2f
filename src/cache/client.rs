//! Query client.
//!
//! Bundles the store, coordinators, invalidation graph and event queue into
//! one explicitly constructed context. Build one per application (or per
//! test) and pass it down; clones share all state.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use tracing::info;

use crate::error::{CacheError, TransportError};

use super::config::{CacheConfig, ReadOptions};
use super::entry::CacheEntry;
use super::events::{EventQueue, MutationEvent};
use super::fetch::FetchCoordinator;
use super::graph::InvalidationGraph;
use super::keys::CacheKey;
use super::maintenance::Maintenance;
use super::mutation::{Mutation, MutationCoordinator, MutationOptions};
use super::observer::QueryObserver;
use super::planner::InvalidationPlan;
use super::store::CacheStore;
use super::subscription::Subscription;

#[derive(Clone)]
pub struct QueryClient {
    config: CacheConfig,
    store: Arc<CacheStore>,
    graph: Arc<InvalidationGraph>,
    events: Arc<EventQueue>,
    fetcher: FetchCoordinator,
    mutations: MutationCoordinator,
}

impl QueryClient {
    pub fn new(config: CacheConfig) -> Self {
        let store = Arc::new(CacheStore::new(config.gc_time()));
        let graph = Arc::new(InvalidationGraph::new());
        let events = Arc::new(EventQueue::new(config.event_queue_limit_non_zero()));
        let fetcher = FetchCoordinator::new(Arc::clone(&store));
        let mutations =
            MutationCoordinator::new(Arc::clone(&store), Arc::clone(&graph), Arc::clone(&events));

        info!(
            enabled = config.enabled,
            stale_time_ms = config.stale_time_ms,
            gc_time_ms = config.gc_time_ms,
            retry = config.retry,
            "Query client created"
        );

        Self {
            config,
            store,
            graph,
            events,
            fetcher,
            mutations,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn graph(&self) -> &InvalidationGraph {
        &self.graph
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    pub fn fetcher(&self) -> &FetchCoordinator {
        &self.fetcher
    }

    pub fn mutations(&self) -> &MutationCoordinator {
        &self.mutations
    }

    /// Read options built from the client's configuration.
    pub fn read_options(&self) -> ReadOptions {
        self.config.read_options()
    }

    /// [`FetchCoordinator::read`] with the default read options.
    pub async fn read<T, F, Fut>(&self, key: &CacheKey, fetch_fn: F) -> Result<Arc<T>, CacheError>
    where
        T: Any + Send + Sync,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
    {
        self.fetcher.read(key, &self.read_options(), fetch_fn).await
    }

    pub async fn read_with<T, F, Fut>(
        &self,
        key: &CacheKey,
        options: &ReadOptions,
        fetch_fn: F,
    ) -> Result<Arc<T>, CacheError>
    where
        T: Any + Send + Sync,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
    {
        self.fetcher.read(key, options, fetch_fn).await
    }

    pub async fn fetch<T, F, Fut>(
        &self,
        key: &CacheKey,
        options: &ReadOptions,
        fetch_fn: F,
    ) -> Result<Arc<T>, CacheError>
    where
        T: Any + Send + Sync,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
    {
        self.fetcher.fetch(key, options, fetch_fn).await
    }

    pub fn prefetch<T, F, Fut>(&self, key: &CacheKey, options: &ReadOptions, fetch_fn: F) -> bool
    where
        T: Any + Send + Sync,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
    {
        self.fetcher.prefetch(key, options, fetch_fn)
    }

    pub async fn mutate<R, F, Fut>(&self, options: MutationOptions<R>, remote: F) -> Result<R, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, TransportError>>,
    {
        self.mutations.mutate(options, remote).await
    }

    pub fn mutation<R>(&self, options: MutationOptions<R>) -> Mutation<R> {
        self.mutations.prepare(options)
    }

    /// Mark everything under `pattern`, and its linked dependents, stale.
    pub fn invalidate(&self, pattern: &CacheKey) -> usize {
        InvalidationPlan::expanded(&self.graph, [pattern.clone()]).apply(&self.store)
    }

    /// Typed cached data, fresh or not.
    pub fn get_data<T: Any + Send + Sync>(&self, key: &CacheKey) -> Result<Option<Arc<T>>, CacheError> {
        self.store.get_data::<T>(key)
    }

    /// Write authoritative data for `key` using the default freshness window.
    pub fn set_data<T: Any + Send + Sync>(&self, key: &CacheKey, value: T) -> Arc<CacheEntry> {
        self.store.set_data(key, value, self.config.stale_time())
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        self.store.remove(key)
    }

    pub fn subscribe<L>(&self, key: &CacheKey, listener: L) -> Subscription
    where
        L: Fn(Option<&Arc<CacheEntry>>) + Send + Sync + 'static,
    {
        self.fetcher.subscribe(key, listener)
    }

    pub fn observe<T, F, Fut, L>(
        &self,
        key: CacheKey,
        options: ReadOptions,
        fetch_fn: F,
        listener: L,
    ) -> QueryObserver<T, F>
    where
        T: Any + Send + Sync,
        F: Fn() -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
        L: Fn(Option<&Arc<CacheEntry>>) + Send + Sync + 'static,
    {
        QueryObserver::new(self.fetcher.clone(), key, options, fetch_fn, listener)
    }

    /// Run one garbage-collection pass now, e.g. on a navigation boundary.
    pub fn evict(&self) -> usize {
        self.store.evict()
    }

    /// Start the periodic garbage-collection loop.
    pub fn start_maintenance(&self) -> Maintenance {
        Maintenance::spawn(Arc::clone(&self.store), self.config.gc_interval())
    }

    pub fn drain_events(&self, limit: usize) -> Vec<MutationEvent> {
        self.events.drain(limit)
    }

    /// Drop every cached entry, e.g. on sign-out.
    pub fn clear(&self) {
        self.store.clear();
        info!("Query client cleared");
    }
}
