//! Fetch coordinator.
//!
//! Serves reads from the store while fresh, collapses concurrent fetches of
//! one key into a single request, retries retryable failures with backoff
//! and keeps serving stale data while a background refetch runs.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use metrics::{counter, histogram};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, debug_span, instrument, warn};

use crate::error::{CacheError, TransportError};

use super::config::ReadOptions;
use super::entry::{CacheEntry, CachedValue, cached};
use super::inflight::{Attach, FetchResult, InFlightRequests, Ticket};
use super::keys::CacheKey;
use super::retry::RetryPolicy;
use super::store::CacheStore;
use super::subscription::Subscription;

const METRIC_READ_HIT_TOTAL: &str = "tidecache_read_hit_total";
const METRIC_READ_MISS_TOTAL: &str = "tidecache_read_miss_total";
const METRIC_READ_DEDUP_TOTAL: &str = "tidecache_read_dedup_total";
const METRIC_FETCH_RETRY_TOTAL: &str = "tidecache_fetch_retry_total";
const METRIC_FETCH_MS: &str = "tidecache_fetch_ms";

/// Coordinates reads of remote resources through the cache.
///
/// Cloning is cheap; clones share the store and the in-flight registry.
#[derive(Clone)]
pub struct FetchCoordinator {
    store: Arc<CacheStore>,
    inflight: InFlightRequests,
}

impl FetchCoordinator {
    pub fn new(store: Arc<CacheStore>) -> Self {
        let inflight = InFlightRequests::new(Arc::clone(&store));
        Self { store, inflight }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Read `key`, fetching only when nothing fresh is cached.
    ///
    /// - Fresh data is returned without a network call.
    /// - Stale data is returned immediately while a background refetch runs;
    ///   that refetch never reports its failure here.
    /// - Without data the caller waits for the (shared) fetch.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn read<T, F, Fut>(
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
        let entry = self.store.get(key);
        if let Some(value) = fresh_data::<T>(key, entry.as_deref())? {
            return Ok(value);
        }
        if !options.enabled {
            return disabled_read(key, entry.as_deref());
        }

        if let Some(entry) = entry.as_deref().filter(|entry| entry.has_data()) {
            let stale = entry
                .try_data::<T>()?
                .ok_or_else(|| CacheError::type_mismatch::<T>(key.canonical()))?;
            counter!(METRIC_READ_MISS_TOTAL).increment(1);
            debug!("Serving stale data while revalidating");
            self.start(key, options, fetch_fn, Attach::Detached);
            return Ok(stale);
        }

        counter!(METRIC_READ_MISS_TOTAL).increment(1);
        self.await_fetch(key, options, fetch_fn).await
    }

    /// Like [`read`](Self::read), but waits for the refetch of stale data
    /// instead of serving it.
    #[instrument(skip_all, fields(key = %key))]
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
        let entry = self.store.get(key);
        if let Some(value) = fresh_data::<T>(key, entry.as_deref())? {
            return Ok(value);
        }
        if !options.enabled {
            return disabled_read(key, entry.as_deref());
        }

        counter!(METRIC_READ_MISS_TOTAL).increment(1);
        self.await_fetch(key, options, fetch_fn).await
    }

    /// Start fetching `key` in the background unless it is fresh.
    ///
    /// Returns whether a request is now running for the key. Must be called
    /// within a tokio runtime.
    pub fn prefetch<T, F, Fut>(&self, key: &CacheKey, options: &ReadOptions, fetch_fn: F) -> bool
    where
        T: Any + Send + Sync,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
    {
        let fresh = self
            .store
            .get(key)
            .is_some_and(|entry| entry.is_fresh(Instant::now()));
        if fresh || !options.enabled {
            return false;
        }
        self.start(key, options, fetch_fn, Attach::Detached);
        true
    }

    /// Whether a request for `key` is running.
    pub fn is_fetching(&self, key: &CacheKey) -> bool {
        self.inflight.contains(key)
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Abort the background request for `key` once nobody observes the key
    /// any more.
    pub(crate) fn release(&self, key: &CacheKey) -> bool {
        self.inflight.cancel_detached(key)
    }

    /// Subscribe to `key`. When the last subscriber leaves, a background
    /// fetch of the key that nobody awaits is aborted.
    pub fn subscribe<L>(&self, key: &CacheKey, listener: L) -> Subscription
    where
        L: Fn(Option<&Arc<CacheEntry>>) + Send + Sync + 'static,
    {
        let fetcher = self.clone();
        let released = key.clone();
        self.store
            .subscribe(key, listener)
            .on_release(move |remaining| {
                if remaining == 0 {
                    fetcher.release(&released);
                }
            })
    }

    async fn await_fetch<T, F, Fut>(
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
        let ticket = self.start(key, options, fetch_fn, Attach::Waiter);
        let value = ticket.wait().await?;
        value
            .downcast::<T>()
            .map_err(|_| CacheError::type_mismatch::<T>(key.canonical()))
    }

    fn start<T, F, Fut>(
        &self,
        key: &CacheKey,
        options: &ReadOptions,
        fetch_fn: F,
        attach: Attach,
    ) -> Ticket
    where
        T: Any + Send + Sync,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
    {
        let ticket = self
            .inflight
            .acquire(key, attach, |id| self.spawn(key.clone(), id, options, fetch_fn));
        if ticket.joined() {
            counter!(METRIC_READ_DEDUP_TOTAL).increment(1);
            debug!(key = %key, "Joined in-flight request");
        }
        ticket
    }

    fn spawn<T, F, Fut>(
        &self,
        key: CacheKey,
        id: u64,
        options: &ReadOptions,
        fetch_fn: F,
    ) -> JoinHandle<FetchResult>
    where
        T: Any + Send + Sync,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let inflight = self.inflight.clone();
        let policy = options.retry;
        let stale_time = options.stale_time;
        let gc_time = options.gc_time;
        let span = debug_span!("cache_fetch", key = %key, request = id);

        tokio::spawn(
            async move {
                store.set_with_gc(&key, gc_time, CacheEntry::set_pending);

                let started = Instant::now();
                let result = AssertUnwindSafe(fetch_with_retry(policy, &fetch_fn))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(TransportError::network("fetch function panicked").into()));
                histogram!(METRIC_FETCH_MS).record(started.elapsed().as_secs_f64() * 1000.0);

                match &result {
                    Ok(value) => {
                        let value = CachedValue::clone(value);
                        store.set(&key, move |entry| {
                            entry.set_success(value, Instant::now(), stale_time);
                        });
                        debug!("Fetch succeeded");
                    }
                    Err(error) => {
                        warn!(error = %error, "Fetch failed");
                        let error = error.clone();
                        store.set(&key, move |entry| entry.set_error(error));
                    }
                }

                inflight.finish(&key, id);
                result
            }
            .instrument(span),
        )
    }
}

async fn fetch_with_retry<T, F, Fut>(policy: RetryPolicy, fetch_fn: &F) -> FetchResult
where
    T: Any + Send + Sync,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut attempt = 0;
    loop {
        match fetch_fn().await {
            Ok(value) => return Ok(cached(value)),
            Err(error) if policy.should_retry(attempt, &error) => {
                let delay = policy.delay_for(attempt);
                counter!(METRIC_FETCH_RETRY_TOTAL).increment(1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "Retrying fetch");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error.into()),
        }
    }
}

fn fresh_data<T: Any + Send + Sync>(
    key: &CacheKey,
    entry: Option<&CacheEntry>,
) -> Result<Option<Arc<T>>, CacheError> {
    match entry {
        Some(entry) if entry.is_fresh(Instant::now()) => {
            let value = entry.try_data::<T>()?;
            if value.is_some() {
                counter!(METRIC_READ_HIT_TOTAL).increment(1);
                debug!(key = %key, "Cache hit");
            }
            Ok(value)
        }
        _ => Ok(None),
    }
}

fn disabled_read<T: Any + Send + Sync>(
    key: &CacheKey,
    entry: Option<&CacheEntry>,
) -> Result<Arc<T>, CacheError> {
    match entry.map(CacheEntry::try_data::<T>).transpose()?.flatten() {
        Some(value) => Ok(value),
        None => Err(CacheError::Disabled {
            key: key.canonical(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::future::BoxFuture;

    use super::*;
    use crate::cache::entry::FetchStatus;

    fn key() -> CacheKey {
        CacheKey::from_segments(["docs", "detail", "42"]).expect("valid key")
    }

    fn coordinator() -> FetchCoordinator {
        FetchCoordinator::new(Arc::new(CacheStore::new(Duration::from_secs(300))))
    }

    /// Returns `"v{n}"` for the n-th call after a short delay.
    fn versioned(
        calls: &Arc<AtomicUsize>,
    ) -> impl Fn() -> BoxFuture<'static, Result<String, TransportError>> + Clone + Send + Sync + 'static
    {
        let calls = Arc::clone(calls);
        move || {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(format!("v{n}"))
            }
            .boxed()
        }
    }

    /// Fails with `error` for the first `failures` calls, then succeeds.
    fn flaky(
        calls: &Arc<AtomicUsize>,
        failures: usize,
        error: TransportError,
    ) -> impl Fn() -> BoxFuture<'static, Result<String, TransportError>> + Clone + Send + Sync + 'static
    {
        let calls = Arc::clone(calls);
        move || {
            let calls = Arc::clone(&calls);
            let error = error.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= failures { Err(error) } else { Ok(format!("v{n}")) }
            }
            .boxed()
        }
    }

    fn options() -> ReadOptions {
        ReadOptions::default().with_stale_time(Duration::from_secs(300))
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_reads_share_one_fetch() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = versioned(&calls);
        let options = options();

        let (key_a, key_b) = (key(), key());
        let (first, second) = tokio::join!(
            coordinator.read(&key_a, &options, fetcher.clone()),
            coordinator.read(&key_b, &options, fetcher.clone()),
        );
        let first: Arc<String> = first.expect("first read");
        let second: Arc<String> = second.expect("second read");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.as_str(), "v1");
        assert!(!coordinator.is_fetching(&key()));
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_reads_do_not_refetch_and_stale_reads_revalidate() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = versioned(&calls);
        let options = options();

        let initial: Arc<String> = coordinator
            .read(&key(), &options, fetcher.clone())
            .await
            .expect("initial read");
        assert_eq!(initial.as_str(), "v1");

        tokio::time::advance(Duration::from_secs(100)).await;
        let cached: Arc<String> = coordinator
            .read(&key(), &options, fetcher.clone())
            .await
            .expect("cached read");
        assert_eq!(cached.as_str(), "v1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(300)).await;
        let stale: Arc<String> = coordinator
            .read(&key(), &options, fetcher.clone())
            .await
            .expect("stale read");
        assert_eq!(stale.as_str(), "v1");
        assert!(coordinator.is_fetching(&key()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let entry = coordinator.store().get(&key()).expect("entry");
        assert_eq!(entry.data::<String>().as_deref().map(String::as_str), Some("v2"));
        assert!(entry.is_fresh(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_waits_for_refetch_of_stale_data() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = versioned(&calls);
        let options = ReadOptions::default();

        let _: Arc<String> = coordinator.fetch(&key(), &options, fetcher.clone()).await.expect("first");
        let second: Arc<String> = coordinator.fetch(&key(), &options, fetcher.clone()).await.expect("second");
        assert_eq!(second.as_str(), "v2");
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_errors_are_retried_with_backoff() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        let value: Arc<String> = coordinator
            .read(&key(), &options(), flaky(&calls, 2, TransportError::network("reset")))
            .await
            .expect("third attempt succeeds");

        assert_eq!(value.as_str(), "v3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn final_failure_is_recorded_on_entry() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));

        let error = coordinator
            .read::<String, _, _>(&key(), &options(), flaky(&calls, 10, TransportError::server(422, "bad")))
            .await
            .expect_err("validation-like errors fail");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(error.transport(), Some(&TransportError::server(422, "bad")));
        let entry = coordinator.store().get(&key()).expect("entry");
        assert_eq!(entry.status(), FetchStatus::Error);
        assert!(!coordinator.is_fetching(&key()));
    }

    #[tokio::test(start_paused = true)]
    async fn background_failure_keeps_stale_data() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        coordinator
            .store()
            .set_data(&key(), "v0".to_string(), Duration::ZERO);

        let stale: Arc<String> = coordinator
            .read(&key(), &options(), flaky(&calls, 10, TransportError::server(404, "gone")))
            .await
            .expect("stale data served");
        assert_eq!(stale.as_str(), "v0");

        tokio::time::sleep(Duration::from_millis(10)).await;
        let entry = coordinator.store().get(&key()).expect("entry");
        assert_eq!(entry.status(), FetchStatus::Error);
        assert!(entry.error().is_some());
        assert_eq!(entry.data::<String>().as_deref().map(String::as_str), Some("v0"));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_reads_never_fetch() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = options().enabled(false);

        let error = coordinator
            .read::<String, _, _>(&key(), &options, versioned(&calls))
            .await
            .expect_err("nothing cached");
        assert!(matches!(error, CacheError::Disabled { .. }));

        coordinator.store().set_data(&key(), "old".to_string(), Duration::ZERO);
        let value: Arc<String> = coordinator
            .read(&key(), &options, versioned(&calls))
            .await
            .expect("stale data served");
        assert_eq!(value.as_str(), "old");
        assert!(!coordinator.prefetch::<String, _, _>(&key(), &options, versioned(&calls)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn type_mismatch_fails_without_fetching() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        coordinator.store().set_data(&key(), 7_u32, Duration::MAX);

        let error = coordinator
            .read::<String, _, _>(&key(), &options(), versioned(&calls))
            .await
            .expect_err("u32 is not a String");
        assert!(matches!(error, CacheError::TypeMismatch { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_only_waiter_cancels_the_fetch() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = versioned(&calls);

        let timed_out = tokio::time::timeout(
            Duration::from_millis(5),
            coordinator.read::<String, _, _>(&key(), &options(), fetcher.clone()),
        )
        .await;
        assert!(timed_out.is_err());
        assert!(!coordinator.is_fetching(&key()));
        assert_eq!(
            coordinator.store().get(&key()).expect("entry").status(),
            FetchStatus::Idle
        );

        let value: Arc<String> = coordinator
            .read(&key(), &options(), fetcher.clone())
            .await
            .expect("new request");
        assert_eq!(value.as_str(), "v2");
    }

    #[tokio::test(start_paused = true)]
    async fn subscriber_keeps_the_request_alive_after_waiter_leaves() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let subscription = coordinator.subscribe(&key(), |_| {});

        let timed_out = tokio::time::timeout(
            Duration::from_millis(5),
            coordinator.fetch::<String, _, _>(&key(), &options(), versioned(&calls)),
        )
        .await;
        assert!(timed_out.is_err());
        assert!(coordinator.is_fetching(&key()));
        assert_eq!(
            coordinator.store().get(&key()).expect("entry").status(),
            FetchStatus::Pending
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        let entry = subscription.current().expect("entry");
        assert_eq!(entry.status(), FetchStatus::Success);
        assert_eq!(entry.data::<String>().as_deref().map(String::as_str), Some("v1"));
        assert!(!coordinator.is_fetching(&key()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_cancels_a_request_its_waiter_abandoned() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let subscription = coordinator.subscribe(&key(), |_| {});

        let timed_out = tokio::time::timeout(
            Duration::from_millis(5),
            coordinator.fetch::<String, _, _>(&key(), &options(), versioned(&calls)),
        )
        .await;
        assert!(timed_out.is_err());

        subscription.unsubscribe();
        assert!(!coordinator.is_fetching(&key()));
        assert_eq!(
            coordinator.store().get(&key()).expect("entry").status(),
            FetchStatus::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_waiter_keeps_the_request_alive() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = versioned(&calls);
        let options = options();

        let (key_a, key_b) = (key(), key());
        let (impatient, patient) = tokio::join!(
            tokio::time::timeout(
                Duration::from_millis(5),
                coordinator.read::<String, _, _>(&key_a, &options, fetcher.clone()),
            ),
            coordinator.read::<String, _, _>(&key_b, &options, fetcher.clone()),
        );

        assert!(impatient.is_err());
        assert_eq!(patient.expect("patient read").as_str(), "v1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn last_unsubscribe_cancels_background_fetch() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = coordinator.subscribe(&key(), |_| {});
        let second = coordinator.subscribe(&key(), |_| {});
        assert!(coordinator.prefetch(&key(), &options(), versioned(&calls)));

        drop(first);
        assert!(coordinator.is_fetching(&key()));
        drop(second);
        assert!(!coordinator.is_fetching(&key()));
        assert_eq!(
            coordinator.store().get(&key()).expect("entry").status(),
            FetchStatus::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn prefetch_runs_detached_and_can_be_released() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));

        assert!(coordinator.prefetch(&key(), &options(), versioned(&calls)));
        assert!(coordinator.is_fetching(&key()));
        assert!(coordinator.release(&key()));
        assert!(!coordinator.is_fetching(&key()));

        assert!(coordinator.prefetch(&key(), &options(), versioned(&calls)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let entry = coordinator.store().get(&key()).expect("entry");
        assert_eq!(entry.status(), FetchStatus::Success);
        assert!(!coordinator.prefetch(&key(), &options(), versioned(&calls)));
    }
}
