//! Query observers.
//!
//! An observer is a subscription bound to a fetch function and its read
//! options. Each [`QueryObserver::refresh`] is one tick of an active
//! subscription: it fetches when the entry is absent or stale and fetching
//! is enabled, and serves the cache otherwise.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::debug;

use crate::error::{CacheError, TransportError};

use super::config::ReadOptions;
use super::entry::CacheEntry;
use super::fetch::FetchCoordinator;
use super::keys::CacheKey;
use super::subscription::Subscription;

pub struct QueryObserver<T, F> {
    key: CacheKey,
    options: ReadOptions,
    fetcher: FetchCoordinator,
    fetch_fn: F,
    subscription: Subscription,
    _value: PhantomData<fn() -> T>,
}

impl<T, F, Fut> QueryObserver<T, F>
where
    T: Any + Send + Sync,
    F: Fn() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
{
    pub fn new<L>(
        fetcher: FetchCoordinator,
        key: CacheKey,
        options: ReadOptions,
        fetch_fn: F,
        listener: L,
    ) -> Self
    where
        L: Fn(Option<&Arc<CacheEntry>>) + Send + Sync + 'static,
    {
        let subscription = fetcher.subscribe(&key, listener);
        Self {
            key,
            options,
            fetcher,
            fetch_fn,
            subscription,
            _value: PhantomData,
        }
    }

    /// Fetch if needed and return the current value.
    ///
    /// Disabled observers serve whatever is cached and fail with
    /// [`CacheError::Disabled`] when nothing is.
    pub async fn refresh(&self) -> Result<Arc<T>, CacheError> {
        self.fetcher
            .fetch(&self.key, &self.options, self.fetch_fn.clone())
            .await
    }

    /// Start a background fetch if the entry is stale. Returns whether one
    /// is running.
    pub fn refresh_in_background(&self) -> bool {
        self.fetcher
            .prefetch(&self.key, &self.options, self.fetch_fn.clone())
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn current(&self) -> Option<Arc<CacheEntry>> {
        self.subscription.current()
    }

    /// Typed view of the current data, ignoring values of another type.
    pub fn data(&self) -> Option<Arc<T>> {
        self.current().and_then(|entry| entry.data::<T>())
    }

    pub fn is_stale(&self) -> bool {
        self.current()
            .is_none_or(|entry| entry.is_stale(Instant::now()))
    }

    pub fn is_enabled(&self) -> bool {
        self.options.enabled
    }

    /// Toggle fetching without dropping the subscription.
    pub fn set_enabled(&mut self, enabled: bool) {
        debug!(key = %self.key, enabled, "Observer toggled");
        self.options.enabled = enabled;
    }

    pub fn options(&self) -> &ReadOptions {
        &self.options
    }
}

impl<T, F> fmt::Debug for QueryObserver<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserver")
            .field("key", &self.key)
            .field("options", &self.options)
            .field("subscription", &self.subscription)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::FutureExt;
    use futures::future::BoxFuture;

    use super::*;
    use crate::cache::entry::FetchStatus;
    use crate::cache::store::CacheStore;

    fn key() -> CacheKey {
        CacheKey::from_segments(["team", "members"]).expect("valid key")
    }

    fn counting(
        calls: &Arc<AtomicUsize>,
    ) -> impl Fn() -> BoxFuture<'static, Result<Vec<String>, TransportError>> + Clone + Send + Sync + 'static
    {
        let calls = Arc::clone(calls);
        move || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec!["ada".to_string()])
            }
            .boxed()
        }
    }

    fn fetcher() -> FetchCoordinator {
        FetchCoordinator::new(Arc::new(CacheStore::new(Duration::from_secs(300))))
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_fetches_only_when_stale() {
        let calls = Arc::new(AtomicUsize::new(0));
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&statuses);

        let observer = QueryObserver::new(
            fetcher(),
            key(),
            ReadOptions::default().with_stale_time(Duration::from_secs(60)),
            counting(&calls),
            move |entry| {
                if let Some(entry) = entry {
                    sink.lock().expect("sink lock").push(entry.status());
                }
            },
        );
        assert!(observer.is_stale());
        assert_eq!(observer.current().expect("idle entry").status(), FetchStatus::Idle);

        let members = observer.refresh().await.expect("members");
        assert_eq!(members.as_slice(), ["ada".to_string()]);
        observer.refresh().await.expect("cached members");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        observer.refresh().await.expect("refetched members");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert_eq!(
            *statuses.lock().expect("sink lock"),
            vec![
                FetchStatus::Pending,
                FetchStatus::Success,
                FetchStatus::Pending,
                FetchStatus::Success,
            ]
        );
    }

    #[tokio::test]
    async fn disabled_observer_keeps_subscription_and_serves_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut observer = QueryObserver::new(
            fetcher(),
            key(),
            ReadOptions::default().enabled(false),
            counting(&calls),
            |_| {},
        );

        assert!(matches!(
            observer.refresh().await,
            Err(CacheError::Disabled { .. })
        ));
        assert!(!observer.refresh_in_background());
        assert_eq!(observer.current().expect("entry").subscriber_count(), 1);

        observer.set_enabled(true);
        assert!(observer.is_enabled());
        assert_eq!(observer.refresh().await.expect("members").len(), 1);
        assert_eq!(observer.data().expect("typed data").len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
