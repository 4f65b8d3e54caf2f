//! Cache entry state.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::Instant;

use crate::error::CacheError;

use super::keys::CacheKey;

/// Type-erased cached payload. Payloads are immutable; replacing data always
/// installs a new `Arc`, which is what rollback compares against.
pub type CachedValue = Arc<dyn Any + Send + Sync>;

/// Wrap a typed value for storage.
pub fn cached<T: Any + Send + Sync>(value: T) -> CachedValue {
    Arc::new(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Idle,
    Pending,
    Success,
    Error,
}

/// One cached resource. Only the store hands out `&mut CacheEntry`, inside
/// [`CacheStore::set`](super::CacheStore::set); everyone else sees snapshots.
#[derive(Clone)]
pub struct CacheEntry {
    key: CacheKey,
    status: FetchStatus,
    data: Option<CachedValue>,
    error: Option<CacheError>,
    fetched_at: Option<Instant>,
    stale_at: Option<Instant>,
    invalidated: bool,
    gc_time: Duration,
    gc_at: Option<Instant>,
    pub(crate) subscriber_count: usize,
    pub(crate) version: u64,
    updated_at: OffsetDateTime,
}

impl CacheEntry {
    pub(crate) fn new(key: CacheKey, gc_time: Duration, now: Instant) -> Self {
        Self {
            key,
            status: FetchStatus::Idle,
            data: None,
            error: None,
            fetched_at: None,
            stale_at: None,
            invalidated: false,
            gc_time,
            gc_at: deadline(now, gc_time),
            subscriber_count: 0,
            version: 0,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn status(&self) -> FetchStatus {
        self.status
    }

    pub fn raw_data(&self) -> Option<&CachedValue> {
        self.data.as_ref()
    }

    /// Typed view of the cached data; `None` when absent or of another type.
    pub fn data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.data.clone().and_then(|value| value.downcast::<T>().ok())
    }

    /// Typed view that reports a type mismatch instead of hiding it.
    pub fn try_data<T: Any + Send + Sync>(&self) -> Result<Option<Arc<T>>, CacheError> {
        match self.data.clone() {
            None => Ok(None),
            Some(value) => value
                .downcast::<T>()
                .map(Some)
                .map_err(|_| CacheError::type_mismatch::<T>(self.key.canonical())),
        }
    }

    pub fn error(&self) -> Option<&CacheError> {
        self.error.as_ref()
    }

    pub fn fetched_at(&self) -> Option<Instant> {
        self.fetched_at
    }

    /// `None` means the entry never goes stale on its own.
    pub fn stale_at(&self) -> Option<Instant> {
        self.stale_at
    }

    /// When an unobserved entry becomes collectable; `None` means never.
    pub fn gc_at(&self) -> Option<Instant> {
        self.gc_at
    }

    pub fn gc_time(&self) -> Duration {
        self.gc_time
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count
    }

    /// Bumped on every change, starting at 1 for the first write.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    pub fn updated_at(&self) -> OffsetDateTime {
        self.updated_at
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Fresh means the data can be served without touching the network.
    pub fn is_fresh(&self, now: Instant) -> bool {
        self.status == FetchStatus::Success
            && self.data.is_some()
            && !self.invalidated
            && self.stale_at.is_none_or(|stale_at| now < stale_at)
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        !self.is_fresh(now)
    }

    /// Enter `Pending`, keeping the last known data visible.
    pub fn set_pending(&mut self) {
        self.status = FetchStatus::Pending;
    }

    /// Record a successful fetch.
    pub fn set_success(&mut self, data: CachedValue, now: Instant, stale_time: Duration) {
        self.status = FetchStatus::Success;
        self.data = Some(data);
        self.error = None;
        self.fetched_at = Some(now);
        self.stale_at = deadline(now, stale_time);
        self.invalidated = false;
    }

    /// Record a failed fetch, keeping stale data next to the error.
    pub fn set_error(&mut self, error: CacheError) {
        self.status = FetchStatus::Error;
        self.error = Some(error);
    }

    /// Install an optimistic value. Freshness of fetched data is kept; a
    /// value no fetch ever confirmed is stale from `now` on, so the next read
    /// revalidates it.
    pub fn replace_data(&mut self, data: CachedValue, now: Instant) {
        self.data = Some(data);
        self.error = None;
        if self.status != FetchStatus::Pending {
            self.status = FetchStatus::Success;
        }
        if self.fetched_at.is_none() {
            self.stale_at = Some(now);
        }
    }

    /// Leave `Pending` after an aborted fetch.
    pub fn settle_cancelled(&mut self) {
        if self.status == FetchStatus::Pending {
            self.status = if self.data.is_some() {
                FetchStatus::Success
            } else {
                FetchStatus::Idle
            };
        }
    }

    /// Make the entry stale now without dropping its data.
    pub fn mark_stale(&mut self, now: Instant) {
        self.stale_at = Some(now);
        self.invalidated = true;
    }

    pub(crate) fn raise_gc_time(&mut self, gc_time: Duration) {
        self.gc_time = self.gc_time.max(gc_time);
    }

    /// Restart the collection countdown from `now`.
    pub(crate) fn arm_gc(&mut self, now: Instant) {
        self.gc_at = deadline(now, self.gc_time);
    }

    pub(crate) fn is_collectable(&self, now: Instant) -> bool {
        self.subscriber_count == 0 && self.gc_at.is_some_and(|gc_at| now >= gc_at)
    }

    pub(crate) fn touch(&mut self) {
        self.version += 1;
        self.updated_at = OffsetDateTime::now_utc();
    }

    pub(crate) fn state(&self) -> EntryState {
        EntryState {
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
            fetched_at: self.fetched_at,
            stale_at: self.stale_at,
            invalidated: self.invalidated,
        }
    }

    /// Put back a captured state. A staleness mark applied since the capture
    /// is kept, so rollback never hides an invalidation.
    pub(crate) fn restore(&mut self, state: EntryState) {
        let keep_current_mark = self.invalidated && !state.invalidated;
        let current_stale_at = self.stale_at;
        self.status = state.status;
        self.data = state.data;
        self.error = state.error;
        self.fetched_at = state.fetched_at;
        self.stale_at = state.stale_at;
        self.invalidated = state.invalidated;
        if keep_current_mark {
            self.stale_at = current_stale_at;
            self.invalidated = true;
        }
    }

    pub(crate) fn holds(&self, value: &CachedValue) -> bool {
        self.data
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, value))
    }
}

/// Observable part of an entry, captured for rollback.
#[derive(Clone)]
pub(crate) struct EntryState {
    status: FetchStatus,
    data: Option<CachedValue>,
    error: Option<CacheError>,
    fetched_at: Option<Instant>,
    stale_at: Option<Instant>,
    invalidated: bool,
}

fn deadline(now: Instant, after: Duration) -> Option<Instant> {
    now.checked_add(after)
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("status", &self.status)
            .field("has_data", &self.data.is_some())
            .field("error", &self.error)
            .field("fetched_at", &self.fetched_at)
            .field("stale_at", &self.stale_at)
            .field("invalidated", &self.invalidated)
            .field("subscriber_count", &self.subscriber_count)
            .field("version", &self.version)
            .finish()
    }
}
