//! Mutation coordinator.
//!
//! A mutation optionally patches cached entries before its remote call and
//! settles in one of two ways:
//!
//! - success: invalidate the declared patterns (plus linked dependents),
//!   remove declared keys, write through values derived from the response,
//!   then run `on_success`;
//! - failure or cancellation: restore every patched entry that still holds
//!   the value this mutation installed, then run `on_error`.
//!
//! Either way one [`MutationEvent`](super::MutationEvent) is published.
//! Mutations are never retried.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{CacheError, TransportError};

use super::entry::{CacheEntry, CachedValue, EntryState, cached};
use super::events::{EventQueue, MutationEventKind};
use super::graph::InvalidationGraph;
use super::keys::CacheKey;
use super::planner::InvalidationPlan;
use super::store::CacheStore;

const METRIC_ROLLBACK_TOTAL: &str = "tidecache_mutation_rollback_total";
const METRIC_ROLLBACK_SKIPPED_TOTAL: &str = "tidecache_rollback_skipped_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Idle,
    Pending,
    Success,
    Error,
}

type PatchFn = Box<dyn FnOnce(Option<&CachedValue>) -> Result<CachedValue, CacheError> + Send>;
type WriteFn<R> = Box<dyn FnOnce(&R) -> CachedValue + Send>;

struct OptimisticPatch {
    key: CacheKey,
    apply: PatchFn,
}

struct WriteThrough<R> {
    key: CacheKey,
    stale_time: Duration,
    value: WriteFn<R>,
}

/// Side effects of one mutation.
pub struct MutationOptions<R> {
    label: Option<String>,
    patches: Vec<OptimisticPatch>,
    invalidates: Vec<CacheKey>,
    removes: Vec<CacheKey>,
    write_through: Vec<WriteThrough<R>>,
    on_success: Option<Box<dyn FnOnce(&R) + Send>>,
    on_error: Option<Box<dyn FnOnce(&CacheError) + Send>>,
}

impl<R> Default for MutationOptions<R> {
    fn default() -> Self {
        Self {
            label: None,
            patches: Vec::new(),
            invalidates: Vec::new(),
            removes: Vec::new(),
            write_through: Vec::new(),
            on_success: None,
            on_error: None,
        }
    }
}

impl<R> MutationOptions<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name reported to notification sinks, e.g. `"documents.rename"`.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Replace the cached value of `key` before the remote call. `patch`
    /// receives the current value, if any.
    pub fn optimistic<T, P>(mut self, key: CacheKey, patch: P) -> Self
    where
        T: Any + Send + Sync,
        P: FnOnce(Option<&T>) -> T + Send + 'static,
    {
        let canonical = key.canonical();
        self.patches.push(OptimisticPatch {
            key,
            apply: Box::new(move |prior| {
                let prior = prior
                    .map(|value| {
                        CachedValue::clone(value)
                            .downcast::<T>()
                            .map_err(|_| CacheError::type_mismatch::<T>(canonical))
                    })
                    .transpose()?;
                Ok(cached(patch(prior.as_deref())))
            }),
        });
        self
    }

    /// Mark everything under `pattern` stale once the mutation succeeds.
    pub fn invalidates(mut self, pattern: CacheKey) -> Self {
        self.invalidates.push(pattern);
        self
    }

    /// Delete `key` once the mutation succeeds.
    pub fn removes(mut self, key: CacheKey) -> Self {
        self.removes.push(key);
        self
    }

    /// Store a value derived from the response under `key` once the
    /// mutation succeeds, fresh for `stale_time`.
    pub fn write_through<T, W>(mut self, key: CacheKey, stale_time: Duration, value: W) -> Self
    where
        T: Any + Send + Sync,
        W: FnOnce(&R) -> T + Send + 'static,
    {
        self.write_through.push(WriteThrough {
            key,
            stale_time,
            value: Box::new(move |response| cached(value(response))),
        });
        self
    }

    pub fn on_success(mut self, callback: impl FnOnce(&R) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl FnOnce(&CacheError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }
}

impl<R> fmt::Debug for MutationOptions<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationOptions")
            .field("label", &self.label)
            .field(
                "patches",
                &self.patches.iter().map(|patch| &patch.key).collect::<Vec<_>>(),
            )
            .field("invalidates", &self.invalidates)
            .field("removes", &self.removes)
            .field("write_through", &self.write_through.len())
            .finish()
    }
}

/// Runs mutations against a shared store.
#[derive(Clone)]
pub struct MutationCoordinator {
    store: Arc<CacheStore>,
    graph: Arc<InvalidationGraph>,
    events: Arc<EventQueue>,
}

impl MutationCoordinator {
    pub fn new(store: Arc<CacheStore>, graph: Arc<InvalidationGraph>, events: Arc<EventQueue>) -> Self {
        Self {
            store,
            graph,
            events,
        }
    }

    /// Prepare a mutation whose status can be observed before it runs.
    pub fn prepare<R>(&self, options: MutationOptions<R>) -> Mutation<R> {
        let (status, _) = watch::channel(MutationStatus::Idle);
        Mutation {
            id: Uuid::new_v4(),
            coordinator: self.clone(),
            options,
            status,
        }
    }

    /// Run `remote` with the side effects declared in `options`.
    pub async fn mutate<R, F, Fut>(&self, options: MutationOptions<R>, remote: F) -> Result<R, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, TransportError>>,
    {
        self.prepare(options).run(remote).await
    }
}

/// One mutation invocation.
pub struct Mutation<R> {
    id: Uuid,
    coordinator: MutationCoordinator,
    options: MutationOptions<R>,
    status: watch::Sender<MutationStatus>,
}

impl<R> Mutation<R> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> MutationStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<MutationStatus> {
        self.status.subscribe()
    }

    #[instrument(skip_all, fields(mutation = %self.id, label = self.options.label.as_deref().unwrap_or("-")))]
    pub async fn run<F, Fut>(self, remote: F) -> Result<R, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, TransportError>>,
    {
        let Self {
            id,
            coordinator,
            options,
            status,
        } = self;
        let MutationOptions {
            label,
            patches,
            invalidates,
            removes,
            write_through,
            on_success,
            on_error,
        } = options;

        status.send_replace(MutationStatus::Pending);
        let mut guard = RollbackGuard {
            id,
            label: label.clone(),
            store: Arc::clone(&coordinator.store),
            events: Arc::clone(&coordinator.events),
            status: status.clone(),
            snapshots: Vec::with_capacity(patches.len()),
            armed: true,
        };

        let outcome = match guard.apply_patches(patches) {
            Ok(()) => remote().await.map_err(CacheError::from),
            Err(error) => Err(error),
        };

        let response = match outcome {
            Ok(response) => response,
            Err(error) => {
                guard.rollback();
                guard.disarm();
                status.send_replace(MutationStatus::Error);
                if let Some(callback) = on_error {
                    callback(&error);
                }
                let kind = if error.is_cancelled() {
                    MutationEventKind::Cancelled { label }
                } else {
                    MutationEventKind::Failed {
                        label,
                        error: error.to_string(),
                    }
                };
                coordinator.events.publish(id, kind);
                return Err(error);
            }
        };

        guard.disarm();
        let store = &coordinator.store;

        let plan = InvalidationPlan::expanded(&coordinator.graph, invalidates);
        let invalidated = plan.apply(store);
        let removed = removes.iter().filter(|key| store.remove(key)).count();

        let now = Instant::now();
        for write in write_through {
            let value = (write.value)(&response);
            let stale_time = write.stale_time;
            store.set(&write.key, move |entry| entry.set_success(value, now, stale_time));
        }

        info!(plan = %plan, invalidated, removed, "Mutation committed");
        status.send_replace(MutationStatus::Success);
        if let Some(callback) = on_success {
            callback(&response);
        }
        coordinator
            .events
            .publish(id, MutationEventKind::Succeeded { label });
        Ok(response)
    }
}

impl<R> fmt::Debug for Mutation<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("options", &self.options)
            .finish()
    }
}

/// What an optimistic patch replaced, and what it installed.
struct Snapshot {
    key: CacheKey,
    /// `None` when the patch created the entry.
    prior: Option<EntryState>,
    installed: CachedValue,
}

/// Rolls back optimistic patches unless disarmed. Dropping an armed guard
/// (the mutation future was dropped) rolls back and reports cancellation.
struct RollbackGuard {
    id: Uuid,
    label: Option<String>,
    store: Arc<CacheStore>,
    events: Arc<EventQueue>,
    status: watch::Sender<MutationStatus>,
    snapshots: Vec<Snapshot>,
    armed: bool,
}

impl RollbackGuard {
    /// A patch that fails leaves its key untouched; patches applied before
    /// it are rolled back by the caller.
    fn apply_patches(&mut self, patches: Vec<OptimisticPatch>) -> Result<(), CacheError> {
        for OptimisticPatch { key, apply } in patches {
            let now = Instant::now();
            let (prior, installed) = self.store.try_set(
                &key,
                |current| {
                    let prior = current.map(CacheEntry::state);
                    apply(current.and_then(CacheEntry::raw_data)).map(|installed| (prior, installed))
                },
                |entry, (_, installed)| entry.replace_data(CachedValue::clone(installed), now),
            )?;
            debug!(key = %key, "Optimistic patch applied");
            self.snapshots.push(Snapshot {
                key,
                prior,
                installed,
            });
        }
        Ok(())
    }

    /// Restore patched entries, newest patch first.
    fn rollback(&mut self) {
        for snapshot in self.snapshots.drain(..).rev() {
            let Snapshot {
                key,
                prior,
                installed,
            } = snapshot;
            let restored = match prior {
                Some(state) => self
                    .store
                    .update_if(&key, |entry| entry.holds(&installed), |entry| entry.restore(state))
                    .is_some(),
                None => self.store.remove_if(&key, |entry| entry.holds(&installed)),
            };

            if restored {
                counter!(METRIC_ROLLBACK_TOTAL).increment(1);
                debug!(key = %key, "Optimistic patch rolled back");
            } else {
                counter!(METRIC_ROLLBACK_SKIPPED_TOTAL).increment(1);
                warn!(key = %key, "Rollback skipped; entry was overwritten by a newer write");
            }
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
        self.snapshots.clear();
    }
}

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.rollback();
        self.status.send_replace(MutationStatus::Error);
        self.events.publish(
            self.id,
            MutationEventKind::Cancelled {
                label: self.label.take(),
            },
        );
    }
}
