//! Resource cache and mutation synchronization.
//!
//! - **Store**: entries keyed by hierarchical [`CacheKey`]s, with staleness
//!   and garbage-collection deadlines
//! - **Fetch coordinator**: fresh reads from cache, one in-flight request
//!   per key, retries, stale-while-revalidate
//! - **Mutation coordinator**: optimistic patches, rollback, invalidation
//!
//! ## Configuration
//!
//! Defaults come from the `[cache]` table of `tidecache.toml`:
//!
//! ```toml
//! [cache]
//! stale_time_ms = 0
//! gc_time_ms = 300000
//! retry = 3
//! # ... see config.rs for all options
//! ```

mod client;
mod config;
mod entry;
mod events;
mod fetch;
mod graph;
mod inflight;
mod keys;
pub(crate) mod lock;
mod maintenance;
mod mutation;
mod observer;
mod planner;
mod retry;
mod store;
mod subscription;

pub use client::QueryClient;
pub use config::{CacheConfig, ReadOptions};
pub use entry::{CacheEntry, CachedValue, FetchStatus, cached};
pub use events::{Epoch, EventQueue, MutationEvent, MutationEventKind};
pub use fetch::FetchCoordinator;
pub use graph::InvalidationGraph;
pub use keys::{CacheKey, KeyError, KeySegment, canonicalize};
pub use maintenance::Maintenance;
pub use mutation::{Mutation, MutationCoordinator, MutationOptions, MutationStatus};
pub use observer::QueryObserver;
pub use planner::InvalidationPlan;
pub use retry::RetryPolicy;
pub use store::CacheStore;
pub use subscription::{Listener, SubscriberId, Subscription};
