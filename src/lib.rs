//! Client-side resource cache with request de-duplication, staleness
//! policies, optimistic mutations and dependency-aware invalidation.

pub mod cache;
pub mod config;
pub mod error;
pub mod resources;
pub mod telemetry;
pub mod transport;
pub mod ui_state;

pub use cache::{CacheConfig, CacheKey, MutationOptions, QueryClient, ReadOptions};
pub use error::{CacheError, TransportError};
pub use resources::ResourceKeys;
pub use transport::{Transport, TransportExt};
pub use ui_state::{UiSlice, UiStateError, UiStateStore};
