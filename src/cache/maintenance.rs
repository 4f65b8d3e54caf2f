//! Periodic garbage collection.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::store::CacheStore;

/// Background eviction loop. Aborted when dropped.
pub struct Maintenance {
    handle: JoinHandle<()>,
}

impl Maintenance {
    /// Run [`CacheStore::evict`] every `interval`, starting one interval
    /// from now.
    pub fn spawn(store: Arc<CacheStore>, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // the first tick completes immediately
            loop {
                ticker.tick().await;
                let evicted = store.evict();
                debug!(evicted, remaining = store.len(), "Cache GC pass");
            }
        });
        Self { handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.handle.abort();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
