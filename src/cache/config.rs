//! Cache configuration.
//!
//! Defaults for every read plus the knobs of the background tasks. The
//! `[cache]` table of `tidecache.toml` deserializes into [`CacheConfig`];
//! [`crate::config::load`] layers overrides on top and validates it.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

use super::retry::RetryPolicy;

const DEFAULT_STALE_TIME_MS: u64 = 0;
const DEFAULT_GC_TIME_MS: u64 = 5 * 60 * 1000;
const DEFAULT_RETRY: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_GC_INTERVAL_MS: u64 = 60_000;
const DEFAULT_EVENT_QUEUE_LIMIT: usize = 256;

/// Cache configuration. Missing fields take their defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Default for [`ReadOptions::enabled`].
    pub enabled: bool,
    /// Default freshness window; `u64::MAX` means never auto-stale.
    pub stale_time_ms: u64,
    /// How long an unobserved entry is kept before eviction.
    pub gc_time_ms: u64,
    /// Default retry count for failed reads.
    pub retry: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Interval of the periodic eviction pass.
    pub gc_interval_ms: u64,
    /// Maximum number of undrained mutation events.
    pub event_queue_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stale_time_ms: DEFAULT_STALE_TIME_MS,
            gc_time_ms: DEFAULT_GC_TIME_MS,
            retry: DEFAULT_RETRY,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            gc_interval_ms: DEFAULT_GC_INTERVAL_MS,
            event_queue_limit: DEFAULT_EVENT_QUEUE_LIMIT,
        }
    }
}

impl CacheConfig {
    pub fn stale_time(&self) -> Duration {
        Duration::from_millis(self.stale_time_ms)
    }

    pub fn gc_time(&self) -> Duration {
        Duration::from_millis(self.gc_time_ms)
    }

    /// GC cadence, clamped to at least one millisecond.
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_retries(self.retry)
            .with_delays(
                Duration::from_millis(self.retry_base_delay_ms),
                Duration::from_millis(self.retry_max_delay_ms),
            )
    }

    /// Returns the event queue limit as NonZeroUsize, clamping to 1 if zero.
    pub fn event_queue_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.event_queue_limit).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn read_options(&self) -> ReadOptions {
        ReadOptions::from(self)
    }
}

/// Per-read configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOptions {
    /// Freshness window after a successful fetch. `Duration::ZERO` means
    /// always stale, `Duration::MAX` never auto-stale.
    pub stale_time: Duration,
    pub gc_time: Duration,
    pub retry: RetryPolicy,
    /// `false` suppresses fetching without dropping subscriptions.
    pub enabled: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

impl From<&CacheConfig> for ReadOptions {
    fn from(config: &CacheConfig) -> Self {
        Self {
            stale_time: config.stale_time(),
            gc_time: config.gc_time(),
            retry: config.retry_policy(),
            enabled: config.enabled,
        }
    }
}

impl ReadOptions {
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn never_stale(self) -> Self {
        self.with_stale_time(Duration::MAX)
    }

    pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = gc_time;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn without_retry(self) -> Self {
        self.with_retry(RetryPolicy::none())
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}
