//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::CacheConfig;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tidecache";
const ENV_PREFIX: &str = "TIDECACHE";
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;

/// Configuration arguments shared by every binary embedding the cache.
#[derive(Debug, Args, Default, Clone)]
pub struct ConfigArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "TIDECACHE_CONFIG_FILE",
        value_name = "PATH",
        global = true
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ConfigOverrides {
    /// Override the base URL requests are resolved against.
    #[arg(long = "base-url", value_name = "URL", global = true)]
    pub base_url: Option<String>,

    /// Override the per-request timeout.
    #[arg(long = "http-timeout-ms", value_name = "MS", global = true)]
    pub http_timeout_ms: Option<u64>,

    /// Override the default freshness window of cached reads.
    #[arg(long = "cache-stale-time-ms", value_name = "MS", global = true)]
    pub cache_stale_time_ms: Option<u64>,

    /// Override how long unobserved entries are kept.
    #[arg(long = "cache-gc-time-ms", value_name = "MS", global = true)]
    pub cache_gc_time_ms: Option<u64>,

    /// Override the default retry count for failed reads.
    #[arg(long = "cache-retry", value_name = "COUNT", global = true)]
    pub cache_retry: Option<u32>,

    /// Override the base log level (trace, debug, info, warn, error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Emit logs as JSON.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheConfig,
    pub http: HttpSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    /// Requests use relative paths resolved against this URL.
    pub base_url: Option<Url>,
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(args: &ConfigArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = args.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&args.overrides);

    Settings::from_raw(raw)
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        Ok(Self {
            logging: build_logging_settings(raw.logging)?,
            cache: build_cache_settings(raw.cache)?,
            http: build_http_settings(raw.http)?,
        })
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: CacheConfig,
    http: RawHttpSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(base_url) = overrides.base_url.as_ref() {
            self.http.base_url = Some(base_url.clone());
        }
        if let Some(timeout) = overrides.http_timeout_ms {
            self.http.timeout_ms = Some(timeout);
        }
        if let Some(stale_time) = overrides.cache_stale_time_ms {
            self.cache.stale_time_ms = stale_time;
        }
        if let Some(gc_time) = overrides.cache_gc_time_ms {
            self.cache.gc_time_ms = gc_time;
        }
        if let Some(retry) = overrides.cache_retry {
            self.cache.retry = retry;
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawHttpSettings {
    base_url: Option<String>,
    timeout_ms: Option<u64>,
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: CacheConfig) -> Result<CacheConfig, LoadError> {
    if cache.retry_max_delay_ms < cache.retry_base_delay_ms {
        return Err(LoadError::invalid(
            "cache.retry_max_delay_ms",
            format!(
                "must be at least cache.retry_base_delay_ms ({})",
                cache.retry_base_delay_ms
            ),
        ));
    }
    if cache.gc_interval_ms == 0 {
        return Err(LoadError::invalid(
            "cache.gc_interval_ms",
            "must be greater than zero",
        ));
    }
    if cache.event_queue_limit == 0 {
        return Err(LoadError::invalid(
            "cache.event_queue_limit",
            "must be greater than zero",
        ));
    }

    Ok(cache)
}

fn build_http_settings(http: RawHttpSettings) -> Result<HttpSettings, LoadError> {
    let base_url = http
        .base_url
        .and_then(|value| {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .map(|value| {
            Url::parse(&value)
                .map_err(|err| LoadError::invalid("http.base_url", format!("failed to parse: {err}")))
        })
        .transpose()?;

    let timeout_ms = http.timeout_ms.unwrap_or(DEFAULT_HTTP_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "http.timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(HttpSettings {
        base_url,
        timeout: Duration::from_millis(timeout_ms),
    })
}
