//! Command-line surface for `tidecache`.

use clap::{Parser, Subcommand};
use tidecache::config::ConfigArgs;

#[derive(Parser, Debug)]
#[command(name = "tidecache", version, about = "Read HTTP resources through a query cache", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// GET a path through the cache and print the JSON body
    Get(GetArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct GetArgs {
    /// Path relative to the base URL, e.g. `documents/42`
    pub path: String,

    /// Query parameter as `name=value`; repeatable
    #[arg(long = "query", short = 'q', value_name = "NAME=VALUE", value_parser = parse_query_pair)]
    pub query: Vec<(String, String)>,

    /// Concurrent reads issued per round
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub concurrency: u32,

    /// Number of rounds
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub repeat: u32,

    /// Freshness window of the cached body; defaults to `cache.stale_time_ms`
    #[arg(long = "stale-ms", value_name = "MS")]
    pub stale_ms: Option<u64>,
}

fn parse_query_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected NAME=VALUE, got `{raw}`"))
}
