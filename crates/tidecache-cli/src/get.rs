use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::try_join_all;
use serde_json::Value;
use tidecache::transport::{Transport, get_fn};
use tidecache::{CacheKey, QueryClient};
use tracing::info;

use crate::args::GetArgs;
use crate::client::CliError;

/// Outcome of a `get` run.
#[derive(Debug)]
pub struct GetReport {
    pub body: Arc<Value>,
    pub reads: usize,
    pub network_calls: usize,
}

impl GetReport {
    pub fn summary(&self) -> String {
        format!(
            "reads: {}, network calls: {}",
            self.reads, self.network_calls
        )
    }
}

/// Read `args.path` `concurrency` times per round for `repeat` rounds.
///
/// Reads within a round share one request; later rounds hit the network
/// again only once the cached body is stale.
pub async fn run(
    client: &QueryClient,
    transport: Arc<dyn Transport>,
    args: &GetArgs,
) -> Result<GetReport, CliError> {
    let key = CacheKey::root("http").push("get").push(args.path.as_str());
    let key = if args.query.is_empty() {
        key
    } else {
        key.with_object(&args.query)
            .map_err(tidecache::CacheError::from)?
    };

    let mut options = client.read_options();
    if let Some(stale_ms) = args.stale_ms {
        options = options.with_stale_time(Duration::from_millis(stale_ms));
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let fetch = {
        let calls = Arc::clone(&calls);
        let get = get_fn::<Value>(transport, args.path.clone(), args.query.clone());
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            get()
        }
    };

    let mut body = None;
    let mut reads = 0;
    for round in 0..args.repeat {
        let results = try_join_all(
            (0..args.concurrency).map(|_| client.fetch(&key, &options, fetch.clone())),
        )
        .await?;
        reads += results.len();
        info!(
            round,
            reads = results.len(),
            network_calls = calls.load(Ordering::SeqCst),
            "Round finished"
        );
        body = results.into_iter().next();
    }

    let body = body.ok_or_else(|| CliError::Output("no reads were issued".to_string()))?;
    Ok(GetReport {
        body,
        reads,
        network_calls: calls.load(Ordering::SeqCst),
    })
}
