//! tidecache: read HTTP resources through the query cache.

mod args;
mod client;
mod get;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use clap::Parser;
use tidecache::QueryClient;

use args::{Cli, Commands};
use client::{CliError, HttpTransport};

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    let settings = tidecache::config::load(&cli.config)?;
    tidecache::telemetry::init(&settings.logging)?;

    let transport = Arc::new(HttpTransport::from_settings(&settings.http)?);
    let client = QueryClient::new(settings.cache);

    match cli.command {
        Commands::Get(args) => {
            let report = get::run(&client, transport, &args).await?;
            print_json(&report.body)?;
            println!("{}", report.summary());
        }
    }

    Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<(), CliError> {
    let out = serde_json::to_string_pretty(value)
        .map_err(|e| CliError::Output(e.to_string()))?;
    println!("{out}");
    Ok(())
}
