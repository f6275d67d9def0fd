//! nexus-broker CLI: gateway, registration, graph builds, discovery, runs.
//!
//! Logging: set `RUST_LOG=nexus_broker=info` (or `warn`, `debug`) to see
//! broker logs on stderr.

mod cli;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use nexus_broker::{Broker, ExecuteRequest, GatewayState, load_settings, run_http};

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("nexus_broker=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let settings = load_settings(&cli.config)?;
    if let Some(parent) = cli.db.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let broker = Broker::open(&cli.db, settings)?;

    match cli.command {
        Command::Gateway { bind } => {
            let state = GatewayState {
                broker: Arc::new(tokio::sync::Mutex::new(broker)),
            };
            run_http(&bind, state).await
        }
        Command::Register {
            name,
            command,
            force,
            args,
        } => {
            let mut broker = broker;
            let record = broker.register_server(&name, &command, &args, force).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Command::Unregister { name } => {
            let mut broker = broker;
            let removed = broker.unregister_server(&name)?;
            println!("{}", serde_json::json!({ "removed": removed, "name": name }));
            Ok(())
        }
        Command::Rebuild { full } => {
            let mut broker = broker;
            let report = broker.rebuild_graph(!full).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Discover { request } => {
            let pipeline = broker.discover(&request).await?;
            println!("{}", serde_json::to_string_pretty(&pipeline)?);
            Ok(())
        }
        Command::Run {
            request,
            url,
            channel,
            source_language,
            target_language,
        } => {
            let mut broker = broker;
            let report = broker
                .execute(ExecuteRequest {
                    request,
                    url,
                    channel,
                    source_language,
                    target_language,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Status => {
            let stats = broker.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::History { limit } => {
            let runs = broker.recent_runs(limit)?;
            println!("{}", serde_json::to_string_pretty(&runs)?);
            Ok(())
        }
    }
}
