//! Standalone runner
//!
//! Starts the worker against a JSON config file and logs every event it
//! would hand to a host callback. Useful for poking at live runtimes
//! without loading the shared library into an agent.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use container_watcher::{Config, EventSink, Worker};

#[derive(Parser)]
#[command(name = "container-watcher")]
#[command(about = "Multi-runtime container lifecycle event worker")]
#[command(version)]
struct Cli {
    /// Path to the init-config JSON file
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("container_watcher={log_level}").into()),
        )
        .init();

    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config))?;

    let sink: EventSink = Box::new(|json, added| {
        info!(added, event = json, "container event");
    });

    let worker = Worker::start(config, sink)
        .await
        .context("worker startup failed")?;
    info!("worker started; press ctrl+c to stop");

    tokio::signal::ctrl_c().await?;

    info!("stopping worker");
    worker.stop().await;
    Ok(())
}
