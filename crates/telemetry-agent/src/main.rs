//! Telemetry Agent
//!
//! Runs the telemetry core for a device described by a manifest, publishing to
//! a console session and taking value changes from stdin.

mod commands;
mod console;
mod manifest;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use telemetry::Telemetry;

use crate::commands::Command;
use crate::console::ConsoleSession;
use crate::manifest::{Manifest, layered_config};

/// Device telemetry agent
#[derive(Parser, Debug)]
#[command(name = "telemetry-agent")]
#[command(about = "Publishes device properties and notifications", long_about = None)]
struct Args {
    /// Path to the device manifest
    #[arg(short, long, default_value = "./telemetry.toml")]
    manifest: PathBuf,

    /// Override the properties task period
    #[arg(long)]
    properties_period_ms: Option<u64>,

    /// Override the notifications task period
    #[arg(long)]
    notifications_period_ms: Option<u64>,

    /// Fraction of deliveries to reject, between 0 and 1
    #[arg(long, default_value = "0.0")]
    failure_rate: f64,

    /// Start without a session
    #[arg(long)]
    offline: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    info!("Starting telemetry agent v{}", env!("CARGO_PKG_VERSION"));

    let mut config = layered_config(&args.manifest)?;
    if let Some(period) = args.properties_period_ms {
        config.properties_period_ms = period;
    }
    if let Some(period) = args.notifications_period_ms {
        config.notifications_period_ms = period;
    }

    let telemetry = Telemetry::new(config).context("Invalid telemetry settings")?;
    Manifest::load(&args.manifest)?.apply(&telemetry)?;

    let session = Arc::new(ConsoleSession::new(!args.offline, args.failure_rate));
    let properties = telemetry.start_properties_task(session.clone())?;
    let notifications = telemetry.start_notifications_task(session.clone())?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => match Command::parse(&line) {
                    Some(Ok(command)) => eprintln!("{}", command.execute(&telemetry, &session)),
                    Some(Err(e)) => eprintln!("{}", e),
                    None => {}
                },
                None => {
                    info!("Input closed, publishing until interrupted");
                    tokio::signal::ctrl_c().await?;
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
        if properties.is_finished() || notifications.is_finished() {
            warn!("A publication task stopped unexpectedly");
            break;
        }
    }

    properties.abort();
    notifications.abort();
    info!("Telemetry agent stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("telemetry=info,telemetry_agent=info"));
    // stdout carries the published data
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
