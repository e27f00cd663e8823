//! runpool autoscaler
//!
//! Keeps an elastic pool of self-hosted CI runners on Compute Engine sized
//! to demand. Each subcommand performs one scale decision and exits; `run`
//! repeats the periodic decisions on an interval until interrupted.

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

use commands::Cli;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("RUNPOOL_LOG_LEVEL").unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let cli = Cli::parse();
    info!("Starting runpool autoscaler");

    if let Err(e) = cli.run().await {
        error!(error = ?e, "Autoscaler command failed");
        std::process::exit(1);
    }
}
