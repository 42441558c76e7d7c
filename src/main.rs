// src/main.rs
// memoria - persistent per-user semantic memory engine

mod cli;

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env from ~/.memoria/.env only (never from CWD - a hostile
    // working directory must not be able to override API keys)
    if let Some(home) = dirs::home_dir()
        && let Err(e) = dotenvy::from_path(home.join(".memoria/.env"))
    {
        tracing::debug!("no global .env loaded: {}", e);
    }

    let cli = Cli::parse();

    let log_level = match &cli.command {
        Commands::Chat { .. } => Level::WARN,
        Commands::Status { .. } => Level::WARN,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    cli::run(cli).await
}
