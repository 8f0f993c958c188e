#![cfg_attr(not(test), forbid(unsafe_code))]
#![deny(warnings, clippy::pedantic)]

//! Command-line entry point for the conversation relay.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use shared::config::Config;

/// Conversation relay server.
#[derive(Debug, Parser)]
#[command(name = "relay-server")]
#[command(about = "Durable conversation relay with resumable SSE delivery", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands for the relay CLI.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the relay server
    Serve {
        /// Port to bind, overriding configuration (e.g. `--port 8080`)
        #[arg(long, short)]
        port: Option<u16>,

        /// Configuration file (`.yaml`, `.yml` or `.json`); defaults are used when omitted
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

/// Loads `.env` and parses the command line.
#[must_use]
pub fn initialize_cli() -> Cli {
    dotenv().ok();
    Cli::parse()
}

/// Resolves configuration and runs the server until shutdown.
///
/// # Errors
/// Returns an error if configuration is invalid or the server fails.
pub async fn handle_serve_command(port: Option<u16>, config: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = Config::load_config(config, port).context("failed to load configuration")?;
    server::server::run(resolved)
        .await
        .map_err(|err| anyhow::anyhow!(err))
        .context("relay server exited with an error")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match initialize_cli().command {
        Commands::Serve { port, config } => handle_serve_command(port, config).await,
    }
}
