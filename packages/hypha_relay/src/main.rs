use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod bridge;
mod cli;
mod config;
mod error;
mod handlers;
mod overlay;
mod registry;
mod rendezvous;
mod session;
mod swarm;
mod wire;


use hypha_engine::Engine;

use crate::registry::SessionRegistry;

/// Shared state for the axum handlers.
pub struct AppState<E: Engine> {
    pub registry: Arc<SessionRegistry<E>>,
}

impl<E: Engine> Clone for AppState<E> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

#[derive(Parser)]
#[command(name = "hypha")]
#[command(about = "Relay and session layer for replicated multiwriter logs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom config file (defaults to ./hypha.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the always-on relay node (holds no key material)
    Serve(cli::serve::ServeArgs),

    /// Replicate a log as a native node
    Join(cli::join::JoinArgs),

    /// Derive and print an identity from a passphrase
    Keys(cli::keys::KeysArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve(args) => cli::serve::run(args, config).await,
        Commands::Join(args) => cli::join::run(args, config).await,
        Commands::Keys(args) => cli::keys::run(args).await,
    }
}
