//! `hypha serve` — the always-on unprivileged node.
//!
//! Hosts the WebSocket attach endpoint and the TCP swarm acceptor, and
//! relays control messages without holding any key material.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use hypha_engine::Engine;
use hypha_engine::memory::MemoryEngine;

use crate::AppState;
use crate::config::FileConfig;
use crate::handlers;
use crate::overlay::OverlayMode;
use crate::registry::{RegistryConfig, SessionRegistry};
use crate::swarm;

#[derive(clap::Args)]
pub struct ServeArgs {
    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port for the web server
    #[arg(short, long)]
    port: Option<u16>,

    /// Port for the TCP swarm listener
    #[arg(long)]
    swarm_port: Option<u16>,

    /// Disable the TCP swarm listener
    #[arg(long)]
    no_swarm: bool,
}

pub async fn run(args: ServeArgs, mut config: FileConfig) -> Result<()> {
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(port) = args.swarm_port {
        config.swarm.port = port;
    }
    if args.no_swarm {
        config.swarm.enabled = false;
    }

    // The relay holds no keys: every session participates in the overlay
    // as a forwarder only.
    let registry = SessionRegistry::new(
        Arc::new(MemoryEngine::new()),
        RegistryConfig {
            overlay_mode: OverlayMode::Relay,
            message_window: config.overlay.message_window(),
            evict_idle: config.sessions.evict_idle,
        },
    );

    if config.swarm.enabled {
        let listener = TcpListener::bind((config.server.host.as_str(), config.swarm.port))
            .await
            .with_context(|| format!("failed to bind swarm port {}", config.swarm.port))?;
        info!(addr = %listener.local_addr()?, "swarm listener up");
        tokio::spawn(swarm::run_acceptor(listener, registry.clone()));
    }

    let app = build_router(AppState {
        registry: registry.clone(),
    });
    let listener = TcpListener::bind((config.server.host.as_str(), config.server.port))
        .await
        .with_context(|| format!("failed to bind web port {}", config.server.port))?;
    let addr = listener.local_addr()?;

    info!("Hypha always-on node (unprivileged relay)");
    info!("Attach:  ws://{addr}/hypha/<read-key-hex>");
    info!("Health:  http://{addr}/health");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

pub fn build_router<E: Engine>(state: AppState<E>) -> Router {
    Router::new()
        .route("/hypha/{read_key}", get(handlers::ws::attach_handler::<E>))
        .route("/health", get(handlers::health::health_handler::<E>))
        .route("/sessions", get(handlers::health::sessions_handler::<E>))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
