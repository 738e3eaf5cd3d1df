//! `hypha join` — a native node replicating one log.
//!
//! Three roles, mirroring the ways a node can hold keys:
//!   - origin writer: `--passphrase` + `--domain` derive the full identity
//!     and open the session writable;
//!   - second device: a read key plus `--request-auth --node-name` derive a
//!     local identity and broadcast an authorisation request;
//!   - plain reader: just the read key.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use hypha_engine::{Engine, EngineError, EngineHandle};
use hypha_engine::memory::MemoryEngine;
use hypha_identity::{
    PublicKey, derive_identity, derive_local_identity, validate_passphrase,
};

use crate::bridge::{self, PIPE_CAPACITY, TransportPipe};
use crate::config::FileConfig;
use crate::error::RelayError;
use crate::overlay::{OverlayEvent, OverlayMode};
use crate::registry::{RegistryConfig, SessionRegistry};
use crate::rendezvous;
use crate::session::ReplicationSession;
use crate::swarm;
use crate::wire::AuthoriseRequest;

#[derive(clap::Args)]
pub struct JoinArgs {
    /// Read key (hex) of the log to replicate
    read_key: Option<String>,

    /// Relay WebSocket URL
    #[arg(long, default_value = "ws://127.0.0.1:8440")]
    ws_url: String,

    /// Dial a swarm peer directly (host:port) instead of the relay
    #[arg(long)]
    tcp: Option<String>,

    /// Rendezvous hub URL for hub-brokered peers
    #[arg(long)]
    rendezvous_url: Option<String>,

    /// Sign in as the origin writer (requires --domain)
    #[arg(long)]
    passphrase: Option<String>,

    /// Key-derivation domain
    #[arg(long)]
    domain: Option<String>,

    /// Name for this device (shown to the origin writer)
    #[arg(long)]
    node_name: Option<String>,

    /// Ask the origin writer to authorise this device as a writer
    #[arg(long)]
    request_auth: bool,

    /// Approve authorisation requests without asking (origin only)
    #[arg(long)]
    auto_approve: bool,

    /// Append a JSON value once this node is able to write
    #[arg(long)]
    append: Option<String>,
}

pub async fn run(args: JoinArgs, config: FileConfig) -> Result<()> {
    // Resolve identity. The KDF is CPU-bound, so it runs off the I/O path.
    let (read_key, write_key, local) = if let Some(passphrase) = args.passphrase.clone() {
        let domain = args
            .domain
            .clone()
            .context("--domain is required with --passphrase")?;
        if let Err(e) = validate_passphrase(&passphrase) {
            warn!(error = %e, "passphrase fails the sign-in rule, deriving anyway");
        }
        let identity =
            tokio::task::spawn_blocking(move || derive_identity(&passphrase, &domain))
                .await
                .context("key derivation task failed")??;
        info!(read_key = %identity.read_key, "derived origin identity");
        if let Some(expected) = &args.read_key {
            if PublicKey::from_hex(expected)? != identity.read_key {
                bail!("derived read key does not match the one given");
            }
        }
        (identity.read_key, Some(identity.write_key), None)
    } else {
        let hex = args
            .read_key
            .clone()
            .context("a read key (or --passphrase with --domain) is required")?;
        let read_key = PublicKey::from_hex(&hex).context("invalid read key")?;
        let local = if args.request_auth {
            let node_name = args
                .node_name
                .clone()
                .unwrap_or_else(|| "hypha device".to_string());
            let local =
                tokio::task::spawn_blocking(move || derive_local_identity(&hex, &node_name))
                    .await
                    .context("key derivation task failed")??;
            info!(local_key = %local.local_read_key, "derived device identity");
            Some(local)
        } else {
            None
        };
        (read_key, None, local)
    };

    let local_read_key = local.as_ref().map(|l| l.local_read_key).unwrap_or(read_key);
    let registry = SessionRegistry::new(
        Arc::new(MemoryEngine::new()),
        RegistryConfig {
            overlay_mode: OverlayMode::Node { local_read_key },
            // Short-lived process: no need to bound the seen set.
            message_window: None,
            evict_idle: false,
        },
    );
    let session = registry.get_or_create(read_key, write_key).await?;

    // Transports.
    if let Some(addr) = &args.tcp {
        swarm::dial(addr, &session).await?;
        info!(peer = %addr, "attached to swarm peer");
    } else {
        let url = format!(
            "{}/hypha/{}",
            args.ws_url.trim_end_matches('/'),
            read_key.to_hex()
        );
        ws_connect(&url, &session).await?;
        info!(url = %url, "attached to relay");
    }
    if let Some(hub) = args.rendezvous_url.clone().or_else(|| config.rendezvous.url.clone()) {
        let session = session.clone();
        tokio::spawn(async move {
            if let Err(e) = rendezvous::run(&hub, session).await {
                warn!(error = %e, "rendezvous connection ended");
            }
        });
    }

    // Report transports coming and going.
    let mut detach_events = session.subscribe_detach();
    tokio::spawn(async move {
        while let Ok(event) = detach_events.recv().await {
            warn!(label = %event.label, reason = ?event.reason, "transport detached");
        }
    });

    // Print replicated entries as they arrive.
    let mut watch = session.handle().watch();
    tokio::spawn(async move {
        loop {
            match watch.recv().await {
                Ok(entry) => info!(
                    writer = %entry.writer.fingerprint(),
                    seq = entry.seq,
                    value = %entry.value,
                    "[replicate]"
                ),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Origin writer: surface (and optionally approve) authorisation
    // requests arriving on the overlay.
    if session.handle().is_writable() {
        let approver = session.clone();
        let auto_approve = args.auto_approve;
        let mut events = session.subscribe_overlay();
        tokio::spawn(async move {
            while let Ok(OverlayEvent::Authorisation(request)) = events.recv().await {
                info!(
                    node_name = %request.node_name,
                    requester = %request.read_key,
                    timestamp = %request.timestamp,
                    "authorisation request"
                );
                if auto_approve {
                    if let Err(e) = approver.grant_writer(request.read_key) {
                        warn!(error = %e, "grant failed");
                    }
                } else {
                    info!("ignoring request (run with --auto-approve to grant)");
                }
            }
        });
    }

    // Second device: ask the origin writer to authorise us.
    if let Some(local) = &local {
        let request = AuthoriseRequest::new(local.node_name.clone(), local.local_read_key);
        let digest = session.broadcast(request.to_wire()).await;
        info!(digest = %&digest[..8], "authorisation request broadcast");
    }

    // Append once this node may write: immediately for the origin, after
    // the grant arrives for a device.
    if let Some(raw) = args.append.clone() {
        let value: serde_json::Value =
            serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw));
        let handle = session.handle().clone();
        let signer = local.as_ref().map(|l| l.local_write_key.clone());
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(500));
            loop {
                interval.tick().await;
                let result = match &signer {
                    Some(key) => handle.append_as(key, value.clone()),
                    None => handle.append(value.clone()),
                };
                match result {
                    Ok(entry) => {
                        info!(seq = entry.seq, "appended");
                        break;
                    }
                    // Not granted yet; keep waiting.
                    Err(EngineError::NotAuthorised(_)) => continue,
                    Err(e) => {
                        warn!(error = %e, "append failed");
                        break;
                    }
                }
            }
        });
    }

    info!("node running, ctrl-c to exit");
    tokio::signal::ctrl_c().await.context("signal handler")?;
    registry.close(&read_key).await;
    Ok(())
}

/// Dial a relay over WebSocket and attach the connection to the session.
pub(crate) async fn ws_connect<E: Engine>(
    url: &str,
    session: &Arc<ReplicationSession<E>>,
) -> Result<(), RelayError> {
    let (socket, _) = connect_async(url)
        .await
        .map_err(|e| RelayError::Transport(format!("connect {url}: {e}")))?;
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (in_tx, in_rx) = mpsc::channel(PIPE_CAPACITY);
    let (out_tx, mut out_rx) = mpsc::channel(PIPE_CAPACITY);
    let pipe = TransportPipe {
        incoming: in_rx,
        outgoing: out_tx,
        label: format!("ws-out:{}", session.read_key().fingerprint()),
    };
    bridge::attach(session, pipe).await?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                out = out_rx.recv() => match out {
                    Some(bytes) => {
                        if ws_tx.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = ws_tx.close().await;
                        break;
                    }
                },
                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Binary(bytes))) => {
                        if in_tx.send(bytes.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "relay socket error");
                        break;
                    }
                },
            }
        }
    });

    Ok(())
}
