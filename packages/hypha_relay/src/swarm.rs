//! TCP swarm attach path.
//!
//! The discovery layer (DHT lookup, NAT traversal) is an external
//! collaborator; what reaches us is a connection event for a discovery
//! key. On the wire that is a TCP connection opening with one handshake
//! line — the discovery key in hex plus a newline — followed by raw
//! replication bytes. A key we do not host drops the connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use hypha_engine::Engine;
use hypha_identity::DiscoveryKey;

use crate::bridge::{self, PIPE_CAPACITY, TransportPipe};
use crate::error::RelayError;
use crate::registry::SessionRegistry;
use crate::session::ReplicationSession;

/// 64 hex chars plus the terminating newline.
const HANDSHAKE_LEN: usize = 65;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept swarm connections until the listener dies.
pub async fn run_acceptor<E: Engine>(listener: TcpListener, registry: Arc<SessionRegistry<E>>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let registry = registry.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, addr.to_string(), registry).await {
                        debug!(peer = %addr, error = %e, "swarm connection ended with error");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "swarm accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection<E: Engine>(
    mut stream: TcpStream,
    peer: String,
    registry: Arc<SessionRegistry<E>>,
) -> Result<(), RelayError> {
    let mut line = [0u8; HANDSHAKE_LEN];
    tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut line))
        .await
        .map_err(|_| RelayError::Transport("handshake timed out".into()))?
        .map_err(|e| RelayError::Transport(format!("handshake read: {e}")))?;

    if line[HANDSHAKE_LEN - 1] != b'\n' {
        return Err(RelayError::Transport("malformed swarm handshake".into()));
    }
    let hex = std::str::from_utf8(&line[..HANDSHAKE_LEN - 1])
        .map_err(|_| RelayError::Transport("malformed swarm handshake".into()))?;
    let discovery_key = DiscoveryKey::from_hex(hex)
        .map_err(|e| RelayError::Transport(format!("bad discovery key: {e}")))?;

    // The relay only serves sessions it already hosts; it cannot create one
    // from a discovery key (one-way hash, no read key to be had).
    let Some(session) = registry.find_by_discovery(&discovery_key).await else {
        info!(
            discovery = %discovery_key.fingerprint(),
            peer = %peer,
            "no session for discovery key, dropping swarm peer"
        );
        return Ok(());
    };

    info!(
        session = %session.read_key().fingerprint(),
        peer = %peer,
        "swarm peer connected"
    );
    let pipe = spawn_stream_pipe(stream, format!("tcp:{peer}"));
    bridge::attach(&session, pipe).await?;
    Ok(())
}

/// Dial a swarm peer and attach the connection to `session` (the outbound
/// half used by `hypha join --tcp`).
pub async fn dial<E: Engine>(
    addr: &str,
    session: &Arc<ReplicationSession<E>>,
) -> Result<(), RelayError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| RelayError::Transport(format!("connect {addr}: {e}")))?;

    let mut hello = session.discovery_key().to_hex().into_bytes();
    hello.push(b'\n');
    stream
        .write_all(&hello)
        .await
        .map_err(|e| RelayError::Transport(format!("handshake write: {e}")))?;

    let pipe = spawn_stream_pipe(stream, format!("tcp:{addr}"));
    bridge::attach(session, pipe).await?;
    Ok(())
}

/// Lower a TCP stream to a [`TransportPipe`]: one task per direction.
fn spawn_stream_pipe(stream: TcpStream, label: String) -> TransportPipe {
    let (mut rd, mut wr) = stream.into_split();
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(PIPE_CAPACITY);
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(PIPE_CAPACITY);

    tokio::spawn(async move {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if in_tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if wr.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    TransportPipe {
        incoming: in_rx,
        outgoing: out_tx,
        label,
    }
}
