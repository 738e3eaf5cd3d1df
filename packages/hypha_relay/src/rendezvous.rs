//! Rendezvous attach path (the browser-to-browser leg).
//!
//! Peer connections are brokered by an external rendezvous/signalling
//! service: every node interested in a log joins the hub room named by the
//! log's discovery key hex, and the hub relays per-peer payloads between
//! room members. Each remote peer the hub reports becomes one attached
//! transport on the session. Connection upgrading (ICE and friends) stays
//! inside the external service; from here each peer is just bytes.
//!
//! Hub protocol, JSON text frames:
//!   hub → client: {"type":"peer","peer":id}
//!                 {"type":"data","from":id,"payload":base64}
//!                 {"type":"leave","peer":id}
//!   client → hub: {"type":"data","to":id,"payload":base64}

use std::collections::HashMap;
use std::sync::Arc;

use futures::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use hypha_engine::Engine;

use crate::bridge::{self, PIPE_CAPACITY, TransportPipe};
use crate::error::RelayError;
use crate::session::ReplicationSession;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum HubInbound {
    Peer { peer: String },
    Data { from: String, payload: String },
    Leave { peer: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum HubOutbound {
    Data { to: String, payload: String },
}

/// Join the hub room for this session's discovery key and keep attaching
/// peers until the hub connection ends.
pub async fn run<E: Engine>(
    hub_url: &str,
    session: Arc<ReplicationSession<E>>,
) -> Result<(), RelayError> {
    let room = session.discovery_key().to_hex();
    let url = format!("{}/{room}", hub_url.trim_end_matches('/'));

    let (socket, _) = connect_async(&url)
        .await
        .map_err(|e| RelayError::Transport(format!("rendezvous connect: {e}")))?;
    info!(
        session = %session.read_key().fingerprint(),
        discovery = %session.discovery_key().fingerprint(),
        "joined rendezvous room"
    );

    let (mut hub_tx, mut hub_rx) = socket.split();

    // All per-peer senders funnel into one writer task.
    let (out_tx, mut out_rx) = mpsc::channel::<HubOutbound>(PIPE_CAPACITY);
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let json = serde_json::to_string(&frame).expect("hub frame serializes");
            if hub_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut peers: HashMap<String, mpsc::Sender<Vec<u8>>> = HashMap::new();

    while let Some(msg) = hub_rx.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "rendezvous socket error");
                break;
            }
        };
        let inbound: HubInbound = match serde_json::from_str(&text) {
            Ok(inbound) => inbound,
            Err(e) => {
                debug!(error = %e, "ignoring malformed hub frame");
                continue;
            }
        };

        match inbound {
            HubInbound::Peer { peer } => {
                ensure_peer(&session, &mut peers, &out_tx, peer).await;
            }
            HubInbound::Data { from, payload } => {
                let bytes = match data_encoding::BASE64.decode(payload.as_bytes()) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        debug!(peer = %from, error = %e, "ignoring undecodable hub payload");
                        continue;
                    }
                };
                if let Some(tx) = ensure_peer(&session, &mut peers, &out_tx, from.clone()).await {
                    if tx.send(bytes).await.is_err() {
                        // The splice ended; forget the peer so a fresh
                        // attach happens if it speaks again.
                        peers.remove(&from);
                    }
                }
            }
            HubInbound::Leave { peer } => {
                // Dropping the sender closes the pipe and detaches.
                peers.remove(&peer);
                debug!(peer = %peer, "rendezvous peer left");
            }
        }
    }

    info!(session = %session.read_key().fingerprint(), "rendezvous room closed");
    Ok(())
}

/// Attach a transport for `peer` if we have not already.
async fn ensure_peer<E: Engine>(
    session: &Arc<ReplicationSession<E>>,
    peers: &mut HashMap<String, mpsc::Sender<Vec<u8>>>,
    out_tx: &mpsc::Sender<HubOutbound>,
    peer: String,
) -> Option<mpsc::Sender<Vec<u8>>> {
    if let Some(tx) = peers.get(&peer) {
        return Some(tx.clone());
    }

    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(PIPE_CAPACITY);
    let (peer_out_tx, mut peer_out_rx) = mpsc::channel::<Vec<u8>>(PIPE_CAPACITY);
    let pipe = TransportPipe {
        incoming: in_rx,
        outgoing: peer_out_tx,
        label: format!("rtc:{peer}"),
    };

    // Bytes the session produces for this peer go back through the hub.
    let hub_out = out_tx.clone();
    let peer_id = peer.clone();
    tokio::spawn(async move {
        while let Some(bytes) = peer_out_rx.recv().await {
            let frame = HubOutbound::Data {
                to: peer_id.clone(),
                payload: data_encoding::BASE64.encode(&bytes),
            };
            if hub_out.send(frame).await.is_err() {
                break;
            }
        }
    });

    match bridge::attach(session, pipe).await {
        Ok(_) => {
            debug!(peer = %peer, "rendezvous peer attached");
            peers.insert(peer, in_tx.clone());
            Some(in_tx)
        }
        Err(e) => {
            warn!(peer = %peer, error = %e, "rendezvous attach failed");
            None
        }
    }
}
