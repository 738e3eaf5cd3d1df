//! Ephemeral control-message overlay.
//!
//! Per session: deduplicates short control messages across every attached
//! transport and either relays them verbatim (the unprivileged always-on
//! host) or decodes and dispatches them (a node holding an identity). The
//! relay never inspects a message beyond its digest, so end-to-end
//! encrypted payloads stay confidential.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use hypha_identity::PublicKey;

use crate::wire::{self, ControlMessage};

/// Capacity of the overlay event channel.
const EVENT_CAPACITY: usize = 64;

/// How this node participates in the overlay.
#[derive(Clone, Debug)]
pub enum OverlayMode {
    /// Forward unseen messages verbatim to every other attachment, never
    /// interpreting them. Used by hosts holding no key material.
    Relay,
    /// Decode unseen messages and dispatch them to the application.
    Node { local_read_key: PublicKey },
}

/// Events surfaced to the application layer.
#[derive(Clone, Debug)]
pub enum OverlayEvent {
    /// An authorisation request addressed to this node as the session's
    /// origin writer. Approval means calling the session's `grant_writer`
    /// with the requester's read key.
    Authorisation(wire::AuthoriseRequest),
}

/// Per-attachment fan-out target: the extension lane's sender.
type PeerMap = HashMap<u64, mpsc::Sender<Vec<u8>>>;

pub struct EphemeralOverlay {
    mode: OverlayMode,
    /// True when this node is the session's origin writer, i.e. the engine
    /// handle is writable and the local identity matches the session key.
    is_writer_owner: bool,
    /// Seen digests and when they were first seen. Insert-and-check is one
    /// atomic operation under the lock.
    seen: Mutex<HashMap<String, Instant>>,
    /// Evict seen digests older than this; `None` keeps them forever.
    window: Option<Duration>,
    peers: tokio::sync::Mutex<PeerMap>,
    events_tx: broadcast::Sender<OverlayEvent>,
}

impl EphemeralOverlay {
    pub fn new(mode: OverlayMode, is_writer_owner: bool, window: Option<Duration>) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            mode,
            is_writer_owner,
            seen: Mutex::new(HashMap::new()),
            window,
            peers: tokio::sync::Mutex::new(HashMap::new()),
            events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OverlayEvent> {
        self.events_tx.subscribe()
    }

    /// Register an attachment's extension sender as a fan-out target.
    pub async fn register_peer(&self, attachment: u64, tx: mpsc::Sender<Vec<u8>>) {
        self.peers.lock().await.insert(attachment, tx);
    }

    pub async fn unregister_peer(&self, attachment: u64) {
        self.peers.lock().await.remove(&attachment);
    }

    /// Broadcast a control message to every peer reachable through this
    /// session. Marks it seen first, so an echo arriving back later is a
    /// no-op. Returns the digest.
    pub async fn broadcast(&self, payload: Vec<u8>) -> String {
        let digest = wire::digest_hex(&payload);
        self.mark_seen(&digest);
        self.forward(None, payload).await;
        digest
    }

    /// Handle a payload arriving on an attachment's extension lane.
    ///
    /// At-most-once: the digest check and the seen-marking are atomic, so
    /// the same payload delivered on two transports dispatches once.
    pub async fn on_message(&self, from: u64, payload: Vec<u8>) {
        let digest = wire::digest_hex(&payload);
        if !self.mark_seen(&digest) {
            trace!(digest = %&digest[..8], from, "duplicate control message dropped");
            return;
        }

        match &self.mode {
            OverlayMode::Relay => {
                // Relay before interpreting; semantics stay opaque here.
                debug!(digest = %&digest[..8], from, "relaying control message");
                self.forward(Some(from), payload).await;
            }
            OverlayMode::Node { .. } => match wire::decode(&payload) {
                Ok(ControlMessage::Authorise(request)) => self.handle_authorise(request),
                Ok(ControlMessage::Unknown { action }) => {
                    debug!(action, from, "ignoring control message with unknown action");
                }
                Err(e) => {
                    // Malformed payload: dropped, logged, connection kept.
                    warn!(from, error = %e, "dropping malformed control message");
                }
            },
        }
    }

    fn handle_authorise(&self, request: wire::AuthoriseRequest) {
        if !self.is_writer_owner {
            debug!(
                requester = %request.read_key.fingerprint(),
                "ignoring authorisation request: not the writer owner of this session"
            );
            return;
        }
        debug!(
            requester = %request.read_key.fingerprint(),
            node_name = %request.node_name,
            "surfacing authorisation request"
        );
        let _ = self.events_tx.send(OverlayEvent::Authorisation(request));
    }

    /// Push a payload to every registered peer except `skip`.
    async fn forward(&self, skip: Option<u64>, payload: Vec<u8>) {
        let targets: Vec<(u64, mpsc::Sender<Vec<u8>>)> = {
            let peers = self.peers.lock().await;
            peers
                .iter()
                .filter(|(id, _)| Some(**id) != skip)
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };
        for (id, tx) in targets {
            // Bounded send: a slow peer applies backpressure here rather
            // than growing a buffer.
            if tx.send(payload.clone()).await.is_err() {
                trace!(attachment = id, "peer lane closed during forward");
            }
        }
    }

    /// Record a digest. Returns `true` if it was new. Prunes entries older
    /// than the window while holding the lock.
    fn mark_seen(&self, digest: &str) -> bool {
        let mut seen = self.seen.lock().expect("seen set poisoned");
        let now = Instant::now();
        if let Some(window) = self.window {
            seen.retain(|_, first_seen| now.duration_since(*first_seen) < window);
        }
        match seen.get(digest) {
            Some(_) => false,
            None => {
                seen.insert(digest.to_string(), now);
                true
            }
        }
    }

    #[cfg(test)]
    fn seen_len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}
