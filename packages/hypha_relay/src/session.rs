//! One replication session per read key.
//!
//! A session owns its engine handle exclusively and fans the engine's
//! logical byte stream out to however many transports are attached. The
//! explicit state machine replaces the callback-style readiness events of
//! the engine with a watchable value.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use hypha_engine::{Engine, EngineHandle};
use hypha_identity::{DiscoveryKey, PublicKey};

use crate::error::RelayError;
use crate::overlay::{EphemeralOverlay, OverlayEvent, OverlayMode};

/// Session lifecycle. `Idle → Replicating` re-entry is valid: a dropped
/// transport may reconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Ready,
    Replicating,
    Idle,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Ready => "ready",
            SessionState::Replicating => "replicating",
            SessionState::Idle => "idle",
            SessionState::Closed => "closed",
        }
    }
}

/// Why a transport left the session.
#[derive(Clone, Debug)]
pub enum DetachReason {
    /// EOF or explicit close from either side.
    Clean,
    /// An I/O failure on the splice. Local to that transport.
    Error(String),
    /// The whole session was torn down.
    SessionClosed,
}

/// Reported to detach observers; never thrown.
#[derive(Clone, Debug)]
pub struct DetachEvent {
    pub attachment: u64,
    pub label: String,
    pub reason: DetachReason,
}

struct AttachmentInfo {
    label: String,
}

pub struct ReplicationSession<E: Engine> {
    read_key: PublicKey,
    discovery_key: DiscoveryKey,
    handle: Arc<E::Handle>,
    overlay: EphemeralOverlay,
    state_tx: watch::Sender<SessionState>,
    attachments: tokio::sync::Mutex<HashMap<u64, AttachmentInfo>>,
    next_attachment_id: AtomicU64,
    created_at: DateTime<Utc>,
    cancel: CancellationToken,
    detach_tx: broadcast::Sender<DetachEvent>,
}

impl<E: Engine> ReplicationSession<E> {
    pub fn new(
        read_key: PublicKey,
        handle: Arc<E::Handle>,
        mode: OverlayMode,
        message_window: Option<Duration>,
    ) -> Arc<Self> {
        // The writer owner is the node whose local identity is the origin
        // writer of this log: only it may act on authorisation requests.
        let is_writer_owner = handle.is_writable()
            && matches!(&mode, OverlayMode::Node { local_read_key } if *local_read_key == read_key);

        let (state_tx, _) = watch::channel(SessionState::Created);
        let (detach_tx, _) = broadcast::channel(64);

        let session = Arc::new(Self {
            read_key,
            discovery_key: read_key.discovery_key(),
            overlay: EphemeralOverlay::new(mode, is_writer_owner, message_window),
            state_tx,
            attachments: tokio::sync::Mutex::new(HashMap::new()),
            next_attachment_id: AtomicU64::new(1),
            created_at: Utc::now(),
            cancel: CancellationToken::new(),
            detach_tx,
            handle,
        });

        // Flip Created → Ready when the engine signals readiness.
        let weak = Arc::downgrade(&session);
        let mut ready_rx = session.handle.ready();
        tokio::spawn(async move {
            loop {
                if *ready_rx.borrow() {
                    if let Some(session) = weak.upgrade() {
                        session.state_tx.send_if_modified(|state| {
                            if *state == SessionState::Created {
                                *state = SessionState::Ready;
                                true
                            } else {
                                false
                            }
                        });
                    }
                    return;
                }
                if ready_rx.changed().await.is_err() {
                    return;
                }
            }
        });

        session
    }

    pub fn read_key(&self) -> PublicKey {
        self.read_key
    }

    pub fn discovery_key(&self) -> &DiscoveryKey {
        &self.discovery_key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn handle(&self) -> &Arc<E::Handle> {
        &self.handle
    }

    pub fn overlay(&self) -> &EphemeralOverlay {
        &self.overlay
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn subscribe_detach(&self) -> broadcast::Receiver<DetachEvent> {
        self.detach_tx.subscribe()
    }

    pub fn subscribe_overlay(&self) -> broadcast::Receiver<OverlayEvent> {
        self.overlay.subscribe()
    }

    /// Broadcast a control payload to every peer of this session.
    pub async fn broadcast(&self, payload: Vec<u8>) -> String {
        self.overlay.broadcast(payload).await
    }

    /// Authorise a requesting device's local key — the approval half of the
    /// handshake.
    pub fn grant_writer(&self, writer: PublicKey) -> Result<(), RelayError> {
        self.handle.grant_writer(writer)?;
        info!(
            session = %self.read_key.fingerprint(),
            writer = %writer.fingerprint(),
            "granted writer"
        );
        Ok(())
    }

    /// Wait until the engine can serve replication streams.
    pub async fn await_ready(&self) -> Result<(), RelayError> {
        let mut ready_rx = self.handle.ready();
        loop {
            if self.cancel.is_cancelled() {
                return Err(RelayError::SessionClosed);
            }
            if *ready_rx.borrow() {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(RelayError::SessionClosed),
                changed = ready_rx.changed() => {
                    if changed.is_err() {
                        return Err(RelayError::SessionClosed);
                    }
                }
            }
        }
    }

    /// Record a new attachment and register its extension sender with the
    /// overlay. Called by the bridge.
    pub(crate) async fn register_attachment(
        &self,
        label: String,
        ext_tx: Option<mpsc::Sender<Vec<u8>>>,
    ) -> u64 {
        let id = self.next_attachment_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut attachments = self.attachments.lock().await;
            attachments.insert(id, AttachmentInfo { label: label.clone() });
        }
        if let Some(tx) = ext_tx {
            self.overlay.register_peer(id, tx).await;
        }
        self.state_tx.send_if_modified(|state| {
            if *state != SessionState::Closed && *state != SessionState::Replicating {
                *state = SessionState::Replicating;
                true
            } else {
                false
            }
        });
        debug!(
            session = %self.read_key.fingerprint(),
            attachment = id,
            label = %label,
            "transport attached"
        );
        id
    }

    /// Remove an attachment. The session idles (or is evicted by the
    /// registry) when the last transport detaches.
    pub(crate) async fn detach(&self, attachment: u64, reason: DetachReason) {
        let (label, remaining) = {
            let mut attachments = self.attachments.lock().await;
            let label = attachments
                .remove(&attachment)
                .map(|info| info.label)
                .unwrap_or_default();
            (label, attachments.len())
        };
        self.overlay.unregister_peer(attachment).await;

        if remaining == 0 {
            self.state_tx.send_if_modified(|state| {
                if *state == SessionState::Replicating {
                    *state = SessionState::Idle;
                    true
                } else {
                    false
                }
            });
        }
        debug!(
            session = %self.read_key.fingerprint(),
            attachment,
            label = %label,
            reason = ?reason,
            remaining,
            "transport detached"
        );
        let _ = self.detach_tx.send(DetachEvent {
            attachment,
            label,
            reason,
        });
    }

    pub async fn attachment_count(&self) -> usize {
        self.attachments.lock().await.len()
    }

    /// Tear the session down: cancel every splice, close the engine handle.
    pub fn close(&self) {
        self.cancel.cancel();
        self.handle.close();
        self.state_tx.send_if_modified(|state| {
            if *state != SessionState::Closed {
                *state = SessionState::Closed;
                true
            } else {
                false
            }
        });
        info!(session = %self.read_key.fingerprint(), "session closed");
    }
}
