//! Transport bridge: splice any transport onto a session.
//!
//! Every transport kind lowers itself to a [`TransportPipe`] — a pair of
//! bounded byte channels plus a label — and [`attach`] does the rest:
//! obtain a fresh replication stream from the session's engine handle,
//! splice the two byte pipes symmetrically, hand the stream's extension
//! lane to the overlay, and detach on either side ending. A broken peer
//! never crashes the session or the other attached transports.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use hypha_engine::{Engine, EngineHandle, StreamOptions};

use crate::error::RelayError;
use crate::session::{DetachReason, ReplicationSession};

/// Depth of each pipe direction. Bounded so a stalled consumer suspends
/// the producer instead of growing a buffer.
pub const PIPE_CAPACITY: usize = 32;

/// Read chunk size for the engine-to-transport direction.
const READ_BUF_SIZE: usize = 16 * 1024;

/// A transport that has become a duplex byte stream.
pub struct TransportPipe {
    /// Bytes arriving from the remote peer.
    pub incoming: mpsc::Receiver<Vec<u8>>,
    /// Bytes to deliver to the remote peer.
    pub outgoing: mpsc::Sender<Vec<u8>>,
    /// Human-readable transport label for logs ("ws:1f2e3d4c", "tcp:...").
    pub label: String,
}

impl TransportPipe {
    /// Two cross-connected pipes, as if joined by a perfect wire. The
    /// in-process transport used by tests.
    #[cfg(test)]
    pub fn pair(label_a: impl Into<String>, label_b: impl Into<String>) -> (Self, Self) {
        let (a_out_tx, b_in_rx) = mpsc::channel(PIPE_CAPACITY);
        let (b_out_tx, a_in_rx) = mpsc::channel(PIPE_CAPACITY);
        (
            Self {
                incoming: a_in_rx,
                outgoing: a_out_tx,
                label: label_a.into(),
            },
            Self {
                incoming: b_in_rx,
                outgoing: b_out_tx,
                label: label_b.into(),
            },
        )
    }
}

/// Attach a transport to a session.
///
/// Waits for the engine to be ready, obtains a fresh replication stream for
/// this transport, and spawns the splice and the overlay inbound pump.
/// Returns the attachment id once the transport is wired.
pub async fn attach<E: Engine>(
    session: &Arc<ReplicationSession<E>>,
    pipe: TransportPipe,
) -> Result<u64, RelayError> {
    session.await_ready().await?;

    let stream = session
        .handle()
        .replicate(StreamOptions::live_with_ephemeral())
        .map_err(RelayError::from)?;

    let (ext_tx, ext_rx) = match stream.extensions {
        Some(lane) => (Some(lane.tx), Some(lane.rx)),
        None => (None, None),
    };

    let id = session.register_attachment(pipe.label.clone(), ext_tx).await;

    // Inbound extension payloads go to the overlay until the lane closes.
    if let Some(mut ext_rx) = ext_rx {
        let session = session.clone();
        tokio::spawn(async move {
            while let Some(payload) = ext_rx.recv().await {
                session.overlay().on_message(id, payload).await;
            }
        });
    }

    let session = session.clone();
    tokio::spawn(async move {
        let reason = splice(&session, stream.io, pipe).await;
        session.detach(id, reason).await;
    });

    Ok(id)
}

/// Pump bytes in both directions until either side ends or the session is
/// torn down. The outcome is reported, never thrown.
///
/// Backpressure is inherent: each direction's forward `await`s the bounded
/// write before reading more, so a slow peer stalls its own direction only.
async fn splice<E: Engine>(
    session: &Arc<ReplicationSession<E>>,
    io: Box<dyn hypha_engine::AsyncStream>,
    pipe: TransportPipe,
) -> DetachReason {
    let TransportPipe {
        mut incoming,
        outgoing,
        label,
    } = pipe;
    let (mut engine_rd, mut engine_wr) = tokio::io::split(io);
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        tokio::select! {
            _ = session.cancel_token().cancelled() => {
                return DetachReason::SessionClosed;
            }

            chunk = incoming.recv() => match chunk {
                Some(bytes) => {
                    if let Err(e) = engine_wr.write_all(&bytes).await {
                        debug!(label = %label, error = %e, "engine stream write failed");
                        return DetachReason::Error(format!("engine write: {e}"));
                    }
                }
                // Transport closed its sending side.
                None => return DetachReason::Clean,
            },

            read = engine_rd.read(&mut buf) => match read {
                Ok(0) => return DetachReason::Clean,
                Ok(n) => {
                    if outgoing.send(buf[..n].to_vec()).await.is_err() {
                        // Transport consumer went away mid-write.
                        return DetachReason::Clean;
                    }
                }
                Err(e) => {
                    debug!(label = %label, error = %e, "engine stream read failed");
                    return DetachReason::Error(format!("engine read: {e}"));
                }
            },
        }
    }
}
