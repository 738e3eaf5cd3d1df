//! Browser-facing WebSocket attach endpoint: `GET /hypha/{readKeyHex}`.
//!
//! On connect the read key resolves to a session (created if absent) and
//! the socket becomes one more transport on it: binary frames in both
//! directions are the replication bytes.

use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use hypha_engine::Engine;
use hypha_identity::PublicKey;

use crate::AppState;
use crate::bridge::{self, PIPE_CAPACITY, TransportPipe};

pub async fn attach_handler<E: Engine>(
    State(state): State<AppState<E>>,
    Path(read_key_hex): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let read_key = match PublicKey::from_hex(&read_key_hex) {
        Ok(key) => key,
        Err(e) => {
            debug!(read_key = %read_key_hex, error = %e, "rejecting attach with invalid read key");
            return (StatusCode::BAD_REQUEST, format!("invalid read key: {e}")).into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_attach(state, read_key, socket))
}

async fn handle_attach<E: Engine>(state: AppState<E>, read_key: PublicKey, socket: WebSocket) {
    info!(session = %read_key.fingerprint(), "web socket attach request");

    let session = match state.registry.get_or_create(read_key, None).await {
        Ok(session) => session,
        Err(e) => {
            warn!(session = %read_key.fingerprint(), error = %e, "could not resolve session");
            return;
        }
    };

    let (in_tx, in_rx) = mpsc::channel(PIPE_CAPACITY);
    let (out_tx, mut out_rx) = mpsc::channel(PIPE_CAPACITY);
    let pipe = TransportPipe {
        incoming: in_rx,
        outgoing: out_tx,
        label: format!("ws:{}", read_key.fingerprint()),
    };

    if let Err(e) = bridge::attach(&session, pipe).await {
        warn!(session = %read_key.fingerprint(), error = %e, "attach failed");
        return;
    }

    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            out = out_rx.recv() => match out {
                Some(bytes) => {
                    if ws_tx.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                // The bridge detached (e.g. session closed); say goodbye.
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
                Some(Ok(Message::Text(text))) => {
                    if in_tx.send(text.as_bytes().to_vec()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Pings and pongs are answered by axum itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session = %read_key.fingerprint(), error = %e, "web socket error");
                    break;
                }
            },
        }
    }
    // Dropping `in_tx` ends the splice; the bridge detaches this transport
    // and the session keeps serving the others.
    debug!(session = %read_key.fingerprint(), "web socket connection ended");
}
