//! The replication-engine interface the Hypha relay consumes.
//!
//! The relay treats the log-replication engine as an opaque collaborator:
//! it opens one session handle per read key, asks the handle for a fresh
//! duplex replication stream per attached transport, and forwards the
//! engine's bytes without interpreting them. Control messages ride an
//! extension lane alongside each stream rather than the log itself.
//!
//! [`memory::MemoryEngine`] is the in-process reference implementation used
//! by the CLI and the tests; a production deployment links a real engine
//! behind the same traits.

pub mod error;
pub mod framing;
pub mod memory;

pub use error::EngineError;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use hypha_identity::{PublicKey, Signature, SigningKey};

/// Extension name for the control-message overlay lane.
pub const EPHEMERAL_EXTENSION: &str = "secure-ephemeral";

/// Anything that can serve as the byte half of a replication stream.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Options for [`EngineHandle::replicate`], mirroring what the engine
/// accepts when opening a stream.
#[derive(Clone, Debug)]
pub struct StreamOptions {
    /// Keep streaming new entries after the initial snapshot.
    pub live: bool,
    /// Extension lanes to enable on this stream.
    pub extensions: Vec<String>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            live: true,
            extensions: Vec::new(),
        }
    }
}

impl StreamOptions {
    /// Live replication with the ephemeral-message extension enabled —
    /// what every relay attachment uses.
    pub fn live_with_ephemeral() -> Self {
        Self {
            live: true,
            extensions: vec![EPHEMERAL_EXTENSION.to_string()],
        }
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|e| e == name)
    }
}

/// The side-channel of one replication stream: control payloads sent and
/// received alongside the log bytes. Both directions are bounded.
pub struct ExtensionLane {
    /// Payloads to push out over this stream.
    pub tx: mpsc::Sender<Vec<u8>>,
    /// Payloads arriving on this stream.
    pub rx: mpsc::Receiver<Vec<u8>>,
}

/// A fresh engine-level duplex for one physical transport. All streams of a
/// handle multiplex onto the same logical log internally.
pub struct ReplicationStream {
    /// The engine's multiplexed replication protocol as a byte pipe; the
    /// bridge splices this with the transport.
    pub io: Box<dyn AsyncStream>,
    /// Present when the stream was opened with the ephemeral extension.
    pub extensions: Option<ExtensionLane>,
}

/// A replication engine: opens one session handle per read key.
pub trait Engine: Send + Sync + 'static {
    type Handle: EngineHandle;

    /// Open (or create) the engine session for `read_key`. `write_key` is
    /// present when this process is the origin writer.
    fn open_session(
        &self,
        read_key: PublicKey,
        write_key: Option<SigningKey>,
    ) -> Result<std::sync::Arc<Self::Handle>, EngineError>;
}

/// One engine session, owned exclusively by a `ReplicationSession`.
pub trait EngineHandle: Send + Sync + 'static {
    fn read_key(&self) -> PublicKey;

    /// Whether this handle was opened with the write key.
    fn is_writable(&self) -> bool;

    /// Readiness signal; `true` once the engine can serve streams.
    fn ready(&self) -> watch::Receiver<bool>;

    /// Obtain a fresh duplex replication stream for one transport.
    fn replicate(&self, options: StreamOptions) -> Result<ReplicationStream, EngineError>;

    /// Authorise another writer's local key to append to this log.
    fn grant_writer(&self, writer: PublicKey) -> Result<(), EngineError>;

    /// Tear the session down; open streams end and further calls fail with
    /// [`EngineError::Closed`].
    fn close(&self);
}

/// One signed entry of the append-only multiwriter log (reference-engine
/// wire shape).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub writer: PublicKey,
    pub seq: u64,
    pub value: serde_json::Value,
    pub signature: Signature,
}

impl LogEntry {
    /// The bytes a writer signs: writer key, sequence number, and the
    /// canonical JSON of the value.
    pub fn signing_bytes(writer: &PublicKey, seq: u64, value: &serde_json::Value) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(writer.as_bytes());
        bytes.extend_from_slice(&seq.to_be_bytes());
        bytes.extend_from_slice(value.to_string().as_bytes());
        bytes
    }

    pub fn verify(&self) -> Result<(), hypha_identity::IdentityError> {
        let bytes = Self::signing_bytes(&self.writer, self.seq, &self.value);
        hypha_identity::keys::verify(&self.writer, &bytes, &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_options_default_is_live_without_extensions() {
        let opts = StreamOptions::default();
        assert!(opts.live);
        assert!(!opts.has_extension(EPHEMERAL_EXTENSION));
    }

    #[test]
    fn live_with_ephemeral_enables_lane() {
        assert!(StreamOptions::live_with_ephemeral().has_extension(EPHEMERAL_EXTENSION));
    }

    #[test]
    fn log_entry_sign_verify() {
        let sk = SigningKey::from_bytes([5u8; 32]);
        let writer = sk.public_key();
        let value = serde_json::json!({"k": "v"});
        let signature = sk.sign(&LogEntry::signing_bytes(&writer, 3, &value));
        let entry = LogEntry {
            writer,
            seq: 3,
            value,
            signature,
        };
        entry.verify().unwrap();

        let mut forged = entry.clone();
        forged.seq = 4;
        assert!(forged.verify().is_err());
    }
}
