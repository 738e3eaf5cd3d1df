//! Engine error taxonomy.

use hypha_identity::PublicKey;

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// The engine handle failed to initialize. Surfaced to the caller;
    /// retryable.
    #[error("session creation failed: {0}")]
    SessionCreation(String),

    /// A write operation was attempted on a handle opened without the
    /// write key.
    #[error("engine handle is not writable")]
    NotWritable,

    /// An append was attempted by a writer the log has not authorised.
    #[error("writer {} is not authorised", .0.fingerprint())]
    NotAuthorised(PublicKey),

    /// The handle has been closed; no further streams or appends.
    #[error("engine handle is closed")]
    Closed,

    /// A replication stream failed.
    #[error("replication stream: {0}")]
    Stream(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_authorised_shows_fingerprint() {
        let err = EngineError::NotAuthorised(PublicKey::from_bytes([0xab; 32]));
        assert!(err.to_string().contains("abababab"));
    }
}
