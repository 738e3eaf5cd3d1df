//! Relay error taxonomy.
//!
//! Failures local to one transport or one message never propagate to the
//! session or the registry; failures in identity derivation or session
//! creation propagate to the caller who requested them.

use hypha_engine::EngineError;
use hypha_identity::IdentityError;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Identity derivation failed; no session may be created.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// The engine handle failed to initialize. Retryable by the caller.
    #[error("session creation failed: {0}")]
    SessionCreation(String),

    /// The session was closed while the operation was in flight.
    #[error("session closed")]
    SessionClosed,

    /// A transport-level failure. Recovered locally: that transport is
    /// detached, the session keeps serving the others.
    #[error("transport: {0}")]
    Transport(String),

    /// A malformed control payload. The message is dropped and logged; the
    /// connection stays up.
    #[error("bad control message: {0}")]
    BadMessage(String),
}

impl From<EngineError> for RelayError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Closed => RelayError::SessionClosed,
            EngineError::SessionCreation(msg) => RelayError::SessionCreation(msg),
            other => RelayError::SessionCreation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_closed_maps_to_session_closed() {
        assert!(matches!(
            RelayError::from(EngineError::Closed),
            RelayError::SessionClosed
        ));
    }

    #[test]
    fn identity_error_passes_through() {
        let err = RelayError::from(IdentityError::KeyDerivation("too short".into()));
        assert!(err.to_string().contains("too short"));
    }
}
