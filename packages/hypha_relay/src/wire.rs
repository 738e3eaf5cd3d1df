//! Control-message wire shape and canonical hashing.
//!
//! Messages travel the extension lane as UTF-8 JSON. The dedup digest is
//! the lowercase hex SHA-256 of the exact wire bytes: senders emit
//! canonical JSON (object keys lexicographically sorted, no added
//! whitespace) and relays forward payloads byte-identical, so the digest is
//! stable across hops.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use hypha_identity::PublicKey;

use crate::error::RelayError;

/// The one action the current protocol defines.
pub const ACTION_AUTHORISE: &str = "authorise";

/// A decoded control payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// A device asking the origin writer to authorise its local key.
    Authorise(AuthoriseRequest),
    /// Valid JSON with an action this node does not understand. Logged and
    /// ignored, never an error.
    Unknown { action: String },
}

/// `{ "action": "authorise", "nodeName": ..., "readKey": ..., "timestamp": ... }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthoriseRequest {
    #[serde(rename = "nodeName")]
    pub node_name: String,
    /// The requesting device's local read key, hex-encoded on the wire.
    #[serde(rename = "readKey")]
    pub read_key: PublicKey,
    pub timestamp: DateTime<Utc>,
}

impl AuthoriseRequest {
    pub fn new(node_name: impl Into<String>, read_key: PublicKey) -> Self {
        Self {
            node_name: node_name.into(),
            read_key,
            timestamp: Utc::now(),
        }
    }

    /// Canonical wire bytes for this request.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut value = serde_json::to_value(self).expect("authorise request serializes");
        value["action"] = serde_json::Value::String(ACTION_AUTHORISE.to_string());
        canonical_bytes(&value)
    }
}

/// Serialize a JSON value with sorted object keys and no added whitespace.
///
/// `serde_json::Value` keeps object members in a BTreeMap, so plain
/// serialization is already canonical; this function exists to pin that
/// property in one place.
pub fn canonical_bytes(value: &serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(value).expect("JSON value serializes")
}

/// Lowercase hex SHA-256 of a payload — the dedup digest.
pub fn digest_hex(payload: &[u8]) -> String {
    data_encoding::HEXLOWER.encode(&Sha256::digest(payload))
}

/// Decode a control payload. Unknown actions decode to
/// [`ControlMessage::Unknown`]; anything that is not a JSON object with a
/// string `action` — or an `authorise` without its required fields — is a
/// [`RelayError::BadMessage`].
pub fn decode(payload: &[u8]) -> Result<ControlMessage, RelayError> {
    let value: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|e| RelayError::BadMessage(format!("invalid JSON: {e}")))?;
    let action = value
        .get("action")
        .and_then(|a| a.as_str())
        .ok_or_else(|| RelayError::BadMessage("missing action field".into()))?;

    match action {
        ACTION_AUTHORISE => {
            let request: AuthoriseRequest = serde_json::from_value(value.clone())
                .map_err(|e| RelayError::BadMessage(format!("malformed authorise: {e}")))?;
            Ok(ControlMessage::Authorise(request))
        }
        other => Ok(ControlMessage::Unknown {
            action: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> AuthoriseRequest {
        AuthoriseRequest::new("Firefox on macOS", PublicKey::from_bytes([0xaa; 32]))
    }

    #[test]
    fn wire_bytes_have_sorted_keys() {
        let wire = sample_request().to_wire();
        let text = String::from_utf8(wire).unwrap();
        let action = text.find("\"action\"").unwrap();
        let node_name = text.find("\"nodeName\"").unwrap();
        let read_key = text.find("\"readKey\"").unwrap();
        let timestamp = text.find("\"timestamp\"").unwrap();
        assert!(action < node_name && node_name < read_key && read_key < timestamp);
    }

    #[test]
    fn digest_is_stable_under_key_reordering() {
        // Two spellings of the same message, different key order.
        let a: serde_json::Value =
            serde_json::from_str(r#"{"action":"authorise","nodeName":"X"}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"nodeName":"X","action":"authorise"}"#).unwrap();
        assert_eq!(
            digest_hex(&canonical_bytes(&a)),
            digest_hex(&canonical_bytes(&b))
        );
    }

    #[test]
    fn digest_is_lowercase_hex() {
        let d = digest_hex(b"hello");
        assert_eq!(d.len(), 64);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn decode_roundtrip() {
        let request = sample_request();
        let wire = request.to_wire();
        match decode(&wire).unwrap() {
            ControlMessage::Authorise(decoded) => {
                assert_eq!(decoded.node_name, request.node_name);
                assert_eq!(decoded.read_key, request.read_key);
            }
            other => panic!("expected authorise, got {other:?}"),
        }
    }

    #[test]
    fn unknown_action_is_not_an_error() {
        let payload = br#"{"action":"dance","tempo":120}"#;
        match decode(payload).unwrap() {
            ControlMessage::Unknown { action } => assert_eq!(action, "dance"),
            other => panic!("expected unknown, got {other:?}"),
        }
    }

    #[test]
    fn invalid_json_is_bad_message() {
        assert!(matches!(
            decode(b"not json"),
            Err(RelayError::BadMessage(_))
        ));
    }

    #[test]
    fn missing_action_is_bad_message() {
        assert!(matches!(
            decode(br#"{"nodeName":"X"}"#),
            Err(RelayError::BadMessage(_))
        ));
    }

    #[test]
    fn malformed_authorise_is_bad_message() {
        assert!(matches!(
            decode(br#"{"action":"authorise"}"#),
            Err(RelayError::BadMessage(_))
        ));
    }
}
