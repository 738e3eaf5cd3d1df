//! Key types, hex encoding, signatures, and standalone verification.
//!
//! Keys are shown to humans as lowercase hex throughout Hypha: the read key
//! doubles as the lookup handle in URLs and the discovery key is what gets
//! advertised to the swarm.

use std::fmt;
use std::hash::{Hash, Hasher};

use ed25519_dalek::Verifier;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::IdentityError;

/// Domain-separation prefix for the read-key → discovery-key hash.
const DISCOVERY_CONTEXT: &[u8] = b"hypha discovery";

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    data_encoding::HEXLOWER.encode(bytes)
}

pub(crate) fn hex_decode(s: &str) -> Result<Vec<u8>, IdentityError> {
    data_encoding::HEXLOWER_PERMISSIVE
        .decode(s.as_bytes())
        .map_err(|e| IdentityError::InvalidKey(format!("hex decode: {e}")))
}

// --- PublicKey ---

/// A 32-byte ed25519 verification key. The read key of a log is a
/// `PublicKey`; so is the per-device local writer key.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from lowercase (or mixed-case) hex.
    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex_decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| IdentityError::InvalidKey(format!("want 32 bytes, got {}", v.len())))?;
        Ok(Self(arr))
    }

    pub fn to_hex(&self) -> String {
        hex_encode(&self.0)
    }

    /// Short form for log lines: first 8 hex chars.
    pub fn fingerprint(&self) -> String {
        self.to_hex()[..8].to_string()
    }

    /// The discovery key for this read key: a one-way hash that is safe to
    /// advertise for peer discovery without revealing the read key itself.
    pub fn discovery_key(&self) -> DiscoveryKey {
        let digest = Sha256::new()
            .chain_update(DISCOVERY_CONTEXT)
            .chain_update(self.0)
            .finalize();
        DiscoveryKey(digest.into())
    }
}

impl Hash for PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PublicKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// --- DiscoveryKey ---

/// One-way hash of a read key. Never changes for the lifetime of an
/// identity and must not allow recovery of the read key.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct DiscoveryKey([u8; 32]);

impl DiscoveryKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex_decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| IdentityError::InvalidKey(format!("want 32 bytes, got {}", v.len())))?;
        Ok(Self(arr))
    }

    pub fn to_hex(&self) -> String {
        hex_encode(&self.0)
    }

    pub fn fingerprint(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl Hash for DiscoveryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Display for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiscoveryKey({})", self.fingerprint())
    }
}

// --- SigningKey ---

/// An ed25519 signing key. The write key of a log authorizes appends as its
/// origin writer; per-device local write keys sign that device's entries.
#[derive(Clone)]
pub struct SigningKey(ed25519_dalek::SigningKey);

impl SigningKey {
    pub fn generate<R: rand::CryptoRng + rand::RngCore>(rng: &mut R) -> Self {
        Self(ed25519_dalek::SigningKey::generate(rng))
    }

    /// Reconstruct from the raw 32-byte seed.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(ed25519_dalek::SigningKey::from_bytes(&bytes))
    }

    /// Raw 32-byte seed.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        use ed25519_dalek::Signer;
        Signature(self.0.sign(message).to_bytes())
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the seed.
        write!(f, "SigningKey(pub: {})", self.public_key().fingerprint())
    }
}

// --- Signature ---

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Signature([u8; 64]);

impl Signature {
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}...)", &hex_encode(&self.0[..8]))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex_encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex_decode(&s).map_err(serde::de::Error::custom)?;
        let arr: [u8; 64] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))?;
        Ok(Signature(arr))
    }
}

// --- ChannelKey ---

/// Symmetric key for the control-message overlay, derived from the write
/// key. Reproducible from the writer identity alone; never transmitted.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct ChannelKey([u8; 32]);

impl ChannelKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelKey(..)")
    }
}

// --- EncryptionKeys ---

/// Curve25519 encryption keypair derived alongside the signing keypair.
#[derive(Clone)]
pub struct EncryptionKeys {
    secret: [u8; 32],
    public: [u8; 32],
}

impl EncryptionKeys {
    /// Build from a 32-byte secret; the public key is computed.
    pub fn from_secret(secret: [u8; 32]) -> Self {
        let static_secret = x25519_dalek::StaticSecret::from(secret);
        let public = x25519_dalek::PublicKey::from(&static_secret);
        Self {
            secret,
            public: public.to_bytes(),
        }
    }

    pub fn public_bytes(&self) -> &[u8; 32] {
        &self.public
    }

    pub fn public_hex(&self) -> String {
        hex_encode(&self.public)
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }
}

impl fmt::Debug for EncryptionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionKeys(pub: {})", &self.public_hex()[..8])
    }
}

// --- Standalone verify ---

pub fn verify(
    public_key: &PublicKey,
    message: &[u8],
    signature: &Signature,
) -> Result<(), IdentityError> {
    let vk = ed25519_dalek::VerifyingKey::from_bytes(public_key.as_bytes())
        .map_err(|_| IdentityError::InvalidSignature)?;
    let sig = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
    vk.verify(message, &sig)
        .map_err(|_| IdentityError::InvalidSignature)
}
