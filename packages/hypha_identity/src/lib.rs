//! Deterministic cryptographic identity derivation for Hypha nodes.
//!
//! A node's identity is derived from a human-memorable passphrase plus a
//! domain string: the same inputs always yield the same signing keypair,
//! encryption keypair, discovery key, and control-channel key. Nothing here
//! touches the network or the disk.

pub mod derive;
pub mod error;
pub mod keys;
pub mod passphrase;

pub use derive::{LocalIdentity, NodeIdentity, derive_identity, derive_local_identity};
pub use error::IdentityError;
pub use keys::{ChannelKey, DiscoveryKey, EncryptionKeys, PublicKey, Signature, SigningKey};
pub use passphrase::{generate_passphrase, validate_passphrase};
