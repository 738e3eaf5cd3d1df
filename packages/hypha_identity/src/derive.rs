//! Passphrase → identity derivation.
//!
//! `derive_identity` is deterministic and side-effect-free: a fixed
//! (passphrase, domain) pair always produces the same signing keypair,
//! encryption keypair, discovery key, and channel key, across calls and
//! across process restarts. The KDF is CPU-bound; callers on an async
//! runtime should wrap calls in `spawn_blocking`.

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};

use crate::error::IdentityError;
use crate::keys::{ChannelKey, DiscoveryKey, EncryptionKeys, PublicKey, SigningKey};

/// Argon2id parameters, fixed so derivation never drifts across releases.
const KDF_MEMORY_KIB: u32 = 19 * 1024;
const KDF_ITERATIONS: u32 = 2;
const KDF_PARALLELISM: u32 = 1;

/// One KDF stretch yields both keypairs: bytes 0..32 seed the ed25519
/// signing keypair, bytes 32..64 the x25519 encryption keypair.
const KDF_OUTPUT_LEN: usize = 64;

/// Argon2 wants a salt of at least 8 bytes; domains can be shorter, so the
/// salt is a truncated hash of the domain string.
const SALT_LEN: usize = 16;

/// Context label and key index for the control-channel subkey.
const CHANNEL_CONTEXT: &[u8] = b"ephemera";
const CHANNEL_KEY_INDEX: u8 = 1;

/// The full key set of a writer node, derived from (passphrase, domain).
#[derive(Clone, Debug)]
pub struct NodeIdentity {
    /// Public verification key; identifies the log and doubles as its
    /// lookup handle.
    pub read_key: PublicKey,
    /// Private signing key authorizing appends as the origin writer.
    pub write_key: SigningKey,
    /// One-way hash of the read key, safe to advertise for discovery.
    pub discovery_key: DiscoveryKey,
    /// Curve25519 keypair for payload encryption between nodes.
    pub encryption: EncryptionKeys,
    /// Symmetric key for the control-message overlay. Derived from the
    /// write key, so it is reproducible from the writer identity alone and
    /// never needs to be transmitted.
    pub channel_key: ChannelKey,
}

/// A per-device writer identity for multiwriter onboarding: a second device
/// derives this from the origin read key plus its own node name, then asks
/// the origin writer to authorise its local key.
#[derive(Clone, Debug)]
pub struct LocalIdentity {
    /// The read key of the log this device wants to join.
    pub origin_read_key: PublicKey,
    /// Discovery key of the origin log (what the device advertises to find
    /// peers).
    pub discovery_key: DiscoveryKey,
    /// This device's own writer keypair.
    pub local_write_key: SigningKey,
    pub local_read_key: PublicKey,
    pub node_name: String,
}

/// Derive a writer identity from a passphrase, salted by the domain.
pub fn derive_identity(passphrase: &str, domain: &str) -> Result<NodeIdentity, IdentityError> {
    let seed = kdf(passphrase, domain)?;

    let mut signing_seed = [0u8; 32];
    signing_seed.copy_from_slice(&seed[..32]);
    let write_key = SigningKey::from_bytes(signing_seed);
    let read_key = write_key.public_key();

    let mut encryption_secret = [0u8; 32];
    encryption_secret.copy_from_slice(&seed[32..]);

    Ok(NodeIdentity {
        discovery_key: read_key.discovery_key(),
        channel_key: channel_key(&write_key)?,
        encryption: EncryptionKeys::from_secret(encryption_secret),
        read_key,
        write_key,
    })
}

/// Derive a device-local identity tied to an existing log.
///
/// The origin read key hex is the shared secret (any device signing in to
/// the domain knows it) and the node name is the device-specific salt, so
/// each device gets a distinct, reproducible local keypair.
pub fn derive_local_identity(
    origin_read_key_hex: &str,
    node_name: &str,
) -> Result<LocalIdentity, IdentityError> {
    let origin_read_key = PublicKey::from_hex(origin_read_key_hex)?;

    // Re-encode so mixed-case hex input derives the same identity.
    let canonical_hex = origin_read_key.to_hex();
    let seed = kdf(&canonical_hex, node_name)?;

    let mut signing_seed = [0u8; 32];
    signing_seed.copy_from_slice(&seed[..32]);
    let local_write_key = SigningKey::from_bytes(signing_seed);

    Ok(LocalIdentity {
        discovery_key: origin_read_key.discovery_key(),
        local_read_key: local_write_key.public_key(),
        local_write_key,
        origin_read_key,
        node_name: node_name.to_string(),
    })
}

/// The control-channel subkey: HKDF-SHA256 over the write-key seed with a
/// fixed context label and key index.
pub fn channel_key(write_key: &SigningKey) -> Result<ChannelKey, IdentityError> {
    let hk = Hkdf::<Sha256>::new(None, &write_key.to_bytes());
    let mut info = CHANNEL_CONTEXT.to_vec();
    info.push(CHANNEL_KEY_INDEX);
    let mut okm = [0u8; 32];
    hk.expand(&info, &mut okm)
        .map_err(|e| IdentityError::KeyDerivation(format!("channel key expand: {e}")))?;
    Ok(ChannelKey::from_bytes(okm))
}

fn kdf(secret: &str, salt_domain: &str) -> Result<[u8; KDF_OUTPUT_LEN], IdentityError> {
    if secret.is_empty() {
        return Err(IdentityError::KeyDerivation("secret is empty".into()));
    }
    if salt_domain.is_empty() {
        return Err(IdentityError::KeyDerivation("salt domain is empty".into()));
    }

    let salt_digest = Sha256::digest(salt_domain.as_bytes());
    let salt = &salt_digest[..SALT_LEN];

    let params = Params::new(
        KDF_MEMORY_KIB,
        KDF_ITERATIONS,
        KDF_PARALLELISM,
        Some(KDF_OUTPUT_LEN),
    )
    .map_err(|e| IdentityError::KeyDerivation(format!("argon2 params: {e}")))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut out = [0u8; KDF_OUTPUT_LEN];
    argon
        .hash_password_into(secret.as_bytes(), salt, &mut out)
        .map_err(|e| IdentityError::KeyDerivation(format!("argon2: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSPHRASE: &str = "correct horse battery staple octopus lantern mosaic ferry";
    const DOMAIN: &str = "ar.al";

    #[test]
    fn derivation_is_deterministic() {
        let a = derive_identity(PASSPHRASE, DOMAIN).unwrap();
        let b = derive_identity(PASSPHRASE, DOMAIN).unwrap();
        assert_eq!(a.read_key, b.read_key);
        assert_eq!(a.write_key.to_bytes(), b.write_key.to_bytes());
        assert_eq!(a.discovery_key.as_bytes(), b.discovery_key.as_bytes());
        assert_eq!(a.encryption.public_bytes(), b.encryption.public_bytes());
        assert_eq!(a.channel_key.as_bytes(), b.channel_key.as_bytes());
    }

    #[test]
    fn distinct_passphrases_distinct_keys() {
        let a = derive_identity(PASSPHRASE, DOMAIN).unwrap();
        let b = derive_identity("a different passphrase entirely", DOMAIN).unwrap();
        assert_ne!(a.read_key, b.read_key);
    }

    #[test]
    fn distinct_domains_distinct_keys() {
        let a = derive_identity(PASSPHRASE, "ar.al").unwrap();
        let b = derive_identity(PASSPHRASE, "example.com").unwrap();
        assert_ne!(a.read_key, b.read_key);
    }

    #[test]
    fn read_key_matches_write_key() {
        let id = derive_identity(PASSPHRASE, DOMAIN).unwrap();
        assert_eq!(id.read_key, id.write_key.public_key());
    }

    #[test]
    fn discovery_key_matches_read_key_hash() {
        let id = derive_identity(PASSPHRASE, DOMAIN).unwrap();
        assert_eq!(
            id.discovery_key.as_bytes(),
            id.read_key.discovery_key().as_bytes()
        );
    }

    #[test]
    fn channel_key_reproducible_from_write_key_alone() {
        let id = derive_identity(PASSPHRASE, DOMAIN).unwrap();
        let rederived = channel_key(&id.write_key).unwrap();
        assert_eq!(id.channel_key.as_bytes(), rederived.as_bytes());
    }

    #[test]
    fn channel_key_differs_per_identity() {
        let a = derive_identity(PASSPHRASE, DOMAIN).unwrap();
        let b = derive_identity("another eight word passphrase for testing", DOMAIN).unwrap();
        assert_ne!(a.channel_key.as_bytes(), b.channel_key.as_bytes());
    }

    #[test]
    fn empty_inputs_rejected() {
        assert!(matches!(
            derive_identity("", DOMAIN),
            Err(IdentityError::KeyDerivation(_))
        ));
        assert!(matches!(
            derive_identity(PASSPHRASE, ""),
            Err(IdentityError::KeyDerivation(_))
        ));
    }

    #[test]
    fn local_identity_deterministic_and_distinct() {
        let origin = derive_identity(PASSPHRASE, DOMAIN).unwrap();
        let hex = origin.read_key.to_hex();

        let a = derive_local_identity(&hex, "laptop").unwrap();
        let b = derive_local_identity(&hex, "laptop").unwrap();
        assert_eq!(a.local_read_key, b.local_read_key);

        // A different device gets a different local key; neither is the
        // origin writer key.
        let c = derive_local_identity(&hex, "phone").unwrap();
        assert_ne!(a.local_read_key, c.local_read_key);
        assert_ne!(a.local_read_key, origin.read_key);
    }

    #[test]
    fn local_identity_shares_origin_discovery_key() {
        let origin = derive_identity(PASSPHRASE, DOMAIN).unwrap();
        let local = derive_local_identity(&origin.read_key.to_hex(), "laptop").unwrap();
        assert_eq!(
            local.discovery_key.as_bytes(),
            origin.discovery_key.as_bytes()
        );
    }

    #[test]
    fn local_identity_hex_case_insensitive() {
        let origin = derive_identity(PASSPHRASE, DOMAIN).unwrap();
        let hex = origin.read_key.to_hex();
        let a = derive_local_identity(&hex, "laptop").unwrap();
        let b = derive_local_identity(&hex.to_uppercase(), "laptop").unwrap();
        assert_eq!(a.local_read_key, b.local_read_key);
    }

    #[test]
    fn local_identity_rejects_bad_read_key() {
        assert!(derive_local_identity("not hex at all", "laptop").is_err());
    }
}
