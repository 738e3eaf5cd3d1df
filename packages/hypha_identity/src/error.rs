//! Error types for identity derivation.

#[derive(Debug, Clone, thiserror::Error)]
pub enum IdentityError {
    /// The KDF rejected its input. Fatal to identity creation; callers must
    /// not proceed to create a session.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// A key could not be parsed from its wire/display encoding.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A signature did not verify.
    #[error("invalid signature")]
    InvalidSignature,

    /// A passphrase failed the sign-in validation rule.
    #[error("passphrase rejected: {0}")]
    WeakPassphrase(String),
}
