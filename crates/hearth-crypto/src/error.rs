use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// The signed pre-key signature did not verify against the bundle's identity key.
    /// Callers must refresh the peer's bundle; this is never retried automatically.
    #[error("invalid signed pre-key signature: {0}")]
    InvalidSignature(String),

    /// The requested one-time pre-key is absent or was already consumed.
    #[error("one-time pre-key exhausted: {0}")]
    KeyExhausted(String),

    /// MAC mismatch, replay, or a message index outside the skip window.
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("session error: {0}")]
    SessionError(String),

    #[error("key storage error: {0}")]
    StorageError(String),
}
