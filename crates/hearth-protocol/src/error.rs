use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The connection dropped or could not be opened. Recoverable: the
    /// transport schedules a reconnect with backoff.
    #[error("transport dropped: {0}")]
    TransportDropped(String),

    /// Every reconnect attempt failed. The transport stays down until the
    /// application calls `initialize()` again.
    #[error("reconnect exhausted after {0} attempts")]
    ReconnectExhausted(u32),

    /// The transport's event loop has shut down.
    #[error("transport closed")]
    Closed,

    #[error("directory request failed: {0}")]
    Directory(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] hearth_crypto::CryptoError),
}
