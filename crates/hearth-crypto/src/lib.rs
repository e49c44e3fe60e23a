pub mod error;
pub mod identity;
pub mod signal;

pub use error::CryptoError;
pub use identity::Identity;
pub use signal::{
    CiphertextFrame, KeyBundleStore, MessageCipher, PreKeyBundle, PreKeyHeader, Session,
    SessionEstablisher,
};

/// Current Unix time in seconds.
pub fn unix_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
