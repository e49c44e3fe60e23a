use serde::{Deserialize, Serialize};

use crate::signal::session::Session;
use crate::CryptoError;

/// A signed pre-key's private half plus the metadata needed for rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    pub key_id: u32,
    pub secret: [u8; 32],
    pub signature: Vec<u8>,
    pub created_at: u64,
    /// Set when a newer signed pre-key replaced this one. The key stays
    /// usable for inbound handshakes until the grace window elapses.
    pub retired_at: Option<u64>,
}

/// Next ids to hand out. Persisted so that an id is never issued twice,
/// even after the key that carried it has been consumed and removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyIdCounters {
    pub next_prekey_id: u32,
    pub next_signed_id: u32,
}

/// Persistence backend for the local identity and pre-keys.
///
/// Only private halves live here; the public bundle is derived on demand.
/// Implementations need not be atomic across calls: `KeyBundleStore`
/// serialises every read-modify-write sequence.
pub trait PreKeyStore: Send + Sync {
    fn load_identity(&self) -> Result<Option<[u8; 32]>, CryptoError>;

    fn store_identity(&self, secret: &[u8; 32]) -> Result<(), CryptoError>;

    /// Load a one-time pre-key secret by id.
    fn load_prekey(&self, key_id: u32) -> Result<Option<[u8; 32]>, CryptoError>;

    fn store_prekey(&self, key_id: u32, secret: &[u8; 32]) -> Result<(), CryptoError>;

    /// Remove a consumed one-time pre-key.
    fn remove_prekey(&self, key_id: u32) -> Result<(), CryptoError>;

    /// Ids of every one-time pre-key still in the pool, ascending.
    fn prekey_ids(&self) -> Result<Vec<u32>, CryptoError>;

    fn load_signed_prekey(&self, key_id: u32) -> Result<Option<SignedPreKeyRecord>, CryptoError>;

    fn store_signed_prekey(&self, record: &SignedPreKeyRecord) -> Result<(), CryptoError>;

    fn remove_signed_prekey(&self, key_id: u32) -> Result<(), CryptoError>;

    /// Ids of every stored signed pre-key (current and retired), ascending.
    fn signed_prekey_ids(&self) -> Result<Vec<u32>, CryptoError>;

    fn load_id_counters(&self) -> Result<Option<KeyIdCounters>, CryptoError>;

    fn store_id_counters(&self, counters: &KeyIdCounters) -> Result<(), CryptoError>;
}

/// Storage for established sessions, one per peer.
pub trait SessionStore: Send + Sync {
    fn load_session(&self, peer: &str) -> Result<Option<Session>, CryptoError>;

    fn store_session(&self, peer: &str, session: &Session) -> Result<(), CryptoError>;

    fn has_session(&self, peer: &str) -> Result<bool, CryptoError>;

    fn delete_session(&self, peer: &str) -> Result<(), CryptoError>;

    fn list_sessions(&self) -> Result<Vec<String>, CryptoError>;
}
