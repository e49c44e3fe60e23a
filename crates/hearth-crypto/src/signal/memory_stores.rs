//! In-memory implementations of the key and session storage traits.
//!
//! Used by tests and by the terminal client. State is lost on exit.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::signal::session::Session;
use crate::signal::store::{KeyIdCounters, PreKeyStore, SessionStore, SignedPreKeyRecord};
use crate::CryptoError;

#[derive(Default)]
pub struct MemoryPreKeyStore {
    identity: Mutex<Option<[u8; 32]>>,
    prekeys: Mutex<BTreeMap<u32, [u8; 32]>>,
    signed_prekeys: Mutex<BTreeMap<u32, SignedPreKeyRecord>>,
    counters: Mutex<Option<KeyIdCounters>>,
}

impl MemoryPreKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreKeyStore for MemoryPreKeyStore {
    fn load_identity(&self) -> Result<Option<[u8; 32]>, CryptoError> {
        Ok(*self.identity.lock())
    }

    fn store_identity(&self, secret: &[u8; 32]) -> Result<(), CryptoError> {
        *self.identity.lock() = Some(*secret);
        Ok(())
    }

    fn load_prekey(&self, key_id: u32) -> Result<Option<[u8; 32]>, CryptoError> {
        Ok(self.prekeys.lock().get(&key_id).copied())
    }

    fn store_prekey(&self, key_id: u32, secret: &[u8; 32]) -> Result<(), CryptoError> {
        self.prekeys.lock().insert(key_id, *secret);
        Ok(())
    }

    fn remove_prekey(&self, key_id: u32) -> Result<(), CryptoError> {
        self.prekeys.lock().remove(&key_id);
        Ok(())
    }

    fn prekey_ids(&self) -> Result<Vec<u32>, CryptoError> {
        Ok(self.prekeys.lock().keys().copied().collect())
    }

    fn load_signed_prekey(&self, key_id: u32) -> Result<Option<SignedPreKeyRecord>, CryptoError> {
        Ok(self.signed_prekeys.lock().get(&key_id).cloned())
    }

    fn store_signed_prekey(&self, record: &SignedPreKeyRecord) -> Result<(), CryptoError> {
        self.signed_prekeys
            .lock()
            .insert(record.key_id, record.clone());
        Ok(())
    }

    fn remove_signed_prekey(&self, key_id: u32) -> Result<(), CryptoError> {
        self.signed_prekeys.lock().remove(&key_id);
        Ok(())
    }

    fn signed_prekey_ids(&self) -> Result<Vec<u32>, CryptoError> {
        Ok(self.signed_prekeys.lock().keys().copied().collect())
    }

    fn load_id_counters(&self) -> Result<Option<KeyIdCounters>, CryptoError> {
        Ok(*self.counters.lock())
    }

    fn store_id_counters(&self, counters: &KeyIdCounters) -> Result<(), CryptoError> {
        *self.counters.lock() = Some(*counters);
        Ok(())
    }
}

/// Session store keyed by peer user id.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load_session(&self, peer: &str) -> Result<Option<Session>, CryptoError> {
        Ok(self.sessions.lock().get(peer).cloned())
    }

    fn store_session(&self, peer: &str, session: &Session) -> Result<(), CryptoError> {
        self.sessions
            .lock()
            .insert(peer.to_string(), session.clone());
        Ok(())
    }

    fn has_session(&self, peer: &str) -> Result<bool, CryptoError> {
        Ok(self.sessions.lock().contains_key(peer))
    }

    fn delete_session(&self, peer: &str) -> Result<(), CryptoError> {
        self.sessions.lock().remove(peer);
        Ok(())
    }

    fn list_sessions(&self) -> Result<Vec<String>, CryptoError> {
        Ok(self.sessions.lock().keys().cloned().collect())
    }
}
