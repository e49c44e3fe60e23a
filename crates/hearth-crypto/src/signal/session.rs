//! Session lifecycle: the X3DH-style handshake on both sides, then
//! per-message encryption over the symmetric ratchet.
//!
//! The initiator builds a session from a peer's published bundle and attaches
//! a [`PreKeyHeader`] to its frames until the peer answers. The responder
//! derives the mirror session from that header on the first frame that
//! authenticates under it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use hkdf::Hkdf;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::identity::Identity;
use crate::signal::cipher::{Aes256GcmCipher, MessageCipher};
use crate::signal::prekeys::{base64_bytes, KeyBundleStore, PreKeyBundle};
use crate::signal::ratchet::{ChainKey, ReceivingChain};
use crate::signal::store::SessionStore;
use crate::{unix_now_secs, CryptoError};

const X3DH_INFO: &[u8] = b"HearthX3DH";

/// Handshake material the initiator attaches to its frames until the peer
/// answers, so the recipient can derive the same session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyHeader {
    /// Initiator's Ed25519 identity key.
    #[serde(with = "base64_bytes")]
    pub identity_key: Vec<u8>,
    /// Initiator's ephemeral X25519 key. Identifies the handshake.
    #[serde(with = "base64_bytes")]
    pub base_key: Vec<u8>,
    pub signed_pre_key_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_pre_key_id: Option<u32>,
}

/// One encrypted message as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CiphertextFrame {
    /// Position in the sender's chain. Monotonic per session.
    pub index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prekey: Option<PreKeyHeader>,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

/// A responder session derived from a handshake header, not yet stored.
struct Candidate {
    session: Session,
    one_time_pre_key_id: Option<u32>,
    identity_changed: bool,
}

/// Shared ratchet state between the local user and one peer.
#[derive(Clone, Serialize, Deserialize)]
pub struct Session {
    local_id: String,
    peer_id: String,
    local_identity_key: Vec<u8>,
    peer_identity_key: Vec<u8>,
    base_key: Vec<u8>,
    sending: ChainKey,
    receiving: ReceivingChain,
    pending_prekey: Option<PreKeyHeader>,
    degraded: bool,
    created_at: u64,
}

impl Session {
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn peer_identity_key(&self) -> &[u8] {
        &self.peer_identity_key
    }

    /// True when the handshake ran without a one-time pre-key.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Index the next outbound message will carry.
    pub fn send_index(&self) -> u64 {
        self.sending.index()
    }

    /// Lowest inbound index not yet received in order.
    pub fn receive_index(&self) -> u64 {
        self.receiving.next_index()
    }

    /// Initiator's ephemeral key. Distinguishes successive sessions with
    /// the same peer.
    pub fn base_key(&self) -> &[u8] {
        &self.base_key
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Whether frames still carry the handshake header (no reply seen yet).
    pub fn awaiting_reply(&self) -> bool {
        self.pending_prekey.is_some()
    }

    fn outbound_aad(&self) -> Vec<u8> {
        [self.local_identity_key.as_slice(), self.peer_identity_key.as_slice()].concat()
    }

    fn inbound_aad(&self) -> Vec<u8> {
        [self.peer_identity_key.as_slice(), self.local_identity_key.as_slice()].concat()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("local_id", &self.local_id)
            .field("peer_id", &self.peer_id)
            .field("peer_identity_key", &hex::encode(&self.peer_identity_key))
            .field("send_index", &self.sending.index())
            .field("receive_index", &self.receiving.next_index())
            .field("degraded", &self.degraded)
            .finish_non_exhaustive()
    }
}

/// Creates, stores and drives sessions for the local user.
///
/// Initiator side: [`SessionEstablisher::establish`] with a peer's published
/// bundle. Responder side: [`SessionEstablisher::decrypt`] accepts the
/// handshake header on the first inbound frame.
pub struct SessionEstablisher {
    local_id: String,
    keys: Arc<KeyBundleStore>,
    sessions: Box<dyn SessionStore>,
    cipher: Box<dyn MessageCipher>,
    max_skip: u64,
    /// One-time key ids already taken from each peer's bundles.
    claimed: Mutex<HashMap<String, HashSet<u32>>>,
    /// Serialises load/modify/store on the session store.
    session_lock: Mutex<()>,
}

impl SessionEstablisher {
    pub fn new(
        local_id: impl Into<String>,
        keys: Arc<KeyBundleStore>,
        sessions: Box<dyn SessionStore>,
        max_skip: u64,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            keys,
            sessions,
            cipher: Box::new(Aes256GcmCipher),
            max_skip,
            claimed: Mutex::new(HashMap::new()),
            session_lock: Mutex::new(()),
        }
    }

    /// Replace the AEAD used for message bodies.
    #[must_use]
    pub fn with_cipher(mut self, cipher: Box<dyn MessageCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn keys(&self) -> &Arc<KeyBundleStore> {
        &self.keys
    }

    /// Open a session with `peer` from their published bundle.
    ///
    /// The signed pre-key signature is checked before anything else; on
    /// failure no session is created. One unclaimed one-time key is taken
    /// from the bundle. A bundle with no one-time keys gives a degraded
    /// session; a bundle whose keys are all claimed fails with `KeyExhausted`.
    pub fn establish(&self, peer: &str, bundle: &PreKeyBundle) -> Result<Session, CryptoError> {
        bundle.verify().inspect_err(|e| {
            tracing::warn!(peer, error = %e, "rejecting bundle with bad signature");
        })?;

        let their_identity = Identity::peer_x25519_public(&bundle.identity_key)?;
        let their_signed_prekey = x25519_public(&bundle.signed_pre_key.public_key, "signed pre-key")?;

        let one_time = self.claim_one_time_key(peer, bundle)?;
        let degraded = one_time.is_none();
        if degraded {
            tracing::warn!(peer, "bundle has no one-time pre-keys; session is degraded");
        }

        let our_identity = self.keys.identity_x25519_secret()?;
        let local_identity_key = self.keys.identity_public_key()?.to_vec();
        let ephemeral = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let base_key = X25519Public::from(&ephemeral).as_bytes().to_vec();

        let mut ikm = Vec::with_capacity(128);
        ikm.extend_from_slice(our_identity.diffie_hellman(&their_signed_prekey).as_bytes());
        ikm.extend_from_slice(ephemeral.diffie_hellman(&their_identity).as_bytes());
        ikm.extend_from_slice(ephemeral.diffie_hellman(&their_signed_prekey).as_bytes());
        let mut one_time_pre_key_id = None;
        if let Some((key_id, public)) = one_time {
            ikm.extend_from_slice(ephemeral.diffie_hellman(&public).as_bytes());
            one_time_pre_key_id = Some(key_id);
        }
        let (first, second) = derive_chains(&ikm)?;

        let session = Session {
            local_id: self.local_id.clone(),
            peer_id: peer.to_string(),
            local_identity_key: local_identity_key.clone(),
            peer_identity_key: bundle.identity_key.clone(),
            base_key: base_key.clone(),
            sending: ChainKey::new(first),
            receiving: ReceivingChain::new(second),
            pending_prekey: Some(PreKeyHeader {
                identity_key: local_identity_key,
                base_key,
                signed_pre_key_id: bundle.signed_pre_key.key_id,
                one_time_pre_key_id,
            }),
            degraded,
            created_at: unix_now_secs(),
        };

        let _guard = self.session_lock.lock();
        if self.sessions.has_session(peer)? {
            tracing::debug!(peer, "replacing existing session");
        }
        self.sessions.store_session(peer, &session)?;
        tracing::info!(peer, one_time_pre_key = ?one_time_pre_key_id, "session established");
        Ok(session)
    }

    /// Derive the responder side of a session from a handshake header.
    ///
    /// Nothing is stored or consumed here; [`SessionEstablisher::decrypt`]
    /// commits the candidate once a frame opens under it. `None` means the
    /// header belongs to the session already held.
    fn inbound_candidate(
        &self,
        peer: &str,
        header: &PreKeyHeader,
        existing: Option<&Session>,
    ) -> Result<Option<Candidate>, CryptoError> {
        let mut identity_changed = false;
        if let Some(existing) = existing {
            if existing.base_key == header.base_key {
                return Ok(None);
            }
            if existing.peer_identity_key != header.identity_key {
                identity_changed = true;
            } else if existing.pending_prekey.is_some() && existing.base_key < header.base_key {
                // Both sides initiated at once. The lower base key wins on both ends.
                return Err(CryptoError::SessionError(
                    "concurrent handshake superseded by ours".into(),
                ));
            }
        }

        let their_identity = Identity::peer_x25519_public(&header.identity_key)?;
        let their_base = x25519_public(&header.base_key, "base key")?;
        let signed_prekey = self.keys.signed_prekey_secret(header.signed_pre_key_id)?;
        let one_time = header
            .one_time_pre_key_id
            .map(|id| self.keys.peek_one_time_key(id))
            .transpose()?;
        let our_identity = self.keys.identity_x25519_secret()?;

        let mut ikm = Vec::with_capacity(128);
        ikm.extend_from_slice(signed_prekey.diffie_hellman(&their_identity).as_bytes());
        ikm.extend_from_slice(our_identity.diffie_hellman(&their_base).as_bytes());
        ikm.extend_from_slice(signed_prekey.diffie_hellman(&their_base).as_bytes());
        if let Some(ref secret) = one_time {
            ikm.extend_from_slice(secret.diffie_hellman(&their_base).as_bytes());
        }
        let (first, second) = derive_chains(&ikm)?;

        // Responder swaps the chains relative to the initiator.
        let session = Session {
            local_id: self.local_id.clone(),
            peer_id: peer.to_string(),
            local_identity_key: self.keys.identity_public_key()?.to_vec(),
            peer_identity_key: header.identity_key.clone(),
            base_key: header.base_key.clone(),
            sending: ChainKey::new(second),
            receiving: ReceivingChain::new(first),
            pending_prekey: None,
            degraded: one_time.is_none(),
            created_at: unix_now_secs(),
        };
        Ok(Some(Candidate {
            session,
            one_time_pre_key_id: header.one_time_pre_key_id,
            identity_changed,
        }))
    }

    /// Encrypt `plaintext` for `peer` under a fresh message key.
    pub fn encrypt(&self, peer: &str, plaintext: &[u8]) -> Result<CiphertextFrame, CryptoError> {
        let _guard = self.session_lock.lock();
        let mut session = self
            .sessions
            .load_session(peer)?
            .ok_or_else(|| CryptoError::SessionError(format!("no session with {peer}")))?;

        let (index, key) = session.sending.step()?;
        let ciphertext = self
            .cipher
            .seal(&key, index, plaintext, &session.outbound_aad())?;
        let frame = CiphertextFrame {
            index,
            prekey: session.pending_prekey.clone(),
            ciphertext,
        };
        self.sessions.store_session(peer, &session)?;
        tracing::trace!(peer, index, "encrypted frame");
        Ok(frame)
    }

    /// Decrypt a frame from `peer`, accepting its handshake header if present.
    ///
    /// State is only committed when the body authenticates. A corrupted or
    /// forged frame leaves the receiving chain, the stored session and the
    /// one-time key pool untouched. A header for a new handshake replaces
    /// the stored session only once its frame opens.
    pub fn decrypt(&self, peer: &str, frame: &CiphertextFrame) -> Result<Vec<u8>, CryptoError> {
        let _guard = self.session_lock.lock();
        let stored = self.sessions.load_session(peer)?;
        let candidate = match &frame.prekey {
            Some(header) => self.inbound_candidate(peer, header, stored.as_ref())?,
            None => None,
        };

        let (mut session, accepted) = match candidate {
            Some(candidate) => (
                candidate.session,
                Some((candidate.one_time_pre_key_id, candidate.identity_changed)),
            ),
            None => (
                stored.ok_or_else(|| CryptoError::DecryptionFailed(format!("no session with {peer}")))?,
                None,
            ),
        };
        let key = session.receiving.key_for(frame.index, self.max_skip)?;
        let plaintext = self
            .cipher
            .open(&key, frame.index, &frame.ciphertext, &session.inbound_aad())?;

        if let Some((one_time_pre_key_id, identity_changed)) = accepted {
            if let Some(key_id) = one_time_pre_key_id {
                self.keys.consume_one_time_key(key_id)?;
            }
            if identity_changed {
                tracing::warn!(peer, "peer identity key changed; replacing session");
            }
            tracing::info!(peer, one_time_pre_key = ?one_time_pre_key_id, "accepted inbound session");
        }
        if frame.prekey.is_none() && session.pending_prekey.take().is_some() {
            tracing::debug!(peer, "peer replied; dropping handshake header");
        }
        self.sessions.store_session(peer, &session)?;
        tracing::trace!(peer, index = frame.index, "decrypted frame");
        Ok(plaintext)
    }

    /// Destroy the session with `peer`. The next send re-establishes.
    pub fn reset(&self, peer: &str) -> Result<(), CryptoError> {
        let _guard = self.session_lock.lock();
        self.sessions.delete_session(peer)?;
        self.claimed.lock().remove(peer);
        tracing::info!(peer, "session reset");
        Ok(())
    }

    pub fn has_session(&self, peer: &str) -> Result<bool, CryptoError> {
        self.sessions.has_session(peer)
    }

    pub fn session(&self, peer: &str) -> Result<Option<Session>, CryptoError> {
        self.sessions.load_session(peer)
    }

    fn claim_one_time_key(
        &self,
        peer: &str,
        bundle: &PreKeyBundle,
    ) -> Result<Option<(u32, X25519Public)>, CryptoError> {
        if bundle.one_time_pre_keys.is_empty() {
            return Ok(None);
        }
        let mut claimed = self.claimed.lock();
        let taken = claimed.entry(peer.to_string()).or_default();
        // Claims on keys no longer published are moot.
        taken.retain(|id| bundle.one_time_pre_keys.iter().any(|k| k.key_id == *id));
        let candidate = bundle
            .one_time_pre_keys
            .iter()
            .find(|k| !taken.contains(&k.key_id))
            .ok_or_else(|| {
                CryptoError::KeyExhausted(format!("every one-time pre-key for {peer} is claimed"))
            })?;
        let public = x25519_public(&candidate.public_key, "one-time pre-key")?;
        taken.insert(candidate.key_id);
        Ok(Some((candidate.key_id, public)))
    }
}

fn x25519_public(bytes: &[u8], what: &str) -> Result<X25519Public, CryptoError> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("{what} must be 32 bytes")))?;
    Ok(X25519Public::from(array))
}

/// Expand the handshake secret into the initiator's sending and receiving chain keys.
fn derive_chains(ikm: &[u8]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; 64];
    hk.expand(X3DH_INFO, &mut okm)
        .map_err(|e| CryptoError::SessionError(format!("HKDF expand failed: {e}")))?;
    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&okm[..32]);
    second.copy_from_slice(&okm[32..]);
    Ok((first, second))
}
