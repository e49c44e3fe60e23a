//! Pre-key generation, bundle publication, and one-time key consumption.
//!
//! The bundle is what a peer downloads from the directory to open a session
//! with us without a round trip. Private halves never leave the
//! [`KeyBundleStore`]; only the public [`PreKeyBundle`] is handed out.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::identity::Identity;
use crate::signal::store::{KeyIdCounters, PreKeyStore, SignedPreKeyRecord};
use crate::{unix_now_secs, CryptoError};

/// Public signed pre-key as published in a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKeyPublic {
    pub key_id: u32,
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
    /// Ed25519 signature over `public_key` by the bundle's identity key.
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

/// Public one-time pre-key as published in a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimePreKeyPublic {
    pub key_id: u32,
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
}

/// The set of public keys a peer needs to start a session with us.
///
/// Serialises to the directory's JSON shape:
/// `{"identityKey": b64, "signedPreKey": {...}, "oneTimePreKeys": [...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyBundle {
    /// Ed25519 identity public key.
    #[serde(with = "base64_bytes")]
    pub identity_key: Vec<u8>,
    pub signed_pre_key: SignedPreKeyPublic,
    #[serde(default)]
    pub one_time_pre_keys: Vec<OneTimePreKeyPublic>,
}

impl PreKeyBundle {
    /// Check the signed pre-key signature against the bundle's identity key.
    pub fn verify(&self) -> Result<(), CryptoError> {
        Identity::verify(
            &self.identity_key,
            &self.signed_pre_key.public_key,
            &self.signed_pre_key.signature,
        )
    }
}

/// Serde adapter encoding byte vectors as standard base64 strings.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Mutable bookkeeping guarded by the store's lock.
struct BundleState {
    identity: Option<Identity>,
    current_signed_id: Option<u32>,
    next_signed_id: u32,
    next_prekey_id: u32,
}

/// Owner of the local identity key, signed pre-keys, and one-time pre-key pool.
///
/// Every operation runs under one mutex, which is what makes
/// [`KeyBundleStore::consume_one_time_key`] single-winner when two inbound
/// handshakes race for the same key.
pub struct KeyBundleStore {
    store: Box<dyn PreKeyStore>,
    state: Mutex<BundleState>,
    /// Seconds a retired signed pre-key remains usable.
    grace_secs: u64,
}

impl KeyBundleStore {
    /// Open a bundle store over a persistence backend.
    ///
    /// Picks up an existing identity and key pool if the backend has one.
    pub fn open(store: Box<dyn PreKeyStore>, grace_secs: u64) -> Result<Self, CryptoError> {
        let identity = store.load_identity()?.map(|s| Identity::from_secret_bytes(&s));

        let signed_ids = store.signed_prekey_ids()?;
        let mut current_signed_id = None;
        for id in &signed_ids {
            if let Some(record) = store.load_signed_prekey(*id)? {
                if record.retired_at.is_none() {
                    current_signed_id = Some(record.key_id);
                }
            }
        }
        // Stored ids only give a floor: a consumed key leaves no trace in the pool.
        let saved = store.load_id_counters()?;
        let next_signed_id = signed_ids
            .last()
            .map_or(1, |id| id + 1)
            .max(saved.map_or(1, |c| c.next_signed_id));
        let next_prekey_id = store
            .prekey_ids()?
            .last()
            .map_or(1, |id| id + 1)
            .max(saved.map_or(1, |c| c.next_prekey_id));

        Ok(Self {
            store,
            state: Mutex::new(BundleState {
                identity,
                current_signed_id,
                next_signed_id,
                next_prekey_id,
            }),
            grace_secs,
        })
    }

    /// Create the identity and signed pre-key if absent, add `one_time_count`
    /// fresh one-time pre-keys, and return the public bundle.
    pub fn generate_bundle(&self, one_time_count: u32) -> Result<PreKeyBundle, CryptoError> {
        let mut state = self.state.lock();
        self.ensure_identity(&mut state)?;
        if state.current_signed_id.is_none() {
            self.create_signed_prekey(&mut state)?;
        }
        for _ in 0..one_time_count {
            self.create_one_time_prekey(&mut state)?;
        }
        tracing::info!(
            one_time_added = one_time_count,
            signed_prekey = ?state.current_signed_id,
            "generated pre-key bundle"
        );
        self.bundle_locked(&state)
    }

    /// The bundle as it currently stands, without generating anything.
    pub fn public_bundle(&self) -> Result<PreKeyBundle, CryptoError> {
        let state = self.state.lock();
        self.bundle_locked(&state)
    }

    /// Remove and return the private half of one-time pre-key `key_id`.
    ///
    /// Fails with `KeyExhausted` if the key is unknown or already consumed.
    pub fn consume_one_time_key(&self, key_id: u32) -> Result<StaticSecret, CryptoError> {
        let _state = self.state.lock();
        let secret = self
            .store
            .load_prekey(key_id)?
            .ok_or_else(|| CryptoError::KeyExhausted(format!("one-time pre-key {key_id}")))?;
        self.store.remove_prekey(key_id)?;
        tracing::debug!(key_id, "consumed one-time pre-key");
        Ok(StaticSecret::from(secret))
    }

    /// Private half of one-time pre-key `key_id`, left in the pool.
    pub fn peek_one_time_key(&self, key_id: u32) -> Result<StaticSecret, CryptoError> {
        let _state = self.state.lock();
        self.store
            .load_prekey(key_id)?
            .map(StaticSecret::from)
            .ok_or_else(|| CryptoError::KeyExhausted(format!("one-time pre-key {key_id}")))
    }

    /// Replace the current signed pre-key with a freshly signed one.
    ///
    /// The previous key is retired, not deleted, so handshakes already in
    /// flight against it still complete during the grace window.
    pub fn rotate_signed_prekey(&self) -> Result<SignedPreKeyPublic, CryptoError> {
        let mut state = self.state.lock();
        self.ensure_identity(&mut state)?;
        let now = unix_now_secs();
        if let Some(old_id) = state.current_signed_id {
            if let Some(mut record) = self.store.load_signed_prekey(old_id)? {
                record.retired_at = Some(now);
                self.store.store_signed_prekey(&record)?;
            }
        }
        let public = self.create_signed_prekey(&mut state)?;
        drop(state);

        self.prune_retired_signed_prekeys(now)?;
        tracing::info!(key_id = public.key_id, "rotated signed pre-key");
        Ok(public)
    }

    /// Delete retired signed pre-keys whose grace window ended before `now`.
    /// Returns how many were removed.
    pub fn prune_retired_signed_prekeys(&self, now: u64) -> Result<usize, CryptoError> {
        let _state = self.state.lock();
        let mut removed = 0;
        for id in self.store.signed_prekey_ids()? {
            let Some(record) = self.store.load_signed_prekey(id)? else {
                continue;
            };
            if let Some(retired_at) = record.retired_at {
                if now.saturating_sub(retired_at) > self.grace_secs {
                    self.store.remove_signed_prekey(id)?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "pruned retired signed pre-keys");
        }
        Ok(removed)
    }

    /// Top the one-time pool back up to `target` when it has fallen below
    /// `low_watermark`. Returns the number of keys generated.
    pub fn replenish(&self, target: u32, low_watermark: u32) -> Result<u32, CryptoError> {
        let mut state = self.state.lock();
        let available = u32::try_from(self.store.prekey_ids()?.len()).unwrap_or(u32::MAX);
        if available >= low_watermark {
            return Ok(0);
        }
        let missing = target.saturating_sub(available);
        for _ in 0..missing {
            self.create_one_time_prekey(&mut state)?;
        }
        tracing::info!(available, added = missing, "replenished one-time pre-keys");
        Ok(missing)
    }

    pub fn one_time_key_count(&self) -> Result<usize, CryptoError> {
        Ok(self.store.prekey_ids()?.len())
    }

    /// Private half of a signed pre-key that is current or still inside its grace window.
    pub fn signed_prekey_secret(&self, key_id: u32) -> Result<StaticSecret, CryptoError> {
        let _state = self.state.lock();
        let record = self
            .store
            .load_signed_prekey(key_id)?
            .ok_or_else(|| CryptoError::InvalidKey(format!("unknown signed pre-key {key_id}")))?;
        if let Some(retired_at) = record.retired_at {
            if unix_now_secs().saturating_sub(retired_at) > self.grace_secs {
                return Err(CryptoError::InvalidKey(format!(
                    "signed pre-key {key_id} expired"
                )));
            }
        }
        Ok(StaticSecret::from(record.secret))
    }

    /// Our identity public key, creating the identity on first use.
    pub fn identity_public_key(&self) -> Result<[u8; 32], CryptoError> {
        let mut state = self.state.lock();
        Ok(self.ensure_identity(&mut state)?.public_key_bytes())
    }

    /// Our identity as an X25519 secret for the handshake.
    pub fn identity_x25519_secret(&self) -> Result<StaticSecret, CryptoError> {
        let mut state = self.state.lock();
        Ok(self.ensure_identity(&mut state)?.x25519_secret())
    }

    fn ensure_identity<'a>(&self, state: &'a mut BundleState) -> Result<&'a Identity, CryptoError> {
        if state.identity.is_none() {
            let identity = Identity::generate();
            self.store.store_identity(identity.secret_key_bytes())?;
            tracing::info!(identity = %identity.public_key_hex(), "created identity key");
            state.identity = Some(identity);
        }
        state
            .identity
            .as_ref()
            .ok_or_else(|| CryptoError::StorageError("identity unavailable".into()))
    }

    fn create_signed_prekey(
        &self,
        state: &mut BundleState,
    ) -> Result<SignedPreKeyPublic, CryptoError> {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = X25519Public::from(&secret);
        let signature = self.ensure_identity(state)?.sign(public.as_bytes()).to_vec();

        let key_id = state.next_signed_id;
        state.next_signed_id += 1;
        self.save_counters(state)?;
        self.store.store_signed_prekey(&SignedPreKeyRecord {
            key_id,
            secret: secret.to_bytes(),
            signature: signature.clone(),
            created_at: unix_now_secs(),
            retired_at: None,
        })?;
        state.current_signed_id = Some(key_id);

        Ok(SignedPreKeyPublic {
            key_id,
            public_key: public.as_bytes().to_vec(),
            signature,
        })
    }

    fn create_one_time_prekey(&self, state: &mut BundleState) -> Result<u32, CryptoError> {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let key_id = state.next_prekey_id;
        state.next_prekey_id += 1;
        self.save_counters(state)?;
        self.store.store_prekey(key_id, &secret.to_bytes())?;
        Ok(key_id)
    }

    /// Written before the key itself, so a crash in between skips an id
    /// rather than reusing one.
    fn save_counters(&self, state: &BundleState) -> Result<(), CryptoError> {
        self.store.store_id_counters(&KeyIdCounters {
            next_prekey_id: state.next_prekey_id,
            next_signed_id: state.next_signed_id,
        })
    }

    fn bundle_locked(&self, state: &BundleState) -> Result<PreKeyBundle, CryptoError> {
        let identity = state
            .identity
            .as_ref()
            .ok_or_else(|| CryptoError::InvalidKey("no identity key generated yet".into()))?;
        let signed_id = state
            .current_signed_id
            .ok_or_else(|| CryptoError::InvalidKey("no signed pre-key generated yet".into()))?;
        let record = self
            .store
            .load_signed_prekey(signed_id)?
            .ok_or_else(|| CryptoError::StorageError(format!("signed pre-key {signed_id} missing")))?;

        let mut one_time_pre_keys = Vec::new();
        for key_id in self.store.prekey_ids()? {
            if let Some(secret) = self.store.load_prekey(key_id)? {
                let public = X25519Public::from(&StaticSecret::from(secret));
                one_time_pre_keys.push(OneTimePreKeyPublic {
                    key_id,
                    public_key: public.as_bytes().to_vec(),
                });
            }
        }

        Ok(PreKeyBundle {
            identity_key: identity.public_key_bytes().to_vec(),
            signed_pre_key: SignedPreKeyPublic {
                key_id: record.key_id,
                public_key: X25519Public::from(&StaticSecret::from(record.secret))
                    .as_bytes()
                    .to_vec(),
                signature: record.signature,
            },
            one_time_pre_keys,
        })
    }
}
