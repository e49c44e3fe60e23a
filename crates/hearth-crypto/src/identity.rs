//! Long-lived identity keys.
//!
//! An identity is a single Ed25519 keypair. It signs pre-keys and, through
//! the Edwards to Montgomery map, doubles as the X25519 key used in the
//! session handshake. Identities are created once and never rotated.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

#[derive(ZeroizeOnDrop)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// Raw secret bytes, for handing to a persistent key store.
    pub fn secret_key_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify `signature` over `message` with an Ed25519 public key given as raw bytes.
    ///
    /// Any malformed key or signature is reported as `InvalidSignature`, so a
    /// tampered bundle can never slip through as a different error class.
    pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let key_bytes: [u8; 32] = public_key
            .try_into()
            .map_err(|_| CryptoError::InvalidSignature("identity key must be 32 bytes".into()))?;
        let verifying_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| CryptoError::InvalidSignature(format!("bad identity key: {e}")))?;
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| CryptoError::InvalidSignature("signature must be 64 bytes".into()))?;
        verifying_key
            .verify(message, &Signature::from_bytes(&sig_bytes))
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))
    }

    /// X25519 secret sharing the Ed25519 scalar, so that
    /// [`Identity::peer_x25519_public`] on our public key yields the matching public key.
    pub fn x25519_secret(&self) -> x25519_dalek::StaticSecret {
        x25519_dalek::StaticSecret::from(self.signing_key.to_scalar_bytes())
    }

    pub fn x25519_public(&self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(&self.x25519_secret())
    }

    /// Convert a peer's Ed25519 public key to X25519 (RFC 7748 birational map).
    pub fn peer_x25519_public(ed25519_public: &[u8]) -> Result<x25519_dalek::PublicKey, CryptoError> {
        let bytes: [u8; 32] = ed25519_public
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("identity key must be 32 bytes".into()))?;
        let verifying_key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid Ed25519 public key: {e}")))?;
        Ok(x25519_dalek::PublicKey::from(
            verifying_key.to_montgomery().to_bytes(),
        ))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let identity = Identity::generate();
        let signature = identity.sign(b"signed pre-key");
        assert!(Identity::verify(&identity.public_key_bytes(), b"signed pre-key", &signature).is_ok());
    }

    #[test]
    fn verify_rejects_other_message() {
        let identity = Identity::generate();
        let signature = identity.sign(b"one");
        let err = Identity::verify(&identity.public_key_bytes(), b"two", &signature).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidSignature(_)));
    }

    #[test]
    fn verify_rejects_short_signature() {
        let identity = Identity::generate();
        let err = Identity::verify(&identity.public_key_bytes(), b"x", &[0u8; 10]).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidSignature(_)));
    }

    #[test]
    fn restored_identity_keeps_public_key() {
        let identity = Identity::generate();
        let restored = Identity::from_secret_bytes(identity.secret_key_bytes());
        assert_eq!(identity.public_key_bytes(), restored.public_key_bytes());
    }

    #[test]
    fn peer_conversion_matches_own_x25519() {
        let identity = Identity::generate();
        let converted = Identity::peer_x25519_public(&identity.public_key_bytes()).unwrap();
        assert_eq!(converted.as_bytes(), identity.x25519_public().as_bytes());
    }

    #[test]
    fn converted_keys_agree() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let bob_pub = Identity::peer_x25519_public(&bob.public_key_bytes()).unwrap();
        let alice_pub = Identity::peer_x25519_public(&alice.public_key_bytes()).unwrap();
        let a = alice.x25519_secret().diffie_hellman(&bob_pub);
        let b = bob.x25519_secret().diffie_hellman(&alice_pub);
        assert_eq!(a.as_bytes(), b.as_bytes());
    }
}
