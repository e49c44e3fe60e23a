//! The AEAD step of the ratchet, kept behind a trait so the construction
//! can be swapped without touching session lifecycle code.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use chacha20poly1305::ChaCha20Poly1305;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::CryptoError;

/// A single-use 32-byte message key produced by the ratchet.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MessageKey([u8; 32]);

impl MessageKey {
    pub(crate) fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MessageKey(..)")
    }
}

/// Authenticated encryption under a per-message key.
///
/// Every key is used for exactly one message, so implementations may derive
/// the nonce from `index` alone.
pub trait MessageCipher: Send + Sync {
    fn seal(
        &self,
        key: &MessageKey,
        index: u64,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    fn open(
        &self,
        key: &MessageKey,
        index: u64,
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
}

fn nonce_for(index: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&index.to_le_bytes());
    nonce
}

/// AES-256-GCM. The default.
#[derive(Debug, Default, Clone, Copy)]
pub struct Aes256GcmCipher;

impl MessageCipher for Aes256GcmCipher {
    fn seal(
        &self,
        key: &MessageKey,
        index: u64,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
        let nonce = nonce_for(index);
        cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))
    }

    fn open(
        &self,
        key: &MessageKey,
        index: u64,
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
        let nonce = nonce_for(index);
        cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| CryptoError::DecryptionFailed("authentication tag mismatch".into()))
    }
}

/// ChaCha20-Poly1305, for platforms without AES acceleration.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChaCha20Poly1305Cipher;

impl MessageCipher for ChaCha20Poly1305Cipher {
    fn seal(
        &self,
        key: &MessageKey,
        index: u64,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
        let nonce = nonce_for(index);
        cipher
            .encrypt(
                chacha20poly1305::Nonce::from_slice(&nonce),
                Payload { msg: plaintext, aad },
            )
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))
    }

    fn open(
        &self,
        key: &MessageKey,
        index: u64,
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
        let nonce = nonce_for(index);
        cipher
            .decrypt(
                chacha20poly1305::Nonce::from_slice(&nonce),
                Payload { msg: ciphertext, aad },
            )
            .map_err(|_| CryptoError::DecryptionFailed("authentication tag mismatch".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(cipher: &dyn MessageCipher) {
        let key = MessageKey::new([7u8; 32]);
        let sealed = cipher.seal(&key, 3, b"hello", b"header").unwrap();
        assert_eq!(cipher.open(&key, 3, &sealed, b"header").unwrap(), b"hello");
        assert!(cipher.open(&key, 4, &sealed, b"header").is_err());
        assert!(cipher.open(&key, 3, &sealed, b"other").is_err());

        let wrong = MessageKey::new([8u8; 32]);
        assert!(matches!(
            cipher.open(&wrong, 3, &sealed, b"header"),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn aes_gcm_binds_key_index_and_aad() {
        check(&Aes256GcmCipher);
    }

    #[test]
    fn chacha_binds_key_index_and_aad() {
        check(&ChaCha20Poly1305Cipher);
    }
}
