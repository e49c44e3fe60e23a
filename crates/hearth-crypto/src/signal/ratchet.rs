//! Symmetric-key ratchet.
//!
//! Each step derives a message key and the next chain key from the current
//! chain key with HKDF-SHA256, then forgets the old chain key. A message key
//! is therefore never derived twice, and holding the current chain key says
//! nothing about earlier message keys.

use std::collections::BTreeMap;

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::signal::cipher::MessageKey;
use crate::CryptoError;

const MESSAGE_KEY_INFO: &[u8] = b"HearthMessageKey";
const CHAIN_KEY_INFO: &[u8] = b"HearthChainKey";

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct ChainKey {
    key: [u8; 32],
    /// Index of the next message key this chain will produce.
    index: u64,
}

impl ChainKey {
    pub(crate) fn new(key: [u8; 32]) -> Self {
        Self { key, index: 0 }
    }

    pub(crate) fn index(&self) -> u64 {
        self.index
    }

    /// Produce the message key for the current index and advance.
    pub(crate) fn step(&mut self) -> Result<(u64, MessageKey), CryptoError> {
        let hk = Hkdf::<Sha256>::new(None, &self.key);
        let mut message_key = [0u8; 32];
        let mut next_chain_key = [0u8; 32];
        hk.expand(MESSAGE_KEY_INFO, &mut message_key)
            .map_err(|e| CryptoError::SessionError(format!("HKDF: {e}")))?;
        hk.expand(CHAIN_KEY_INFO, &mut next_chain_key)
            .map_err(|e| CryptoError::SessionError(format!("HKDF: {e}")))?;

        self.key.zeroize();
        self.key = next_chain_key;
        let index = self.index;
        self.index += 1;
        Ok((index, MessageKey::new(message_key)))
    }
}

impl Drop for ChainKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Receiving side of a chain, tolerant of reordering within a window.
///
/// Keys for indices jumped over are kept until their message arrives or the
/// store exceeds `max_skip` entries, at which point the oldest are evicted.
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct ReceivingChain {
    chain: ChainKey,
    skipped: BTreeMap<u64, [u8; 32]>,
}

impl ReceivingChain {
    pub(crate) fn new(key: [u8; 32]) -> Self {
        Self {
            chain: ChainKey::new(key),
            skipped: BTreeMap::new(),
        }
    }

    pub(crate) fn next_index(&self) -> u64 {
        self.chain.index()
    }

    pub(crate) fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Message key for `index`, advancing the chain past any gap.
    pub(crate) fn key_for(&mut self, index: u64, max_skip: u64) -> Result<MessageKey, CryptoError> {
        let next = self.chain.index();
        if index < next {
            return self.skipped.remove(&index).map(MessageKey::new).ok_or_else(|| {
                CryptoError::DecryptionFailed(format!(
                    "message index {index} already used or evicted"
                ))
            });
        }
        if index - next > max_skip {
            return Err(CryptoError::DecryptionFailed(format!(
                "message index {index} is {} past the receiving chain, window is {max_skip}",
                index - next
            )));
        }

        while self.chain.index() < index {
            let (skipped_index, key) = self.chain.step()?;
            self.skipped.insert(skipped_index, *key.as_bytes());
        }
        let max_stored = usize::try_from(max_skip).unwrap_or(usize::MAX);
        while self.skipped.len() > max_stored {
            if let Some((_, mut evicted)) = self.skipped.pop_first() {
                evicted.zeroize();
            }
        }

        let (_, key) = self.chain.step()?;
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_never_repeat_keys() {
        let mut chain = ChainKey::new([1u8; 32]);
        let mut seen = std::collections::HashSet::new();
        for expected in 0..50 {
            let (index, key) = chain.step().unwrap();
            assert_eq!(index, expected);
            assert!(seen.insert(*key.as_bytes()));
        }
    }

    #[test]
    fn sender_and_receiver_chains_agree() {
        let mut sending = ChainKey::new([9u8; 32]);
        let mut receiving = ReceivingChain::new([9u8; 32]);
        for _ in 0..5 {
            let (index, key) = sending.step().unwrap();
            assert_eq!(receiving.key_for(index, 10).unwrap().as_bytes(), key.as_bytes());
        }
    }

    #[test]
    fn out_of_order_within_window() {
        let mut sending = ChainKey::new([3u8; 32]);
        let keys: Vec<_> = (0..4).map(|_| sending.step().unwrap().1).collect();
        let mut receiving = ReceivingChain::new([3u8; 32]);

        assert_eq!(receiving.key_for(3, 10).unwrap().as_bytes(), keys[3].as_bytes());
        assert_eq!(receiving.skipped_len(), 3);
        assert_eq!(receiving.key_for(1, 10).unwrap().as_bytes(), keys[1].as_bytes());
        assert_eq!(receiving.key_for(0, 10).unwrap().as_bytes(), keys[0].as_bytes());
        assert_eq!(receiving.key_for(2, 10).unwrap().as_bytes(), keys[2].as_bytes());
        assert_eq!(receiving.skipped_len(), 0);
        assert_eq!(receiving.next_index(), 4);
    }

    #[test]
    fn beyond_window_rejected() {
        let mut receiving = ReceivingChain::new([3u8; 32]);
        assert!(matches!(
            receiving.key_for(11, 10),
            Err(CryptoError::DecryptionFailed(_))
        ));
        assert_eq!(receiving.next_index(), 0);
        assert!(receiving.key_for(10, 10).is_ok());
    }

    #[test]
    fn replayed_index_rejected() {
        let mut receiving = ReceivingChain::new([3u8; 32]);
        receiving.key_for(0, 10).unwrap();
        assert!(receiving.key_for(0, 10).is_err());
    }

    #[test]
    fn skipped_store_bounded() {
        let mut receiving = ReceivingChain::new([3u8; 32]);
        receiving.key_for(4, 4).unwrap();
        receiving.key_for(9, 4).unwrap();
        assert!(receiving.skipped_len() <= 4);
        assert!(receiving.key_for(0, 4).is_err());
    }
}
