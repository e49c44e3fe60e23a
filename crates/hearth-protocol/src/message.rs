use rand::RngCore;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    File,
}

/// A chat message as seen by the application.
///
/// Everything except the delivery and read flags is fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    /// Plaintext once decrypted; never the ciphertext on this type.
    pub content: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub chat_id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Sender's wall clock, milliseconds. Display only, not used for ordering.
    pub created_at: u64,
    pub is_encrypted: bool,
    pub is_read: bool,
    pub is_delivered: bool,
    /// Sender's ratchet index, the ordering key within a chat.
    pub sequence: u64,
}

/// Chat id for a one-to-one conversation. Symmetric in its arguments.
pub fn direct_chat_id(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

/// Random 128-bit message id, hex encoded.
pub fn new_message_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn timestamp_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_id_is_symmetric() {
        assert_eq!(direct_chat_id("alice", "bob"), direct_chat_id("bob", "alice"));
        assert_ne!(direct_chat_id("alice", "bob"), direct_chat_id("alice", "carol"));
    }

    #[test]
    fn message_ids_are_unique() {
        let a = new_message_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, new_message_id());
    }

    #[test]
    fn message_type_serialises_lowercase() {
        assert_eq!(serde_json::to_string(&MessageType::Image).unwrap(), "\"image\"");
    }
}
