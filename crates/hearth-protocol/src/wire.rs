//! Events exchanged with the relay server over the WebSocket.
//!
//! Every WebSocket text frame carries one JSON object of the form
//! `{"event": "<name>", "data": {...}}`.

use hearth_crypto::CiphertextFrame;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::message::MessageType;

/// An encrypted chat message in transit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFrame {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub chat_id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub created_at: u64,
    pub payload: CiphertextFrame,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum WireEvent {
    /// Sent by the client right after the socket opens.
    #[serde(rename_all = "camelCase")]
    Connect { user_id: String },
    /// Graceful close by the client.
    Disconnect,
    MessageSend(MessageFrame),
    /// A peer came online.
    #[serde(rename_all = "camelCase")]
    NewConnection { user_id: String },
    /// A peer went offline.
    #[serde(rename_all = "camelCase")]
    NewDisconnection { user_id: String },
    /// Recipient confirms it decrypted and delivered `message_id`. Routed
    /// to `sender_id`, the author of the message.
    #[serde(rename_all = "camelCase")]
    MessageDelivered {
        message_id: String,
        sender_id: String,
        recipient_id: String,
    },
    /// Recipient has displayed `message_id`.
    #[serde(rename_all = "camelCase")]
    MessageRead {
        message_id: String,
        sender_id: String,
        recipient_id: String,
    },
    /// Heartbeat ping. Never surfaced to the application.
    Ping { nonce: u64 },
    Pong { nonce: u64 },
}

impl WireEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Disconnect => "disconnect",
            Self::MessageSend(_) => "message-send",
            Self::NewConnection { .. } => "new-connection",
            Self::NewDisconnection { .. } => "new-disconnection",
            Self::MessageDelivered { .. } => "message-delivered",
            Self::MessageRead { .. } => "message-read",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_events_use_kebab_names() {
        let json = WireEvent::NewConnection {
            user_id: "bob".into(),
        }
        .encode()
        .unwrap();
        assert_eq!(json, r#"{"event":"new-connection","data":{"userId":"bob"}}"#);
    }

    #[test]
    fn disconnect_has_no_data() {
        let event = WireEvent::decode(r#"{"event":"disconnect"}"#).unwrap();
        assert_eq!(event, WireEvent::Disconnect);
    }

    #[test]
    fn message_frame_decodes() {
        let text = r#"{"event":"message-send","data":{
            "id":"m1","senderId":"alice","recipientId":"bob","chatId":"alice:bob",
            "type":"text","createdAt":5,
            "payload":{"index":2,"ciphertext":"AAEC"}}}"#;
        let WireEvent::MessageSend(frame) = WireEvent::decode(text).unwrap() else {
            panic!("expected message-send");
        };
        assert_eq!(frame.payload.index, 2);
        assert_eq!(frame.payload.ciphertext, vec![0, 1, 2]);
        assert!(frame.payload.prekey.is_none());
    }

    #[test]
    fn receipts_name_both_ends() {
        let json = WireEvent::MessageRead {
            message_id: "m1".into(),
            sender_id: "alice".into(),
            recipient_id: "bob".into(),
        }
        .encode()
        .unwrap();
        assert_eq!(
            json,
            r#"{"event":"message-read","data":{"messageId":"m1","senderId":"alice","recipientId":"bob"}}"#
        );
    }

    #[test]
    fn unknown_event_is_an_error() {
        assert!(matches!(
            WireEvent::decode(r#"{"event":"bogus"}"#),
            Err(ProtocolError::Deserialization(_))
        ));
    }
}
