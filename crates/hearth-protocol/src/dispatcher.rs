//! Outbound encryption and queueing, inbound decryption, ordering and fan-out.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use hearth_crypto::SessionEstablisher;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::directory::Directory;
use crate::error::ProtocolError;
use crate::message::{direct_chat_id, new_message_id, timestamp_now_ms, Message, MessageType};
use crate::sequencer::{Sequenced, Sequencer};
use crate::transport::{SendOutcome, TransportManager};
use crate::wire::{MessageFrame, WireEvent};

/// Outbound messages remembered for receipts.
const SENT_LIMIT: usize = 1024;

/// An inbound message that could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryFailure {
    pub message_id: String,
    pub sender_id: String,
    pub reason: String,
}

/// Receives messages from the dispatcher.
///
/// Callbacks run on the client's dispatch loop, one at a time, in
/// registration order. They must not block.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, message: &Message);

    fn on_delivery_failed(&self, _failure: &DeliveryFailure) {}

    /// The recipient confirmed one of our messages.
    fn on_delivered(&self, _message_id: &str, _recipient_id: &str) {}

    fn on_read(&self, _message_id: &str, _recipient_id: &str) {}
}

type OutboundQueue = Arc<tokio::sync::Mutex<VecDeque<WireEvent>>>;

pub struct MessageDispatcher {
    local_id: String,
    establisher: Arc<SessionEstablisher>,
    directory: Arc<dyn Directory>,
    transport: TransportManager,
    listeners: RwLock<Vec<Arc<dyn MessageListener>>>,
    /// One FIFO per recipient. Holding its lock is what keeps a flush from
    /// interleaving with new sends to the same recipient.
    queues: Mutex<HashMap<String, OutboundQueue>>,
    sequencer: Mutex<Sequencer>,
    sent: Mutex<SentLog>,
}

#[derive(Default)]
struct SentLog {
    order: VecDeque<String>,
    messages: HashMap<String, Message>,
}

impl SentLog {
    fn insert(&mut self, message: Message) {
        if self.order.len() == SENT_LIMIT {
            if let Some(oldest) = self.order.pop_front() {
                self.messages.remove(&oldest);
            }
        }
        self.order.push_back(message.id.clone());
        self.messages.insert(message.id.clone(), message);
    }
}

impl MessageDispatcher {
    pub fn new(
        establisher: Arc<SessionEstablisher>,
        directory: Arc<dyn Directory>,
        transport: TransportManager,
        max_pending: usize,
    ) -> Self {
        Self {
            local_id: establisher.local_id().to_string(),
            establisher,
            directory,
            transport,
            listeners: RwLock::new(Vec::new()),
            queues: Mutex::new(HashMap::new()),
            sequencer: Mutex::new(Sequencer::new(max_pending)),
            sent: Mutex::new(SentLog::default()),
        }
    }

    /// Register a listener. Registering the same `Arc` twice is a no-op;
    /// returns whether it was added.
    pub fn add_listener(&self, listener: Arc<dyn MessageListener>) -> bool {
        let mut listeners = self.listeners.write();
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Removing a listener that isn't registered is a no-op.
    pub fn remove_listener(&self, listener: &Arc<dyn MessageListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Encrypt and send a text message to `recipient_id`.
    pub async fn send(&self, content: &str, recipient_id: &str) -> Result<Message, ProtocolError> {
        self.send_typed(content, recipient_id, MessageType::Text).await
    }

    /// Encrypt and send. Establishes a session from the directory on first
    /// contact. While the transport is down the encrypted frame is queued
    /// and goes out, in order, after the next connect.
    pub async fn send_typed(
        &self,
        content: &str,
        recipient_id: &str,
        message_type: MessageType,
    ) -> Result<Message, ProtocolError> {
        // The directory call stays outside the queue lock so a slow fetch
        // never holds up a flush.
        if !self.establisher.has_session(recipient_id)? {
            let bundle = self.directory.fetch_bundle(recipient_id).await?;
            if !self.establisher.has_session(recipient_id)? {
                self.establisher.establish(recipient_id, &bundle)?;
            }
        }

        // Encrypting under the lock keeps ratchet order equal to queue order.
        let queue = self.queue_for(recipient_id);
        let mut queue = queue.lock().await;
        let payload = self.establisher.encrypt(recipient_id, content.as_bytes())?;

        let message = Message {
            id: new_message_id(),
            content: content.to_string(),
            sender_id: self.local_id.clone(),
            recipient_id: recipient_id.to_string(),
            chat_id: direct_chat_id(&self.local_id, recipient_id),
            message_type,
            created_at: timestamp_now_ms(),
            is_encrypted: true,
            is_read: false,
            is_delivered: false,
            sequence: payload.index,
        };
        let frame = WireEvent::MessageSend(MessageFrame {
            id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            recipient_id: message.recipient_id.clone(),
            chat_id: message.chat_id.clone(),
            message_type,
            created_at: message.created_at,
            payload,
        });
        self.sent.lock().insert(message.clone());

        queue.push_back(frame);
        let remaining = self.drain(&mut queue).await?;
        if remaining > 0 {
            tracing::debug!(recipient = recipient_id, queued = remaining, "transport down; message queued");
        }
        Ok(message)
    }

    /// Send everything queued, recipient by recipient, in send order.
    pub async fn flush(&self) -> Result<(), ProtocolError> {
        let queues: Vec<(String, OutboundQueue)> = self
            .queues
            .lock()
            .iter()
            .map(|(recipient, queue)| (recipient.clone(), Arc::clone(queue)))
            .collect();

        for (recipient, queue) in queues {
            let mut queue = queue.lock().await;
            if queue.is_empty() {
                continue;
            }
            let before = queue.len();
            let remaining = self.drain(&mut queue).await?;
            tracing::info!(recipient = %recipient, sent = before - remaining, remaining, "flushed outbound queue");
            if remaining > 0 {
                break;
            }
        }
        Ok(())
    }

    /// Frames waiting for `recipient_id`.
    pub async fn queued(&self, recipient_id: &str) -> usize {
        let queue = self.queues.lock().get(recipient_id).cloned();
        match queue {
            Some(queue) => queue.lock().await.len(),
            None => 0,
        }
    }

    /// Decrypt, order and deliver one inbound frame. Returns the messages
    /// released to listeners, which may be none (waiting behind a gap) or
    /// several (the frame filled a gap).
    ///
    /// Failures concern this frame only; they are reported to listeners
    /// and never returned.
    pub async fn on_frame_received(&self, frame: MessageFrame) -> Vec<Message> {
        if frame.recipient_id != self.local_id {
            tracing::warn!(message = %frame.id, recipient = %frame.recipient_id, "frame not addressed to us");
            self.fail(&frame, "not addressed to this user".into());
            return Vec::new();
        }

        let plaintext = match self.establisher.decrypt(&frame.sender_id, &frame.payload) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                tracing::warn!(message = %frame.id, sender = %frame.sender_id, error = %e, "dropping undecryptable frame");
                self.fail(&frame, e.to_string());
                return self.pass_over(&frame).await;
            }
        };
        let content = match String::from_utf8(plaintext) {
            Ok(content) => content,
            Err(_) => {
                self.fail(&frame, "message body is not UTF-8".into());
                return self.pass_over(&frame).await;
            }
        };
        let epoch = match self.establisher.session(&frame.sender_id) {
            Ok(Some(session)) => session.base_key().to_vec(),
            Ok(None) | Err(_) => Vec::new(),
        };

        let message = Message {
            id: frame.id,
            content,
            sender_id: frame.sender_id,
            recipient_id: frame.recipient_id,
            chat_id: frame.chat_id,
            message_type: frame.message_type,
            created_at: frame.created_at,
            is_encrypted: true,
            is_read: false,
            is_delivered: false,
            sequence: frame.payload.index,
        };

        let sequenced = self.sequencer.lock().push(&epoch, message);
        let ready = match sequenced {
            Sequenced::Deliver(ready) => ready,
            Sequenced::Late(message) => {
                self.notify_failure(&DeliveryFailure {
                    message_id: message.id,
                    sender_id: message.sender_id,
                    reason: "arrived after its place in the conversation was skipped".into(),
                });
                return Vec::new();
            }
        };

        self.deliver(ready).await
    }

    /// Let the conversation move past a frame that will never be delivered.
    ///
    /// Only a frame of the sender's current session counts; one naming some
    /// other handshake says nothing about this stream's counters.
    async fn pass_over(&self, frame: &MessageFrame) -> Vec<Message> {
        let epoch = match self.establisher.session(&frame.sender_id) {
            Ok(Some(session)) => session.base_key().to_vec(),
            Ok(None) | Err(_) => return Vec::new(),
        };
        if frame
            .payload
            .prekey
            .as_ref()
            .is_some_and(|header| header.base_key != epoch)
        {
            return Vec::new();
        }
        let ready = self.sequencer.lock().skip(
            &epoch,
            &frame.chat_id,
            &frame.sender_id,
            frame.payload.index,
        );
        self.deliver(ready).await
    }

    /// Hand released messages to listeners and acknowledge each one.
    async fn deliver(&self, ready: Vec<Message>) -> Vec<Message> {
        if ready.is_empty() {
            return ready;
        }
        let listeners = self.listeners.read().clone();
        let mut delivered = Vec::with_capacity(ready.len());
        for mut message in ready {
            message.is_delivered = true;
            for listener in &listeners {
                listener.on_message(&message);
            }
            self.acknowledge(WireEvent::MessageDelivered {
                message_id: message.id.clone(),
                sender_id: message.sender_id.clone(),
                recipient_id: self.local_id.clone(),
            })
            .await;
            delivered.push(message);
        }
        delivered
    }

    /// Tell the author of `message` that it has been read.
    pub async fn mark_read(&self, message: &Message) {
        self.acknowledge(WireEvent::MessageRead {
            message_id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            recipient_id: self.local_id.clone(),
        })
        .await;
    }

    /// A receipt for one of our messages arrived.
    pub fn on_receipt(&self, message_id: &str, recipient_id: &str, read: bool) {
        {
            let mut sent = self.sent.lock();
            match sent.messages.get_mut(message_id) {
                Some(message) => {
                    message.is_delivered = true;
                    message.is_read |= read;
                }
                None => tracing::debug!(message = message_id, "receipt for unknown message"),
            }
        }
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            if read {
                listener.on_read(message_id, recipient_id);
            } else {
                listener.on_delivered(message_id, recipient_id);
            }
        }
    }

    /// Our record of a sent message, with receipt flags applied.
    pub fn sent_message(&self, message_id: &str) -> Option<Message> {
        self.sent.lock().messages.get(message_id).cloned()
    }

    fn queue_for(&self, recipient_id: &str) -> OutboundQueue {
        Arc::clone(
            self.queues
                .lock()
                .entry(recipient_id.to_string())
                .or_default(),
        )
    }

    /// Send from the front until the queue is empty or the transport defers.
    async fn drain(&self, queue: &mut VecDeque<WireEvent>) -> Result<usize, ProtocolError> {
        while let Some(frame) = queue.pop_front() {
            match self.transport.send(frame).await? {
                SendOutcome::Sent => {}
                SendOutcome::Deferred(frame) => {
                    queue.push_front(frame);
                    break;
                }
            }
        }
        Ok(queue.len())
    }

    /// Receipts are best effort and never queued.
    async fn acknowledge(&self, receipt: WireEvent) {
        match self.transport.send(receipt).await {
            Ok(SendOutcome::Sent) => {}
            Ok(SendOutcome::Deferred(receipt)) => {
                tracing::debug!(event = receipt.name(), "not connected; receipt dropped");
            }
            Err(e) => tracing::debug!(error = %e, "receipt not sent"),
        }
    }

    fn fail(&self, frame: &MessageFrame, reason: String) {
        self.notify_failure(&DeliveryFailure {
            message_id: frame.id.clone(),
            sender_id: frame.sender_id.clone(),
            reason,
        });
    }

    fn notify_failure(&self, failure: &DeliveryFailure) {
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            listener.on_delivery_failed(failure);
        }
    }
}
