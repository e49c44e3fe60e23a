//! The composed client: one transport, one dispatcher, presence and metrics,
//! all driven by a single dispatch loop.

use std::sync::Arc;

use hearth_crypto::signal::SessionStore;
use hearth_crypto::{KeyBundleStore, SessionEstablisher};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::directory::Directory;
use crate::dispatcher::{MessageDispatcher, MessageListener};
use crate::error::ProtocolError;
use crate::message::{timestamp_now_ms, Message};
use crate::monitor::{ConnectionMetrics, ConnectionMonitor};
use crate::presence::{PresenceChange, PresenceRecord, PresenceTracker};
use crate::transport::{ConnectionState, Connector, TransportEvent, TransportManager};

/// Application callbacks. All run on the dispatch loop, never concurrently
/// with each other.
pub trait ClientObserver: Send + Sync {
    fn on_connect(&self) {}

    fn on_disconnect(&self) {}

    fn on_message_received(&self, _message: &Message) {}

    fn on_peer_connected(&self, _user_id: &str) {}

    fn on_peer_disconnected(&self, _user_id: &str) {}

    /// The transport gave up; call [`ChatClient::start`] to try again.
    fn on_reconnect_exhausted(&self, _attempts: u32) {}
}

struct Shared {
    config: ClientConfig,
    keys: Arc<KeyBundleStore>,
    directory: Arc<dyn Directory>,
    dispatcher: Arc<MessageDispatcher>,
    presence: RwLock<PresenceTracker>,
    monitor: RwLock<ConnectionMonitor>,
    observers: RwLock<Vec<Arc<dyn ClientObserver>>>,
}

impl Shared {
    fn observers(&self) -> Vec<Arc<dyn ClientObserver>> {
        self.observers.read().clone()
    }

    /// Top up one-time pre-keys and republish the bundle if any were added.
    async fn replenish(&self) -> Result<(), ProtocolError> {
        let crypto = &self.config.crypto;
        let added = self
            .keys
            .replenish(crypto.one_time_prekey_count, crypto.prekey_low_watermark)?;
        if added == 0 {
            return Ok(());
        }
        let bundle = self.keys.public_bundle()?;
        self.directory
            .publish_bundle(&self.config.user_id, &bundle)
            .await
    }
}

pub struct ChatClient {
    shared: Arc<Shared>,
    establisher: Arc<SessionEstablisher>,
    transport: TransportManager,
    dispatch_task: JoinHandle<()>,
}

impl ChatClient {
    /// Build a client. Nothing touches the network until [`ChatClient::start`].
    /// Must be called inside a tokio runtime.
    pub fn new(
        config: ClientConfig,
        keys: Arc<KeyBundleStore>,
        sessions: Box<dyn SessionStore>,
        directory: Arc<dyn Directory>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ProtocolError> {
        config.validate()?;

        let establisher = Arc::new(SessionEstablisher::new(
            config.user_id.clone(),
            Arc::clone(&keys),
            sessions,
            config.crypto.max_skip,
        ));
        let (transport, events) = TransportManager::with_dispatch(&config, connector);
        let dispatcher = Arc::new(MessageDispatcher::new(
            Arc::clone(&establisher),
            Arc::clone(&directory),
            transport.clone(),
            config.ordering.max_pending,
        ));

        let shared = Arc::new(Shared {
            config,
            keys,
            directory,
            dispatcher,
            presence: RwLock::new(PresenceTracker::new()),
            monitor: RwLock::new(ConnectionMonitor::new()),
            observers: RwLock::new(Vec::new()),
        });
        let dispatch_task = tokio::spawn(dispatch_loop(Arc::clone(&shared), events));

        Ok(Self {
            shared,
            establisher,
            transport,
            dispatch_task,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.shared.config.user_id
    }

    /// Make sure a bundle exists, publish it, then connect.
    ///
    /// A directory failure is returned without connecting. A connect failure
    /// is returned too, but the transport keeps retrying on its backoff
    /// schedule.
    pub async fn start(&self) -> Result<(), ProtocolError> {
        let crypto = &self.shared.config.crypto;
        let bundle = if self.shared.keys.one_time_key_count()? == 0 {
            self.shared.keys.generate_bundle(crypto.one_time_prekey_count)?
        } else {
            self.shared
                .keys
                .replenish(crypto.one_time_prekey_count, crypto.prekey_low_watermark)?;
            self.shared.keys.public_bundle()?
        };
        self.shared
            .directory
            .publish_bundle(self.user_id(), &bundle)
            .await?;
        self.transport.initialize().await
    }

    pub async fn disconnect(&self) -> Result<(), ProtocolError> {
        self.transport.disconnect().await
    }

    /// Encrypt and send, or queue until the transport reconnects.
    ///
    /// Refused with `ReconnectExhausted` once the transport has given up;
    /// [`ChatClient::start`] must succeed before new messages are accepted.
    pub async fn send(&self, content: &str, recipient_id: &str) -> Result<Message, ProtocolError> {
        if self.transport.state() == ConnectionState::PermanentlyFailed {
            return Err(ProtocolError::ReconnectExhausted(
                self.shared.config.reconnect.max_attempts,
            ));
        }
        self.shared.dispatcher.send(content, recipient_id).await
    }

    pub async fn mark_read(&self, message: &Message) {
        self.shared.dispatcher.mark_read(message).await;
    }

    /// Forget the session with `peer`; the next send fetches a fresh bundle.
    pub fn reset_session(&self, peer: &str) -> Result<(), ProtocolError> {
        Ok(self.establisher.reset(peer)?)
    }

    pub fn add_observer(&self, observer: Arc<dyn ClientObserver>) -> bool {
        let mut observers = self.shared.observers.write();
        if observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            return false;
        }
        observers.push(observer);
        true
    }

    pub fn remove_observer(&self, observer: &Arc<dyn ClientObserver>) -> bool {
        let mut observers = self.shared.observers.write();
        let before = observers.len();
        observers.retain(|o| !Arc::ptr_eq(o, observer));
        observers.len() != before
    }

    pub fn add_listener(&self, listener: Arc<dyn MessageListener>) -> bool {
        self.shared.dispatcher.add_listener(listener)
    }

    pub fn remove_listener(&self, listener: &Arc<dyn MessageListener>) -> bool {
        self.shared.dispatcher.remove_listener(listener)
    }

    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.shared.dispatcher
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn presence(&self, user_id: &str) -> Option<PresenceRecord> {
        self.shared.presence.read().get(user_id).cloned()
    }

    pub fn presence_snapshot(&self) -> Vec<PresenceRecord> {
        self.shared.presence.read().snapshot()
    }

    pub fn metrics(&self) -> ConnectionMetrics {
        self.shared.monitor.read().snapshot(timestamp_now_ms())
    }

    pub fn reset_metrics(&self) {
        self.shared.monitor.write().reset(timestamp_now_ms());
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.dispatch_task.abort();
    }
}

async fn dispatch_loop(shared: Arc<Shared>, mut events: mpsc::Receiver<TransportEvent>) {
    let mut connected = false;
    while let Some(event) = events.recv().await {
        let change = shared.presence.write().apply(&event);
        shared.monitor.write().apply(&event);

        match event {
            TransportEvent::StateChanged(ConnectionState::Connected) => {
                connected = true;
                if let Err(e) = shared.dispatcher.flush().await {
                    tracing::warn!(error = %e, "outbound flush interrupted");
                }
                for observer in shared.observers() {
                    observer.on_connect();
                }
            }
            TransportEvent::StateChanged(_) => {
                if connected {
                    connected = false;
                    for observer in shared.observers() {
                        observer.on_disconnect();
                    }
                }
            }
            TransportEvent::Message(frame) => {
                let consumed_prekey = frame
                    .payload
                    .prekey
                    .as_ref()
                    .is_some_and(|h| h.one_time_pre_key_id.is_some());
                let delivered = shared.dispatcher.on_frame_received(frame).await;
                let observers = shared.observers();
                for message in &delivered {
                    for observer in &observers {
                        observer.on_message_received(message);
                    }
                }
                if consumed_prekey {
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        if let Err(e) = shared.replenish().await {
                            tracing::warn!(error = %e, "failed to replenish pre-keys");
                        }
                    });
                }
            }
            TransportEvent::Delivered {
                message_id,
                recipient_id,
            } => shared.dispatcher.on_receipt(&message_id, &recipient_id, false),
            TransportEvent::Read {
                message_id,
                recipient_id,
            } => shared.dispatcher.on_receipt(&message_id, &recipient_id, true),
            TransportEvent::ReconnectExhausted { attempts } => {
                for observer in shared.observers() {
                    observer.on_reconnect_exhausted(attempts);
                }
            }
            TransportEvent::PeerConnected(_)
            | TransportEvent::PeerDisconnected(_)
            | TransportEvent::Reconnecting { .. } => {}
        }

        match change {
            Some(PresenceChange::Online(user_id)) => {
                for observer in shared.observers() {
                    observer.on_peer_connected(&user_id);
                }
            }
            Some(PresenceChange::Offline(user_id)) => {
                for observer in shared.observers() {
                    observer.on_peer_disconnected(&user_id);
                }
            }
            Some(PresenceChange::Unobservable(_)) | None => {}
        }
    }
    tracing::debug!("dispatch loop stopped");
}
