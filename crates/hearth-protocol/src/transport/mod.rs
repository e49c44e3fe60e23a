//! Connection lifecycle: connect, heartbeat, reconnect with backoff.
//!
//! A single spawned task owns the link and is the only writer of the
//! connection state. Callers talk to it through [`TransportManager`], a
//! cloneable handle that posts commands; timers and inbound frames are
//! handled inside the same `select!` loop, so nothing races on state.
//!
//! Events go out two ways. Passive observers subscribe to a broadcast and
//! may lag. The one consumer that must see everything, in order, takes a
//! bounded mpsc from [`TransportManager::with_dispatch`]; while it is full
//! the task stops reading the link but keeps serving commands.

mod connector;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

pub use connector::{Connector, Link, MemoryConnector, WebSocketConnector};

use crate::config::{ClientConfig, HeartbeatConfig, ReconnectPolicy};
use crate::error::ProtocolError;
use crate::wire::{MessageFrame, WireEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts are exhausted. Only `initialize()` leaves this state.
    PermanentlyFailed,
}

/// Everything the transport reports, in the order it happened.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    /// A reconnect is scheduled after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    ReconnectExhausted { attempts: u32 },
    PeerConnected(String),
    PeerDisconnected(String),
    Message(MessageFrame),
    Delivered { message_id: String, recipient_id: String },
    Read { message_id: String, recipient_id: String },
}

/// Result of [`TransportManager::send`].
#[derive(Debug)]
pub enum SendOutcome {
    Sent,
    /// Not connected; the event is handed back for the caller to queue.
    Deferred(WireEvent),
}

enum Command {
    Initialize(oneshot::Sender<Result<(), ProtocolError>>),
    Disconnect(oneshot::Sender<()>),
    Send(WireEvent, oneshot::Sender<SendOutcome>),
}

/// Handle to the transport task. The task stops once every handle is dropped.
#[derive(Clone)]
pub struct TransportManager {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<TransportEvent>,
    state: watch::Receiver<ConnectionState>,
}

impl TransportManager {
    /// Spawn the transport task. Must be called inside a tokio runtime.
    pub fn new(config: &ClientConfig, connector: Arc<dyn Connector>) -> Self {
        Self::spawn(config, connector, None)
    }

    /// Like [`TransportManager::new`], plus a lossless event stream with
    /// backpressure for a single consumer.
    pub fn with_dispatch(
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.channel_capacity);
        (Self::spawn(config, connector, Some(dispatch_tx)), dispatch_rx)
    }

    fn spawn(
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
        dispatch: Option<mpsc::Sender<TransportEvent>>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(config.channel_capacity);
        let (events, _) = broadcast::channel(config.channel_capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let event_loop = EventLoop {
            url: config.server_url.clone(),
            user_id: config.user_id.clone(),
            connector,
            policy: config.reconnect.clone(),
            heartbeat: config.heartbeat.clone(),
            commands: commands_rx,
            events: events.clone(),
            dispatch,
            outbox: VecDeque::new(),
            state: state_tx,
            link: None,
            attempt: 0,
            reconnect_at: None,
            next_ping: None,
            awaiting_pong: None,
        };
        tokio::spawn(event_loop.run());

        Self {
            commands: commands_tx,
            events,
            state: state_rx,
        }
    }

    /// Connect now. Cancels any pending reconnect and resets the attempt
    /// counter. On failure the regular backoff schedule takes over.
    pub async fn initialize(&self) -> Result<(), ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Initialize(reply)).await?;
        rx.await.map_err(|_| ProtocolError::Closed)?
    }

    /// Close the link and cancel any pending reconnect.
    pub async fn disconnect(&self) -> Result<(), ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Disconnect(reply)).await?;
        rx.await.map_err(|_| ProtocolError::Closed)
    }

    /// Transmit if connected, otherwise hand the event back.
    pub async fn send(&self, event: WireEvent) -> Result<SendOutcome, ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Send(event, reply)).await?;
        rx.await.map_err(|_| ProtocolError::Closed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    async fn post(&self, command: Command) -> Result<(), ProtocolError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ProtocolError::Closed)
    }
}

enum Step {
    Command(Command),
    /// Room in the dispatch channel, or `None` once its receiver is gone.
    Forward(Option<mpsc::OwnedPermit<TransportEvent>>),
    Incoming(Option<WireEvent>),
    PongTimeout,
    Ping,
    Reconnect,
}

struct EventLoop {
    url: String,
    user_id: String,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    heartbeat: HeartbeatConfig,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<TransportEvent>,
    dispatch: Option<mpsc::Sender<TransportEvent>>,
    /// Events not yet handed to the dispatch consumer.
    outbox: VecDeque<TransportEvent>,
    state: watch::Sender<ConnectionState>,
    link: Option<Link>,
    /// Consecutive failed attempts since the last successful connect.
    attempt: u32,
    reconnect_at: Option<Instant>,
    next_ping: Option<Instant>,
    awaiting_pong: Option<(u64, Instant)>,
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            let step = tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => break,
                },
                permit = reserve(self.dispatch.clone()), if !self.outbox.is_empty() => Step::Forward(permit),
                incoming = next_incoming(&mut self.link), if self.outbox.is_empty() => Step::Incoming(incoming),
                () = sleep_until(self.awaiting_pong.map(|(_, deadline)| deadline)) => Step::PongTimeout,
                () = sleep_until(self.next_ping) => Step::Ping,
                () = sleep_until(self.reconnect_at) => Step::Reconnect,
            };

            match step {
                Step::Command(Command::Initialize(reply)) => {
                    let result = self.initialize().await;
                    let _ = reply.send(result);
                }
                Step::Command(Command::Disconnect(reply)) => {
                    self.disconnect();
                    let _ = reply.send(());
                }
                Step::Command(Command::Send(event, reply)) => self.send(event, reply).await,
                Step::Forward(Some(permit)) => {
                    if let Some(event) = self.outbox.pop_front() {
                        permit.send(event);
                    }
                }
                Step::Forward(None) => {
                    tracing::debug!("dispatch consumer gone");
                    self.dispatch = None;
                    self.outbox.clear();
                }
                Step::Incoming(Some(event)) => self.handle_incoming(event),
                Step::Incoming(None) => self.handle_drop("link closed"),
                Step::PongTimeout => self.handle_drop("heartbeat timed out"),
                Step::Ping => self.send_ping(),
                Step::Reconnect => {
                    self.reconnect_at = None;
                    tracing::info!(attempt = self.attempt, "reconnecting");
                    if let Err(e) = self.try_connect().await {
                        tracing::warn!(attempt = self.attempt, error = %e, "reconnect failed");
                        self.schedule_reconnect();
                    }
                }
            }
        }

        if let Some(link) = self.link.take() {
            let _ = link.outgoing.try_send(WireEvent::Disconnect);
        }
        tracing::debug!("transport task stopped");
    }

    async fn initialize(&mut self) -> Result<(), ProtocolError> {
        if self.link.is_some() {
            return Ok(());
        }
        self.reconnect_at = None;
        self.attempt = 0;
        self.try_connect().await.inspect_err(|e| {
            tracing::warn!(url = %self.url, error = %e, "initial connect failed");
            self.schedule_reconnect();
        })
    }

    async fn try_connect(&mut self) -> Result<(), ProtocolError> {
        self.set_state(ConnectionState::Connecting);

        let link = tokio::time::timeout(self.heartbeat.timeout(), self.connector.connect(&self.url))
            .await
            .map_err(|_| ProtocolError::TransportDropped("connect timed out".into()))??;
        link.outgoing
            .send(WireEvent::Connect {
                user_id: self.user_id.clone(),
            })
            .await
            .map_err(|_| ProtocolError::TransportDropped("link closed during handshake".into()))?;

        self.link = Some(link);
        self.attempt = 0;
        self.reconnect_at = None;
        self.awaiting_pong = None;
        self.next_ping = Some(Instant::now() + self.heartbeat.interval());
        self.set_state(ConnectionState::Connected);
        tracing::info!(url = %self.url, user = %self.user_id, "connected");
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            let _ = link.outgoing.try_send(WireEvent::Disconnect);
        }
        self.attempt = 0;
        self.reconnect_at = None;
        self.next_ping = None;
        self.awaiting_pong = None;
        self.set_state(ConnectionState::Disconnected);
        tracing::info!("disconnected by request");
    }

    async fn send(&mut self, event: WireEvent, reply: oneshot::Sender<SendOutcome>) {
        let Some(link) = &self.link else {
            let _ = reply.send(SendOutcome::Deferred(event));
            return;
        };
        let name = event.name();
        match link.outgoing.send(event).await {
            Ok(()) => {
                tracing::trace!(event = name, "sent");
                let _ = reply.send(SendOutcome::Sent);
            }
            Err(mpsc::error::SendError(event)) => {
                let _ = reply.send(SendOutcome::Deferred(event));
                self.handle_drop("link closed during send");
            }
        }
    }

    fn handle_incoming(&mut self, event: WireEvent) {
        tracing::trace!(event = event.name(), "received");
        match event {
            WireEvent::Ping { nonce } => {
                if let Some(link) = &self.link {
                    let _ = link.outgoing.try_send(WireEvent::Pong { nonce });
                }
            }
            WireEvent::Pong { nonce } => {
                if matches!(self.awaiting_pong, Some((expected, _)) if expected == nonce) {
                    self.awaiting_pong = None;
                }
            }
            WireEvent::NewConnection { user_id } => self.emit(TransportEvent::PeerConnected(user_id)),
            WireEvent::NewDisconnection { user_id } => {
                self.emit(TransportEvent::PeerDisconnected(user_id));
            }
            WireEvent::MessageSend(frame) => self.emit(TransportEvent::Message(frame)),
            WireEvent::MessageDelivered {
                message_id,
                recipient_id,
                ..
            } => self.emit(TransportEvent::Delivered {
                message_id,
                recipient_id,
            }),
            WireEvent::MessageRead {
                message_id,
                recipient_id,
                ..
            } => self.emit(TransportEvent::Read {
                message_id,
                recipient_id,
            }),
            WireEvent::Disconnect => self.handle_drop("server closed the session"),
            WireEvent::Connect { user_id } => {
                tracing::debug!(user = %user_id, "ignoring connect from server");
            }
        }
    }

    fn send_ping(&mut self) {
        self.next_ping = Some(Instant::now() + self.heartbeat.interval());
        if self.awaiting_pong.is_some() {
            return;
        }
        let nonce: u64 = rand::random();
        let closed = match &self.link {
            Some(link) => matches!(
                link.outgoing.try_send(WireEvent::Ping { nonce }),
                Err(mpsc::error::TrySendError::Closed(_))
            ),
            None => true,
        };
        if closed {
            self.handle_drop("link closed during heartbeat");
            return;
        }
        self.awaiting_pong = Some((nonce, Instant::now() + self.heartbeat.timeout()));
    }

    /// Unsolicited loss of the link.
    fn handle_drop(&mut self, reason: &str) {
        if self.link.take().is_none() {
            return;
        }
        tracing::warn!(reason, "connection dropped");
        self.next_ping = None;
        self.awaiting_pong = None;
        self.set_state(ConnectionState::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.attempt >= self.policy.max_attempts {
            tracing::error!(attempts = self.attempt, url = %self.url, "giving up on reconnecting");
            self.reconnect_at = None;
            self.set_state(ConnectionState::PermanentlyFailed);
            self.emit(TransportEvent::ReconnectExhausted {
                attempts: self.attempt,
            });
            return;
        }
        self.attempt += 1;
        let delay = self.policy.delay_for(self.attempt);
        self.reconnect_at = Some(Instant::now() + delay);
        self.set_state(ConnectionState::Disconnected);
        tracing::debug!(attempt = self.attempt, ?delay, "reconnect scheduled");
        self.emit(TransportEvent::Reconnecting {
            attempt: self.attempt,
            delay,
        });
    }

    fn set_state(&mut self, next: ConnectionState) {
        if *self.state.borrow() == next {
            return;
        }
        self.state.send_replace(next);
        self.emit(TransportEvent::StateChanged(next));
    }

    fn emit(&mut self, event: TransportEvent) {
        if self.dispatch.is_some() {
            self.outbox.push_back(event.clone());
        }
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

async fn next_incoming(link: &mut Option<Link>) -> Option<WireEvent> {
    match link {
        Some(link) => link.incoming.recv().await,
        None => std::future::pending().await,
    }
}

async fn reserve(
    dispatch: Option<mpsc::Sender<TransportEvent>>,
) -> Option<mpsc::OwnedPermit<TransportEvent>> {
    match dispatch {
        Some(dispatch) => dispatch.reserve_owned().await.ok(),
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts: u32) -> ClientConfig {
        ClientConfig {
            user_id: "alice".into(),
            reconnect: ReconnectPolicy {
                base_delay_ms: 100,
                max_delay_ms: 1_000,
                max_attempts,
            },
            ..ClientConfig::default()
        }
    }

    fn setup(max_attempts: u32) -> (TransportManager, Arc<MemoryConnector>, mpsc::UnboundedReceiver<Link>) {
        let (connector, servers) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let transport = TransportManager::new(&config(max_attempts), connector.clone());
        (transport, connector, servers)
    }

    fn drain(events: &mut broadcast::Receiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_announces_user() {
        let (transport, _connector, mut servers) = setup(3);
        transport.initialize().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Connected);

        let mut server = servers.recv().await.unwrap();
        assert_eq!(
            server.incoming.recv().await.unwrap(),
            WireEvent::Connect {
                user_id: "alice".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_disconnected_is_deferred() {
        let (transport, _connector, _servers) = setup(3);
        let outcome = transport.send(WireEvent::Ping { nonce: 1 }).await.unwrap();
        assert!(matches!(outcome, SendOutcome::Deferred(WireEvent::Ping { nonce: 1 })));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_after_max_attempts() {
        let (transport, connector, mut servers) = setup(3);
        let mut events = transport.subscribe();
        transport.initialize().await.unwrap();

        connector.set_online(false);
        drop(servers.recv().await.unwrap());
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(transport.state(), ConnectionState::PermanentlyFailed);
        assert_eq!(connector.attempts(), 4);

        let events = drain(&mut events);
        let delays: Vec<(u32, Duration)> = events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Reconnecting { attempt, delay } => Some((*attempt, *delay)),
                _ => None,
            })
            .collect();
        assert_eq!(
            delays,
            vec![
                (1, Duration::from_millis(100)),
                (2, Duration::from_millis(200)),
                (3, Duration::from_millis(400)),
            ]
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, TransportEvent::ReconnectExhausted { attempts: 3 })));

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_counter_resets_on_success() {
        let (transport, connector, mut servers) = setup(5);
        let mut events = transport.subscribe();
        transport.initialize().await.unwrap();

        connector.set_online(false);
        drop(servers.recv().await.unwrap());
        tokio::time::sleep(Duration::from_millis(150)).await;
        connector.set_online(true);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(transport.state(), ConnectionState::Connected);

        drain(&mut events);
        drop(servers.recv().await.unwrap());
        tokio::time::sleep(Duration::from_millis(10)).await;
        let attempts: Vec<u32> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::Reconnecting { attempt, .. } => Some(attempt),
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_pong_drops_link() {
        let (transport, _connector, mut servers) = setup(3);
        transport.initialize().await.unwrap();
        let mut server = servers.recv().await.unwrap();
        server.incoming.recv().await.unwrap();

        tokio::time::sleep(Duration::from_millis(25_100)).await;
        assert!(matches!(
            server.incoming.recv().await.unwrap(),
            WireEvent::Ping { .. }
        ));
        assert_eq!(transport.state(), ConnectionState::Connected);

        tokio::time::sleep(Duration::from_millis(9_950)).await;
        assert_ne!(transport.state(), ConnectionState::Connected);
        // the reconnect that follows is a fresh link
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(servers.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn answered_heartbeat_keeps_link() {
        let (transport, _connector, mut servers) = setup(3);
        transport.initialize().await.unwrap();
        let mut server = servers.recv().await.unwrap();

        tokio::spawn(async move {
            while let Some(event) = server.incoming.recv().await {
                if let WireEvent::Ping { nonce } = event {
                    let _ = server.outgoing.send(WireEvent::Pong { nonce }).await;
                }
            }
        });

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        let (transport, connector, mut servers) = setup(5);
        transport.initialize().await.unwrap();

        connector.set_online(false);
        drop(servers.recv().await.unwrap());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(connector.attempts(), 1);

        transport.disconnect().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 1);
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_and_message_events_forwarded() {
        let (transport, _connector, mut servers) = setup(3);
        let mut events = transport.subscribe();
        transport.initialize().await.unwrap();
        let server = servers.recv().await.unwrap();

        server
            .outgoing
            .send(WireEvent::NewConnection {
                user_id: "bob".into(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, TransportEvent::PeerConnected(id) if id == "bob")));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_initialize_enters_backoff() {
        let (transport, connector, _servers) = setup(2);
        connector.set_online(false);
        assert!(matches!(
            transport.initialize().await,
            Err(ProtocolError::TransportDropped(_))
        ));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.attempts(), 3);
        assert_eq!(transport.state(), ConnectionState::PermanentlyFailed);

        connector.set_online(true);
        transport.initialize().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_dispatch_consumer_loses_nothing() {
        let (connector, mut servers) = MemoryConnector::new();
        let config = ClientConfig {
            channel_capacity: 2,
            ..config(3)
        };
        let (transport, mut events) = TransportManager::with_dispatch(&config, Arc::new(connector));
        transport.initialize().await.unwrap();
        let server = servers.recv().await.unwrap();

        for i in 0..10 {
            server
                .outgoing
                .send(WireEvent::NewConnection {
                    user_id: format!("u{i}"),
                })
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        let mut peers = Vec::new();
        while peers.len() < 10 {
            if let TransportEvent::PeerConnected(user) = events.recv().await.unwrap() {
                peers.push(user);
            }
        }
        assert_eq!(peers, (0..10).map(|i| format!("u{i}")).collect::<Vec<_>>());
        // Commands were still served while the channel sat full.
        assert_eq!(transport.state(), ConnectionState::Connected);
    }
}
