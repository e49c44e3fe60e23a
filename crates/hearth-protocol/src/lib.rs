//! Real-time transport and message dispatch for Hearth.
//!
//! [`ChatClient`] ties the pieces together: a [`TransportManager`] owning the
//! WebSocket, a [`MessageDispatcher`] encrypting through
//! `hearth_crypto::SessionEstablisher`, and the passive [`PresenceTracker`]
//! and [`ConnectionMonitor`] fed from the transport's event stream.

pub mod client;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod monitor;
pub mod presence;
pub mod sequencer;
pub mod transport;
pub mod wire;

pub use client::{ChatClient, ClientObserver};
pub use config::ClientConfig;
pub use directory::{Directory, HttpDirectory, MemoryDirectory};
pub use dispatcher::{DeliveryFailure, MessageDispatcher, MessageListener};
pub use error::ProtocolError;
pub use message::{Message, MessageType};
pub use monitor::{ConnectionMetrics, ConnectionMonitor};
pub use presence::{PresenceRecord, PresenceStatus, PresenceTracker};
pub use transport::{ConnectionState, Connector, TransportEvent, TransportManager};
pub use wire::WireEvent;
