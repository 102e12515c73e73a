//! Protocol Engine
//!
//! The narrow command interface the session layer drives: handshake,
//! publish/subscribe/unsubscribe, and a bounded receive `cycle` that places
//! inbound messages into the client's mailbox.
//!
//! `WireEngine` speaks MQTT v3.1.1 over a [`Transport`]; tests substitute
//! their own implementation.

mod wire;

pub use wire::WireEngine;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::codec::DEFAULT_MAX_PACKET_SIZE;
use crate::mailbox::Mailbox;
use crate::protocol::{ConnectReturnCode, DecodeError, EncodeError, QoS};
use crate::transport::Transport;

/// Error type for engine operations
#[derive(Debug)]
pub enum EngineError {
    /// The transport closed or stopped answering
    ConnectionLost,
    /// No session is established
    NotConnected,
    /// An acknowledgement did not arrive within the command timeout
    Timeout,
    /// The peer violated the protocol or a packet could not be encoded
    Protocol(String),
    /// The broker refused a subscription
    SubscriptionRejected(String),
    /// Transport I/O failure
    Io(io::Error),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::ConnectionLost => write!(f, "Connection lost"),
            EngineError::NotConnected => write!(f, "Not connected"),
            EngineError::Timeout => write!(f, "Operation timed out"),
            EngineError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            EngineError::SubscriptionRejected(filter) => {
                write!(f, "Subscription to '{}' rejected", filter)
            }
            EngineError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for EngineError {
    fn from(e: io::Error) -> Self {
        EngineError::Io(e)
    }
}

impl From<DecodeError> for EngineError {
    fn from(e: DecodeError) -> Self {
        EngineError::Protocol(format!("Decode error: {}", e))
    }
}

impl From<EncodeError> for EngineError {
    fn from(e: EncodeError) -> Self {
        EngineError::Protocol(format!("Encode error: {}", e))
    }
}

/// Per-client settings handed to the engine once, before first use
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub client_id: String,
    pub clean_session: bool,
    /// Upper bound on one receive cycle
    pub cycle_timeout: Duration,
    /// Upper bound on waiting for an acknowledgement
    pub command_timeout: Duration,
    pub max_packet_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            clean_session: true,
            cycle_timeout: Duration::from_millis(500),
            command_timeout: Duration::from_secs(5),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

/// Username and optional password sent in CONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<Bytes>,
}

/// Message the broker publishes on our behalf if we vanish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Per-connection handshake parameters
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    /// Keepalive in seconds, 0 disables pings
    pub keepalive: u16,
    pub credentials: Option<Credentials>,
    pub will: Option<LastWill>,
}

/// Command interface of an MQTT protocol engine
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    /// Bind the engine to a client; called once before the engine is shared
    fn init(&mut self, mailbox: Arc<Mailbox>, settings: EngineSettings);

    /// Take ownership of a freshly opened transport and perform the handshake
    async fn connect(
        &self,
        transport: Transport,
        handshake: &Handshake,
    ) -> Result<ConnectReturnCode, EngineError>;

    /// Whether a session is currently established
    fn connected(&self) -> bool;

    /// Send a protocol-level disconnect
    async fn disconnect(&self) -> Result<(), EngineError>;

    /// Drop the transport; idempotent
    async fn close(&self);

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), EngineError>;

    /// Subscribe to `filter`, returning the granted QoS
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<QoS, EngineError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), EngineError>;

    /// One bounded receive iteration: housekeeping plus inbound traffic
    async fn cycle(&self) -> Result<(), EngineError>;

    fn topic_match(&self, topic: &str, filter: &str) -> bool {
        crate::topic::matches(topic, filter)
    }
}
