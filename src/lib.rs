//! lwmqtt - Lightweight MQTT v3.1.1 client session layer
//!
//! One logical broker connection per [`Client`]: session state machine with
//! manual and hook-driven reconnection, wildcard dispatch of inbound
//! messages to registered handlers through a bounded mailbox, and a
//! pluggable [`ProtocolEngine`] with a built-in wire implementation.

pub mod client;
pub mod codec;
pub mod config;
pub mod engine;
pub mod hooks;
pub mod mailbox;
pub mod protocol;
pub mod topic;
pub mod transport;

pub use client::{
    Client, ClientError, ConnectOptions, HandlerError, HandlerErrorPolicy, HandlerResult,
    MessageHandler, SessionState,
};
pub use config::{BrokerConfig, ClientConfig, Config, ConfigError};
pub use engine::{
    Credentials, EngineError, EngineSettings, Handshake, LastWill, ProtocolEngine, WireEngine,
};
pub use hooks::{CompositeHooks, DefaultHooks, LoopOutcome, SessionHooks};
pub use mailbox::{ActivatedMessage, Mailbox};
pub use protocol::{ConnectReturnCode, QoS};
pub use topic::matches;
pub use transport::{SocketKeepalive, TlsConfig, Transport};
