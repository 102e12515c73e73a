//! Client error types

use std::fmt;

use super::HandlerError;
use crate::engine::EngineError;
use crate::protocol::ConnectReturnCode;
use crate::transport::TlsError;

/// Error type for client operations
#[derive(Debug)]
pub enum ClientError {
    /// The broker refused the handshake
    ConnectRefused(ConnectReturnCode),
    /// Opening the transport or performing the handshake failed
    Transport(String),
    /// `disconnect` gave up waiting for the receive loop
    Timeout,
    /// The operation needs an established session
    NotConnected,
    /// A message handler failed and the receive loop stopped
    Handler(HandlerError),
    /// Malformed topic name or filter
    InvalidTopic(&'static str),
    /// `unsubscribe` of a filter that was never subscribed
    NotSubscribed(String),
    /// `run_loop` while a receive loop is already active
    LoopAlreadyRunning,
    /// The protocol engine failed
    Engine(EngineError),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::ConnectRefused(code) => write!(f, "Connection refused: {}", code),
            ClientError::Transport(msg) => write!(f, "Transport error: {}", msg),
            ClientError::Timeout => write!(f, "Timed out waiting for the receive loop to stop"),
            ClientError::NotConnected => write!(f, "Not connected"),
            ClientError::Handler(e) => write!(f, "Message handler failed: {}", e),
            ClientError::InvalidTopic(msg) => write!(f, "Invalid topic: {}", msg),
            ClientError::NotSubscribed(filter) => write!(f, "Not subscribed to '{}'", filter),
            ClientError::LoopAlreadyRunning => write!(f, "Receive loop already running"),
            ClientError::Engine(e) => write!(f, "Engine error: {}", e),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Handler(e) => Some(e),
            ClientError::Engine(e) => Some(e),
            _ => None,
        }
    }
}

impl From<EngineError> for ClientError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotConnected => ClientError::NotConnected,
            other => ClientError::Engine(other),
        }
    }
}

impl From<TlsError> for ClientError {
    fn from(e: TlsError) -> Self {
        ClientError::Transport(e.to_string())
    }
}

impl From<HandlerError> for ClientError {
    fn from(e: HandlerError) -> Self {
        ClientError::Handler(e)
    }
}
