//! Message handlers

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

use super::Client;

/// Result returned by a [`MessageHandler`]
pub type HandlerResult = Result<(), HandlerError>;

/// Failure reported by a message handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for HandlerError {}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// Callback invoked by the receive loop for every message whose topic
/// matches the handler's filter
///
/// Handlers run sequentially on the loop's task and may call back into the
/// client (publish, subscribe, disconnect).
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, client: &Client, topic: &str, payload: &Bytes) -> HandlerResult;
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(&Client, &str, &Bytes) -> HandlerResult + Send + Sync,
{
    async fn handle(&self, client: &Client, topic: &str, payload: &Bytes) -> HandlerResult {
        self(client, topic, payload)
    }
}
