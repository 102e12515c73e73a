//! Hooks Module
//!
//! Extensibility points around the session lifecycle: before a reconnect,
//! after an accepted handshake, and when the receive loop hits a cycle
//! failure.

use std::sync::Arc;

use async_trait::async_trait;

use crate::client::Client;
use crate::engine::EngineError;


/// Decision returned by [`SessionHooks::on_loop_failure`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopOutcome {
    /// Close the session and stop the receive loop
    #[default]
    BreakLoop,
    /// The hook repaired the session; keep looping
    Recovered,
}

/// Session hooks trait
///
/// All methods have default implementations: the lifecycle events are
/// no-ops and a loop failure ends the loop.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// Called at the start of [`Client::reconnect`], before the old
    /// transport is torn down
    async fn before_reconnect(&self, _client: &Client) {
        // Default: no-op
    }

    /// Called after every accepted handshake, before the receive loop starts
    async fn after_connect(&self, _client: &Client) {
        // Default: no-op
    }

    /// Called when a receive cycle fails and no disconnect was requested
    ///
    /// # Returns
    /// * `LoopOutcome::Recovered` - the loop continues without closing the
    ///   transport; the hook is responsible for any reconnection
    /// * `LoopOutcome::BreakLoop` - the transport is closed and the loop exits
    async fn on_loop_failure(&self, _client: &Client, _error: &EngineError) -> LoopOutcome {
        LoopOutcome::BreakLoop
    }
}

/// Hooks that do nothing and never recover
#[derive(Debug, Default)]
pub struct DefaultHooks;

#[async_trait]
impl SessionHooks for DefaultHooks {}

#[async_trait]
impl<T: SessionHooks + ?Sized> SessionHooks for Arc<T> {
    async fn before_reconnect(&self, client: &Client) {
        (**self).before_reconnect(client).await;
    }

    async fn after_connect(&self, client: &Client) {
        (**self).after_connect(client).await;
    }

    async fn on_loop_failure(&self, client: &Client, error: &EngineError) -> LoopOutcome {
        (**self).on_loop_failure(client, error).await
    }
}

/// Chains several hook implementations
///
/// Events run in registration order. A loop failure is recovered as soon as
/// one hook reports `Recovered`; later hooks are not consulted.
#[derive(Default)]
pub struct CompositeHooks {
    hooks: Vec<Box<dyn SessionHooks>>,
}

impl CompositeHooks {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn add<H: SessionHooks + 'static>(&mut self, hooks: H) {
        self.hooks.push(Box::new(hooks));
    }

    pub fn with<H: SessionHooks + 'static>(mut self, hooks: H) -> Self {
        self.add(hooks);
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

#[async_trait]
impl SessionHooks for CompositeHooks {
    async fn before_reconnect(&self, client: &Client) {
        for hooks in &self.hooks {
            hooks.before_reconnect(client).await;
        }
    }

    async fn after_connect(&self, client: &Client) {
        for hooks in &self.hooks {
            hooks.after_connect(client).await;
        }
    }

    async fn on_loop_failure(&self, client: &Client, error: &EngineError) -> LoopOutcome {
        for hooks in &self.hooks {
            if hooks.on_loop_failure(client, error).await == LoopOutcome::Recovered {
                return LoopOutcome::Recovered;
            }
        }
        LoopOutcome::BreakLoop
    }
}
