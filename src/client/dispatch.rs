//! Receive loop and message dispatch
//!
//! Each iteration runs one engine cycle, drains the mailbox and invokes the
//! matching handlers in registration order. Handlers run on the loop's own
//! task, so a handler that blocks stalls further receipt.

use std::sync::atomic::Ordering;

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::{connection, Client, ClientError, SessionState};
use crate::hooks::LoopOutcome;

tokio::task_local! {
    /// Identity of the client whose receive loop runs on the current task
    static LOOP_OWNER: usize;
}

/// What the receive loop does when a handler returns an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerErrorPolicy {
    /// Drop the rest of the batch, close the session and end the loop with
    /// the handler's error
    #[default]
    StopLoop,
    /// Log the error and keep dispatching
    LogAndContinue,
}

/// Whether the caller runs inside `client`'s own receive loop
pub(crate) fn in_loop_of(client: &Client) -> bool {
    LOOP_OWNER
        .try_with(|owner| *owner == client.id())
        .unwrap_or(false)
}

/// Exclusive right to run the receive loop; released on drop
pub(crate) struct LoopGuard {
    client: Client,
}

impl LoopGuard {
    /// Claim the loop, or `None` if one is already running
    pub(crate) fn acquire(client: &Client) -> Option<Self> {
        if client.inner.loop_running.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(Self {
            client: client.clone(),
        })
    }
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        self.client.inner.loop_running.store(false, Ordering::SeqCst);
        debug!("Client '{}': Receive loop stopped", self.client.client_id());
    }
}

/// Run the receive loop until a disconnect is requested or it fails
pub(crate) async fn run(guard: LoopGuard) -> Result<(), ClientError> {
    let client = guard.client.clone();
    let result = LOOP_OWNER.scope(client.id(), receive_loop(&client)).await;
    drop(guard);
    result
}

async fn receive_loop(client: &Client) -> Result<(), ClientError> {
    debug!("Client '{}': Receive loop started", client.client_id());

    loop {
        if client.disconnect_requested() {
            return Ok(());
        }

        let cycle = {
            let _gate = client.inner.transport_gate.read().await;
            client.inner.engine.cycle().await
        };

        if let Err(e) = cycle {
            if client.disconnect_requested() {
                return Ok(());
            }

            warn!("Client '{}': Receive cycle failed: {}", client.client_id(), e);
            match client.hooks().on_loop_failure(client, &e).await {
                LoopOutcome::Recovered => {
                    info!("Client '{}': Loop failure recovered by hook", client.client_id());
                    if !client.inner.engine.connected() {
                        // the hook left the session down; retry at cycle pace
                        tokio::time::sleep(client.inner.config.cycle_timeout).await;
                    }
                    continue;
                }
                LoopOutcome::BreakLoop => {
                    close_session(client).await;
                    return Err(ClientError::Engine(e));
                }
            }
        }

        if let Err(e) = dispatch_batch(client).await {
            close_session(client).await;
            return Err(e);
        }
    }
}

/// Nothing pumps the engine once the loop is gone, so the session ends too
async fn close_session(client: &Client) {
    connection::close(client.inner.engine.as_ref()).await;
    client.set_state(SessionState::Disconnected);
}

async fn dispatch_batch(client: &Client) -> Result<(), ClientError> {
    let batch = client.inner.mailbox.drain();

    for message in batch {
        let handlers = client
            .inner
            .registry
            .read()
            .lookup_with(&message.topic, |topic, filter| {
                client.inner.engine.topic_match(topic, filter)
            });

        if handlers.is_empty() {
            debug!(
                "Client '{}': No handler for '{}', dropping message",
                client.client_id(),
                message.topic
            );
            continue;
        }

        for handler in handlers {
            let Err(e) = handler.handle(client, &message.topic, &message.payload).await else {
                continue;
            };

            match client.inner.config.handler_error_policy {
                HandlerErrorPolicy::StopLoop => {
                    error!(
                        "Client '{}': Handler for '{}' failed, stopping receive loop: {}",
                        client.client_id(),
                        message.topic,
                        e
                    );
                    return Err(ClientError::Handler(e));
                }
                HandlerErrorPolicy::LogAndContinue => {
                    warn!(
                        "Client '{}': Handler for '{}' failed: {}",
                        client.client_id(),
                        message.topic,
                        e
                    );
                }
            }
        }
    }

    Ok(())
}
