//! Client Session Layer
//!
//! `Client` owns one logical broker connection: the session state machine,
//! the subscription registry, the inbound mailbox and the receive loop.
//! All protocol work is delegated to a [`ProtocolEngine`].
//!
//! ```no_run
//! use lwmqtt::{Client, ClientConfig, ConnectOptions, HandlerResult, QoS};
//! use bytes::Bytes;
//!
//! # async fn run() -> Result<(), lwmqtt::ClientError> {
//! let client = Client::with_wire_engine(ClientConfig::new("sensor-1"));
//! client.connect(ConnectOptions::new("localhost", 60)).await?;
//! client
//!     .subscribe(
//!         "sensors/+/temp",
//!         |_: &Client, topic: &str, payload: &Bytes| -> HandlerResult {
//!             println!("{}: {:?}", topic, payload);
//!             Ok(())
//!         },
//!         QoS::AtLeastOnce,
//!     )
//!     .await?;
//! client.publish("sensors/1/temp", "21.5", QoS::AtMostOnce, false).await?;
//! # Ok(())
//! # }
//! ```

mod connection;
mod dispatch;
mod error;
mod handler;


pub use dispatch::HandlerErrorPolicy;
pub use error::ClientError;
pub use handler::{HandlerError, HandlerResult, MessageHandler};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{BrokerConfig, ClientConfig, Config};
use crate::engine::{Credentials, EngineSettings, Handshake, LastWill, ProtocolEngine, WireEngine};
use crate::hooks::{DefaultHooks, SessionHooks};
use crate::mailbox::Mailbox;
use crate::protocol::{ConnectReturnCode, QoS};
use crate::topic::{validate_topic_filter, validate_topic_name, SubscriptionRegistry};
use crate::transport::{SocketKeepalive, TlsConfig};

use dispatch::LoopGuard;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Parameters for [`Client::connect`], kept for later reconnects
#[derive(Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    /// Keepalive in seconds, 0 disables pings
    pub keepalive: u16,
    pub tls: Option<TlsConfig>,
    pub socket_keepalive: Option<SocketKeepalive>,
    /// Spawn the receive loop after an accepted handshake
    pub start_loop: bool,
    pub hooks: Arc<dyn SessionHooks>,
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>, keepalive: u16) -> Self {
        Self {
            host: host.into(),
            port: 1883,
            keepalive,
            tls: None,
            socket_keepalive: None,
            start_loop: true,
            hooks: Arc::new(DefaultHooks),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn socket_keepalive(mut self, keepalive: SocketKeepalive) -> Self {
        self.socket_keepalive = Some(keepalive);
        self
    }

    pub fn start_loop(mut self, start: bool) -> Self {
        self.start_loop = start;
        self
    }

    pub fn hooks<H: SessionHooks + 'static>(mut self, hooks: H) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("keepalive", &self.keepalive)
            .field("tls", &self.tls)
            .field("socket_keepalive", &self.socket_keepalive)
            .field("start_loop", &self.start_loop)
            .finish_non_exhaustive()
    }
}

impl From<&BrokerConfig> for ConnectOptions {
    fn from(broker: &BrokerConfig) -> Self {
        Self {
            host: broker.host.clone(),
            port: broker.port,
            keepalive: broker.keepalive,
            tls: broker.tls.clone(),
            socket_keepalive: broker.socket_keepalive,
            start_loop: broker.start_loop,
            hooks: Arc::new(DefaultHooks),
        }
    }
}

struct Inner {
    config: ClientConfig,
    engine: Arc<dyn ProtocolEngine>,
    mailbox: Arc<Mailbox>,
    registry: RwLock<SubscriptionRegistry>,
    state: RwLock<SessionState>,
    options: RwLock<Option<ConnectOptions>>,
    credentials: RwLock<Option<Credentials>>,
    will: RwLock<Option<LastWill>>,
    loop_running: AtomicBool,
    disconnect_requested: AtomicBool,
    loop_handle: Mutex<Option<JoinHandle<Result<(), ClientError>>>>,
    /// Serializes connect and reconnect
    lifecycle: tokio::sync::Mutex<()>,
    /// Held shared by the loop during a cycle, exclusively while the
    /// transport is replaced
    transport_gate: tokio::sync::RwLock<()>,
    /// Serializes subscribe, unsubscribe and resubscribe
    subscription_lock: tokio::sync::Mutex<()>,
}

/// Handle to an MQTT client session; clones share the session
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.client_id())
            .field("state", &self.state())
            .field("loop_running", &self.is_loop_running())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client driving `engine`
    pub fn new<E: ProtocolEngine + 'static>(mut engine: E, config: ClientConfig) -> Self {
        let mailbox = Arc::new(Mailbox::new(config.mailbox_capacity));
        engine.init(
            mailbox.clone(),
            EngineSettings {
                client_id: config.client_id.clone(),
                clean_session: config.clean_session,
                cycle_timeout: config.cycle_timeout,
                command_timeout: config.command_timeout,
                max_packet_size: config.max_packet_size,
            },
        );

        Self {
            inner: Arc::new(Inner {
                config,
                engine: Arc::new(engine),
                mailbox,
                registry: RwLock::new(SubscriptionRegistry::new()),
                state: RwLock::new(SessionState::Disconnected),
                options: RwLock::new(None),
                credentials: RwLock::new(None),
                will: RwLock::new(None),
                loop_running: AtomicBool::new(false),
                disconnect_requested: AtomicBool::new(false),
                loop_handle: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                transport_gate: tokio::sync::RwLock::new(()),
                subscription_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Create a client speaking MQTT 3.1.1 through [`WireEngine`]
    pub fn with_wire_engine(config: ClientConfig) -> Self {
        Self::new(WireEngine::new(), config)
    }

    /// Create a client from loaded configuration, with credentials applied
    pub fn from_config(config: &Config) -> Self {
        let client = Self::with_wire_engine(config.client.clone());
        if let Some(username) = &config.broker.username {
            client.set_credentials(username, config.broker.password.as_deref());
        }
        client
    }

    pub fn client_id(&self) -> &str {
        &self.inner.config.client_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.read()
    }

    /// True only when the session is Connected and the engine agrees
    pub fn connected(&self) -> bool {
        self.state() == SessionState::Connected && self.inner.engine.connected()
    }

    pub fn is_loop_running(&self) -> bool {
        self.inner.loop_running.load(Ordering::SeqCst)
    }

    /// Registered topic filters in registration order
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.registry.read().filters()
    }

    /// Credentials for the next handshake; `None` password sends username only
    pub fn set_credentials(&self, username: &str, password: Option<&str>) {
        *self.inner.credentials.write() = Some(Credentials {
            username: username.to_string(),
            password: password.map(|p| Bytes::copy_from_slice(p.as_bytes())),
        });
    }

    pub fn clear_credentials(&self) {
        *self.inner.credentials.write() = None;
    }

    /// Last will sent with the next handshake
    pub fn set_will(&self, will: LastWill) {
        *self.inner.will.write() = Some(will);
    }

    pub fn clear_will(&self) {
        *self.inner.will.write() = None;
    }

    /// Take the join handle of the spawned receive loop, if one was spawned
    pub fn take_loop_handle(&self) -> Option<JoinHandle<Result<(), ClientError>>> {
        self.inner.loop_handle.lock().take()
    }

    /// Connect to the broker described by `options`
    ///
    /// Any previous transport is closed first. A refusal or transport error
    /// leaves the client Disconnected and the receive loop is not started.
    pub async fn connect(&self, options: ConnectOptions) -> Result<ConnectReturnCode, ClientError> {
        *self.inner.options.write() = Some(options.clone());
        self.establish(&options, false).await
    }

    /// Tear down the current transport and connect again with the stored
    /// options; the subscription registry is left untouched
    pub async fn reconnect(&self) -> Result<ConnectReturnCode, ClientError> {
        let options = self
            .inner
            .options
            .read()
            .clone()
            .ok_or(ClientError::NotConnected)?;

        info!("Client '{}': Reconnecting to {}:{}", self.client_id(), options.host, options.port);
        options.hooks.before_reconnect(self).await;
        self.establish(&options, true).await
    }

    async fn establish(
        &self,
        options: &ConnectOptions,
        reconnecting: bool,
    ) -> Result<ConnectReturnCode, ClientError> {
        let code = {
            let _lifecycle = self.inner.lifecycle.lock().await;
            // the loop must not cycle on a half-torn-down session
            let _gate = self.inner.transport_gate.write().await;
            let engine = self.inner.engine.as_ref();

            if reconnecting {
                if let Err(e) = engine.disconnect().await {
                    debug!("Client '{}': Disconnect before reconnect failed: {}", self.client_id(), e);
                }
            }

            self.set_state(SessionState::Connecting);
            connection::close(engine).await;

            let handshake = Handshake {
                keepalive: options.keepalive,
                credentials: self.inner.credentials.read().clone(),
                will: self.inner.will.read().clone(),
            };

            let result = match connection::open(options, self.inner.config.connect_timeout).await {
                Ok(transport) => connection::handshake(engine, transport, &handshake).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(ConnectReturnCode::Accepted) => {
                    self.inner.disconnect_requested.store(false, Ordering::SeqCst);
                    if self.inner.config.clean_session {
                        self.inner.registry.write().mark_all_inactive();
                    }
                    self.set_state(SessionState::Connected);
                    info!(
                        "Client '{}': Connected to {}:{}",
                        self.client_id(),
                        options.host,
                        options.port
                    );
                    ConnectReturnCode::Accepted
                }
                Ok(code) => {
                    connection::close(engine).await;
                    self.set_state(SessionState::Disconnected);
                    warn!("Client '{}': Connection refused: {}", self.client_id(), code);
                    return Err(ClientError::ConnectRefused(code));
                }
                Err(e) => {
                    self.set_state(SessionState::Disconnected);
                    warn!("Client '{}': Connect failed: {}", self.client_id(), e);
                    return Err(e);
                }
            }
        };

        options.hooks.after_connect(self).await;

        if options.start_loop {
            self.spawn_loop();
        }

        Ok(code)
    }

    fn spawn_loop(&self) {
        let Some(guard) = LoopGuard::acquire(self) else {
            debug!("Client '{}': Receive loop already running", self.client_id());
            return;
        };
        let handle = tokio::spawn(dispatch::run(guard));
        *self.inner.loop_handle.lock() = Some(handle);
    }

    /// Run the receive loop on the current task until it stops
    pub async fn run_loop(&self) -> Result<(), ClientError> {
        let guard = LoopGuard::acquire(self).ok_or(ClientError::LoopAlreadyRunning)?;
        dispatch::run(guard).await
    }

    /// Publish `payload` to `topic`
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError> {
        validate_topic_name(topic).map_err(ClientError::InvalidTopic)?;
        self.ensure_connected()?;

        self.inner
            .engine
            .publish(topic, payload.into(), qos, retain)
            .await?;
        Ok(())
    }

    /// Register `handler` for `filter`, returning the granted QoS
    ///
    /// The broker round trip is skipped when the filter is already held at
    /// the same qos; the handler is still replaced.
    pub async fn subscribe<H: MessageHandler + 'static>(
        &self,
        filter: &str,
        handler: H,
        qos: QoS,
    ) -> Result<QoS, ClientError> {
        validate_topic_filter(filter).map_err(ClientError::InvalidTopic)?;
        self.ensure_connected()?;

        let handler: Arc<dyn MessageHandler> = Arc::new(handler);
        let _serial = self.inner.subscription_lock.lock().await;

        let needs_engine = self.inner.registry.read().needs_engine_subscribe(filter, qos);
        if !needs_engine {
            self.inner.registry.write().add(filter, handler, qos);
            debug!("Client '{}': Replaced handler for '{}'", self.client_id(), filter);
            return Ok(qos);
        }

        // retained messages can arrive right behind the SUBACK, so the handler
        // must be visible to the loop before the broker sees the SUBSCRIBE
        let previous = self.inner.registry.write().stage(filter, handler, qos);
        match self.inner.engine.subscribe(filter, qos).await {
            Ok(granted) => {
                self.inner.registry.write().set_active(filter);
                debug!("Client '{}': Subscribed to '{}' ({:?})", self.client_id(), filter, granted);
                Ok(granted)
            }
            Err(e) => {
                self.inner.registry.write().restore(filter, previous);
                Err(e.into())
            }
        }
    }

    /// Remove the subscription for `filter`
    pub async fn unsubscribe(&self, filter: &str) -> Result<(), ClientError> {
        validate_topic_filter(filter).map_err(ClientError::InvalidTopic)?;
        self.ensure_connected()?;

        let _serial = self.inner.subscription_lock.lock().await;

        let engine_active = self.inner.registry.read().get(filter).map(|s| s.engine_active);
        match engine_active {
            None => return Err(ClientError::NotSubscribed(filter.to_string())),
            Some(true) => self.inner.engine.unsubscribe(filter).await?,
            Some(false) => {}
        }

        self.inner.registry.write().remove(filter);
        debug!("Client '{}': Unsubscribed from '{}'", self.client_id(), filter);
        Ok(())
    }

    /// Re-issue broker subscriptions for every registered filter the broker
    /// no longer holds, returning how many were restored
    pub async fn resubscribe(&self) -> Result<usize, ClientError> {
        self.ensure_connected()?;

        let _serial = self.inner.subscription_lock.lock().await;
        let inactive = self.inner.registry.read().inactive();

        for (filter, qos) in &inactive {
            self.inner.engine.subscribe(filter, *qos).await?;
            self.inner.registry.write().set_active(filter);
        }

        if !inactive.is_empty() {
            info!("Client '{}': Restored {} subscriptions", self.client_id(), inactive.len());
        }
        Ok(inactive.len())
    }

    /// End the session
    ///
    /// Waits for the receive loop to stop, at most `timeout` when given.
    /// The transport is closed and the state set to Disconnected even when
    /// the wait times out. Called from inside the loop it does not wait.
    pub async fn disconnect(&self, timeout: Option<Duration>) -> Result<(), ClientError> {
        self.inner.disconnect_requested.store(true, Ordering::SeqCst);
        self.set_state(SessionState::Disconnecting);

        if let Err(e) = self.inner.engine.disconnect().await {
            debug!("Client '{}': Protocol disconnect failed: {}", self.client_id(), e);
        }

        let waited = if dispatch::in_loop_of(self) {
            Ok(())
        } else {
            self.wait_for_loop_exit(timeout).await
        };

        connection::close(self.inner.engine.as_ref()).await;
        self.set_state(SessionState::Disconnected);

        match &waited {
            Ok(()) => info!("Client '{}': Disconnected", self.client_id()),
            Err(_) => warn!(
                "Client '{}': Receive loop did not stop in time, transport closed",
                self.client_id()
            ),
        }
        waited
    }

    async fn wait_for_loop_exit(&self, timeout: Option<Duration>) -> Result<(), ClientError> {
        let started = Instant::now();
        while self.is_loop_running() {
            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    return Err(ClientError::Timeout);
                }
            }
            tokio::time::sleep(self.inner.config.disconnect_poll_interval).await;
        }
        Ok(())
    }

    fn ensure_connected(&self) -> Result<(), ClientError> {
        if self.state() == SessionState::Connected {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }

    fn set_state(&self, state: SessionState) {
        *self.inner.state.write() = state;
    }

    fn disconnect_requested(&self) -> bool {
        self.inner.disconnect_requested.load(Ordering::SeqCst)
    }

    fn hooks(&self) -> Arc<dyn SessionHooks> {
        match self.inner.options.read().as_ref() {
            Some(options) => options.hooks.clone(),
            None => Arc::new(DefaultHooks),
        }
    }

    /// Identity of the shared session, stable across clones
    fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}
