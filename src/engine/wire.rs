//! MQTT v3.1.1 engine over a client transport
//!
//! The transport is split into a read side, pumped by `cycle` (or by a
//! command waiting for its acknowledgement when nobody else is reading),
//! and a write side shared by every sender. Acknowledgements are routed to
//! waiters by packet identifier.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

use super::{EngineError, EngineSettings, Handshake, ProtocolEngine};
use crate::codec::{Decoder, Encoder};
use crate::mailbox::{ActivatedMessage, Mailbox};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, Publish, QoS, SubAckReturnCode, Subscribe,
    Unsubscribe, Will,
};
use crate::transport::Transport;

const READ_BUFFER_SIZE: usize = 4096;

struct ReadState {
    half: ReadHalf<Transport>,
    buf: BytesMut,
}

#[derive(Debug, Default)]
struct KeepaliveState {
    interval: Option<Duration>,
    last_sent: Option<Instant>,
    ping_sent: Option<Instant>,
}

/// Outcome of processing buffered input
enum Progress {
    Drained,
    /// The mailbox is full; the next packet stays buffered
    Blocked,
}

pub struct WireEngine {
    settings: EngineSettings,
    mailbox: Arc<Mailbox>,
    encoder: Encoder,
    decoder: Decoder,
    reader: tokio::sync::Mutex<Option<ReadState>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<Transport>>>,
    /// Waiters for acknowledgements, keyed by packet identifier
    pending: Mutex<HashMap<u16, oneshot::Sender<Packet>>>,
    /// Inbound QoS 2 packet ids that were delivered but not yet released
    awaiting_rel: Mutex<HashSet<u16>>,
    next_packet_id: AtomicU16,
    connected: AtomicBool,
    keepalive: Mutex<KeepaliveState>,
}

impl Default for WireEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl WireEngine {
    pub fn new() -> Self {
        Self {
            settings: EngineSettings::default(),
            mailbox: Arc::new(Mailbox::default()),
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            reader: tokio::sync::Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            awaiting_rel: Mutex::new(HashSet::new()),
            next_packet_id: AtomicU16::new(1),
            connected: AtomicBool::new(false),
            keepalive: Mutex::new(KeepaliveState::default()),
        }
    }

    fn client_id(&self) -> &str {
        &self.settings.client_id
    }

    fn ensure_connected(&self) -> Result<(), EngineError> {
        if self.connected() {
            Ok(())
        } else {
            Err(EngineError::NotConnected)
        }
    }

    /// Mark the session as gone and hand the error back
    fn fail(&self, e: EngineError) -> EngineError {
        self.connected.store(false, Ordering::SeqCst);
        e
    }

    /// Allocate a free packet identifier and register its waiter
    fn register(&self) -> (u16, oneshot::Receiver<Packet>) {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock();
        let id = loop {
            let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !pending.contains_key(&id) {
                break id;
            }
        };
        pending.insert(id, tx);
        (id, rx)
    }

    fn expect(&self, id: u16) -> oneshot::Receiver<Packet> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        rx
    }

    async fn send(&self, packet: &Packet) -> Result<(), EngineError> {
        let mut buf = BytesMut::new();
        self.encoder.encode(packet, &mut buf)?;

        let mut writer = self.writer.lock().await;
        let half = writer.as_mut().ok_or(EngineError::NotConnected)?;
        let written = match half.write_all(&buf).await {
            Ok(()) => half.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            return Err(self.fail(e.into()));
        }

        self.keepalive.lock().last_sent = Some(Instant::now());
        Ok(())
    }

    /// Send a packet whose acknowledgement is already registered under `id`
    async fn send_registered(&self, id: u16, packet: &Packet) -> Result<(), EngineError> {
        if let Err(e) = self.send(packet).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }
        Ok(())
    }

    /// Wait for the acknowledgement registered under `id`
    ///
    /// Pumps the transport itself while no one else is reading, so commands
    /// complete before the receive loop starts.
    async fn await_ack(
        &self,
        id: u16,
        mut rx: oneshot::Receiver<Packet>,
    ) -> Result<Packet, EngineError> {
        let deadline = Instant::now() + self.settings.command_timeout;

        loop {
            match rx.try_recv() {
                Ok(packet) => return Ok(packet),
                Err(TryRecvError::Closed) => return Err(EngineError::ConnectionLost),
                Err(TryRecvError::Empty) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                self.pending.lock().remove(&id);
                return Err(EngineError::Timeout);
            }
            let slice = (deadline - now).min(self.settings.cycle_timeout);

            let must_wait = match self.reader.try_lock() {
                Ok(mut reader) => {
                    let Some(state) = reader.as_mut() else {
                        self.pending.lock().remove(&id);
                        return Err(EngineError::NotConnected);
                    };
                    match self.pump(state, slice).await {
                        Ok(progress) => matches!(progress, Progress::Blocked),
                        Err(e) => {
                            self.pending.lock().remove(&id);
                            return Err(self.fail(e));
                        }
                    }
                }
                // The receive loop is reading and will route the ack to us
                Err(_) => true,
            };

            if must_wait {
                if let Ok(result) = timeout(slice, &mut rx).await {
                    return result.map_err(|_| EngineError::ConnectionLost);
                }
            }
        }
    }

    /// Process buffered packets, then read once for at most `wait`
    async fn pump(&self, state: &mut ReadState, wait: Duration) -> Result<Progress, EngineError> {
        if let Progress::Blocked = self.process_buffered(state).await? {
            return Ok(Progress::Blocked);
        }

        state.buf.reserve(READ_BUFFER_SIZE);
        match timeout(wait, state.half.read_buf(&mut state.buf)).await {
            Err(_) => Ok(Progress::Drained),
            Ok(Ok(0)) => Err(EngineError::ConnectionLost),
            Ok(Ok(_)) => self.process_buffered(state).await,
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn process_buffered(&self, state: &mut ReadState) -> Result<Progress, EngineError> {
        while let Some((packet, consumed)) = self.decoder.decode(&state.buf)? {
            if let Progress::Blocked = self.handle_packet(packet).await? {
                return Ok(Progress::Blocked);
            }
            state.buf.advance(consumed);
        }
        Ok(Progress::Drained)
    }

    async fn handle_packet(&self, packet: Packet) -> Result<Progress, EngineError> {
        match packet {
            Packet::Publish(publish) => return self.handle_publish(publish).await,
            Packet::PubRel(id) => {
                self.awaiting_rel.lock().remove(&id);
                self.send(&Packet::PubComp(id)).await?;
            }
            Packet::PingResp => {
                self.keepalive.lock().ping_sent = None;
            }
            Packet::PubAck(id)
            | Packet::PubRec(id)
            | Packet::PubComp(id)
            | Packet::UnsubAck(id) => self.complete(id, packet),
            Packet::SubAck(ref ack) => {
                let id = ack.packet_id;
                self.complete(id, packet);
            }
            other => {
                return Err(EngineError::Protocol(format!(
                    "Unexpected packet type {} from broker",
                    other.packet_type()
                )));
            }
        }
        Ok(Progress::Drained)
    }

    fn complete(&self, id: u16, packet: Packet) {
        let waiter = self.pending.lock().remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(packet);
            }
            None => debug!(
                "Client '{}': Ignoring acknowledgement for unknown packet {}",
                self.client_id(),
                id
            ),
        }
    }

    async fn handle_publish(&self, publish: Publish) -> Result<Progress, EngineError> {
        let Publish {
            qos,
            retain,
            topic,
            packet_id,
            payload,
            ..
        } = publish;

        if let (QoS::ExactlyOnce, Some(id)) = (qos, packet_id) {
            let duplicate = self.awaiting_rel.lock().contains(&id);
            if duplicate {
                self.send(&Packet::PubRec(id)).await?;
                return Ok(Progress::Drained);
            }
        }

        let message = ActivatedMessage {
            topic,
            payload,
            qos,
            retain,
        };
        if let Err(message) = self.mailbox.deliver(message) {
            debug!(
                "Client '{}': Mailbox full, holding message on '{}'",
                self.client_id(),
                message.topic
            );
            return Ok(Progress::Blocked);
        }

        match (qos, packet_id) {
            (QoS::AtLeastOnce, Some(id)) => self.send(&Packet::PubAck(id)).await?,
            (QoS::ExactlyOnce, Some(id)) => {
                self.awaiting_rel.lock().insert(id);
                self.send(&Packet::PubRec(id)).await?;
            }
            _ => {}
        }
        Ok(Progress::Drained)
    }

    async fn keepalive_tick(&self) -> Result<(), EngineError> {
        let ping_due = {
            let state = self.keepalive.lock();
            let Some(interval) = state.interval else {
                return Ok(());
            };
            let now = Instant::now();
            if let Some(sent) = state.ping_sent {
                if now.duration_since(sent) >= interval {
                    return Err(EngineError::ConnectionLost);
                }
                false
            } else {
                state
                    .last_sent
                    .map_or(true, |last| now.duration_since(last) >= interval)
            }
        };

        if ping_due {
            debug!("Client '{}': Sending PINGREQ", self.client_id());
            self.send(&Packet::PingReq).await?;
            self.keepalive.lock().ping_sent = Some(Instant::now());
        }
        Ok(())
    }

    async fn read_connack(decoder: &Decoder, state: &mut ReadState) -> Result<ConnAck, EngineError> {
        loop {
            if let Some((packet, consumed)) = decoder.decode(&state.buf)? {
                state.buf.advance(consumed);
                return match packet {
                    Packet::ConnAck(ack) => Ok(ack),
                    other => Err(EngineError::Protocol(format!(
                        "Expected CONNACK, got packet type {}",
                        other.packet_type()
                    ))),
                };
            }

            state.buf.reserve(READ_BUFFER_SIZE);
            if state.half.read_buf(&mut state.buf).await? == 0 {
                return Err(EngineError::ConnectionLost);
            }
        }
    }

    async fn run_cycle(&self) -> Result<(), EngineError> {
        self.keepalive_tick().await?;

        let mut reader = self.reader.lock().await;
        let state = reader.as_mut().ok_or(EngineError::NotConnected)?;
        self.pump(state, self.settings.cycle_timeout).await?;
        Ok(())
    }
}

#[async_trait]
impl ProtocolEngine for WireEngine {
    fn init(&mut self, mailbox: Arc<Mailbox>, settings: EngineSettings) {
        self.decoder = Decoder::new().with_max_packet_size(settings.max_packet_size);
        self.mailbox = mailbox;
        self.settings = settings;
    }

    async fn connect(
        &self,
        transport: Transport,
        handshake: &Handshake,
    ) -> Result<ConnectReturnCode, EngineError> {
        self.close().await;

        let (read_half, write_half) = tokio::io::split(transport);
        *self.writer.lock().await = Some(write_half);
        let mut reader = self.reader.lock().await;
        let state = reader.insert(ReadState {
            half: read_half,
            buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
        });

        let connect = Packet::Connect(Box::new(Connect {
            client_id: self.settings.client_id.clone(),
            clean_session: self.settings.clean_session,
            keep_alive: handshake.keepalive,
            username: handshake
                .credentials
                .as_ref()
                .map(|c| c.username.clone()),
            password: handshake
                .credentials
                .as_ref()
                .and_then(|c| c.password.clone()),
            will: handshake.will.as_ref().map(|w| Will {
                topic: w.topic.clone(),
                payload: w.payload.clone(),
                qos: w.qos,
                retain: w.retain,
            }),
        }));
        self.send(&connect).await?;
        debug!("Client '{}': CONNECT sent", self.client_id());

        let connack = timeout(
            self.settings.command_timeout,
            Self::read_connack(&self.decoder, state),
        )
        .await
        .map_err(|_| EngineError::Timeout)??;

        if connack.return_code.is_accepted() {
            if self.settings.clean_session || !connack.session_present {
                self.awaiting_rel.lock().clear();
            }
            *self.keepalive.lock() = KeepaliveState {
                interval: (handshake.keepalive > 0)
                    .then(|| Duration::from_secs(u64::from(handshake.keepalive))),
                last_sent: Some(Instant::now()),
                ping_sent: None,
            };
            self.connected.store(true, Ordering::SeqCst);
            info!(
                "Client '{}': Connected (session_present={})",
                self.client_id(),
                connack.session_present
            );
        } else {
            info!(
                "Client '{}': Connection refused: {}",
                self.client_id(),
                connack.return_code
            );
        }

        Ok(connack.return_code)
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Err(EngineError::NotConnected);
        }
        self.send(&Packet::Disconnect).await
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.reader.lock().await.take();
        if let Some(mut half) = self.writer.lock().await.take() {
            if let Err(e) = half.shutdown().await {
                debug!("Client '{}': Transport shutdown failed: {}", self.client_id(), e);
            }
        }
        // Dropping the senders fails every outstanding waiter
        self.pending.lock().clear();
        *self.keepalive.lock() = KeepaliveState::default();
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), EngineError> {
        self.ensure_connected()?;

        if qos == QoS::AtMostOnce {
            return self
                .send(&Packet::Publish(Publish {
                    retain,
                    topic: topic.to_string(),
                    payload,
                    ..Default::default()
                }))
                .await;
        }

        let (id, rx) = self.register();
        let publish = Packet::Publish(Publish {
            dup: false,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id: Some(id),
            payload,
        });
        self.send_registered(id, &publish).await?;

        match (qos, self.await_ack(id, rx).await?) {
            (QoS::AtLeastOnce, Packet::PubAck(_)) => Ok(()),
            (QoS::ExactlyOnce, Packet::PubRec(_)) => {
                let rx = self.expect(id);
                self.send_registered(id, &Packet::PubRel(id)).await?;
                match self.await_ack(id, rx).await? {
                    Packet::PubComp(_) => Ok(()),
                    other => Err(unexpected_ack(&other)),
                }
            }
            (_, other) => Err(unexpected_ack(&other)),
        }
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<QoS, EngineError> {
        self.ensure_connected()?;

        let (id, rx) = self.register();
        let subscribe = Packet::Subscribe(Subscribe {
            packet_id: id,
            filters: vec![(filter.to_string(), qos)],
        });
        self.send_registered(id, &subscribe).await?;

        match self.await_ack(id, rx).await? {
            Packet::SubAck(ack) => match ack.return_codes.first() {
                Some(SubAckReturnCode::Granted(granted)) => Ok(*granted),
                Some(SubAckReturnCode::Failure) => {
                    Err(EngineError::SubscriptionRejected(filter.to_string()))
                }
                None => Err(EngineError::Protocol(
                    "SUBACK without return codes".to_string(),
                )),
            },
            other => Err(unexpected_ack(&other)),
        }
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), EngineError> {
        self.ensure_connected()?;

        let (id, rx) = self.register();
        let unsubscribe = Packet::Unsubscribe(Unsubscribe {
            packet_id: id,
            filters: vec![filter.to_string()],
        });
        self.send_registered(id, &unsubscribe).await?;

        match self.await_ack(id, rx).await? {
            Packet::UnsubAck(_) => Ok(()),
            other => Err(unexpected_ack(&other)),
        }
    }

    async fn cycle(&self) -> Result<(), EngineError> {
        self.ensure_connected()?;
        self.run_cycle().await.map_err(|e| self.fail(e))
    }
}

fn unexpected_ack(packet: &Packet) -> EngineError {
    EngineError::Protocol(format!(
        "Unexpected acknowledgement type {}",
        packet.packet_type()
    ))
}
