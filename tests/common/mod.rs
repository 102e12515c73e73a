//! Scripted in-process broker for integration tests
//!
//! Tests drive the broker side packet by packet with the crate's own codec,
//! so every exchange the client makes is asserted explicitly.

#![allow(dead_code)]

use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use lwmqtt::codec::{Decoder, Encoder};
use lwmqtt::protocol::{ConnAck, Connect, ConnectReturnCode, Packet, Publish, QoS};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Route client logs to the test output; `RUST_LOG=lwmqtt=debug` to see them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Listening side of the scripted broker
pub struct TestBroker {
    listener: TcpListener,
    pub port: u16,
}

impl TestBroker {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test broker");
        let port = listener.local_addr().expect("No local addr").port();
        Self { listener, port }
    }

    pub async fn accept(&self) -> BrokerPeer {
        let (stream, _) = timeout(RECV_TIMEOUT, self.listener.accept())
            .await
            .expect("Timed out waiting for a client")
            .expect("Accept failed");
        BrokerPeer::new(stream)
    }

    /// Accept one client and complete its handshake with `code`
    pub async fn accept_session(&self, code: ConnectReturnCode) -> (BrokerPeer, Connect) {
        let mut peer = self.accept().await;
        let connect = peer.expect_connect().await;
        peer.send(&Packet::ConnAck(ConnAck {
            session_present: false,
            return_code: code,
        }))
        .await;
        (peer, connect)
    }
}

/// One accepted client connection, seen from the broker
pub struct BrokerPeer {
    stream: TcpStream,
    buf: BytesMut,
    encoder: Encoder,
    decoder: Decoder,
}

impl BrokerPeer {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(4096),
            encoder: Encoder::new(),
            decoder: Decoder::new(),
        }
    }

    pub async fn send(&mut self, packet: &Packet) {
        let mut buf = BytesMut::new();
        self.encoder
            .encode(packet, &mut buf)
            .expect("Failed to encode");
        self.stream.write_all(&buf).await.expect("Failed to write");
    }

    /// Send several packets in a single write, as a broker flushing a
    /// batch would
    pub async fn send_batch(&mut self, packets: &[Packet]) {
        let mut buf = BytesMut::new();
        for packet in packets {
            self.encoder
                .encode(packet, &mut buf)
                .expect("Failed to encode");
        }
        self.stream.write_all(&buf).await.expect("Failed to write");
    }

    /// Next packet from the client, or `None` if nothing arrives within `wait`
    pub async fn try_recv(&mut self, wait: Duration) -> Option<Packet> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some((packet, consumed)) = self.decoder.decode(&self.buf).expect("Bad packet") {
                self.buf.advance(consumed);
                return Some(packet);
            }

            let read = tokio::time::timeout_at(deadline, self.stream.read_buf(&mut self.buf)).await;
            match read {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return None,
                Ok(Ok(_)) => {}
            }
        }
    }

    pub async fn recv(&mut self) -> Packet {
        self.try_recv(RECV_TIMEOUT)
            .await
            .expect("Timed out waiting for a packet")
    }

    /// True once the client has closed its side of the connection
    pub async fn closed(&mut self) -> bool {
        let mut scratch = [0u8; 64];
        matches!(
            timeout(RECV_TIMEOUT, self.stream.read(&mut scratch)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }

    pub async fn expect_connect(&mut self) -> Connect {
        match self.recv().await {
            Packet::Connect(connect) => *connect,
            other => panic!("Expected CONNECT, got {:?}", other),
        }
    }

    pub async fn publish(&mut self, topic: &str, payload: &'static [u8], qos: QoS, packet_id: Option<u16>) {
        self.send(&Packet::Publish(Publish {
            dup: false,
            qos,
            retain: false,
            topic: topic.to_string(),
            packet_id,
            payload: bytes::Bytes::from_static(payload),
        }))
        .await;
    }
}
