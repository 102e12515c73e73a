//! End-to-end session tests: `Client` + `WireEngine` against the scripted
//! broker

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio::time::timeout;

use common::TestBroker;
use lwmqtt::protocol::{Packet, Publish, SubAck, SubAckReturnCode};
use lwmqtt::{
    BrokerConfig, Client, ClientConfig, ClientError, Config, ConnectOptions, ConnectReturnCode,
    EngineError, HandlerError, HandlerResult, LoopOutcome, QoS, SessionHooks, SessionState,
};

fn config(client_id: &str) -> ClientConfig {
    ClientConfig {
        cycle_timeout: Duration::from_millis(50),
        command_timeout: Duration::from_secs(2),
        ..ClientConfig::new(client_id)
    }
}

fn options(broker: &TestBroker) -> ConnectOptions {
    ConnectOptions::new("127.0.0.1", 30).port(broker.port)
}

type Inbox = mpsc::UnboundedReceiver<(String, Bytes)>;

fn forwarder() -> (impl lwmqtt::MessageHandler + 'static, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |_: &Client, topic: &str, payload: &Bytes| -> HandlerResult {
        tx.send((topic.to_string(), payload.clone()))
            .map_err(|e| HandlerError::new(e.to_string()))
    };
    (handler, rx)
}

async fn answer_subscribe(peer: &mut common::BrokerPeer) -> Vec<String> {
    match peer.recv().await {
        Packet::Subscribe(subscribe) => {
            peer.send(&Packet::SubAck(SubAck {
                packet_id: subscribe.packet_id,
                return_codes: subscribe
                    .filters
                    .iter()
                    .map(|(_, qos)| SubAckReturnCode::Granted(*qos))
                    .collect(),
            }))
            .await;
            subscribe.filters.into_iter().map(|(f, _)| f).collect()
        }
        other => panic!("Expected SUBSCRIBE, got {:?}", other),
    }
}

#[tokio::test]
async fn test_full_session_roundtrip() {
    common::init_tracing();
    let broker = TestBroker::bind().await;
    let client = Client::with_wire_engine(config("roundtrip"));

    let (code, (mut peer, connect)) = tokio::join!(
        client.connect(options(&broker)),
        broker.accept_session(ConnectReturnCode::Accepted)
    );
    assert_eq!(code.unwrap(), ConnectReturnCode::Accepted);
    assert_eq!(connect.client_id, "roundtrip");
    assert!(client.connected());
    assert!(client.is_loop_running());

    let (handler, mut inbox) = forwarder();
    let (granted, filters) = tokio::join!(
        client.subscribe("room/+/temp", handler, QoS::AtLeastOnce),
        answer_subscribe(&mut peer)
    );
    assert_eq!(granted.unwrap(), QoS::AtLeastOnce);
    assert_eq!(filters, vec!["room/+/temp"]);

    peer.publish("room/1/temp", b"21.5", QoS::AtLeastOnce, Some(10))
        .await;
    let (topic, payload) = timeout(Duration::from_secs(5), inbox.recv())
        .await
        .expect("handler not invoked")
        .expect("inbox closed");
    assert_eq!(topic, "room/1/temp");
    assert_eq!(payload, Bytes::from_static(b"21.5"));
    assert_eq!(peer.recv().await, Packet::PubAck(10));

    let (published, ()) = tokio::join!(
        client.publish("room/1/setpoint", "19", QoS::AtLeastOnce, false),
        async {
            match peer.recv().await {
                Packet::Publish(publish) => {
                    assert_eq!(publish.topic, "room/1/setpoint");
                    peer.send(&Packet::PubAck(publish.packet_id.unwrap())).await;
                }
                other => panic!("Expected PUBLISH, got {:?}", other),
            }
        }
    );
    published.unwrap();

    client.disconnect(Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(peer.recv().await, Packet::Disconnect);
    assert_eq!(client.state(), SessionState::Disconnected);
    assert!(!client.is_loop_running());
}

#[tokio::test]
async fn test_bad_credentials_refused() {
    common::init_tracing();
    let broker = TestBroker::bind().await;
    let client = Client::with_wire_engine(config("refused"));
    client.set_credentials("user", Some("wrong"));

    let (result, (mut peer, connect)) = tokio::join!(
        client.connect(options(&broker)),
        broker.accept_session(ConnectReturnCode::RefusedBadCredentials)
    );

    assert!(matches!(
        result,
        Err(ClientError::ConnectRefused(
            ConnectReturnCode::RefusedBadCredentials
        ))
    ));
    assert_eq!(connect.username.as_deref(), Some("user"));
    assert_eq!(client.state(), SessionState::Disconnected);
    assert!(!client.is_loop_running());
    assert!(peer.closed().await);
}

struct Resubscribe;

#[async_trait]
impl SessionHooks for Resubscribe {
    async fn after_connect(&self, client: &Client) {
        if let Err(e) = client.resubscribe().await {
            panic!("resubscribe failed: {}", e);
        }
    }
}

#[tokio::test]
async fn test_reconnect_restores_subscriptions_through_hook() {
    common::init_tracing();
    let broker = TestBroker::bind().await;
    let client = Client::with_wire_engine(config("reconnect"));

    let (code, (mut first, _)) = tokio::join!(
        client.connect(options(&broker).hooks(Resubscribe)),
        broker.accept_session(ConnectReturnCode::Accepted)
    );
    code.unwrap();

    let (handler, mut inbox) = forwarder();
    let (subscribed, _) = tokio::join!(
        client.subscribe("alerts/#", handler, QoS::AtMostOnce),
        answer_subscribe(&mut first)
    );
    subscribed.unwrap();

    let (code, (mut second, filters)) = tokio::join!(client.reconnect(), async {
        let (mut peer, _) = broker.accept_session(ConnectReturnCode::Accepted).await;
        let filters = answer_subscribe(&mut peer).await;
        (peer, filters)
    });
    assert_eq!(code.unwrap(), ConnectReturnCode::Accepted);
    assert_eq!(filters, vec!["alerts/#"]);
    assert_eq!(client.subscriptions(), vec!["alerts/#"]);
    assert_eq!(first.recv().await, Packet::Disconnect);

    second.publish("alerts/fire", b"!", QoS::AtMostOnce, None).await;
    let (topic, _) = timeout(Duration::from_secs(5), inbox.recv())
        .await
        .expect("handler not invoked after reconnect")
        .expect("inbox closed");
    assert_eq!(topic, "alerts/fire");

    client.disconnect(Some(Duration::from_secs(5))).await.unwrap();
}

#[derive(Default)]
struct ReconnectOnFailure {
    failures: AtomicUsize,
}

#[async_trait]
impl SessionHooks for ReconnectOnFailure {
    async fn on_loop_failure(&self, client: &Client, error: &EngineError) -> LoopOutcome {
        assert!(matches!(error, EngineError::ConnectionLost));
        self.failures.fetch_add(1, Ordering::SeqCst);
        match client.reconnect().await {
            Ok(ConnectReturnCode::Accepted) => LoopOutcome::Recovered,
            _ => LoopOutcome::BreakLoop,
        }
    }
}

#[tokio::test]
async fn test_hook_recovers_from_broker_hangup() {
    common::init_tracing();
    let broker = TestBroker::bind().await;
    let client = Client::with_wire_engine(config("recovering"));
    let hooks = Arc::new(ReconnectOnFailure::default());

    let (code, (first, _)) = tokio::join!(
        client.connect(options(&broker).hooks(hooks.clone())),
        broker.accept_session(ConnectReturnCode::Accepted)
    );
    code.unwrap();

    drop(first);
    let (_second, _) = broker.accept_session(ConnectReturnCode::Accepted).await;

    timeout(Duration::from_secs(5), async {
        while !client.connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client did not reconnect");

    assert_eq!(hooks.failures.load(Ordering::SeqCst), 1);
    assert!(client.is_loop_running());
    client.disconnect(Some(Duration::from_secs(5))).await.unwrap();
}

#[tokio::test]
async fn test_broker_hangup_ends_loop_by_default() {
    common::init_tracing();
    let broker = TestBroker::bind().await;
    let client = Client::with_wire_engine(config("hangup"));

    let (code, (peer, _)) = tokio::join!(
        client.connect(options(&broker)),
        broker.accept_session(ConnectReturnCode::Accepted)
    );
    code.unwrap();
    drop(peer);

    let result = timeout(Duration::from_secs(5), client.take_loop_handle().unwrap())
        .await
        .expect("loop did not stop")
        .unwrap();

    assert!(matches!(
        result,
        Err(ClientError::Engine(EngineError::ConnectionLost))
    ));
    assert_eq!(client.state(), SessionState::Disconnected);
    assert!(!client.connected());
    assert!(matches!(
        client.publish("late", "x", QoS::AtMostOnce, false).await,
        Err(ClientError::NotConnected)
    ));
}

#[tokio::test]
async fn test_retained_message_behind_suback_reaches_handler() {
    common::init_tracing();
    let broker = TestBroker::bind().await;
    let client = Client::with_wire_engine(config("retained"));

    let (code, (mut peer, _)) = tokio::join!(
        client.connect(options(&broker)),
        broker.accept_session(ConnectReturnCode::Accepted)
    );
    code.unwrap();
    // let the loop settle into its read
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (handler, mut inbox) = forwarder();
    let (granted, ()) = tokio::join!(
        client.subscribe("status/#", handler, QoS::AtLeastOnce),
        async {
            let packet_id = match peer.recv().await {
                Packet::Subscribe(subscribe) => subscribe.packet_id,
                other => panic!("Expected SUBSCRIBE, got {:?}", other),
            };
            peer.send_batch(&[
                Packet::SubAck(SubAck {
                    packet_id,
                    return_codes: vec![SubAckReturnCode::Granted(QoS::AtLeastOnce)],
                }),
                Packet::Publish(Publish {
                    dup: false,
                    qos: QoS::AtLeastOnce,
                    retain: true,
                    topic: "status/a".to_string(),
                    packet_id: Some(1),
                    payload: Bytes::from_static(b"online"),
                }),
            ])
            .await;
        }
    );
    assert_eq!(granted.unwrap(), QoS::AtLeastOnce);

    let (topic, payload) = timeout(Duration::from_secs(5), inbox.recv())
        .await
        .expect("retained message dropped")
        .expect("inbox closed");
    assert_eq!(topic, "status/a");
    assert_eq!(payload, Bytes::from_static(b"online"));
    assert_eq!(peer.recv().await, Packet::PubAck(1));

    client.disconnect(Some(Duration::from_secs(5))).await.unwrap();
}

#[tokio::test]
async fn test_from_config_sends_configured_credentials() {
    common::init_tracing();
    let broker = TestBroker::bind().await;
    let config = Config {
        client: config("configured"),
        broker: BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: broker.port,
            username: Some("svc".to_string()),
            password: Some("hunter2".to_string()),
            ..Default::default()
        },
    };
    let client = Client::from_config(&config);

    let (code, (_peer, connect)) = tokio::join!(
        client.connect(ConnectOptions::from(&config.broker).start_loop(false)),
        broker.accept_session(ConnectReturnCode::Accepted)
    );
    code.unwrap();

    assert_eq!(connect.client_id, "configured");
    assert_eq!(connect.username.as_deref(), Some("svc"));
    assert_eq!(connect.password, Some(Bytes::from_static(b"hunter2")));
    client.disconnect(Some(Duration::from_secs(5))).await.unwrap();
}
