//! Integration tests
//!
//! Each test starts a real broker on a loopback port and drives it with raw
//! MQTT v3.1.1 clients, validating the protocol flows end to end.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use driftmq::broker::{Broker, BrokerConfig};
use driftmq::codec::{Decoder, Encoder};
use driftmq::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, ProtocolVersion, PubAck, PubComp, PubRec, PubRel,
    Publish, QoS, SubAck, SubAckCode, Subscribe, SubscribeFilter, Unsubscribe, Will,
};
use driftmq::scripts::{
    Script, ScriptInitOutputs, ScriptInitReturn, ScriptRunInput, ScriptRunOutputs, ScriptRunType,
    SyncAction,
};

// Atomic port counter to avoid port conflicts between tests
static PORT_COUNTER: AtomicU16 = AtomicU16::new(19300);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Start a broker on a fresh loopback port
async fn start_broker() -> (SocketAddr, Arc<Broker>) {
    let addr = SocketAddr::from(([127, 0, 0, 1], next_port()));
    let config = BrokerConfig {
        bind_addr: addr,
        max_connections: 100,
        cleanup_interval: Duration::from_millis(100),
        sync_script_timeout: Duration::from_secs(2),
        ..BrokerConfig::default()
    };
    let broker = Arc::new(Broker::new(config));

    let runner = broker.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    // wait until the listener accepts
    for _ in 0..50 {
        if TcpStream::connect(addr).await.is_ok() {
            return (addr, broker);
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("broker did not start on {}", addr);
}

/// Raw MQTT client helper
struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("failed to connect");
        Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let mut out = BytesMut::new();
        Encoder::new().encode(packet, &mut out).expect("encode");
        self.stream.write_all(&out).await.expect("write");
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write raw");
    }

    /// Receive one packet within `wait`; `None` on timeout or closed socket
    async fn recv_within(&mut self, wait: Duration) -> Option<Packet> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some((packet, consumed)) = Decoder::new().decode(&self.buf).ok()? {
                self.buf.advance(consumed);
                return Some(packet);
            }

            let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
            match timeout(remaining, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(0)) => return None,
                Ok(Ok(_)) => continue,
                _ => return None,
            }
        }
    }

    async fn recv(&mut self) -> Option<Packet> {
        self.recv_within(Duration::from_secs(5)).await
    }

    /// Assert silence for a short window
    async fn expect_nothing(&mut self) {
        let packet = self.recv_within(Duration::from_millis(300)).await;
        assert!(packet.is_none(), "expected no packet, got {:?}", packet);
    }

    /// True if the broker closed the connection without sending anything
    async fn is_closed(&mut self) -> bool {
        self.recv_within(Duration::from_secs(2)).await.is_none()
    }

    async fn mqtt_connect(&mut self, client_id: &str, clean_session: bool) -> ConnAck {
        self.mqtt_connect_with(Connect {
            client_id: client_id.to_string(),
            clean_session,
            ..Connect::default()
        })
        .await
    }

    async fn mqtt_connect_with(&mut self, connect: Connect) -> ConnAck {
        self.send(&Packet::Connect(Box::new(connect))).await;
        match self.recv().await {
            Some(Packet::ConnAck(ack)) => ack,
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    async fn subscribe(&mut self, packet_id: u16, filter: &str, qos: QoS) -> SubAck {
        self.send(&Packet::Subscribe(Subscribe {
            packet_id,
            filters: vec![SubscribeFilter {
                filter: filter.to_string(),
                qos,
            }],
        }))
        .await;
        match self.recv().await {
            Some(Packet::SubAck(ack)) => ack,
            other => panic!("expected SUBACK, got {:?}", other),
        }
    }

    async fn publish_qos0(&mut self, topic: &str, payload: &str, retain: bool) {
        self.send(&Packet::Publish(Publish {
            qos: QoS::AtMostOnce,
            retain,
            topic: topic.to_string(),
            payload: Bytes::from(payload.to_string()),
            ..Publish::default()
        }))
        .await;
    }

    /// QoS 1 publish including the PUBACK exchange
    async fn publish_qos1(&mut self, topic: &str, payload: &str, packet_id: u16) {
        self.send(&Packet::Publish(Publish {
            qos: QoS::AtLeastOnce,
            topic: topic.to_string(),
            packet_id: Some(packet_id),
            payload: Bytes::from(payload.to_string()),
            ..Publish::default()
        }))
        .await;
        match self.recv().await {
            Some(Packet::PubAck(ack)) => assert_eq!(ack.packet_id, packet_id),
            other => panic!("expected PUBACK, got {:?}", other),
        }
    }

    async fn expect_publish(&mut self) -> Publish {
        match self.recv().await {
            Some(Packet::Publish(publish)) => publish,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    async fn disconnect(mut self) {
        self.send(&Packet::Disconnect).await;
        let _ = self.stream.shutdown().await;
    }
}

// ============================================================================
// Connection basics
// ============================================================================

#[tokio::test]
async fn test_connect_and_ping() {
    let (addr, _broker) = start_broker().await;

    let mut client = TestClient::connect(addr).await;
    let ack = client.mqtt_connect("pinger", true).await;
    assert_eq!(ack.return_code, ConnectReturnCode::Accepted);
    assert!(!ack.session_present);

    client.send(&Packet::PingReq).await;
    assert_eq!(client.recv().await, Some(Packet::PingResp));
}

#[tokio::test]
async fn test_unsupported_protocol_level_gets_connack_then_close() {
    let (addr, _broker) = start_broker().await;

    let mut client = TestClient::connect(addr).await;
    // CONNECT with protocol name "MQTT" but level 5
    client
        .send_raw(&[
            0x10, 0x0C, //
            0x00, 0x04, b'M', b'Q', b'T', b'T', //
            0x05, 0x02, 0x00, 0x3C, 0x00, 0x00,
        ])
        .await;

    match client.recv().await {
        Some(Packet::ConnAck(ack)) => {
            assert_eq!(
                ack.return_code,
                ConnectReturnCode::UnacceptableProtocolVersion
            );
        }
        other => panic!("expected CONNACK refusal, got {:?}", other),
    }
    assert!(client.is_closed().await);
}

#[tokio::test]
async fn test_malformed_packet_closes_without_response() {
    let (addr, _broker) = start_broker().await;

    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("framing", true).await;

    // reserved packet type 15
    client.send_raw(&[0xF0, 0x00]).await;
    assert!(client.is_closed().await);
}

#[tokio::test]
async fn test_publish_before_connect_drops_connection() {
    let (addr, _broker) = start_broker().await;

    let mut client = TestClient::connect(addr).await;
    client.publish_qos0("too/early", "x", false).await;
    assert!(client.is_closed().await);
}

#[tokio::test]
async fn test_empty_client_id_requires_clean_session() {
    let (addr, _broker) = start_broker().await;

    let mut client = TestClient::connect(addr).await;
    let ack = client.mqtt_connect("", false).await;
    assert_eq!(ack.return_code, ConnectReturnCode::IdentifierRejected);
    assert!(client.is_closed().await);

    let mut client = TestClient::connect(addr).await;
    let ack = client.mqtt_connect("", true).await;
    assert_eq!(ack.return_code, ConnectReturnCode::Accepted);
}

// ============================================================================
// Scenario: retained replay with QoS downgrade
// ============================================================================

#[tokio::test]
async fn test_retained_message_replayed_to_new_subscriber() {
    let (addr, _broker) = start_broker().await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("a", true).await;
    publisher.publish_qos0("room/temp", "22", true).await;
    publisher.disconnect().await;

    // give the async publish a moment to land in the retained store
    sleep(Duration::from_millis(100)).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("b", true).await;
    let ack = subscriber.subscribe(1, "room/+", QoS::AtLeastOnce).await;
    assert_eq!(ack.return_codes, vec![SubAckCode::GrantedQoS1]);

    let publish = subscriber.expect_publish().await;
    assert_eq!(publish.topic, "room/temp");
    assert_eq!(publish.payload, Bytes::from("22"));
    assert!(publish.retain);
    // downgraded to the original publish QoS
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert!(publish.packet_id.is_none());

    subscriber.expect_nothing().await;
}

#[tokio::test]
async fn test_empty_retained_payload_clears_entry() {
    let (addr, broker) = start_broker().await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("clearer", true).await;
    publisher.publish_qos0("room/temp", "22", true).await;
    publisher.publish_qos0("room/temp", "", true).await;
    sleep(Duration::from_millis(100)).await;

    assert_eq!(broker.retained_count(), 0);

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("checker", true).await;
    subscriber.subscribe(1, "room/+", QoS::AtMostOnce).await;
    subscriber.expect_nothing().await;
}

// ============================================================================
// Scenario: wildcard vs omni with $-topics
// ============================================================================

#[tokio::test]
async fn test_omni_skips_dollar_topics() {
    let (addr, _broker) = start_broker().await;

    let mut omni = TestClient::connect(addr).await;
    omni.mqtt_connect("x", true).await;
    omni.subscribe(1, "#", QoS::AtMostOnce).await;

    let mut sys = TestClient::connect(addr).await;
    sys.mqtt_connect("y", true).await;
    sys.subscribe(1, "$SYS/#", QoS::AtMostOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("pub", true).await;

    publisher.publish_qos0("a/b", "plain", false).await;
    let publish = omni.expect_publish().await;
    assert_eq!(publish.topic, "a/b");
    sys.expect_nothing().await;

    publisher.publish_qos0("$SYS/load", "0.5", false).await;
    let publish = sys.expect_publish().await;
    assert_eq!(publish.topic, "$SYS/load");
    omni.expect_nothing().await;
}

// ============================================================================
// Scenario: Sync script aborts delivery
// ============================================================================

/// Sync script vetoing publishes whose payload is "no"
struct GateScript;

impl Script for GateScript {
    fn init(&mut self, out: ScriptInitOutputs) {
        (out.success)(ScriptInitReturn {
            run_type: ScriptRunType::Sync,
        });
    }

    fn run(&self, input: ScriptRunInput, out: ScriptRunOutputs) {
        if input.payload.as_ref() == b"no" {
            (out.sync_action)(SyncAction::AbortPublish);
        }
        (out.success)();
    }

    fn force_quit(&self) {}
}

#[tokio::test]
async fn test_sync_script_abort_suppresses_delivery_and_retain() {
    let (addr, broker) = start_broker().await;

    broker.add_script("gatekeeper", Box::new(|| Box::new(GateScript)));
    broker.subscribe_script("gatekeeper", "gate/#");
    sleep(Duration::from_millis(100)).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("c", true).await;
    subscriber.subscribe(1, "gate/open", QoS::AtMostOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("pub", true).await;

    publisher.publish_qos0("gate/open", "no", true).await;
    subscriber.expect_nothing().await;
    assert_eq!(broker.retained_count(), 0);

    publisher.publish_qos0("gate/open", "yes", false).await;
    let publish = subscriber.expect_publish().await;
    assert_eq!(publish.payload, Bytes::from("yes"));
}

// ============================================================================
// Scenario: session resume
// ============================================================================

#[tokio::test]
async fn test_session_resume_without_offline_replay() {
    let (addr, _broker) = start_broker().await;

    let mut client = TestClient::connect(addr).await;
    let ack = client.mqtt_connect("s", false).await;
    assert!(!ack.session_present);
    client.subscribe(1, "a/+", QoS::AtLeastOnce).await;
    client.disconnect().await;
    sleep(Duration::from_millis(100)).await;

    // published while "s" is away; not queued for it
    let mut other = TestClient::connect(addr).await;
    other.mqtt_connect("other", true).await;
    other.publish_qos1("a/b", "hi", 1).await;

    let mut client = TestClient::connect(addr).await;
    let ack = client.mqtt_connect("s", false).await;
    assert!(ack.session_present);
    // the subscription is restored, but the missed message is gone
    client.expect_nothing().await;

    // new publishes arrive through the restored subscription
    other.publish_qos1("a/b", "again", 2).await;
    let publish = client.expect_publish().await;
    assert_eq!(publish.payload, Bytes::from("again"));
    assert_eq!(publish.qos, QoS::AtLeastOnce);
}

#[tokio::test]
async fn test_clean_session_forgets_subscriptions() {
    let (addr, _broker) = start_broker().await;

    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("wipe", false).await;
    client.subscribe(1, "a/+", QoS::AtLeastOnce).await;
    client.disconnect().await;
    sleep(Duration::from_millis(100)).await;

    let mut client = TestClient::connect(addr).await;
    let ack = client.mqtt_connect("wipe", true).await;
    assert!(!ack.session_present);

    let mut other = TestClient::connect(addr).await;
    other.mqtt_connect("other", true).await;
    other.publish_qos0("a/b", "hi", false).await;

    client.expect_nothing().await;
}

// ============================================================================
// Scenario: duplicate client id
// ============================================================================

#[tokio::test]
async fn test_duplicate_client_id_deposes_first_connection() {
    let (addr, _broker) = start_broker().await;

    let mut watcher = TestClient::connect(addr).await;
    watcher.mqtt_connect("watcher", true).await;
    watcher.subscribe(1, "will/+", QoS::AtMostOnce).await;

    let mut first = TestClient::connect(addr).await;
    first
        .mqtt_connect_with(Connect {
            client_id: "x".to_string(),
            clean_session: true,
            will: Some(Will {
                topic: "will/x".to_string(),
                payload: Bytes::from("gone"),
                qos: QoS::AtMostOnce,
                retain: false,
            }),
            ..Connect::default()
        })
        .await;

    let mut second = TestClient::connect(addr).await;
    let ack = second.mqtt_connect("x", true).await;
    assert_eq!(ack.return_code, ConnectReturnCode::Accepted);

    // the first holder was logged out, its will published
    let publish = watcher.expect_publish().await;
    assert_eq!(publish.topic, "will/x");
    assert_eq!(publish.payload, Bytes::from("gone"));
    assert!(first.is_closed().await);
}

#[tokio::test]
async fn test_will_published_on_abrupt_close() {
    let (addr, _broker) = start_broker().await;

    let mut watcher = TestClient::connect(addr).await;
    watcher.mqtt_connect("watcher", true).await;
    watcher.subscribe(1, "status/+", QoS::AtMostOnce).await;

    let mut doomed = TestClient::connect(addr).await;
    doomed
        .mqtt_connect_with(Connect {
            client_id: "doomed".to_string(),
            clean_session: true,
            will: Some(Will {
                topic: "status/doomed".to_string(),
                payload: Bytes::from("offline"),
                qos: QoS::AtMostOnce,
                retain: false,
            }),
            ..Connect::default()
        })
        .await;

    // drop the socket without DISCONNECT
    drop(doomed);

    let publish = watcher.expect_publish().await;
    assert_eq!(publish.topic, "status/doomed");
    assert_eq!(publish.payload, Bytes::from("offline"));
}

#[tokio::test]
async fn test_graceful_disconnect_discards_will() {
    let (addr, _broker) = start_broker().await;

    let mut watcher = TestClient::connect(addr).await;
    watcher.mqtt_connect("watcher", true).await;
    watcher.subscribe(1, "status/+", QoS::AtMostOnce).await;

    let mut polite = TestClient::connect(addr).await;
    polite
        .mqtt_connect_with(Connect {
            client_id: "polite".to_string(),
            clean_session: true,
            will: Some(Will {
                topic: "status/polite".to_string(),
                payload: Bytes::from("offline"),
                qos: QoS::AtMostOnce,
                retain: false,
            }),
            ..Connect::default()
        })
        .await;

    polite.disconnect().await;

    watcher.expect_nothing().await;
}

// ============================================================================
// Scenario: QoS downgrade and handshakes
// ============================================================================

#[tokio::test]
async fn test_qos_downgrade_to_granted_level() {
    let (addr, _broker) = start_broker().await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("low", true).await;
    let ack = subscriber.subscribe(1, "data", QoS::AtMostOnce).await;
    assert_eq!(ack.return_codes, vec![SubAckCode::GrantedQoS0]);

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("high", true).await;

    // publisher's own QoS 2 handshake proceeds regardless
    publisher
        .send(&Packet::Publish(Publish {
            qos: QoS::ExactlyOnce,
            topic: "data".to_string(),
            packet_id: Some(5),
            payload: Bytes::from("v"),
            ..Publish::default()
        }))
        .await;
    assert_eq!(
        publisher.recv().await,
        Some(Packet::PubRec(PubRec { packet_id: 5 }))
    );
    publisher.send(&Packet::PubRel(PubRel { packet_id: 5 })).await;
    assert_eq!(
        publisher.recv().await,
        Some(Packet::PubComp(PubComp { packet_id: 5 }))
    );

    // the subscriber sees QoS 0, no packet id, no ack exchange
    let publish = subscriber.expect_publish().await;
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert!(publish.packet_id.is_none());
    assert_eq!(publish.payload, Bytes::from("v"));
}

#[tokio::test]
async fn test_qos1_delivery_with_puback() {
    let (addr, _broker) = start_broker().await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("q1sub", true).await;
    subscriber.subscribe(1, "data", QoS::AtLeastOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("q1pub", true).await;
    publisher.publish_qos1("data", "hello", 7).await;

    let publish = subscriber.expect_publish().await;
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    let packet_id = publish.packet_id.expect("QoS 1 delivery carries an id");

    // ack it; the broker must not redeliver
    subscriber
        .send(&Packet::PubAck(PubAck { packet_id }))
        .await;
    subscriber.expect_nothing().await;
}

#[tokio::test]
async fn test_qos2_duplicate_publish_dispatched_once() {
    let (addr, _broker) = start_broker().await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("q2sub", true).await;
    subscriber.subscribe(1, "data", QoS::AtMostOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("q2pub", true).await;

    let duplicate = Packet::Publish(Publish {
        qos: QoS::ExactlyOnce,
        topic: "data".to_string(),
        packet_id: Some(9),
        payload: Bytes::from("once"),
        ..Publish::default()
    });

    // same packet id twice before PUBREL
    publisher.send(&duplicate).await;
    assert_eq!(
        publisher.recv().await,
        Some(Packet::PubRec(PubRec { packet_id: 9 }))
    );
    publisher.send(&duplicate).await;
    assert_eq!(
        publisher.recv().await,
        Some(Packet::PubRec(PubRec { packet_id: 9 }))
    );

    publisher.send(&Packet::PubRel(PubRel { packet_id: 9 })).await;
    assert_eq!(
        publisher.recv().await,
        Some(Packet::PubComp(PubComp { packet_id: 9 }))
    );

    // dispatched exactly once
    let publish = subscriber.expect_publish().await;
    assert_eq!(publish.payload, Bytes::from("once"));
    subscriber.expect_nothing().await;
}

// ============================================================================
// Subscriptions
// ============================================================================

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (addr, _broker) = start_broker().await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("unsub", true).await;
    subscriber.subscribe(1, "a/+", QoS::AtMostOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("pub", true).await;
    publisher.publish_qos0("a/b", "first", false).await;
    assert_eq!(
        subscriber.expect_publish().await.payload,
        Bytes::from("first")
    );

    subscriber
        .send(&Packet::Unsubscribe(Unsubscribe {
            packet_id: 2,
            filters: vec!["a/+".to_string()],
        }))
        .await;
    match subscriber.recv().await {
        Some(Packet::UnsubAck(ack)) => assert_eq!(ack.packet_id, 2),
        other => panic!("expected UNSUBACK, got {:?}", other),
    }

    publisher.publish_qos0("a/b", "second", false).await;
    subscriber.expect_nothing().await;
}

#[tokio::test]
async fn test_invalid_filter_gets_failure_code() {
    let (addr, _broker) = start_broker().await;

    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("badfilter", true).await;

    client
        .send(&Packet::Subscribe(Subscribe {
            packet_id: 3,
            filters: vec![
                SubscribeFilter {
                    filter: "ok/+".to_string(),
                    qos: QoS::AtLeastOnce,
                },
                SubscribeFilter {
                    filter: "bad/#/tail".to_string(),
                    qos: QoS::AtMostOnce,
                },
            ],
        }))
        .await;

    match client.recv().await {
        Some(Packet::SubAck(ack)) => {
            assert_eq!(
                ack.return_codes,
                vec![SubAckCode::GrantedQoS1, SubAckCode::Failure]
            );
        }
        other => panic!("expected SUBACK, got {:?}", other),
    }
}

#[tokio::test]
async fn test_publisher_ordering_preserved_per_subscriber() {
    let (addr, _broker) = start_broker().await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("ordered", true).await;
    subscriber.subscribe(1, "seq", QoS::AtMostOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("seq-pub", true).await;
    for i in 0..20 {
        publisher.publish_qos0("seq", &i.to_string(), false).await;
    }

    for i in 0..20 {
        let publish = subscriber.expect_publish().await;
        assert_eq!(publish.payload, Bytes::from(i.to_string()));
    }
}

#[tokio::test]
async fn test_mqtt_v31_client_accepted() {
    let (addr, _broker) = start_broker().await;

    let mut client = TestClient::connect(addr).await;
    let ack = client
        .mqtt_connect_with(Connect {
            protocol_version: ProtocolVersion::V31,
            client_id: "legacy".to_string(),
            clean_session: true,
            ..Connect::default()
        })
        .await;
    assert_eq!(ack.return_code, ConnectReturnCode::Accepted);

    client.send(&Packet::PingReq).await;
    assert_eq!(client.recv().await, Some(Packet::PingResp));
}
