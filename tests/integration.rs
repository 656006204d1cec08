//! Integration tests for the relaymq broker
//!
//! These tests run the real TCP server and speak MQTT to it over sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use relaymq::broker::{Broker, BrokerConfig};
use relaymq::cluster::{ClusterConfig, ClusterLinks};
use relaymq::codec::{Encoder, PacketFramer};
use relaymq::protocol::{
    ConnAck, Connect, Disconnect, Packet, Properties, ProtocolVersion, PubAck, PubComp, PubRec,
    PubRel, Publish, QoS, ReasonCode, Subscribe, SubscribeFilter, SubscriptionOptions, Will,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_broker(config: BrokerConfig) -> (Arc<Broker>, SocketAddr) {
    let broker = Arc::new(Broker::new(config));
    let addr = serve(broker.clone()).await;
    (broker, addr)
}

async fn serve(broker: Arc<Broker>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(broker.serve(listener));
    addr
}

/// Helper struct for MQTT client operations in tests
struct TestClient {
    stream: TcpStream,
    encoder: Encoder,
    framer: PacketFramer,
    pending: Vec<Packet>,
}

impl TestClient {
    async fn open(addr: SocketAddr, version: ProtocolVersion) -> Self {
        let stream = TcpStream::connect(addr).await.expect("Failed to connect");
        let mut framer = PacketFramer::default();
        framer.pin(version);
        Self {
            stream,
            encoder: Encoder::new(version),
            framer,
            pending: Vec::new(),
        }
    }

    async fn connect(addr: SocketAddr, connect: Connect) -> (Self, ConnAck) {
        let mut client = Self::open(addr, connect.protocol_version).await;
        client.send(&Packet::Connect(Box::new(connect))).await;
        match client.recv().await {
            Some(Packet::ConnAck(ack)) => (client, ack),
            other => panic!("Expected CONNACK, got {:?}", other),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let mut buf = BytesMut::new();
        self.encoder.encode(packet, &mut buf).expect("Failed to encode");
        self.stream.write_all(&buf).await.expect("Failed to write");
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("Failed to write");
    }

    /// Next packet, or `None` on close or timeout
    async fn recv(&mut self) -> Option<Packet> {
        self.recv_within(RECV_TIMEOUT).await
    }

    async fn recv_within(&mut self, limit: Duration) -> Option<Packet> {
        let deadline = tokio::time::Instant::now() + limit;
        let mut buf = vec![0u8; 4096];
        loop {
            if !self.pending.is_empty() {
                return Some(self.pending.remove(0));
            }
            let read = tokio::time::timeout_at(deadline, self.stream.read(&mut buf)).await;
            match read {
                Ok(Ok(n)) if n > 0 => {
                    self.pending.extend(self.framer.feed(&buf[..n]).expect("Bad frame"));
                }
                _ => return None,
            }
        }
    }

    async fn recv_publish(&mut self) -> Publish {
        match self.recv().await {
            Some(Packet::Publish(publish)) => publish,
            other => panic!("Expected PUBLISH, got {:?}", other),
        }
    }

    async fn subscribe(&mut self, filter: &str, qos: QoS) {
        let subscribe = Subscribe {
            packet_id: 1,
            filters: vec![SubscribeFilter {
                filter: filter.to_string(),
                options: SubscriptionOptions {
                    qos,
                    ..Default::default()
                },
            }],
            properties: Properties::default(),
        };
        self.send(&Packet::Subscribe(subscribe)).await;
        match self.recv().await {
            Some(Packet::SubAck(ack)) => {
                assert_eq!(ack.reason_codes, vec![ReasonCode::granted(qos)]);
            }
            other => panic!("Expected SUBACK, got {:?}", other),
        }
    }

    async fn publish(&mut self, topic: &str, payload: &'static [u8], qos: QoS, retain: bool) {
        let publish = Publish {
            qos,
            retain,
            topic: Arc::from(topic),
            packet_id: (qos != QoS::AtMostOnce).then_some(1),
            payload: Bytes::from_static(payload),
            ..Default::default()
        };
        self.send(&Packet::Publish(publish)).await;
    }

    async fn disconnect(mut self) {
        self.send(&Packet::Disconnect(Disconnect::new(ReasonCode::Success)))
            .await;
    }
}

fn connect(version: ProtocolVersion, client_id: &str) -> Connect {
    Connect {
        protocol_version: version,
        client_id: client_id.to_string(),
        ..Default::default()
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_connect_both_generations() {
    let (broker, addr) = start_broker(BrokerConfig::default()).await;

    let (_v5, ack) = TestClient::connect(addr, connect(ProtocolVersion::V5, "v5")).await;
    assert_eq!(ack.reason_code, ReasonCode::Success);
    assert!(!ack.session_present);

    let (_v311, ack) = TestClient::connect(addr, connect(ProtocolVersion::V311, "v311")).await;
    assert_eq!(ack.reason_code, ReasonCode::Success);

    wait_until(|| broker.connection_count() == 2).await;
}

#[tokio::test]
async fn test_unsupported_protocol_level_refused() {
    let (_broker, addr) = start_broker(BrokerConfig::default()).await;
    let mut client = TestClient::open(addr, ProtocolVersion::V311).await;

    // CONNECT with protocol level 6
    client
        .send_raw(&[
            0x10, 13, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x06, 0x02, 0x00, 0x3C, 0x00, 0x01,
            b'c',
        ])
        .await;
    match client.recv().await {
        Some(Packet::ConnAck(ack)) => {
            assert_eq!(ack.reason_code, ReasonCode::UnsupportedProtocolVersion)
        }
        other => panic!("Expected CONNACK, got {:?}", other),
    }
    assert!(client.recv().await.is_none());
}

#[tokio::test]
async fn test_publish_between_generations() {
    let (_broker, addr) = start_broker(BrokerConfig::default()).await;

    let (mut sub, _) = TestClient::connect(addr, connect(ProtocolVersion::V311, "sub")).await;
    sub.subscribe("sensors/+/temp", QoS::AtLeastOnce).await;

    let (mut publisher, _) = TestClient::connect(addr, connect(ProtocolVersion::V5, "pub")).await;
    publisher
        .publish("sensors/kitchen/temp", b"21.5", QoS::AtLeastOnce, false)
        .await;
    assert_eq!(
        publisher.recv().await,
        Some(Packet::PubAck(PubAck::new(1)))
    );

    let received = sub.recv_publish().await;
    assert_eq!(&*received.topic, "sensors/kitchen/temp");
    assert_eq!(&received.payload[..], b"21.5");
    assert_eq!(received.qos, QoS::AtLeastOnce);
    let packet_id = received.packet_id.unwrap();
    sub.send(&Packet::PubAck(PubAck::new(packet_id))).await;
}

#[tokio::test]
async fn test_qos2_end_to_end() {
    let (_broker, addr) = start_broker(BrokerConfig::default()).await;

    let (mut sub, _) = TestClient::connect(addr, connect(ProtocolVersion::V5, "sub")).await;
    sub.subscribe("orders", QoS::ExactlyOnce).await;
    let (mut publisher, _) = TestClient::connect(addr, connect(ProtocolVersion::V5, "pub")).await;

    publisher.publish("orders", b"#1", QoS::ExactlyOnce, false).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubRec(PubRec::new(1))));
    publisher.send(&Packet::PubRel(PubRel::new(1))).await;
    assert_eq!(
        publisher.recv().await,
        Some(Packet::PubComp(PubComp::new(1)))
    );

    let received = sub.recv_publish().await;
    assert_eq!(received.qos, QoS::ExactlyOnce);
    let packet_id = received.packet_id.unwrap();
    sub.send(&Packet::PubRec(PubRec::new(packet_id))).await;
    assert_eq!(sub.recv().await, Some(Packet::PubRel(PubRel::new(packet_id))));
    sub.send(&Packet::PubComp(PubComp::new(packet_id))).await;
}

#[tokio::test]
async fn test_retained_message_for_late_subscriber() {
    let (broker, addr) = start_broker(BrokerConfig::default()).await;

    let (mut publisher, _) = TestClient::connect(addr, connect(ProtocolVersion::V5, "pub")).await;
    publisher.publish("config/mode", b"eco", QoS::AtMostOnce, true).await;
    publisher.disconnect().await;
    wait_until(|| broker.retained_count() == 1).await;

    let (mut late, _) = TestClient::connect(addr, connect(ProtocolVersion::V5, "late")).await;
    late.subscribe("config/#", QoS::AtLeastOnce).await;
    let received = late.recv_publish().await;
    assert!(received.retain);
    assert_eq!(&received.payload[..], b"eco");
}

#[tokio::test]
async fn test_will_on_abrupt_close() {
    let (_broker, addr) = start_broker(BrokerConfig::default()).await;

    let (mut watcher, _) = TestClient::connect(addr, connect(ProtocolVersion::V5, "watcher")).await;
    watcher.subscribe("status/+", QoS::AtMostOnce).await;

    let mut with_will = connect(ProtocolVersion::V311, "device");
    with_will.will = Some(Will {
        topic: Arc::from("status/device"),
        payload: Bytes::from_static(b"offline"),
        qos: QoS::AtMostOnce,
        retain: false,
        properties: Properties::default(),
    });
    let (device, _) = TestClient::connect(addr, with_will).await;
    drop(device);

    let will = watcher.recv_publish().await;
    assert_eq!(&*will.topic, "status/device");
    assert_eq!(&will.payload[..], b"offline");
}

#[tokio::test]
async fn test_session_takeover_over_tcp() {
    let (_broker, addr) = start_broker(BrokerConfig::default()).await;

    let (mut first, _) = TestClient::connect(addr, connect(ProtocolVersion::V5, "dup")).await;
    let (_second, ack) = TestClient::connect(addr, connect(ProtocolVersion::V5, "dup")).await;
    assert_eq!(ack.reason_code, ReasonCode::Success);

    assert_eq!(
        first.recv().await,
        Some(Packet::Disconnect(Disconnect::new(ReasonCode::SessionTakenOver)))
    );
    assert!(first.recv().await.is_none());
}

#[tokio::test]
async fn test_ping() {
    let (_broker, addr) = start_broker(BrokerConfig::default()).await;
    let (mut client, _) = TestClient::connect(addr, connect(ProtocolVersion::V5, "pinger")).await;
    client.send(&Packet::PingReq).await;
    assert_eq!(client.recv().await, Some(Packet::PingResp));
}

#[tokio::test]
async fn test_keep_alive_timeout_closes_connection() {
    let config = BrokerConfig {
        tick_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let (_broker, addr) = start_broker(config).await;

    let mut idle = connect(ProtocolVersion::V5, "idle");
    idle.keep_alive = 1;
    let (mut client, _) = TestClient::connect(addr, idle).await;
    assert_eq!(
        client.recv_within(Duration::from_secs(4)).await,
        Some(Packet::Disconnect(Disconnect::new(ReasonCode::KeepAliveTimeout)))
    );
}

#[tokio::test]
async fn test_connect_timeout() {
    let config = BrokerConfig {
        connect_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let (_broker, addr) = start_broker(config).await;
    let mut silent = TestClient::open(addr, ProtocolVersion::V5).await;
    let closed = timeout(Duration::from_secs(2), silent.recv()).await;
    assert!(matches!(closed, Ok(None)));
}

#[tokio::test]
async fn test_shutdown_disconnects_clients() {
    let (broker, addr) = start_broker(BrokerConfig::default()).await;
    let (mut client, _) = TestClient::connect(addr, connect(ProtocolVersion::V5, "c1")).await;
    wait_until(|| broker.connection_count() == 1).await;

    broker.shutdown(std::time::Instant::now());
    assert_eq!(
        client.recv().await,
        Some(Packet::Disconnect(Disconnect::new(ReasonCode::ServerShuttingDown)))
    );
}

#[tokio::test]
async fn test_cluster_relays_publishes_and_retained() {
    // Bind both cluster listeners first so each node knows the other's address
    let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let cluster_a = listener_a.local_addr().unwrap();
    let cluster_b = listener_b.local_addr().unwrap();

    let node = |node_id: &str, peer: SocketAddr| {
        let (tx, rx) = mpsc::unbounded_channel();
        let broker = Arc::new(
            Broker::new(BrokerConfig {
                node_id: node_id.to_string(),
                ..Default::default()
            })
            .with_replication(tx),
        );
        let cluster = ClusterConfig {
            enabled: true,
            node_id: Some(node_id.to_string()),
            peers: vec![peer.to_string()],
            reconnect_min: Duration::from_millis(50),
            reconnect_max: Duration::from_millis(200),
            ..Default::default()
        };
        (broker.clone(), ClusterLinks::new(cluster, broker), rx)
    };
    let (broker_a, links_a, rx_a) = node("a", cluster_b);
    let (broker_b, links_b, rx_b) = node("b", cluster_a);

    // Retained before the link is up travels in the snapshot
    let (mut early, _) = TestClient::connect(
        serve(broker_a.clone()).await,
        connect(ProtocolVersion::V5, "early"),
    )
    .await;
    early.publish("fleet/config", b"v1", QoS::AtMostOnce, true).await;
    wait_until(|| broker_a.retained_count() == 1).await;

    links_a.start_with_listener(listener_a, rx_a);
    links_b.start_with_listener(listener_b, rx_b);
    wait_until(|| links_a.connected_peers() == 1 && links_b.connected_peers() == 1).await;
    wait_until(|| broker_b.retained_count() == 1).await;

    let addr_b = serve(broker_b.clone()).await;
    let (mut sub, _) = TestClient::connect(addr_b, connect(ProtocolVersion::V5, "sub")).await;
    sub.subscribe("fleet/#", QoS::AtMostOnce).await;
    let retained = sub.recv_publish().await;
    assert_eq!(&retained.payload[..], b"v1");

    early.publish("fleet/truck1", b"moving", QoS::AtMostOnce, false).await;
    let relayed = sub.recv_publish().await;
    assert_eq!(&*relayed.topic, "fleet/truck1");
    assert_eq!(&relayed.payload[..], b"moving");

    // Delivered once: b does not relay a relayed message back to a
    assert!(sub.recv_within(Duration::from_millis(300)).await.is_none());
}
