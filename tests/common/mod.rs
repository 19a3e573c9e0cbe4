//! Shared helpers: a raw-socket MQTT test client and bridge startup glue.

#![allow(dead_code)]

use mqtt_nats::bridge::{BridgeConfig, BridgeServer};
use mqtt_nats::packet::{self, ConnAckPacket, ConnectPacket, Packet, QoS, ReturnCode, TopicFilter};
use mqtt_nats::testing::MockNats;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const RECV_WAIT: Duration = Duration::from_secs(5);
pub const SILENCE_WAIT: Duration = Duration::from_millis(200);

/// Starts a bridge on an ephemeral port over the given mock bus.
pub async fn start_bridge(
    config: BridgeConfig,
    nats: &MockNats,
) -> (Arc<BridgeServer>, JoinHandle<mqtt_nats::Result<()>>) {
    let server = BridgeServer::new(config.with_port(0), Arc::new(nats.clone()))
        .await
        .expect("bridge start");
    let serving = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve().await })
    };
    server.wait_ready().await;
    (server, serving)
}

/// A minimal MQTT client speaking raw packets over TCP.
pub struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    pub async fn dial(server: &BridgeServer) -> Self {
        let addr = server.local_addr().expect("server not bound");
        let stream = TcpStream::connect(("127.0.0.1", addr.port()))
            .await
            .expect("tcp connect");
        Self { stream }
    }

    /// Raw access to the socket, for writing intentionally bad bytes.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub async fn send(&mut self, packet: &Packet) {
        let bytes = packet::encode_packet(packet).expect("encode");
        self.stream.write_all(&bytes).await.expect("socket write");
    }

    pub async fn recv(&mut self) -> Packet {
        timeout(RECV_WAIT, packet::read_packet(&mut self.stream))
            .await
            .expect("timed out waiting for packet")
            .expect("packet read")
    }

    /// Expects the peer to stay silent and then close or keep the
    /// connection; returns whatever arrived, if anything.
    pub async fn recv_silence(&mut self) -> Option<Packet> {
        match timeout(SILENCE_WAIT, packet::read_packet(&mut self.stream)).await {
            Ok(Ok(packet)) => Some(packet),
            _ => None,
        }
    }

    /// Waits for the server to close the connection.
    pub async fn expect_closed(&mut self) {
        let result = timeout(RECV_WAIT, packet::read_packet(&mut self.stream))
            .await
            .expect("timed out waiting for close");
        assert!(result.is_err(), "expected close, got {result:?}");
    }

    /// Sends CONNECT and returns the CONNACK.
    pub async fn handshake(&mut self, connect: ConnectPacket) -> ConnAckPacket {
        self.send(&Packet::Connect(Box::new(connect))).await;
        match self.recv().await {
            Packet::ConnAck(ack) => ack,
            other => panic!("expected CONNACK, got {other}"),
        }
    }

    /// Connects with a clean session and asserts acceptance.
    pub async fn connect_clean(&mut self, client_id: &str) {
        let ack = self.handshake(ConnectPacket::new(client_id, true, 0)).await;
        assert_eq!(ack.return_code, ReturnCode::Accepted);
        assert!(!ack.session_present);
    }

    /// Subscribes to a single filter and asserts the SUBACK return code.
    pub async fn subscribe(&mut self, packet_id: u16, filter: &str, qos: QoS) {
        self.send(&Packet::Subscribe(
            mqtt_nats::packet::SubscribePacket::new(
                packet_id,
                vec![TopicFilter {
                    filter: filter.to_string(),
                    qos,
                }],
            ),
        ))
        .await;
        match self.recv().await {
            Packet::SubAck(ack) => {
                assert_eq!(ack.packet_id, packet_id);
                assert_eq!(ack.return_codes, vec![u8::from(qos).min(1)]);
            }
            other => panic!("expected SUBACK, got {other}"),
        }
    }

    /// Receives the next packet and asserts it is a PUBLISH.
    pub async fn recv_publish(&mut self) -> mqtt_nats::packet::PublishPacket {
        match self.recv().await {
            Packet::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {other}"),
        }
    }
}
