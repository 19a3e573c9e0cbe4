//! Message flow in both directions, including QoS-1 acknowledgment
//! propagation and the topic/subject translation.

mod common;

use common::{start_bridge, TestClient, RECV_WAIT, SILENCE_WAIT};
use mqtt_nats::bridge::BridgeConfig;
use mqtt_nats::packet::{Packet, PublishPacket, QoS};
use mqtt_nats::testing::MockNats;
use tokio::time::timeout;

#[tokio::test]
async fn test_mqtt_to_nats_subject_translation() {
    let nats = MockNats::new();
    let (server, _serving) = start_bridge(BridgeConfig::default(), &nats).await;

    // dots and slashes swap places on the way over
    let mut on_nats = nats.subscribe("testing.s/o/m/e.topic").await;

    let mut client = TestClient::dial(&server).await;
    client.connect_clean("translator").await;
    client
        .send(&Packet::Publish(PublishPacket::simple(
            "testing/s.o.m.e/topic",
            b"payload bytes".to_vec(),
        )))
        .await;

    let message = timeout(RECV_WAIT, on_nats.recv()).await.unwrap().unwrap();
    assert_eq!(message.subject, "testing.s/o/m/e.topic");
    assert_eq!(message.payload, b"payload bytes");
    assert_eq!(message.reply, None);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_nats_to_mqtt_delivery_with_wildcard() {
    let nats = MockNats::new();
    let (server, _serving) = start_bridge(BridgeConfig::default(), &nats).await;

    let mut client = TestClient::dial(&server).await;
    client.connect_clean("listener").await;
    client.subscribe(1, "testing/+/topic", QoS::AtMostOnce).await;

    nats.publish("testing.x.topic", b"from nats").await;

    let publish = client.recv_publish().await;
    assert_eq!(publish.topic, "testing/x/topic");
    assert_eq!(publish.payload, b"from nats");
    assert_eq!(publish.qos, QoS::AtMostOnce);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_qos1_publish_acked_through_nats_reply() {
    let nats = MockNats::new();
    let (server, _serving) = start_bridge(BridgeConfig::default(), &nats).await;

    let mut on_nats = nats.subscribe("qos1.topic").await;

    let mut client = TestClient::dial(&server).await;
    client.connect_clean("acker").await;
    client
        .send(&Packet::Publish(PublishPacket::new(
            5,
            "qos1/topic",
            b"important".to_vec(),
            QoS::AtLeastOnce,
            false,
            false,
        )))
        .await;

    // The bridge publishes a request carrying the session identity.
    let message = timeout(RECV_WAIT, on_nats.recv()).await.unwrap().unwrap();
    let reply = message.reply.clone().expect("reply subject");
    assert!(reply.starts_with("_INBOX.acker."), "reply was {reply}");
    assert!(reply.ends_with(".5.2"), "reply was {reply}");

    // No PUBACK until a NATS responder replies.
    assert_eq!(client.recv_silence().await, None);
    nats.publish(&reply, b"").await;
    assert_eq!(client.recv().await, Packet::PubAck(5));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_qos1_dup_publish_is_suppressed_while_pending() {
    let nats = MockNats::new();
    let (server, _serving) = start_bridge(BridgeConfig::default(), &nats).await;

    let mut on_nats = nats.subscribe("dup.topic").await;

    let mut client = TestClient::dial(&server).await;
    client.connect_clean("dupper").await;
    let publish = PublishPacket::new(9, "dup/topic", b"m".to_vec(), QoS::AtLeastOnce, false, false);
    client.send(&Packet::Publish(publish.clone())).await;

    let first = timeout(RECV_WAIT, on_nats.recv()).await.unwrap().unwrap();
    let reply = first.reply.clone().unwrap();

    // A DUP for a packet already awaiting its ack is dropped silently.
    let mut dup = publish;
    dup.set_dup();
    client.send(&Packet::Publish(dup)).await;
    assert!(timeout(SILENCE_WAIT, on_nats.recv()).await.is_err());

    nats.publish(&reply, b"").await;
    assert_eq!(client.recv().await, Packet::PubAck(9));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_nats_to_mqtt_qos1_ack_propagates_to_reply_subject() {
    let nats = MockNats::new();
    let (server, _serving) = start_bridge(BridgeConfig::default(), &nats).await;

    let mut client = TestClient::dial(&server).await;
    client.connect_clean("receiver").await;
    client.subscribe(1, "alerts/#", QoS::AtLeastOnce).await;

    // A reply subject that does not parse as bridge ack context forces the
    // bridge to allocate a packet id and deliver at QoS 1.
    let mut on_reply = nats.subscribe("_REQ.77").await;
    nats.publish_with_reply("alerts.fire", "_REQ.77", b"evacuate")
        .await;

    let publish = client.recv_publish().await;
    assert_eq!(publish.topic, "alerts/fire");
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    assert!(publish.packet_id != 0);

    client.send(&Packet::PubAck(publish.packet_id)).await;
    let ack = timeout(RECV_WAIT, on_reply.recv()).await.unwrap().unwrap();
    assert_eq!(ack.payload, vec![0]);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_subscription_qos_caps_delivery() {
    let nats = MockNats::new();
    let (server, _serving) = start_bridge(BridgeConfig::default(), &nats).await;

    let mut client = TestClient::dial(&server).await;
    client.connect_clean("capped").await;
    // QoS 0 subscription: messages arrive at QoS 0 even with a reply subject
    client.subscribe(1, "feed/#", QoS::AtMostOnce).await;

    nats.publish_with_reply("feed.a", "_REQ.1", b"x").await;
    let publish = client.recv_publish().await;
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert_eq!(publish.packet_id, 0);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let nats = MockNats::new();
    let (server, _serving) = start_bridge(BridgeConfig::default(), &nats).await;

    let mut client = TestClient::dial(&server).await;
    client.connect_clean("fickle").await;
    client.subscribe(1, "stream/a", QoS::AtMostOnce).await;

    client
        .send(&Packet::Unsubscribe(
            mqtt_nats::packet::UnsubscribePacket::new(2, vec!["stream/a".to_string()]),
        ))
        .await;
    assert_eq!(client.recv().await, Packet::UnsubAck(2));

    nats.publish("stream.a", b"late").await;
    assert_eq!(client.recv_silence().await, None);

    server.shutdown().await.unwrap();
}
