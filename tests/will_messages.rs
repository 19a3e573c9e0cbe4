//! Will publication on abnormal disconnect.

mod common;

use common::{start_bridge, TestClient, SILENCE_WAIT};
use mqtt_nats::bridge::BridgeConfig;
use mqtt_nats::packet::{ConnectPacket, Credentials, Packet, QoS, Will};
use mqtt_nats::testing::MockNats;
use std::time::Duration;
use tokio::time::timeout;

fn will(qos: QoS) -> Will {
    Will {
        topic: "testing/my/will".to_string(),
        message: b"the will message".to_vec(),
        qos,
        retain: false,
    }
}

#[tokio::test]
async fn test_will_published_on_tcp_abort() {
    let nats = MockNats::new();
    let (server, _serving) = start_bridge(BridgeConfig::default(), &nats).await;

    let mut subscriber = TestClient::dial(&server).await;
    subscriber.connect_clean("mourner").await;
    subscriber
        .subscribe(1, "testing/my/will", QoS::AtMostOnce)
        .await;

    let mut publisher = TestClient::dial(&server).await;
    publisher
        .handshake(ConnectPacket::new("doomed", true, 0).with_will(will(QoS::AtMostOnce)))
        .await;
    drop(publisher); // aborts the TCP connection

    let publish = subscriber.recv_publish().await;
    assert_eq!(publish.topic, "testing/my/will");
    assert_eq!(publish.payload, b"the will message");
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert!(!publish.dup);
    assert!(!publish.retain);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_clean_disconnect_discards_the_will() {
    let nats = MockNats::new();
    let (server, _serving) = start_bridge(BridgeConfig::default(), &nats).await;

    let mut on_nats = nats.subscribe("testing.my.will").await;

    let mut publisher = TestClient::dial(&server).await;
    publisher
        .handshake(ConnectPacket::new("polite", true, 0).with_will(will(QoS::AtMostOnce)))
        .await;
    publisher.send(&Packet::Disconnect).await;
    publisher.expect_closed().await;

    assert!(timeout(SILENCE_WAIT, on_nats.recv()).await.is_err());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_qos1_will_republished_until_acknowledged() {
    let nats = MockNats::new();
    let config = BridgeConfig::default().with_repeat_rate(50);
    let (server, _serving) = start_bridge(config, &nats).await;

    let mut on_nats = nats.subscribe("testing.my.will").await;

    let credentials = Credentials {
        user: Some("bob".to_string()),
        password: None,
    };
    let mut publisher = TestClient::dial(&server).await;
    publisher
        .handshake(
            ConnectPacket::new("doomed", true, 0)
                .with_will(will(QoS::AtLeastOnce))
                .with_credentials(credentials.clone()),
        )
        .await;
    drop(publisher);

    // The initial publish, then republish attempts on the repeat rate.
    let first = timeout(Duration::from_secs(5), on_nats.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.payload, b"the will message");
    let second = timeout(Duration::from_secs(5), on_nats.recv())
        .await
        .unwrap()
        .unwrap();
    let reply = second.reply.clone().expect("republish reply subject");

    // Republishing keeps using the originating client's credentials.
    assert!(nats.connects().contains(&Some(credentials)));

    // An ack on the reply subject stops the republishing.
    nats.publish(&reply, b"").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    while timeout(SILENCE_WAIT, on_nats.recv()).await.is_ok() {
        // drain republishes already in flight before the ack landed
    }
    assert!(timeout(Duration::from_millis(300), on_nats.recv()).await.is_err());

    server.shutdown().await.unwrap();
}
