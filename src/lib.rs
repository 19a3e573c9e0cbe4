//! # mqtt-nats
//!
//! A protocol bridge that terminates MQTT 3.1.1 client connections and
//! relays their semantics onto a NATS message bus, so MQTT publishers and
//! subscribers interoperate with NATS ones transparently.
//!
//! The bridge preserves MQTT session semantics on top of NATS's
//! fire-and-forget subject model:
//!
//! - **Topic mapping** — MQTT `a/b.c` ⇄ NATS `a.b/c`; subscription
//!   wildcards map `+` ⇄ `*` and `#` ⇄ `>`.
//! - **QoS 1** — client publishes become NATS requests whose reply subject
//!   encodes the session and packet id; a reply triggers the PUBACK.
//!   Deliveries to the client are tracked until the client acknowledges.
//! - **Retained messages** — stored in the bridge and replayed on
//!   subscribe; NATS clients can query them over a request subject.
//! - **Wills** — published on abnormal disconnect, with QoS-1 wills
//!   republished until acknowledged.
//! - **Persistence** — sessions, retained messages, and in-flight acks
//!   survive restarts through a JSON snapshot.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use mqtt_nats::bridge::{BridgeConfig, BridgeServer};
//!
//! #[tokio::main]
//! async fn main() -> mqtt_nats::Result<()> {
//!     let config = BridgeConfig::default()
//!         .with_port(1883)
//!         .with_nats_urls("nats://127.0.0.1:4222")
//!         .with_storage_path("mqtt-nats.json");
//!     let server = BridgeServer::with_config(config).await?;
//!     let bridge = server.clone();
//!     tokio::spawn(async move {
//!         tokio::signal::ctrl_c().await.ok();
//!         bridge.shutdown().await.ok();
//!     });
//!     server.serve().await
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

pub mod bridge;
pub mod constants;
pub mod encoding;
pub mod error;
pub mod nats;
pub mod packet;
pub mod packet_id;
pub mod reply_topic;
pub mod session;
pub mod testing;
pub mod topic;

pub use bridge::{BridgeConfig, BridgeServer};
pub use error::{MqttError, Result};
pub use packet::{Packet, PacketType, QoS};
