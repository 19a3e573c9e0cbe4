//! The bridge itself: server, per-connection handling, retained store,
//! acknowledgment tracking, and persistence.

pub mod ack_tracker;
pub mod config;
pub mod connection;
pub mod persistence;
pub mod retained;
pub mod server;
pub mod tls;

pub use ack_tracker::{AckTracker, NatsPub};
pub use config::{BridgeConfig, TlsConfig};
pub use connection::{AsyncStream, ClientState, ConnectionHandler};
pub use retained::RetainedStore;
pub use server::BridgeServer;
