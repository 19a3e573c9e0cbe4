use crate::packet::connect::ReturnCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MqttError>;

/// Errors produced by the bridge.
///
/// The variants fall into a handful of categories:
///
/// - **Wire format**: `MalformedPacket`, `UnexpectedEof` — the byte stream
///   could not be decoded as MQTT 3.1.1.
/// - **Protocol state**: `ProtocolViolation` — a well-formed packet arrived
///   in a state where it is not allowed (e.g. a second CONNECT).
/// - **Handshake**: `ConnectRefused` — carries the CONNACK return code so
///   that CONNECT parsing can signal "unacceptable protocol version" through
///   ordinary error propagation and the read loop can answer with a CONNACK
///   instead of dropping the connection outright.
/// - **Transport/backhaul**: `Io`, `Nats`, `KeepAliveTimeout`.
/// - **Lifecycle**: `ShutdownTimeout`, `Persistence`, `Configuration`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MqttError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("unexpected EOF")]
    UnexpectedEof,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("connection refused: {0}")]
    ConnectRefused(ReturnCode),

    #[error("QoS level 2 is not supported")]
    QoS2NotSupported,

    #[error("Invalid QoS: {0}")]
    InvalidQoS(u8),

    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Keep alive timeout")]
    KeepAliveTimeout,

    #[error("NATS error: {0}")]
    Nats(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("timeout during bridge shutdown")]
    ShutdownTimeout,
}

impl From<std::io::Error> for MqttError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            MqttError::UnexpectedEof
        } else {
            MqttError::Io(err.to_string())
        }
    }
}

impl From<serde_json::Error> for MqttError {
    fn from(err: serde_json::Error) -> Self {
        MqttError::Persistence(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MqttError::MalformedPacket("bad varint".to_string());
        assert_eq!(err.to_string(), "Malformed packet: bad varint");

        let err = MqttError::ConnectRefused(ReturnCode::UnacceptableProtocolVersion);
        assert_eq!(
            err.to_string(),
            "connection refused: unacceptable protocol version"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(MqttError::from(io_err), MqttError::UnexpectedEof);

        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(MqttError::from(io_err), MqttError::Io(_)));
    }
}
