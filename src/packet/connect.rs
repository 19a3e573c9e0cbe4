use crate::constants::connect_flags;
use crate::encoding::{decode_bytes, decode_string, encode_bytes, encode_string};
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, PacketType, QoS};
use bytes::{Buf, BufMut};
use std::fmt;

const PROTOCOL_NAME: &str = "MQTT";

/// Protocol level byte for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;

/// CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUserNameOrPassword = 4,
    NotAuthorized = 5,
}

impl ReturnCode {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ReturnCode::Accepted),
            1 => Some(ReturnCode::UnacceptableProtocolVersion),
            2 => Some(ReturnCode::IdentifierRejected),
            3 => Some(ReturnCode::ServerUnavailable),
            4 => Some(ReturnCode::BadUserNameOrPassword),
            5 => Some(ReturnCode::NotAuthorized),
            _ => None,
        }
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReturnCode::Accepted => "accepted",
            ReturnCode::UnacceptableProtocolVersion => "unacceptable protocol version",
            ReturnCode::IdentifierRejected => "identifier rejected",
            ReturnCode::ServerUnavailable => "server unavailable",
            ReturnCode::BadUserNameOrPassword => "bad user name or password",
            ReturnCode::NotAuthorized => "not authorized",
        };
        f.write_str(s)
    }
}

/// The optional will carried in a CONNECT packet, published on the client's
/// behalf when its connection ends abnormally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// User name and password from a CONNECT packet. The password is opaque
/// bytes; it is handed to the NATS layer untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    pub user: Option<String>,
    pub password: Option<Vec<u8>>,
}

/// MQTT CONNECT packet.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectPacket {
    /// Client identifier. May be empty.
    pub client_id: String,
    pub will: Option<Will>,
    pub credentials: Option<Credentials>,
    /// Keep-alive interval in seconds; zero disables the read deadline.
    pub keep_alive: u16,
    pub clean_session: bool,
    /// Protocol level as sent by the client. Always 4 once parsing succeeds.
    pub protocol_level: u8,
}

impl ConnectPacket {
    #[must_use]
    pub fn new(client_id: impl Into<String>, clean_session: bool, keep_alive: u16) -> Self {
        Self {
            client_id: client_id.into(),
            will: None,
            credentials: None,
            keep_alive,
            clean_session,
            protocol_level: PROTOCOL_LEVEL,
        }
    }

    #[must_use]
    pub fn with_will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Clears the will. Used when the client disconnects cleanly.
    pub fn delete_will(&mut self) {
        self.will = None;
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.clean_session {
            flags |= connect_flags::CLEAN_SESSION;
        }
        if let Some(will) = &self.will {
            flags |= connect_flags::WILL | (u8::from(will.qos) << connect_flags::WILL_QOS_SHIFT);
            if will.retain {
                flags |= connect_flags::WILL_RETAIN;
            }
        }
        if let Some(creds) = &self.credentials {
            if creds.user.is_some() {
                flags |= connect_flags::USER_NAME;
            }
            if creds.password.is_some() {
                flags |= connect_flags::PASSWORD;
            }
        }
        flags
    }

    /// Parses the CONNECT body.
    ///
    /// # Errors
    ///
    /// Returns `MqttError::ConnectRefused(UnacceptableProtocolVersion)` when
    /// the protocol level is not 4, so the read loop can answer with a
    /// CONNACK carrying that code. Any other failure is a malformed packet.
    pub fn decode_body<B: Buf>(buf: &mut B, _header: &FixedHeader) -> Result<Self> {
        let proto = decode_string(buf)?;
        if proto != PROTOCOL_NAME {
            return Err(MqttError::MalformedPacket(format!(
                "expected connect packet with protocol name \"MQTT\", got \"{proto}\""
            )));
        }

        if !buf.has_remaining() {
            return Err(MqttError::UnexpectedEof);
        }
        let protocol_level = buf.get_u8();
        if protocol_level != PROTOCOL_LEVEL {
            return Err(MqttError::ConnectRefused(
                ReturnCode::UnacceptableProtocolVersion,
            ));
        }

        if buf.remaining() < 3 {
            return Err(MqttError::UnexpectedEof);
        }
        let flags = buf.get_u8();
        let keep_alive = buf.get_u16();

        // Payload starts here
        let client_id = decode_string(buf)?;

        let will = if (flags & connect_flags::WILL) != 0 {
            let qos = QoS::try_from_u8(
                (flags & connect_flags::WILL_QOS) >> connect_flags::WILL_QOS_SHIFT,
            )?;
            let topic = decode_string(buf)?;
            let message = decode_bytes(buf)?;
            Some(Will {
                topic,
                message,
                qos,
                retain: (flags & connect_flags::WILL_RETAIN) != 0,
            })
        } else {
            None
        };

        let credentials = if (flags & (connect_flags::USER_NAME | connect_flags::PASSWORD)) != 0 {
            let user = if (flags & connect_flags::USER_NAME) != 0 {
                Some(decode_string(buf)?)
            } else {
                None
            };
            let password = if (flags & connect_flags::PASSWORD) != 0 {
                Some(decode_bytes(buf)?)
            } else {
                None
            };
            Some(Credentials { user, password })
        } else {
            None
        };

        Ok(Self {
            client_id,
            will,
            credentials,
            keep_alive,
            clean_session: (flags & connect_flags::CLEAN_SESSION) != 0,
            protocol_level,
        })
    }

    /// Serializes the packet, fixed header included.
    ///
    /// # Errors
    ///
    /// Returns an error if a string or byte field exceeds its length limit.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let mut len = 2 + PROTOCOL_NAME.len() + 1 + 1 + 2 + 2 + self.client_id.len();
        if let Some(will) = &self.will {
            len += 2 + will.topic.len() + 2 + will.message.len();
        }
        if let Some(creds) = &self.credentials {
            if let Some(user) = &creds.user {
                len += 2 + user.len();
            }
            if let Some(password) = &creds.password {
                len += 2 + password.len();
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        FixedHeader::new(PacketType::Connect, 0, len as u32).encode(buf)?;
        encode_string(buf, PROTOCOL_NAME)?;
        buf.put_u8(self.protocol_level);
        buf.put_u8(self.flags());
        buf.put_u16(self.keep_alive);
        encode_string(buf, &self.client_id)?;
        if let Some(will) = &self.will {
            encode_string(buf, &will.topic)?;
            encode_bytes(buf, &will.message)?;
        }
        if let Some(creds) = &self.credentials {
            if let Some(user) = &creds.user {
                encode_string(buf, user)?;
            }
            if let Some(password) = &creds.password {
                encode_bytes(buf, password)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for ConnectPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CONNECT")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{encode_packet, Packet};
    use bytes::{Buf, BytesMut};

    fn decode(bytes: &[u8]) -> Result<Packet> {
        let mut buf = BytesMut::from(bytes);
        let first = buf.get_u8();
        let len = crate::encoding::decode_variable_int(&mut buf).unwrap();
        assert_eq!(len as usize, buf.remaining());
        Packet::decode(first, buf.freeze())
    }

    #[test]
    fn test_roundtrip_minimal() {
        let packet = Packet::Connect(Box::new(ConnectPacket::new("", true, 0)));
        let bytes = encode_packet(&packet).unwrap();
        assert_eq!(decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_roundtrip_will_without_credentials() {
        let packet = Packet::Connect(Box::new(ConnectPacket::new("dev-1", false, 60).with_will(
            Will {
                topic: "state/dev-1".to_string(),
                message: b"gone".to_vec(),
                qos: QoS::AtMostOnce,
                retain: true,
            },
        )));
        let bytes = encode_packet(&packet).unwrap();
        assert_eq!(decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_password_without_user() {
        let packet = Packet::Connect(Box::new(ConnectPacket::new("c", true, 10).with_credentials(
            Credentials {
                user: None,
                password: Some(b"pw".to_vec()),
            },
        )));
        let bytes = encode_packet(&packet).unwrap();
        assert_eq!(decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_wrong_protocol_name() {
        let mut body = BytesMut::new();
        encode_string(&mut body, "MQIsdp").unwrap();
        body.put_u8(3);
        let err = ConnectPacket::decode_body(
            &mut body.freeze(),
            &FixedHeader::new(PacketType::Connect, 0, 0),
        )
        .unwrap_err();
        assert!(matches!(err, MqttError::MalformedPacket(_)));
    }

    #[test]
    fn test_unacceptable_protocol_level() {
        let mut body = BytesMut::new();
        encode_string(&mut body, "MQTT").unwrap();
        body.put_u8(5);
        let err = ConnectPacket::decode_body(
            &mut body.freeze(),
            &FixedHeader::new(PacketType::Connect, 0, 0),
        )
        .unwrap_err();
        assert_eq!(
            err,
            MqttError::ConnectRefused(ReturnCode::UnacceptableProtocolVersion)
        );
    }
}
