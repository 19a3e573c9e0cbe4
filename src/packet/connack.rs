use crate::error::{MqttError, Result};
use crate::packet::connect::ReturnCode;
use crate::packet::{FixedHeader, PacketType};
use bytes::{Buf, BufMut};
use std::fmt;

/// MQTT CONNACK packet sent in response to a CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAckPacket {
    pub session_present: bool,
    pub return_code: ReturnCode,
}

impl ConnAckPacket {
    #[must_use]
    pub fn new(session_present: bool, return_code: ReturnCode) -> Self {
        Self {
            session_present,
            return_code,
        }
    }

    /// Parses the 2-byte CONNACK body.
    ///
    /// # Errors
    ///
    /// Returns an error on a body that is not exactly 2 bytes or an unknown
    /// return code.
    pub fn decode_body<B: Buf>(buf: &mut B, header: &FixedHeader) -> Result<Self> {
        if header.remaining_length != 2 || buf.remaining() < 2 {
            return Err(MqttError::MalformedPacket("malformed CONNACK".to_string()));
        }
        let flags = buf.get_u8();
        let code = buf.get_u8();
        let return_code = ReturnCode::from_u8(code).ok_or_else(|| {
            MqttError::MalformedPacket(format!("unknown CONNACK return code {code}"))
        })?;
        Ok(Self {
            session_present: (flags & 0x01) != 0,
            return_code,
        })
    }

    /// Serializes the packet, fixed header included.
    ///
    /// # Errors
    ///
    /// Infallible in practice; kept fallible for uniformity with the other
    /// packet encoders.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        FixedHeader::new(PacketType::ConnAck, 0, 2).encode(buf)?;
        buf.put_u8(u8::from(self.session_present));
        buf.put_u8(self.return_code as u8);
        Ok(())
    }
}

impl fmt::Display for ConnAckPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CONNACK (s{}, rt{})",
            u8::from(self.session_present),
            self.return_code as u8
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_roundtrip() {
        for (present, code) in [
            (false, ReturnCode::Accepted),
            (true, ReturnCode::Accepted),
            (false, ReturnCode::ServerUnavailable),
        ] {
            let packet = ConnAckPacket::new(present, code);
            let mut buf = BytesMut::new();
            packet.encode(&mut buf).unwrap();
            assert_eq!(&buf[..2], &[0x20, 0x02]);
            let mut body = buf.freeze().slice(2..);
            let header = FixedHeader::new(PacketType::ConnAck, 0, 2);
            assert_eq!(
                ConnAckPacket::decode_body(&mut body, &header).unwrap(),
                packet
            );
        }
    }

    #[test]
    fn test_bad_length() {
        let header = FixedHeader::new(PacketType::ConnAck, 0, 3);
        let mut body = bytes::Bytes::from_static(&[0, 0, 0]);
        assert!(ConnAckPacket::decode_body(&mut body, &header).is_err());
    }
}
