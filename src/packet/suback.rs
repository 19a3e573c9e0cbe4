use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, PacketType};
use bytes::{Buf, BufMut};
use std::fmt;

/// MQTT SUBACK packet: one return code per requested topic filter, in
/// request order. A code of 0x80 marks a failed subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAckPacket {
    pub packet_id: u16,
    pub return_codes: Vec<u8>,
}

impl SubAckPacket {
    #[must_use]
    pub fn new(packet_id: u16, return_codes: Vec<u8>) -> Self {
        Self {
            packet_id,
            return_codes,
        }
    }

    /// Parses the SUBACK body.
    ///
    /// # Errors
    ///
    /// Returns `MqttError::UnexpectedEof` on a body shorter than 2 bytes.
    pub fn decode_body<B: Buf>(buf: &mut B, _header: &FixedHeader) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(MqttError::UnexpectedEof);
        }
        let packet_id = buf.get_u16();
        let mut return_codes = vec![0u8; buf.remaining()];
        buf.copy_to_slice(&mut return_codes);
        Ok(Self {
            packet_id,
            return_codes,
        })
    }

    /// Serializes the packet, fixed header included.
    ///
    /// # Errors
    ///
    /// Returns an error if the remaining length exceeds the varint maximum.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        #[allow(clippy::cast_possible_truncation)]
        FixedHeader::new(PacketType::SubAck, 0, (2 + self.return_codes.len()) as u32)
            .encode(buf)?;
        buf.put_u16(self.packet_id);
        buf.put_slice(&self.return_codes);
        Ok(())
    }
}

impl fmt::Display for SubAckPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SUBACK (m{}, ", self.packet_id)?;
        if self.return_codes.len() == 1 {
            write!(f, "rc{}", self.return_codes[0])?;
        } else {
            f.write_str("[")?;
            for (i, rc) in self.return_codes.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "rc{rc}")?;
            }
            f.write_str("]")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_roundtrip() {
        let packet = SubAckPacket::new(7, vec![0, 1, 0x80]);
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(&buf[..2], &[0x90, 5]);
        let mut body = buf.freeze().slice(2..);
        let header = FixedHeader::new(PacketType::SubAck, 0, 5);
        assert_eq!(SubAckPacket::decode_body(&mut body, &header).unwrap(), packet);
    }
}
