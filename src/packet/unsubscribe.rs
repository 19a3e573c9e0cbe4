use crate::constants::FIXED_SUBSCRIBE_FLAGS;
use crate::encoding::{decode_string, encode_string};
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, PacketType};
use bytes::{Buf, BufMut};
use std::fmt;

/// MQTT UNSUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

impl UnsubscribePacket {
    #[must_use]
    pub fn new(packet_id: u16, filters: Vec<String>) -> Self {
        Self { packet_id, filters }
    }

    /// Parses the UNSUBSCRIBE body. The fixed-header flag nibble must be
    /// `0b0010`.
    ///
    /// # Errors
    ///
    /// Returns an error for a wrong flag nibble or truncated input.
    pub fn decode_body<B: Buf>(buf: &mut B, header: &FixedHeader) -> Result<Self> {
        if header.flags != FIXED_SUBSCRIBE_FLAGS {
            return Err(MqttError::MalformedPacket(
                "malformed unsubscribe header".to_string(),
            ));
        }
        if buf.remaining() < 2 {
            return Err(MqttError::UnexpectedEof);
        }
        let packet_id = buf.get_u16();
        let mut filters = Vec::new();
        while buf.has_remaining() {
            filters.push(decode_string(buf)?);
        }
        Ok(Self { packet_id, filters })
    }

    /// Serializes the packet, fixed header included.
    ///
    /// # Errors
    ///
    /// Returns an error if a filter exceeds its length limit.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let len = 2 + self.filters.iter().map(|f| 2 + f.len()).sum::<usize>();
        #[allow(clippy::cast_possible_truncation)]
        FixedHeader::new(PacketType::Unsubscribe, FIXED_SUBSCRIBE_FLAGS, len as u32)
            .encode(buf)?;
        buf.put_u16(self.packet_id);
        for filter in &self.filters {
            encode_string(buf, filter)?;
        }
        Ok(())
    }
}

impl fmt::Display for UnsubscribePacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UNSUBSCRIBE (m{}, {:?})", self.packet_id, self.filters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_roundtrip() {
        let packet = UnsubscribePacket::new(11, vec!["a/+".to_string(), "b".to_string()]);
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        let first = buf.get_u8();
        assert_eq!(first, 0xA2);
        let len = crate::encoding::decode_variable_int(&mut buf).unwrap();
        let header = FixedHeader::new(PacketType::Unsubscribe, first & 0x0F, len);
        assert_eq!(
            UnsubscribePacket::decode_body(&mut buf, &header).unwrap(),
            packet
        );
    }

    #[test]
    fn test_bad_flag_nibble() {
        let header = FixedHeader::new(PacketType::Unsubscribe, 1, 2);
        let mut body = bytes::Bytes::from_static(&[0, 1]);
        assert!(UnsubscribePacket::decode_body(&mut body, &header).is_err());
    }
}
