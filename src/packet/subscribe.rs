use crate::constants::FIXED_SUBSCRIBE_FLAGS;
use crate::encoding::{decode_string, encode_string};
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, PacketType, QoS};
use bytes::{Buf, BufMut};
use std::fmt;

/// One topic filter of a SUBSCRIBE packet: the filter string (which may
/// contain `+` and `#` wildcards) and the desired QoS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    pub filter: String,
    pub qos: QoS,
}

/// MQTT SUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub topics: Vec<TopicFilter>,
}

impl SubscribePacket {
    #[must_use]
    pub fn new(packet_id: u16, topics: Vec<TopicFilter>) -> Self {
        Self { packet_id, topics }
    }

    /// Parses the SUBSCRIBE body. The fixed-header flag nibble must be
    /// `0b0010`.
    ///
    /// # Errors
    ///
    /// Returns an error for a wrong flag nibble, truncated input, or a
    /// desired QoS above 2.
    pub fn decode_body<B: Buf>(buf: &mut B, header: &FixedHeader) -> Result<Self> {
        if header.flags != FIXED_SUBSCRIBE_FLAGS {
            return Err(MqttError::MalformedPacket(
                "malformed subscribe header".to_string(),
            ));
        }

        if buf.remaining() < 2 {
            return Err(MqttError::UnexpectedEof);
        }
        let packet_id = buf.get_u16();

        let mut topics = Vec::new();
        while buf.has_remaining() {
            let filter = decode_string(buf)?;
            if !buf.has_remaining() {
                return Err(MqttError::UnexpectedEof);
            }
            let qos = QoS::try_from_u8(buf.get_u8()).map_err(|_| {
                MqttError::MalformedPacket("malformed subscribed topic QoS".to_string())
            })?;
            topics.push(TopicFilter { filter, qos });
        }
        Ok(Self { packet_id, topics })
    }

    /// Serializes the packet, fixed header included.
    ///
    /// # Errors
    ///
    /// Returns an error if a filter exceeds its length limit.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let len = 2 + self
            .topics
            .iter()
            .map(|t| 3 + t.filter.len())
            .sum::<usize>();
        #[allow(clippy::cast_possible_truncation)]
        FixedHeader::new(PacketType::Subscribe, FIXED_SUBSCRIBE_FLAGS, len as u32).encode(buf)?;
        buf.put_u16(self.packet_id);
        for topic in &self.topics {
            encode_string(buf, &topic.filter)?;
            buf.put_u8(u8::from(topic.qos));
        }
        Ok(())
    }
}

impl fmt::Display for SubscribePacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SUBSCRIBE (m{}, ", self.packet_id)?;
        if self.topics.len() == 1 {
            let t = &self.topics[0];
            write!(f, "q{}, '{}'", u8::from(t.qos), t.filter)?;
        } else {
            f.write_str("[")?;
            for (i, t) in self.topics.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "(q{}, '{}')", u8::from(t.qos), t.filter)?;
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

    fn roundtrip(packet: &SubscribePacket) {
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        let first = buf.get_u8();
        assert_eq!(first, 0x82);
        let len = crate::encoding::decode_variable_int(&mut buf).unwrap();
        let header = FixedHeader::new(PacketType::Subscribe, first & 0x0F, len);
        let decoded = SubscribePacket::decode_body(&mut buf, &header).unwrap();
        assert_eq!(&decoded, packet);
    }

    #[test]
    fn test_roundtrip() {
        roundtrip(&SubscribePacket::new(
            42,
            vec![
                TopicFilter {
                    filter: "sensors/+/temp".to_string(),
                    qos: QoS::AtLeastOnce,
                },
                TopicFilter {
                    filter: "alerts/#".to_string(),
                    qos: QoS::ExactlyOnce,
                },
            ],
        ));
    }

    #[test]
    fn test_bad_flag_nibble() {
        let header = FixedHeader::new(PacketType::Subscribe, 0, 2);
        let mut body = bytes::Bytes::from_static(&[0, 1]);
        assert_eq!(
            SubscribePacket::decode_body(&mut body, &header).unwrap_err(),
            MqttError::MalformedPacket("malformed subscribe header".to_string())
        );
    }

    #[test]
    fn test_qos_above_two() {
        let mut buf = BytesMut::new();
        buf.put_u16(1);
        encode_string(&mut buf, "t").unwrap();
        buf.put_u8(3);
        #[allow(clippy::cast_possible_truncation)]
        let header =
            FixedHeader::new(PacketType::Subscribe, FIXED_SUBSCRIBE_FLAGS, buf.len() as u32);
        assert_eq!(
            SubscribePacket::decode_body(&mut buf, &header).unwrap_err(),
            MqttError::MalformedPacket("malformed subscribed topic QoS".to_string())
        );
    }
}
