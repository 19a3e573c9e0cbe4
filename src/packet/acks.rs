//! The four fixed-size acknowledgment packets (PUBACK, PUBREC, PUBREL,
//! PUBCOMP) and UNSUBACK all share the same 2-byte body: the packet id.

use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, PacketType};
use bytes::{Buf, BufMut};

/// Decodes the 2-byte packet-id body shared by the ack packets.
///
/// # Errors
///
/// Returns `malformed <NAME>` when the body is not exactly 2 bytes.
pub fn decode_id_body<B: Buf>(buf: &mut B, name: &str) -> Result<u16> {
    if buf.remaining() != 2 {
        return Err(MqttError::MalformedPacket(format!("malformed {name}")));
    }
    Ok(buf.get_u16())
}

/// Encodes an id-only packet: fixed header plus the 2-byte packet id.
///
/// # Errors
///
/// Infallible in practice; kept fallible for uniformity with the other
/// packet encoders.
pub fn encode_id_packet<B: BufMut>(
    buf: &mut B,
    packet_type: PacketType,
    flags: u8,
    packet_id: u16,
) -> Result<()> {
    FixedHeader::new(packet_type, flags, 2).encode(buf)?;
    buf.put_u16(packet_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};

    #[test]
    fn test_roundtrip() {
        let mut buf = BytesMut::new();
        encode_id_packet(&mut buf, PacketType::PubAck, 0, 0xBEEF).unwrap();
        assert_eq!(&buf[..], &[0x40, 0x02, 0xBE, 0xEF]);
        let mut body = buf.freeze().slice(2..);
        assert_eq!(decode_id_body(&mut body, "PUBACK").unwrap(), 0xBEEF);
    }

    #[test]
    fn test_pubrel_reserved_flags() {
        let mut buf = BytesMut::new();
        encode_id_packet(&mut buf, PacketType::PubRel, 0x02, 1).unwrap();
        assert_eq!(buf[0], 0x62);
    }

    #[test]
    fn test_wrong_length() {
        let mut body = Bytes::from_static(&[0x00, 0x01, 0x02]);
        assert_eq!(
            decode_id_body(&mut body, "PUBACK").unwrap_err(),
            MqttError::MalformedPacket("malformed PUBACK".to_string())
        );
    }
}
