use crate::constants::limits;
use crate::error::{MqttError, Result};
use bytes::{Buf, BufMut};

/// Encodes a byte block with a 2-byte big-endian length prefix.
///
/// # Errors
///
/// Returns an error if the block exceeds the u16 length limit.
pub fn encode_bytes<B: BufMut>(buf: &mut B, data: &[u8]) -> Result<()> {
    if data.len() > usize::from(limits::MAX_STRING_LENGTH) {
        return Err(MqttError::MalformedPacket(format!(
            "binary data length {} exceeds maximum {}",
            data.len(),
            limits::MAX_STRING_LENGTH
        )));
    }

    // Safe cast: length validated against u16::MAX above
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
    Ok(())
}

/// Decodes a byte block with a 2-byte big-endian length prefix.
///
/// # Errors
///
/// Returns `MqttError::UnexpectedEof` on truncated input.
pub fn decode_bytes<B: Buf>(buf: &mut B) -> Result<Vec<u8>> {
    if buf.remaining() < 2 {
        return Err(MqttError::UnexpectedEof);
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(MqttError::UnexpectedEof);
    }
    let mut data = vec![0u8; len];
    buf.copy_to_slice(&mut data);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_encode_decode_bytes() {
        for data in [&b""[..], b"\x00\x01\x02", b"payload bytes"] {
            let mut buf = BytesMut::new();
            encode_bytes(&mut buf, data).unwrap();
            assert_eq!(decode_bytes(&mut buf).unwrap(), data);
        }
    }

    #[test]
    fn test_decode_truncated_prefix() {
        let mut buf = BytesMut::from(&[0x00u8][..]);
        assert_eq!(decode_bytes(&mut buf).unwrap_err(), MqttError::UnexpectedEof);
    }

    #[test]
    fn test_decode_truncated_body() {
        let mut buf = BytesMut::from(&[0x00u8, 0x03, 0x01][..]);
        assert_eq!(decode_bytes(&mut buf).unwrap_err(), MqttError::UnexpectedEof);
    }
}
