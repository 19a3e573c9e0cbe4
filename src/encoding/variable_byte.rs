use crate::constants::masks;
use crate::error::{MqttError, Result};
use bytes::{Buf, BufMut};

/// Maximum value that can be encoded as a variable byte integer (268,435,455).
pub const VARIABLE_BYTE_INT_MAX: u32 = 268_435_455;

/// Encodes a u32 value as an MQTT variable byte integer.
///
/// Values 0-127 use 1 byte, 128-16,383 use 2 bytes, 16,384-2,097,151 use
/// 3 bytes, and 2,097,152-268,435,455 use 4 bytes.
///
/// # Errors
///
/// Returns `MqttError::MalformedPacket` if the value exceeds the maximum.
pub fn encode_variable_int<B: BufMut>(buf: &mut B, value: u32) -> Result<()> {
    if value > VARIABLE_BYTE_INT_MAX {
        return Err(MqttError::MalformedPacket(format!(
            "variable byte integer value {value} exceeds maximum {VARIABLE_BYTE_INT_MAX}"
        )));
    }

    let mut val = value;
    loop {
        let mut byte = (val % 128) as u8;
        val /= 128;
        if val > 0 {
            byte |= masks::CONTINUATION_BIT;
        }
        buf.put_u8(byte);
        if val == 0 {
            break;
        }
    }

    Ok(())
}

/// Decodes a variable byte integer from the buffer.
///
/// The multiplier grows by 128 per continuation byte; if it would pass
/// `0x200000` (a fifth byte) the encoding is rejected with the classic
/// "malformed compressed int" error.
///
/// # Errors
///
/// Returns an error if the buffer runs out mid-integer or the encoding uses
/// more than 4 bytes.
pub fn decode_variable_int<B: Buf>(buf: &mut B) -> Result<u32> {
    let mut multiplier = 1u32;
    let mut value = 0u32;

    loop {
        if !buf.has_remaining() {
            return Err(MqttError::UnexpectedEof);
        }

        let byte = buf.get_u8();
        value += u32::from(byte & masks::VARIABLE_BYTE_VALUE) * multiplier;

        if (byte & masks::CONTINUATION_BIT) == 0 {
            return Ok(value);
        }

        multiplier *= 128;
        if multiplier > 0x0020_0000 {
            return Err(MqttError::MalformedPacket(
                "malformed compressed int".to_string(),
            ));
        }
    }
}

/// Number of bytes needed to encode `value` as a variable byte integer.
#[must_use]
pub fn variable_int_len(value: u32) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_roundtrip_boundaries() {
        // (value, expected encoded length)
        let table = [
            (0u32, 1usize),
            (1, 1),
            (127, 1),
            (128, 2),
            (16_383, 2),
            (16_384, 3),
            (2_097_151, 3),
            (2_097_152, 4),
            (268_435_455, 4),
        ];
        for (value, len) in table {
            let mut buf = BytesMut::new();
            encode_variable_int(&mut buf, value).unwrap();
            assert_eq!(buf.len(), len, "encoded length of {value}");
            assert_eq!(decode_variable_int(&mut buf).unwrap(), value);
        }
    }

    #[test]
    fn test_encode_value_too_large() {
        let mut buf = BytesMut::new();
        assert!(encode_variable_int(&mut buf, VARIABLE_BYTE_INT_MAX + 1).is_err());
    }

    #[test]
    fn test_decode_truncated() {
        let mut buf = BytesMut::from(&[0x80u8][..]);
        assert_eq!(
            decode_variable_int(&mut buf).unwrap_err(),
            MqttError::UnexpectedEof
        );
    }

    #[test]
    fn test_decode_overlong() {
        let mut buf = BytesMut::from(&[0x80u8, 0x80, 0x80, 0x80, 0x01][..]);
        assert_eq!(
            decode_variable_int(&mut buf).unwrap_err(),
            MqttError::MalformedPacket("malformed compressed int".to_string())
        );
    }

    #[test]
    fn test_known_encodings() {
        let mut buf = BytesMut::new();
        encode_variable_int(&mut buf, 64).unwrap();
        assert_eq!(&buf[..], &[0x40]);

        buf.clear();
        encode_variable_int(&mut buf, 321).unwrap();
        assert_eq!(&buf[..], &[0xC1, 0x02]);
    }

    #[test]
    fn test_variable_int_len() {
        assert_eq!(variable_int_len(0), 1);
        assert_eq!(variable_int_len(127), 1);
        assert_eq!(variable_int_len(128), 2);
        assert_eq!(variable_int_len(16_383), 2);
        assert_eq!(variable_int_len(16_384), 3);
        assert_eq!(variable_int_len(2_097_151), 3);
        assert_eq!(variable_int_len(2_097_152), 4);
        assert_eq!(variable_int_len(VARIABLE_BYTE_INT_MAX), 4);
    }
}
