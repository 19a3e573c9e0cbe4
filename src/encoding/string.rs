use crate::constants::limits;
use crate::error::{MqttError, Result};
use bytes::{Buf, BufMut};

/// Encodes a UTF-8 string with a 2-byte big-endian length prefix.
///
/// # Errors
///
/// Returns an error if the string exceeds the u16 length limit.
pub fn encode_string<B: BufMut>(buf: &mut B, string: &str) -> Result<()> {
    let bytes = string.as_bytes();
    if bytes.len() > usize::from(limits::MAX_STRING_LENGTH) {
        return Err(MqttError::MalformedPacket(format!(
            "string length {} exceeds maximum {}",
            bytes.len(),
            limits::MAX_STRING_LENGTH
        )));
    }

    // Safe cast: length validated against u16::MAX above
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
    Ok(())
}

/// Decodes a UTF-8 string with a 2-byte big-endian length prefix.
///
/// # Errors
///
/// Returns an error on truncated input or invalid UTF-8.
pub fn decode_string<B: Buf>(buf: &mut B) -> Result<String> {
    let bytes = super::decode_bytes(buf)?;
    String::from_utf8(bytes)
        .map_err(|e| MqttError::MalformedPacket(format!("invalid UTF-8 string: {e}")))
}

/// Encoded length of a string (2 bytes for the prefix plus the string bytes).
#[must_use]
pub fn string_len(string: &str) -> usize {
    2 + string.len()
}
