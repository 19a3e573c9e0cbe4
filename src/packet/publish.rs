use crate::constants::publish_flags;
use crate::encoding::{decode_string, encode_string};
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, PacketType, QoS};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Buf, BufMut};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// MQTT PUBLISH packet.
///
/// `nats_reply_to` is not part of the wire format: it carries the NATS reply
/// subject when the message was delivered to the bridge by a NATS
/// subscription, so that the client's eventual PUBACK can be propagated back.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PublishPacket {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Meaningful only when `qos > 0`.
    pub packet_id: u16,
    pub nats_reply_to: Option<String>,
}

impl PublishPacket {
    #[must_use]
    pub fn new(
        packet_id: u16,
        topic: impl Into<String>,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        dup: bool,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos,
            retain,
            dup,
            packet_id,
            nats_reply_to: None,
        }
    }

    /// A QoS-0 publish with all flags clear and no reply subject.
    #[must_use]
    pub fn simple(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::new(0, topic, payload, QoS::AtMostOnce, false, false)
    }

    /// Builds a packet from a raw flag nibble, as carried by a reply subject.
    ///
    /// # Errors
    ///
    /// Returns `MqttError::InvalidQoS` when the flag nibble encodes QoS 3.
    pub fn from_flags(
        packet_id: u16,
        topic: impl Into<String>,
        flags: u8,
        payload: Vec<u8>,
        nats_reply_to: Option<String>,
    ) -> Result<Self> {
        let qos = QoS::try_from_u8((flags & publish_flags::QOS) >> publish_flags::QOS_SHIFT)?;
        Ok(Self {
            topic: topic.into(),
            payload,
            qos,
            retain: (flags & publish_flags::RETAIN) != 0,
            dup: (flags & publish_flags::DUP) != 0,
            packet_id,
            nats_reply_to,
        })
    }

    /// The PUBLISH flag nibble: bit 0 retain, bits 1-2 QoS, bit 3 dup.
    #[must_use]
    pub fn flags(&self) -> u8 {
        let mut flags = u8::from(self.qos) << publish_flags::QOS_SHIFT;
        if self.retain {
            flags |= publish_flags::RETAIN;
        }
        if self.dup {
            flags |= publish_flags::DUP;
        }
        flags
    }

    pub fn set_dup(&mut self) {
        self.dup = true;
    }

    pub fn reset_retain(&mut self) {
        self.retain = false;
    }

    /// Parses the PUBLISH body using the flag nibble from the fixed header.
    ///
    /// # Errors
    ///
    /// QoS 3 is malformed. (QoS 2 parses fine and is refused later, at
    /// publish-handling time.)
    pub fn decode_body<B: Buf>(buf: &mut B, header: &FixedHeader) -> Result<Self> {
        let qos_bits = (header.flags & publish_flags::QOS) >> publish_flags::QOS_SHIFT;
        let qos = QoS::try_from_u8(qos_bits)
            .map_err(|_| MqttError::MalformedPacket(format!("invalid publish QoS {qos_bits}")))?;

        let topic = decode_string(buf)?;
        let packet_id = if qos > QoS::AtMostOnce {
            if buf.remaining() < 2 {
                return Err(MqttError::UnexpectedEof);
            }
            buf.get_u16()
        } else {
            0
        };
        let mut payload = vec![0u8; buf.remaining()];
        buf.copy_to_slice(&mut payload);

        Ok(Self {
            topic,
            payload,
            qos,
            retain: (header.flags & publish_flags::RETAIN) != 0,
            dup: (header.flags & publish_flags::DUP) != 0,
            packet_id,
            nats_reply_to: None,
        })
    }

    /// Serializes the packet, fixed header included.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic exceeds its length limit.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let mut len = 2 + self.topic.len() + self.payload.len();
        if self.qos > QoS::AtMostOnce {
            len += 2;
        }
        #[allow(clippy::cast_possible_truncation)]
        FixedHeader::new(PacketType::Publish, self.flags(), len as u32).encode(buf)?;
        encode_string(buf, &self.topic)?;
        if self.qos > QoS::AtMostOnce {
            buf.put_u16(self.packet_id);
        }
        buf.put_slice(&self.payload);
        Ok(())
    }
}

impl fmt::Display for PublishPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // layout borrowed from mosquitto_sub log output
        write!(
            f,
            "PUBLISH (d{}, q{}, r{}, m{}, '{}', ... ({} bytes))",
            u8::from(self.dup),
            u8::from(self.qos),
            u8::from(self.retain),
            self.packet_id,
            self.topic,
            self.payload.len()
        )
    }
}

/// Snapshot form: `{"flags", "id", "name", "reply_to"?, "payload"? | "payload_enc"?}`.
/// The payload is stored literally when it is valid UTF-8 and base64 encoded
/// otherwise; an empty payload is omitted entirely.
#[derive(Serialize, Deserialize)]
struct PublishJson {
    flags: u8,
    id: u16,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload_enc: Option<String>,
}

impl Serialize for PublishPacket {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let (payload, payload_enc) = if self.payload.is_empty() {
            (None, None)
        } else {
            match std::str::from_utf8(&self.payload) {
                Ok(s) => (Some(s.to_string()), None),
                Err(_) => (None, Some(BASE64.encode(&self.payload))),
            }
        };
        PublishJson {
            flags: self.flags(),
            id: self.packet_id,
            name: self.topic.clone(),
            reply_to: self.nats_reply_to.clone(),
            payload,
            payload_enc,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PublishPacket {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let js = PublishJson::deserialize(deserializer)?;
        let payload = match (js.payload, js.payload_enc) {
            (Some(s), _) => s.into_bytes(),
            (None, Some(enc)) => BASE64.decode(enc).map_err(D::Error::custom)?,
            (None, None) => Vec::new(),
        };
        PublishPacket::from_flags(js.id, js.name, js.flags, payload, js.reply_to)
            .map_err(D::Error::custom)
    }
}
