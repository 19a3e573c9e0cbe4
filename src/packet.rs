//! MQTT 3.1.1 control packets and their codec.
//!
//! Every packet kind lives in its own submodule with a
//! `decode_body`/`encode` pair; this module ties them together with the
//! [`Packet`] sum type, the fixed header, and the async frame reader used by
//! the connection read loop.

pub mod acks;
pub mod connack;
pub mod connect;
pub mod publish;
pub mod suback;
pub mod subscribe;
pub mod unsubscribe;

use crate::constants::{masks, FIXED_SUBSCRIBE_FLAGS};
use crate::encoding::encode_variable_int;
use crate::error::{MqttError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};

pub use connack::ConnAckPacket;
pub use connect::{ConnectPacket, Credentials, ReturnCode, Will};
pub use publish::PublishPacket;
pub use suback::SubAckPacket;
pub use subscribe::{SubscribePacket, TopicFilter};
pub use unsubscribe::UnsubscribePacket;

/// Quality of service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    /// Converts a raw QoS value.
    ///
    /// # Errors
    ///
    /// Returns `MqttError::InvalidQoS` for values above 2.
    pub fn try_from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(MqttError::InvalidQoS(value)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

/// MQTT control packet types (the high nibble of the fixed header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    /// Converts the type nibble to a `PacketType`.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PacketType::Connect),
            2 => Some(PacketType::ConnAck),
            3 => Some(PacketType::Publish),
            4 => Some(PacketType::PubAck),
            5 => Some(PacketType::PubRec),
            6 => Some(PacketType::PubRel),
            7 => Some(PacketType::PubComp),
            8 => Some(PacketType::Subscribe),
            9 => Some(PacketType::SubAck),
            10 => Some(PacketType::Unsubscribe),
            11 => Some(PacketType::UnsubAck),
            12 => Some(PacketType::PingReq),
            13 => Some(PacketType::PingResp),
            14 => Some(PacketType::Disconnect),
            _ => None,
        }
    }
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> Self {
        packet_type as u8
    }
}

/// MQTT packet fixed header: type nibble, flag nibble, remaining length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_length: u32,
}

impl FixedHeader {
    #[must_use]
    pub fn new(packet_type: PacketType, flags: u8, remaining_length: u32) -> Self {
        Self {
            packet_type,
            flags,
            remaining_length,
        }
    }

    /// Encodes the fixed header (byte 1 plus the remaining-length varint).
    ///
    /// # Errors
    ///
    /// Returns an error if the remaining length exceeds the varint maximum.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u8((u8::from(self.packet_type) << 4) | (self.flags & masks::FLAGS));
        encode_variable_int(buf, self.remaining_length)
    }
}

/// A parsed MQTT control packet.
///
/// DISCONNECT, PINGREQ, and PINGRESP carry no state and are plain unit
/// variants; `Packet::Disconnect` doubles as the write-queue sentinel that
/// tells the write loop to flush and exit.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Box<ConnectPacket>),
    ConnAck(ConnAckPacket),
    Publish(PublishPacket),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(SubscribePacket),
    SubAck(SubAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Decodes a packet from its first header byte and body bytes.
    ///
    /// The body is exactly `remaining length` bytes; handing it to the
    /// per-packet decoders as a bounded buffer means a payload parser can
    /// never over-consume into the next frame.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown packet types, disallowed flag nibbles,
    /// or truncated bodies.
    pub fn decode(first_byte: u8, body: Bytes) -> Result<Packet> {
        let type_nibble = (first_byte & masks::PACKET_TYPE) >> 4;
        let packet_type = PacketType::from_u8(type_nibble)
            .ok_or(MqttError::InvalidPacketType(type_nibble))?;
        #[allow(clippy::cast_possible_truncation)]
        let header = FixedHeader::new(packet_type, first_byte & masks::FLAGS, body.len() as u32);
        let mut body = body;

        match packet_type {
            PacketType::Connect => Ok(Packet::Connect(Box::new(ConnectPacket::decode_body(
                &mut body, &header,
            )?))),
            PacketType::ConnAck => Ok(Packet::ConnAck(ConnAckPacket::decode_body(
                &mut body, &header,
            )?)),
            PacketType::Publish => Ok(Packet::Publish(PublishPacket::decode_body(
                &mut body, &header,
            )?)),
            PacketType::PubAck => Ok(Packet::PubAck(acks::decode_id_body(&mut body, "PUBACK")?)),
            PacketType::PubRec => Ok(Packet::PubRec(acks::decode_id_body(&mut body, "PUBREC")?)),
            PacketType::PubRel => Ok(Packet::PubRel(acks::decode_id_body(&mut body, "PUBREL")?)),
            PacketType::PubComp => {
                Ok(Packet::PubComp(acks::decode_id_body(&mut body, "PUBCOMP")?))
            }
            PacketType::Subscribe => Ok(Packet::Subscribe(SubscribePacket::decode_body(
                &mut body, &header,
            )?)),
            PacketType::SubAck => Ok(Packet::SubAck(SubAckPacket::decode_body(
                &mut body, &header,
            )?)),
            PacketType::Unsubscribe => Ok(Packet::Unsubscribe(UnsubscribePacket::decode_body(
                &mut body, &header,
            )?)),
            PacketType::UnsubAck => {
                Ok(Packet::UnsubAck(acks::decode_id_body(&mut body, "UNSUBACK")?))
            }
            PacketType::PingReq => Ok(Packet::PingReq),
            PacketType::PingResp => Ok(Packet::PingResp),
            PacketType::Disconnect => Ok(Packet::Disconnect),
        }
    }

    /// Serializes the packet, fixed header included, onto the buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if a length field exceeds its wire limit.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        match self {
            Packet::Connect(p) => p.encode(buf),
            Packet::ConnAck(p) => p.encode(buf),
            Packet::Publish(p) => p.encode(buf),
            Packet::PubAck(id) => acks::encode_id_packet(buf, PacketType::PubAck, 0, *id),
            Packet::PubRec(id) => acks::encode_id_packet(buf, PacketType::PubRec, 0, *id),
            Packet::PubRel(id) => {
                acks::encode_id_packet(buf, PacketType::PubRel, FIXED_SUBSCRIBE_FLAGS, *id)
            }
            Packet::PubComp(id) => acks::encode_id_packet(buf, PacketType::PubComp, 0, *id),
            Packet::Subscribe(p) => p.encode(buf),
            Packet::SubAck(p) => p.encode(buf),
            Packet::Unsubscribe(p) => p.encode(buf),
            Packet::UnsubAck(id) => acks::encode_id_packet(buf, PacketType::UnsubAck, 0, *id),
            Packet::PingReq => {
                buf.put_slice(&[(u8::from(PacketType::PingReq)) << 4, 0]);
                Ok(())
            }
            Packet::PingResp => {
                buf.put_slice(&[(u8::from(PacketType::PingResp)) << 4, 0]);
                Ok(())
            }
            Packet::Disconnect => {
                buf.put_slice(&[(u8::from(PacketType::Disconnect)) << 4, 0]);
                Ok(())
            }
        }
    }

    /// The 16-bit packet identifier, or 0 when the packet kind carries none.
    #[must_use]
    pub fn packet_id(&self) -> u16 {
        match self {
            Packet::Publish(p) => p.packet_id,
            Packet::PubAck(id)
            | Packet::PubRec(id)
            | Packet::PubRel(id)
            | Packet::PubComp(id)
            | Packet::UnsubAck(id) => *id,
            Packet::Subscribe(p) => p.packet_id,
            Packet::SubAck(p) => p.packet_id,
            Packet::Unsubscribe(p) => p.packet_id,
            _ => 0,
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::Connect(p) => p.fmt(f),
            Packet::ConnAck(p) => p.fmt(f),
            Packet::Publish(p) => p.fmt(f),
            Packet::PubAck(id) => write!(f, "PUBACK (m{id})"),
            Packet::PubRec(id) => write!(f, "PUBREC (m{id})"),
            Packet::PubRel(id) => write!(f, "PUBREL (m{id})"),
            Packet::PubComp(id) => write!(f, "PUBCOMP (m{id})"),
            Packet::Subscribe(p) => p.fmt(f),
            Packet::SubAck(p) => p.fmt(f),
            Packet::Unsubscribe(p) => p.fmt(f),
            Packet::UnsubAck(id) => write!(f, "UNSUBACK (m{id})"),
            Packet::PingReq => write!(f, "PINGREQ"),
            Packet::PingResp => write!(f, "PINGRESP"),
            Packet::Disconnect => write!(f, "DISCONNECT"),
        }
    }
}

/// Reads one raw MQTT frame: the first header byte and the body.
///
/// The remaining length varint is read byte-at-a-time off the stream with
/// the same overflow rule as [`crate::encoding::decode_variable_int`], then
/// exactly that many body bytes are read.
///
/// # Errors
///
/// Returns `MqttError::UnexpectedEof` when the stream ends mid-frame and
/// "malformed compressed int" when the varint overflows.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(u8, Bytes)> {
    let mut byte = [0u8; 1];
    r.read_exact(&mut byte).await?;
    let first = byte[0];

    let mut multiplier: u32 = 1;
    let mut remaining: u32 = 0;
    loop {
        r.read_exact(&mut byte).await?;
        remaining += u32::from(byte[0] & masks::VARIABLE_BYTE_VALUE) * multiplier;
        if (byte[0] & masks::CONTINUATION_BIT) == 0 {
            break;
        }
        multiplier *= 128;
        if multiplier > 0x0020_0000 {
            return Err(MqttError::MalformedPacket(
                "malformed compressed int".to_string(),
            ));
        }
    }

    let mut body = vec![0u8; remaining as usize];
    r.read_exact(&mut body).await?;
    Ok((first, Bytes::from(body)))
}

/// Reads and decodes one complete packet from the stream.
///
/// # Errors
///
/// Propagates framing and decoding errors from [`read_frame`] and
/// [`Packet::decode`].
pub async fn read_packet<R: AsyncRead + Unpin>(r: &mut R) -> Result<Packet> {
    let (first, body) = read_frame(r).await?;
    Packet::decode(first, body)
}

/// Encodes a packet into a fresh buffer. Convenience for tests and the
/// one-off writes outside the batched write loop.
///
/// # Errors
///
/// Propagates encoding errors from [`Packet::encode`].
pub fn encode_packet(packet: &Packet) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    packet.encode(&mut buf)?;
    Ok(buf.freeze())
}
