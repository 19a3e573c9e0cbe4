//! The NATS reply subject that carries MQTT acknowledgment context.
//!
//! Encoded as `_INBOX.<clientID>.<sessionID>.<packetID>.<flags>`. The
//! session identity is embedded so that an asynchronous NATS reply can be
//! routed back to the right session even when the originating connection is
//! gone: the handler re-resolves the session from the parsed subject instead
//! of holding a reference to it.

use crate::packet::PublishPacket;
use crate::session::Session;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTopic {
    client_id: String,
    session_id: String,
    packet_id: u16,
    flags: u8,
}

impl ReplyTopic {
    /// Builds the reply topic for a publish tracked by the given session.
    #[must_use]
    pub fn new(session: &Session, publish: &PublishPacket) -> Self {
        Self {
            client_id: session.client_id().to_string(),
            session_id: session.id().to_string(),
            packet_id: publish.packet_id,
            flags: publish.flags(),
        }
    }

    /// Parses a NATS reply subject. Returns `None` unless the string has
    /// exactly five dot-separated parts, starts with `_INBOX`, and parts 4
    /// and 5 are decimal integers.
    #[must_use]
    pub fn parse(subject: &str) -> Option<Self> {
        let parts: Vec<&str> = subject.split('.').collect();
        if parts.len() != 5 || parts[0] != "_INBOX" {
            return None;
        }
        let packet_id = parts[3].parse::<u16>().ok()?;
        let flags = parts[4].parse::<u8>().ok()?;
        Some(Self {
            client_id: parts[1].to_string(),
            session_id: parts[2].to_string(),
            packet_id,
            flags,
        })
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn packet_id(&self) -> u16 {
        self.packet_id
    }

    #[must_use]
    pub fn flags(&self) -> u8 {
        self.flags
    }
}

impl fmt::Display for ReplyTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "_INBOX.{}.{}.{}.{}",
            self.client_id, self.session_id, self.packet_id, self.flags
        )
    }
}
