//! Mesh Wire Protocol
//!
//! Binary layout for originator messages (OGM) and unicast content
//! messages (UCM). All multi-byte integers are big-endian.
//!
//! ```text
//! source:   len:u8 (1..=255) + utf8
//! dest:     len:u8 (0 = broadcast) + utf8
//! sequence:u32 | type:u8 | ttl:u8 | tq:u8
//! prev hop: len:u8 (1..=255) + utf8
//! body:     len:u32 + bytes (empty for OGM)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use super::device_id::DeviceId;
use crate::error::ParseError;

/// Smallest possible frame: one-byte source, broadcast destination, fixed
/// fields, one-byte previous hop and an empty body.
pub const MIN_HEADER_SIZE: usize = 16;

/// Highest ttl a frame may carry
pub const MAX_TTL: u8 = 64;

/// Message type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Ogm = 1, // Originator advertisement, flooded
    Ucm = 2, // Unicast application payload
}

impl TryFrom<u8> for MessageType {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Ogm),
            2 => Ok(MessageType::Ucm),
            other => Err(ParseError::UnknownMessageType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Ogm => f.write_str("OGM"),
            MessageType::Ucm => f.write_str("UCM"),
        }
    }
}

/// Where a message is headed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    Broadcast,
    Device(DeviceId),
}

impl Destination {
    pub fn device(&self) -> Option<&DeviceId> {
        match self {
            Destination::Device(id) => Some(id),
            Destination::Broadcast => None,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Broadcast => f.write_str("BROADCAST"),
            Destination::Device(id) => write!(f, "{}", id),
        }
    }
}

/// A single mesh frame. Immutable: routing produces new values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    source: DeviceId,
    destination: Destination,
    sequence: u32,
    message_type: MessageType,
    ttl: u8,
    tq: u8,
    previous_hop: DeviceId,
    body: Vec<u8>,
}

impl Message {
    /// Create a self-originated advertisement
    pub fn ogm(source: DeviceId, sequence: u32, tq: u8, ttl: u8) -> Self {
        Self {
            previous_hop: source.clone(),
            source,
            destination: Destination::Broadcast,
            sequence,
            message_type: MessageType::Ogm,
            ttl,
            tq,
            body: Vec::new(),
        }
    }

    /// Create a unicast message carrying an application payload
    pub fn ucm(
        source: DeviceId,
        destination: DeviceId,
        sequence: u32,
        tq: u8,
        ttl: u8,
        body: Vec<u8>,
    ) -> Self {
        Self {
            previous_hop: source.clone(),
            source,
            destination: Destination::Device(destination),
            sequence,
            message_type: MessageType::Ucm,
            ttl,
            tq,
            body,
        }
    }

    pub fn source(&self) -> &DeviceId {
        &self.source
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    pub fn tq(&self) -> u8 {
        self.tq
    }

    /// The node that put this frame on the link we received it from
    pub fn previous_hop(&self) -> &DeviceId {
        &self.previous_hop
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination == Destination::Broadcast
    }

    pub fn is_addressed_to(&self, id: &DeviceId) -> bool {
        self.destination.device() == Some(id)
    }

    /// Copy for the next hop: ttl decremented, tq replaced, previous hop set to `via`.
    /// Returns `None` when the ttl is already 0.
    pub fn forwarded(&self, via: &DeviceId, tq: u8) -> Option<Self> {
        let ttl = self.ttl.checked_sub(1)?;
        Some(Self {
            ttl,
            tq,
            previous_hop: via.clone(),
            ..self.clone()
        })
    }

    /// Encoded size in bytes
    pub fn wire_len(&self) -> usize {
        let dest_len = self.destination.device().map_or(0, |id| id.as_str().len());
        1 + self.source.as_str().len()
            + 1 + dest_len
            + 7
            + 1 + self.previous_hop.as_str().len()
            + 4 + self.body.len()
    }

    /// Encode to the binary wire format
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.wire_len());

        write_id(&mut buffer, self.source.as_str());
        write_id(&mut buffer, self.destination.device().map_or("", |id| id.as_str()));

        buffer.extend_from_slice(&self.sequence.to_be_bytes());
        buffer.push(self.message_type as u8);
        buffer.push(self.ttl);
        buffer.push(self.tq);

        write_id(&mut buffer, self.previous_hop.as_str());

        buffer.extend_from_slice(&(self.body.len() as u32).to_be_bytes());
        buffer.extend_from_slice(&self.body);

        buffer
    }

    /// Decode a frame. Never panics on malformed input.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < MIN_HEADER_SIZE {
            return Err(ParseError::TooShort { len: data.len(), min: MIN_HEADER_SIZE });
        }

        let mut reader = Reader { data, offset: 0 };

        let source = reader.device_id("source")?;
        let destination = match reader.id_bytes("destination")? {
            "" => Destination::Broadcast,
            id => Destination::Device(DeviceId::validated(id.to_string(), "destination")?),
        };

        let sequence = reader.u32("sequence")?;
        let message_type = MessageType::try_from(reader.u8("type")?)?;
        let ttl = reader.u8("ttl")?;
        if ttl > MAX_TTL {
            return Err(ParseError::TtlOutOfRange { ttl, max: MAX_TTL });
        }
        let tq = reader.u8("tq")?;
        let previous_hop = reader.device_id("previous hop")?;

        let declared = reader.u32("body length")? as usize;
        let actual = data.len() - reader.offset;
        if declared != actual {
            return Err(ParseError::BodyLengthMismatch { declared, actual });
        }
        let body = data[reader.offset..].to_vec();

        if message_type == MessageType::Ogm {
            if destination != Destination::Broadcast {
                return Err(ParseError::InvalidOgm("addressed to a device"));
            }
            if !body.is_empty() {
                return Err(ParseError::InvalidOgm("carries a body"));
            }
        }

        Ok(Self {
            source,
            destination,
            sequence,
            message_type,
            ttl,
            tq,
            previous_hop,
            body,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{} -> {} seq={} ttl={} tq={} via={} {}B]",
            self.message_type,
            self.source,
            self.destination,
            self.sequence,
            self.ttl,
            self.tq,
            self.previous_hop,
            self.body.len()
        )
    }
}

fn write_id(buffer: &mut Vec<u8>, id: &str) {
    // DeviceId guarantees len <= 255
    buffer.push(id.len() as u8);
    buffer.extend_from_slice(id.as_bytes());
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], ParseError> {
        let end = self.offset.checked_add(len).ok_or(ParseError::Truncated(field))?;
        let bytes = self.data.get(self.offset..end).ok_or(ParseError::Truncated(field))?;
        self.offset = end;
        Ok(bytes)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, ParseError> {
        Ok(self.take(1, field)?[0])
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, ParseError> {
        let bytes = self.take(4, field)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn id_bytes(&mut self, field: &'static str) -> Result<&'a str, ParseError> {
        let len = self.u8(field)? as usize;
        let bytes = self.take(len, field)?;
        std::str::from_utf8(bytes)
            .map_err(|_| ParseError::InvalidDeviceId { field, reason: "not utf-8" })
    }

    fn device_id(&mut self, field: &'static str) -> Result<DeviceId, ParseError> {
        let id = self.id_bytes(field)?;
        DeviceId::validated(id.to_string(), field)
    }
}
