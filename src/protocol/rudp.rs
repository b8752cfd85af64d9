//! Reliable-UDP frame format
//!
//! Frame layout (all integers big-endian):
//! - subtype: 1 byte
//! - type: 2 bytes
//! - size: 2 bytes (length of payload)
//! - payload: `size` bytes
//! - remote counter: 2 bytes
//! - optional nested frame with the same layout
//!
//! Sequenced frames carry the sender's 16-bit local counter as the first two
//! payload bytes. ACK frames name the acknowledged counter in the remote
//! counter field.

use bytes::{BufMut, Bytes, BytesMut};

use super::error::ProtocolError;
use super::wire::ByteReader;

/// Fixed part of a frame without payload
pub const FRAME_OVERHEAD: usize = 7;

/// Subtype used for every frame this client emits
pub const SUBTYPE_DEFAULT: u8 = 0x12;

/// Maximum depth of nested sub-messages
const MAX_NESTING: usize = 4;

/// Closed set of frame type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RudpType {
    InitRequest = 0x8030,
    InitResponse = 0xD000,
    CookieRequest = 0x9030,
    CookieResponse = 0xA030,
    SessionMessage = 0x2030,
    TakionSwitchAck = 0x242E,
    Ack = 0x2430,
    CtrlMessage = 0x0230,
    Unknown = 0x022F,
    Finish = 0xC000,
}

impl TryFrom<u16> for RudpType {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x8030 => Ok(RudpType::InitRequest),
            0xD000 => Ok(RudpType::InitResponse),
            0x9030 => Ok(RudpType::CookieRequest),
            0xA030 => Ok(RudpType::CookieResponse),
            0x2030 => Ok(RudpType::SessionMessage),
            0x242E => Ok(RudpType::TakionSwitchAck),
            0x2430 => Ok(RudpType::Ack),
            0x0230 => Ok(RudpType::CtrlMessage),
            0x022F => Ok(RudpType::Unknown),
            0xC000 => Ok(RudpType::Finish),
            other => Err(ProtocolError::UnknownFrameType(other)),
        }
    }
}

impl RudpType {
    /// Frames whose payload starts with the sender's local counter
    pub fn is_sequenced(self) -> bool {
        !matches!(self, RudpType::Ack | RudpType::Unknown)
    }

    /// Frames that confirm one of our earlier frames by its counter
    pub fn acknowledges(self) -> bool {
        matches!(
            self,
            RudpType::Ack | RudpType::InitResponse | RudpType::CookieResponse
        )
    }
}

/// A single transport frame, possibly carrying a nested one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RudpMessage {
    pub subtype: u8,
    pub kind: RudpType,
    pub payload: Bytes,
    pub remote_counter: u16,
    pub sub_message: Option<Box<RudpMessage>>,
}

impl RudpMessage {
    pub fn new(kind: RudpType, payload: Bytes, remote_counter: u16) -> Self {
        Self {
            subtype: SUBTYPE_DEFAULT,
            kind,
            payload,
            remote_counter,
            sub_message: None,
        }
    }

    /// Sequenced frame: prefixes `body` with `local_counter`
    pub fn sequenced(kind: RudpType, local_counter: u16, body: &[u8], remote_counter: u16) -> Self {
        let mut payload = BytesMut::with_capacity(2 + body.len());
        payload.put_u16(local_counter);
        payload.put_slice(body);
        Self::new(kind, payload.freeze(), remote_counter)
    }

    pub fn ack(acked_counter: u16) -> Self {
        Self::new(RudpType::Ack, Bytes::new(), acked_counter)
    }

    pub fn with_sub_message(mut self, sub: RudpMessage) -> Self {
        self.sub_message = Some(Box::new(sub));
        self
    }

    /// Declared size, which always equals the payload length
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Sender's local counter for sequenced frames
    pub fn local_counter(&self) -> Option<u16> {
        if !self.kind.is_sequenced() || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    /// Payload with the counter prefix stripped
    pub fn body(&self) -> Bytes {
        if self.local_counter().is_some() {
            self.payload.slice(2..)
        } else {
            self.payload.clone()
        }
    }

    /// Serialize the frame and any nested frames
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_into(&mut buf, 0)?;
        Ok(buf.freeze())
    }

    fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD
            + self.payload.len()
            + self.sub_message.as_ref().map_or(0, |s| s.encoded_len())
    }

    fn write_into(&self, buf: &mut BytesMut, depth: usize) -> Result<(), ProtocolError> {
        if depth >= MAX_NESTING {
            return Err(ProtocolError::NestingTooDeep);
        }
        let size = u16::try_from(self.payload.len())
            .map_err(|_| ProtocolError::PayloadTooLarge(self.payload.len()))?;

        buf.put_u8(self.subtype);
        buf.put_u16(self.kind as u16);
        buf.put_u16(size);
        buf.put_slice(&self.payload);
        buf.put_u16(self.remote_counter);

        if let Some(sub) = &self.sub_message {
            sub.write_into(buf, depth + 1)?;
        }
        Ok(())
    }

    /// Parse a frame. Unknown type codes and truncated frames are rejected.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = ByteReader::new(data);
        Self::read(&mut reader, 0)
    }

    fn read(reader: &mut ByteReader<'_>, depth: usize) -> Result<Self, ProtocolError> {
        if depth >= MAX_NESTING {
            return Err(ProtocolError::NestingTooDeep);
        }
        let subtype = reader.read_u8()?;
        let kind = RudpType::try_from(reader.read_u16()?)?;
        let size = reader.read_u16()? as usize;
        if reader.remaining() < size + 2 {
            return Err(ProtocolError::SizeMismatch {
                declared: size,
                actual: reader.remaining().saturating_sub(2),
            });
        }
        let payload = Bytes::copy_from_slice(reader.read_bytes(size)?);
        let remote_counter = reader.read_u16()?;

        let sub_message = if reader.is_empty() {
            None
        } else {
            Some(Box::new(Self::read(reader, depth + 1)?))
        };

        Ok(Self {
            subtype,
            kind,
            payload,
            remote_counter,
            sub_message,
        })
    }
}
