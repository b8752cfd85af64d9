//! Unreliable datagrams sharing the socket with RUDP frames
//!
//! AV packet layout:
//! - marker: 1 byte (0x02 video, 0x03 audio, 0x04 haptics)
//! - packet index: 2 bytes
//! - frame index: 2 bytes
//! - key position: 4 bytes
//! - encrypted payload
//!
//! The client sends feedback (0x06, encrypted with the local keystream)
//! and congestion reports (0x05, cleartext counters).

use bytes::{BufMut, Bytes, BytesMut};

use super::error::ProtocolError;
use super::wire::ByteReader;

pub const MARKER_VIDEO: u8 = 0x02;
pub const MARKER_AUDIO: u8 = 0x03;
pub const MARKER_HAPTICS: u8 = 0x04;
pub const MARKER_CONGESTION: u8 = 0x05;
pub const MARKER_FEEDBACK: u8 = 0x06;

pub const AV_HEADER_SIZE: usize = 9;

/// Offset added to a packet's key position before decryption
pub const KEY_POS_OFFSET: u64 = 16;

pub const CONGESTION_SIZE: usize = 5;
pub const FEEDBACK_HEADER_SIZE: usize = 7;

/// Header length of the AV-side packet starting with `marker`, None for
/// markers that start an RUDP frame
pub fn av_header_size(marker: u8) -> Option<usize> {
    match marker {
        MARKER_VIDEO | MARKER_AUDIO | MARKER_HAPTICS => Some(AV_HEADER_SIZE),
        MARKER_CONGESTION => Some(CONGESTION_SIZE),
        MARKER_FEEDBACK => Some(FEEDBACK_HEADER_SIZE),
        _ => None,
    }
}

/// True if a datagram is one of the unreliable AV-side packets rather than
/// an RUDP frame
pub fn is_av_datagram(data: &[u8]) -> bool {
    data.first().copied().and_then(av_header_size).is_some()
}

/// Route a datagram by its first byte. `Ok(true)` for an AV-side packet
/// with a complete header, `Ok(false)` for an RUDP frame. An AV marker
/// followed by a short header is an error.
pub fn av_datagram(data: &[u8]) -> Result<bool, ProtocolError> {
    match data.first().copied().and_then(av_header_size) {
        Some(needed) if data.len() < needed => Err(ProtocolError::Truncated {
            needed,
            remaining: data.len(),
        }),
        Some(_) => Ok(true),
        None => Ok(false),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AvKind {
    Video,
    Audio,
    Haptics,
}

impl AvKind {
    pub fn is_video(self) -> bool {
        self == AvKind::Video
    }

    pub fn is_haptics(self) -> bool {
        self == AvKind::Haptics
    }

    fn marker(self) -> u8 {
        match self {
            AvKind::Video => MARKER_VIDEO,
            AvKind::Audio => MARKER_AUDIO,
            AvKind::Haptics => MARKER_HAPTICS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvPacket {
    pub kind: AvKind,
    pub packet_index: u16,
    pub frame_index: u16,
    pub key_pos: u32,
    pub payload: Bytes,
}

impl AvPacket {
    pub fn parse(data: &Bytes) -> Result<Self, ProtocolError> {
        let mut r = ByteReader::new(data);
        let kind = match r.read_u8()? {
            MARKER_VIDEO => AvKind::Video,
            MARKER_AUDIO => AvKind::Audio,
            MARKER_HAPTICS => AvKind::Haptics,
            other => return Err(ProtocolError::UnknownAvMarker(other)),
        };
        let packet_index = r.read_u16()?;
        let frame_index = r.read_u16()?;
        let key_pos = r.read_u32()?;
        Ok(Self {
            kind,
            packet_index,
            frame_index,
            key_pos,
            payload: data.slice(r.position()..),
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(AV_HEADER_SIZE + self.payload.len());
        buf.put_u8(self.kind.marker());
        buf.put_u16(self.packet_index);
        buf.put_u16(self.frame_index);
        buf.put_u32(self.key_pos);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Keystream position for this packet's payload
    pub fn decrypt_position(&self) -> u64 {
        u64::from(self.key_pos) + KEY_POS_OFFSET
    }
}

/// Encrypted controller feedback datagram
pub fn feedback_datagram(sequence: u16, key_pos: u32, encrypted: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FEEDBACK_HEADER_SIZE + encrypted.len());
    buf.put_u8(MARKER_FEEDBACK);
    buf.put_u16(sequence);
    buf.put_u32(key_pos);
    buf.put_slice(encrypted);
    buf.freeze()
}

/// Received/lost counters reported back to the console
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CongestionReport {
    pub received: u16,
    pub lost: u16,
}

impl CongestionReport {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CONGESTION_SIZE);
        buf.put_u8(MARKER_CONGESTION);
        buf.put_u16(self.received);
        buf.put_u16(self.lost);
        buf.freeze()
    }

    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = ByteReader::new(data);
        let marker = r.read_u8()?;
        if marker != MARKER_CONGESTION {
            return Err(ProtocolError::UnknownAvMarker(marker));
        }
        Ok(Self {
            received: r.read_u16()?,
            lost: r.read_u16()?,
        })
    }
}
