//! Control-channel messages carried in CTRL_MESSAGE frames
//!
//! Layout: `payload_size u32 | type u16 | reserved u16 | payload`.

use bytes::{BufMut, Bytes, BytesMut};

use super::error::ProtocolError;
use super::wire::ByteReader;

const HEADER_SIZE: usize = 8;

/// Minimum accepted length of a console-assigned session id
const SESSION_ID_MIN: usize = 24;
/// Maximum accepted length of a console-assigned session id
const SESSION_ID_MAX: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CtrlType {
    SessionId = 0x33,
    HeartbeatRequest = 0xfe,
    HeartbeatReply = 0x1fe,
    LoginPinRequest = 0x4,
    LoginPinReply = 0x8004,
    Login = 0x5,
    GotoBed = 0x50,
    GoHome = 0x14,
    Nickname = 0x0a,
    MicConnect = 0x30,
    MicToggle = 0x36,
    SwitchToStreamConnection = 0x34,
}

impl CtrlType {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x33 => Some(CtrlType::SessionId),
            0xfe => Some(CtrlType::HeartbeatRequest),
            0x1fe => Some(CtrlType::HeartbeatReply),
            0x4 => Some(CtrlType::LoginPinRequest),
            0x8004 => Some(CtrlType::LoginPinReply),
            0x5 => Some(CtrlType::Login),
            0x50 => Some(CtrlType::GotoBed),
            0x14 => Some(CtrlType::GoHome),
            0x0a => Some(CtrlType::Nickname),
            0x30 => Some(CtrlType::MicConnect),
            0x36 => Some(CtrlType::MicToggle),
            0x34 => Some(CtrlType::SwitchToStreamConnection),
            _ => None,
        }
    }
}

/// A control message. The raw type code is kept so unknown types can be
/// logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtrlMessage {
    pub raw_type: u16,
    pub payload: Bytes,
}

/// Result of a console login attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    Success,
    PinIncorrect,
    Other(u8),
}

impl CtrlMessage {
    pub fn new(kind: CtrlType, payload: impl Into<Bytes>) -> Self {
        Self {
            raw_type: kind as u16,
            payload: payload.into(),
        }
    }

    pub fn kind(&self) -> Option<CtrlType> {
        CtrlType::from_u16(self.raw_type)
    }

    pub fn go_home() -> Self {
        let mut home = [0u8; 0x10];
        home[1] = 0xff;
        Self::new(CtrlType::GoHome, home.to_vec())
    }

    pub fn goto_bed() -> Self {
        Self::new(CtrlType::GotoBed, Bytes::new())
    }

    pub fn login_pin(pin: &str) -> Self {
        Self::new(CtrlType::LoginPinReply, pin.as_bytes().to_vec())
    }

    pub fn mic_connect() -> Self {
        Self::new(CtrlType::MicConnect, vec![0u8, 0])
    }

    pub fn mic_toggle(muted: bool) -> Self {
        Self::new(CtrlType::MicToggle, vec![0, 1, if muted { 0 } else { 1 }, 89])
    }

    pub fn heartbeat_reply() -> Self {
        Self::new(CtrlType::HeartbeatReply, Bytes::new())
    }

    /// Moves a punched control socket over to the stream connection. The
    /// console echoes it back as the ack.
    pub fn switch_to_stream_connection() -> Self {
        Self::new(CtrlType::SwitchToStreamConnection, Bytes::new())
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u16(self.raw_type);
        buf.put_u16(0);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = ByteReader::new(data);
        let size = r.read_u32()? as usize;
        let raw_type = r.read_u16()?;
        r.skip(2)?;
        let payload = Bytes::copy_from_slice(r.read_bytes(size)?);
        Ok(Self { raw_type, payload })
    }

    /// Login result carried by a LOGIN message
    pub fn login_state(&self) -> Result<LoginState, ProtocolError> {
        match self.payload.first() {
            Some(0) => Ok(LoginState::Success),
            Some(1) => Ok(LoginState::PinIncorrect),
            Some(&other) => Ok(LoginState::Other(other)),
            None => Err(ProtocolError::MissingField("login state")),
        }
    }

    /// Session id from a SESSION_ID message: a length byte followed by
    /// 24 or more alphanumeric characters
    pub fn session_id(&self) -> Result<String, ProtocolError> {
        let id = self
            .payload
            .get(1..)
            .ok_or(ProtocolError::MissingField("session id"))?;
        if id.len() < SESSION_ID_MIN || id.len() >= SESSION_ID_MAX {
            return Err(ProtocolError::InvalidField("session id length"));
        }
        if !id.iter().all(u8::is_ascii_alphanumeric) {
            return Err(ProtocolError::InvalidField("session id characters"));
        }
        String::from_utf8(id.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    pub fn nickname(&self) -> Result<String, ProtocolError> {
        let end = self
            .payload
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.payload.len());
        String::from_utf8(self.payload[..end].to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }
}
