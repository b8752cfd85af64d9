//! Protocol error types

use thiserror::Error;

/// Errors raised while decoding or encoding wire data.
///
/// Every decoder in this crate fails closed: a truncated or over-long field
/// produces one of these instead of a partially filled value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Truncated data: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Unknown frame type 0x{0:04x}")]
    UnknownFrameType(u16),

    #[error("Declared size {declared} does not match payload length {actual}")]
    SizeMismatch { declared: usize, actual: usize },

    #[error("Frame nesting too deep")]
    NestingTooDeep,

    #[error("Malformed record: {0}")]
    Malformed(String),

    #[error("Unknown message kind {0}")]
    UnknownMessageKind(u64),

    #[error("Unknown data type {0}")]
    UnknownDataType(u8),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid field {0}")]
    InvalidField(&'static str),

    #[error("Invalid UTF-8 in field")]
    InvalidUtf8,

    #[error("Unknown AV marker 0x{0:02x}")]
    UnknownAvMarker(u8),
}

impl From<prost::DecodeError> for ProtocolError {
    fn from(e: prost::DecodeError) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}
