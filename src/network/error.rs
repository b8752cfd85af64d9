//! Network error types

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors that can occur in the transport layer
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Connection refused by peer")]
    ConnectionRefused,

    #[error("Transport closed: {0}")]
    TransportClosed(String),

    #[error("Transport stopped")]
    Stopped,

    #[error("Send buffer full, evicted unacknowledged sequence {evicted}")]
    SendBufferFull { evicted: u16 },

    #[error("Sequence number {0} already in send buffer")]
    DuplicateSequence(u16),

    #[error("Invalid socket: {0}")]
    InvalidSocket(String),

    #[error("Stream keys already installed")]
    KeysAlreadyInstalled,

    #[error("Stream keys not installed")]
    KeysMissing,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid packet: {0}")]
    InvalidPacket(#[from] ProtocolError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("STUN failed: {0}")]
    StunFailed(String),
}

impl NetworkError {
    /// Errors after which the transport can no longer be used. A full
    /// resend buffer or a reused counter is reported but the frame was sent.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            NetworkError::SendBufferFull { .. } | NetworkError::DuplicateSequence(_)
        )
    }
}

/// Key exchange and keystream failures. Always fatal to a handshake.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("ECDH signature mismatch")]
    SignatureMismatch,

    #[error("Invalid ECDH public key")]
    InvalidPublicKey,

    #[error("ECDH result is not contributory")]
    NonContributory,

    #[error("Invalid key material")]
    InvalidKey,

    #[error("Key derivation failed")]
    KeyDerivation,
}

/// Holepunch coordinator failures
#[derive(Error, Debug)]
pub enum HolepunchError {
    #[error("Access token missing scope {0}")]
    MissingScope(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Console unreachable: no candidate answered")]
    Unreachable,

    #[error("Data punch attempted before control punch succeeded")]
    DataBeforeControl,

    #[error("Invalid holepunch state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Console rejected the session: error {0}")]
    Rejected(u32),

    #[error("Holepunch cancelled")]
    Cancelled,

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}

impl From<std::io::Error> for HolepunchError {
    fn from(e: std::io::Error) -> Self {
        HolepunchError::Network(NetworkError::Io(e))
    }
}

/// Failures of the session handshake and steady-state loop
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Timed out connecting the transport")]
    ConnectTimeout,

    #[error("Timed out waiting for the key exchange reply")]
    KeyExchangeTimeout,

    #[error("Timed out waiting for stream parameters")]
    StreamInfoTimeout,

    #[error("Timed out waiting for the stream connection switch ack")]
    SwitchTimeout,

    #[error("Console refused the protocol version")]
    VersionRejected,

    #[error("Console refused the session key")]
    KeyRejected,

    #[error("Cryptographic failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] NetworkError),

    /// The local socket could not be opened or attached to the console
    #[error("Socket setup failed: {0}")]
    Socket(NetworkError),

    #[error("Stream connection not established")]
    NotConnected,

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

impl StreamError {
    /// Handshake-stage timeouts, the only failures a session may retry
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            StreamError::ConnectTimeout
                | StreamError::KeyExchangeTimeout
                | StreamError::StreamInfoTimeout
                | StreamError::SwitchTimeout
        )
    }
}

/// Failures of the LAN session request that precedes the stream
#[derive(Error, Debug)]
pub enum SessionRequestError {
    #[error("Session request connection refused")]
    ConnectionRefused,

    #[error("Timed out waiting for the session response")]
    Timeout,

    #[error("Remote play is already in use on the console")]
    InUse,

    #[error("Remote play crashed on the console")]
    Crashed,

    #[error("RP-Version mismatch, console reports {}", .0.as_deref().unwrap_or("no version"))]
    VersionMismatch(Option<String>),

    #[error("Console rejected the session request: reason {0:#x}")]
    Rejected(u32),

    #[error("Malformed session response: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned to the host by `Session`
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session already started")]
    AlreadyStarted,

    #[error("Invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}
