//! Events delivered to the host application
//!
//! Fire-and-forget: components push into an unbounded channel and never
//! wait for the host. A session emits exactly one `Event::Quit`, last.

use tokio::sync::mpsc;

use super::error::{HolepunchError, NetworkError, SessionRequestError, StreamError};
use super::holepunch::HolepunchState;
use crate::protocol::{EffectIntensity, Rumble, TriggerEffects};

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuitReason {
    /// Stopped by the host
    Stopped,
    /// The console ended the session
    RemoteDisconnected,
    /// The console is shutting down
    RemoteShutdown,
    ConnectTimeout,
    ConnectionRefused,
    KeyExchangeTimeout,
    StreamInfoTimeout,
    VersionMismatch,
    KeyRejected,
    CryptoFailure,
    ProtocolViolation,
    TransportClosed,
    /// A local socket or other OS resource could not be set up
    ResourceExhausted,
    SessionRequestRefused,
    /// Another client is streaming from the console
    SessionRequestInUse,
    SessionRequestCrashed,
    SessionRequestFailed,
    HolepunchUnreachable,
    HolepunchFailed,
    InvalidConfig,
    Unknown,
}

impl QuitReason {
    pub fn is_error(self) -> bool {
        !matches!(
            self,
            QuitReason::Stopped | QuitReason::RemoteDisconnected | QuitReason::RemoteShutdown
        )
    }

    pub fn from_stream_error(e: &StreamError) -> Self {
        match e {
            StreamError::ConnectTimeout | StreamError::SwitchTimeout => QuitReason::ConnectTimeout,
            StreamError::KeyExchangeTimeout => QuitReason::KeyExchangeTimeout,
            StreamError::StreamInfoTimeout => QuitReason::StreamInfoTimeout,
            StreamError::VersionRejected => QuitReason::VersionMismatch,
            StreamError::KeyRejected => QuitReason::KeyRejected,
            StreamError::Crypto(_) => QuitReason::CryptoFailure,
            StreamError::Protocol(_) => QuitReason::ProtocolViolation,
            StreamError::Transport(NetworkError::ConnectionRefused) => QuitReason::ConnectionRefused,
            StreamError::Transport(NetworkError::Crypto(_)) => QuitReason::CryptoFailure,
            StreamError::Transport(_) => QuitReason::TransportClosed,
            StreamError::Socket(_) => QuitReason::ResourceExhausted,
            StreamError::NotConnected | StreamError::InvalidTransition { .. } => QuitReason::Unknown,
        }
    }

    pub fn from_session_request_error(e: &SessionRequestError) -> Self {
        match e {
            SessionRequestError::ConnectionRefused => QuitReason::SessionRequestRefused,
            SessionRequestError::InUse => QuitReason::SessionRequestInUse,
            SessionRequestError::Crashed => QuitReason::SessionRequestCrashed,
            SessionRequestError::VersionMismatch(_) => QuitReason::VersionMismatch,
            SessionRequestError::Timeout
            | SessionRequestError::Rejected(_)
            | SessionRequestError::Malformed(_)
            | SessionRequestError::Io(_) => QuitReason::SessionRequestFailed,
        }
    }

    pub fn from_holepunch_error(e: &HolepunchError) -> Self {
        match e {
            HolepunchError::Unreachable => QuitReason::HolepunchUnreachable,
            HolepunchError::Cancelled => QuitReason::Stopped,
            _ => QuitReason::HolepunchFailed,
        }
    }

    /// Map a reason string from the console's disconnect message
    pub fn from_remote_reason(reason: &str) -> Self {
        if reason == crate::protocol::takion::SERVER_SHUTDOWN_REASON {
            QuitReason::RemoteShutdown
        } else {
            QuitReason::RemoteDisconnected
        }
    }
}

impl std::fmt::Display for QuitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            QuitReason::Stopped => "stopped",
            QuitReason::RemoteDisconnected => "remote disconnected",
            QuitReason::RemoteShutdown => "remote shut down",
            QuitReason::ConnectTimeout => "connect timed out",
            QuitReason::ConnectionRefused => "connection refused",
            QuitReason::KeyExchangeTimeout => "key exchange timed out",
            QuitReason::StreamInfoTimeout => "stream parameters timed out",
            QuitReason::VersionMismatch => "protocol version mismatch",
            QuitReason::KeyRejected => "session key rejected",
            QuitReason::CryptoFailure => "cryptographic failure",
            QuitReason::ProtocolViolation => "protocol violation",
            QuitReason::TransportClosed => "transport closed",
            QuitReason::ResourceExhausted => "socket or resource failure",
            QuitReason::SessionRequestRefused => "session request refused",
            QuitReason::SessionRequestInUse => "remote play already in use",
            QuitReason::SessionRequestCrashed => "remote play crashed on the console",
            QuitReason::SessionRequestFailed => "session request failed",
            QuitReason::HolepunchUnreachable => "console unreachable",
            QuitReason::HolepunchFailed => "holepunch failed",
            QuitReason::InvalidConfig => "invalid configuration",
            QuitReason::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connected,
    Quit {
        reason: QuitReason,
        message: Option<String>,
    },
    /// The console assigned its session id
    RegistrationFinished {
        session_id: String,
    },
    LoginPinRequested {
        pin_incorrect: bool,
    },
    HolepunchProgress(HolepunchState),
    NicknameReceived(String),
    Rumble(Rumble),
    LedColor([u8; 3]),
    PlayerIndex(u8),
    MotionReset,
    HapticIntensity(EffectIntensity),
    TriggerIntensity(EffectIntensity),
    TriggerEffects(TriggerEffects),
}

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
