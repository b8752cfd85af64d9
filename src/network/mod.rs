//! Network module for console streaming
//!
//! Handles the UDP transport, the reliable message layer, NAT traversal
//! through the relay, the stream handshake and the host-facing session.

mod av;
mod congestion;
mod crypto;
mod error;
mod events;
mod feedback;
mod holepunch;
mod resend;
mod rudp;
mod sequence_tracker;
mod session;
mod session_request;
mod signaling;
mod stream_connection;
mod stun;
mod transport;

pub use av::{open_av_datagram, AvFrame, RawPath};
pub use congestion::{PacketStats, QualityAverage, QualityMonitor, QUALITY_SAMPLE_COUNT};
pub use crypto::{
    derive_secret, launch_spec_keystream, new_keystream, sign_public_key, KeyPair, Keystream,
    SharedSecret, StreamKeys,
};
pub use error::{
    CryptoError, HolepunchError, NetworkError, SessionError, SessionRequestError, StreamError,
};
pub use events::{Event, EventReceiver, EventSender, QuitReason};
pub use feedback::FeedbackSender;
pub use holepunch::{ConsoleType, HolepunchConfig, HolepunchSession, HolepunchState, PortKind};
pub use resend::{ResendBuffer, RESEND_BUFFER_SIZE};
pub use rudp::{init_response_body, Received, Rudp};
pub use sequence_tracker::SequenceTracker;
pub use session::Session;
pub use session_request::{request_session, rp_version, SessionGrant, NONCE_SIZE};
pub use signaling::{
    AccessToken, Candidate, CandidateKind, ConnectionRequest, RelayEnd, RelayMessage,
    SessionAction, SessionMessage, SignalingChannel, REQUIRED_SCOPES,
};
pub use stream_connection::{
    StreamConfig, StreamConnection, StreamOutcome, StreamSocket, StreamState, EXPECT_TIMEOUT,
    HEARTBEAT_INTERVAL,
};
pub use stun::{discover_mapped_address, StunResult, DEFAULT_STUN_SERVERS};
pub use transport::UdpTransport;
