//! Wire formats
//!
//! Reliable-UDP frames, session control records, control-channel messages,
//! AV datagrams and the launch specification.

pub mod av;
pub mod ctrl;
mod error;
pub mod launchspec;
pub mod pad;
pub mod rudp;
pub mod takion;
pub mod wire;

pub use av::{AvKind, AvPacket, CongestionReport};
pub use ctrl::{CtrlMessage, CtrlType, LoginState};
pub use error::ProtocolError;
pub use launchspec::{LaunchParams, LaunchSpec, VideoCodec, HANDSHAKE_KEY_SIZE};
pub use pad::{ControllerState, EffectIntensity, PadInfo, PadState, Rumble, TriggerEffects};
pub use rudp::{RudpMessage, RudpType};
pub use takion::{
    BangPayload, BigPayload, ConnectionQuality, ControllerType, DataType, Resolution, StreamInfo,
    TakionMessage,
};
