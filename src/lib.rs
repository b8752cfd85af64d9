//! remoteplay - Console remote play streaming client core
//!
//! This library establishes and runs a streaming session with a console:
//! the reliable UDP layer, NAT traversal through the relay for internet
//! mode, the key exchange and the live control channel.

pub mod config;
pub mod network;
pub mod protocol;

pub use config::SessionConfig;
pub use network::{Event, QuitReason, Session};
