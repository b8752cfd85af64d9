//! Session configuration
//!
//! Loaded from a JSON file and/or filled in from command line flags.
//! Every field has a default so partial files are accepted; `validate`
//! checks the combination before a session starts.

use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::{AccessToken, HolepunchConfig, StreamConfig, REQUIRED_SCOPES};
use crate::protocol::{LaunchParams, VideoCodec};

/// Console port for the stream connection on a LAN
pub const STREAM_PORT: u16 = 9296;

/// Console port answering the session request on a LAN
pub const SESSION_PORT: u16 = 9295;

/// Length of generated session ids
const SESSION_ID_LEN: usize = 24;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Requested video stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoProfile {
    pub width: u32,
    pub height: u32,
    pub max_fps: u32,
    pub bitrate_kbps: u32,
    pub codec: VideoCodec,
    pub hdr: bool,
}

impl Default for VideoProfile {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            max_fps: 60,
            bitrate_kbps: 10000,
            codec: VideoCodec::H264,
            hdr: false,
        }
    }
}

/// Internet mode: relay and console identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HolepunchSettings {
    /// OAuth access token
    pub access_token: String,
    /// Space separated scopes granted to the token
    pub token_scopes: String,
    /// Console device id, 64 hex characters
    pub console_duid: String,
    pub relay_url: String,
    pub stun_servers: Vec<String>,
    pub create_timeout_ms: u64,
    pub start_timeout_ms: u64,
    pub candidate_timeout_ms: u64,
    pub delete_timeout_ms: u64,
}

impl Default for HolepunchSettings {
    fn default() -> Self {
        let defaults = HolepunchConfig::default();
        Self {
            access_token: String::new(),
            token_scopes: REQUIRED_SCOPES.join(" "),
            console_duid: String::new(),
            relay_url: String::new(),
            stun_servers: defaults.stun_servers,
            create_timeout_ms: defaults.create_timeout.as_millis() as u64,
            start_timeout_ms: defaults.start_timeout.as_millis() as u64,
            candidate_timeout_ms: defaults.candidate_timeout.as_millis() as u64,
            delete_timeout_ms: defaults.delete_timeout.as_millis() as u64,
        }
    }
}

impl HolepunchSettings {
    pub fn token(&self) -> AccessToken {
        AccessToken::new(self.access_token.clone(), &self.token_scopes)
    }

    pub fn duid_bytes(&self) -> Result<[u8; 32], ConfigError> {
        let bytes = hex::decode(self.console_duid.trim())
            .map_err(|e| ConfigError::invalid("console_duid", e.to_string()))?;
        bytes
            .try_into()
            .map_err(|_| ConfigError::invalid("console_duid", "expected 32 bytes"))
    }

    pub fn holepunch_config(&self) -> HolepunchConfig {
        HolepunchConfig {
            create_timeout: Duration::from_millis(self.create_timeout_ms),
            start_timeout: Duration::from_millis(self.start_timeout_ms),
            candidate_timeout: Duration::from_millis(self.candidate_timeout_ms),
            delete_timeout: Duration::from_millis(self.delete_timeout_ms),
            stun_servers: self.stun_servers.clone(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.access_token.is_empty() {
            return Err(ConfigError::invalid("access_token", "missing"));
        }
        if !(self.relay_url.starts_with("ws://") || self.relay_url.starts_with("wss://")) {
            return Err(ConfigError::invalid(
                "relay_url",
                format!("expected a ws:// or wss:// url, got {:?}", self.relay_url),
            ));
        }
        self.duid_bytes()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Console host for LAN mode, with optional port
    pub host: Option<String>,
    pub ps5: bool,
    /// Registration key from pairing, hex
    pub regist_key: String,
    /// TCP port of the session request on a LAN
    pub session_port: u16,
    /// Pre-shared registration secret, base64 of 16 bytes
    pub morning: String,
    /// Session key for the handshake; generated when absent
    pub session_id: Option<String>,
    pub video: VideoProfile,
    pub mtu: u32,
    pub rtt_ms: u32,
    pub enable_dualsense: bool,
    /// Upper bound for the loss reported to the console
    pub packet_loss_max: f64,
    pub expect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Window in which a timed out handshake is retried once
    pub retry_window_ms: u64,
    /// Set for internet mode
    pub holepunch: Option<HolepunchSettings>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: None,
            ps5: true,
            regist_key: String::new(),
            session_port: SESSION_PORT,
            morning: String::new(),
            session_id: None,
            video: VideoProfile::default(),
            mtu: 1454,
            rtt_ms: 12,
            enable_dualsense: true,
            packet_loss_max: 0.05,
            expect_timeout_ms: 5000,
            heartbeat_interval_ms: 1000,
            retry_window_ms: 10_000,
            holepunch: None,
        }
    }
}

impl SessionConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn is_remote(&self) -> bool {
        self.holepunch.is_some()
    }

    /// Console description for logs
    pub fn target(&self) -> String {
        match (&self.holepunch, &self.host) {
            (Some(settings), _) => format!("duid:{}", settings.console_duid),
            (None, Some(host)) => host.clone(),
            (None, None) => "unset".to_string(),
        }
    }

    /// LAN address as `host:port`, defaulting to the stream port
    pub fn stream_target(&self) -> Option<String> {
        let host = self.host.as_deref()?;
        if host.parse::<std::net::SocketAddr>().is_ok() {
            return Some(host.to_string());
        }
        if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            return Some(std::net::SocketAddr::new(ip, STREAM_PORT).to_string());
        }
        if host.contains(':') {
            Some(host.to_string())
        } else {
            Some(format!("{}:{}", host, STREAM_PORT))
        }
    }

    pub fn morning_bytes(&self) -> Result<[u8; 16], ConfigError> {
        let bytes = BASE64
            .decode(self.morning.trim())
            .map_err(|e| ConfigError::invalid("morning", e.to_string()))?;
        bytes
            .try_into()
            .map_err(|_| ConfigError::invalid("morning", "expected 16 bytes"))
    }

    pub fn regist_key_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        let bytes = hex::decode(self.regist_key.trim())
            .map_err(|e| ConfigError::invalid("regist_key", e.to_string()))?;
        if bytes.is_empty() || bytes.len() > 16 {
            return Err(ConfigError::invalid("regist_key", "expected 1 to 16 bytes"));
        }
        Ok(bytes)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.holepunch {
            Some(settings) => settings.validate()?,
            None => {
                if self.host.as_deref().map_or(true, str::is_empty) {
                    return Err(ConfigError::invalid("host", "required without holepunch settings"));
                }
                self.regist_key_bytes()?;
            }
        }
        self.morning_bytes()?;

        if let Some(session_id) = &self.session_id {
            if session_id.is_empty() || session_id.len() > 64 || !session_id.is_ascii() {
                return Err(ConfigError::invalid(
                    "session_id",
                    "expected 1 to 64 ASCII characters",
                ));
            }
        }
        if self.video.width == 0 || self.video.height == 0 || self.video.max_fps == 0 {
            return Err(ConfigError::invalid("video", "zero dimension or frame rate"));
        }
        if !(0.0..=1.0).contains(&self.packet_loss_max) {
            return Err(ConfigError::invalid("packet_loss_max", "expected 0.0 to 1.0"));
        }
        if self.session_port == 0 {
            return Err(ConfigError::invalid("session_port", "must be non-zero"));
        }
        if self.expect_timeout_ms == 0 || self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::invalid("timeouts", "must be non-zero"));
        }
        Ok(())
    }

    /// Handshake parameters for one stream connection
    pub fn stream_config(&self, session_id: &str) -> Result<StreamConfig, ConfigError> {
        Ok(StreamConfig {
            morning: self.morning_bytes()?,
            session_id: session_id.to_string(),
            launch: LaunchParams {
                width: self.video.width,
                height: self.video.height,
                max_fps: self.video.max_fps,
                bw_kbps_sent: self.video.bitrate_kbps,
                mtu: self.mtu,
                rtt: self.rtt_ms,
                ps5: self.ps5,
                codec: self.video.codec,
                hdr: self.video.hdr,
            },
            enable_dualsense: self.enable_dualsense,
            packet_loss_max: self.packet_loss_max,
            expect_timeout: Duration::from_millis(self.expect_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
        })
    }

    pub fn retry_window(&self) -> Duration {
        Duration::from_millis(self.retry_window_ms)
    }
}

/// Random alphanumeric session key
pub fn random_session_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_ID_LEN)
        .map(char::from)
        .collect()
}
