//! Launch specification sent inside the handshake-open message

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::error::ProtocolError;

/// Size of the per-session handshake key
pub const HANDSHAKE_KEY_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoCodec {
    #[serde(rename = "avc")]
    H264,
    #[serde(rename = "hevc")]
    H265,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DynamicRange {
    #[serde(rename = "SDR")]
    Sdr,
    #[serde(rename = "HDR")]
    Hdr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamResolution {
    pub resolution: ResolutionSize,
    pub max_fps: u32,
    pub score: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    pub bw_kbps_sent: u32,
    pub bw_loss: f64,
    pub mtu: u32,
    pub rtt: u32,
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSpecification {
    pub min_fps: u32,
    pub min_bandwidth: u32,
    pub ext_title_id: String,
    pub version: u32,
    pub time_limit: u32,
    pub start_timeout: u32,
    pub afk_timeout: u32,
    pub afk_timeout_disconnect: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Konan {
    pub ps3_access_token: String,
    pub ps3_refresh_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestGameSpecification {
    pub model: String,
    pub platform: String,
    pub audio_channels: String,
    pub language: String,
    pub accept_button: String,
    pub connected_controllers: Vec<String>,
    pub yuv_coefficient: String,
    pub video_encoder_profile: String,
    pub audio_encoder_profile: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub online_id: String,
    pub np_id: String,
    pub region: String,
    pub languages_used: Vec<String>,
}

/// The JSON document describing the requested stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchSpec {
    pub session_id: String,
    pub stream_resolutions: Vec<StreamResolution>,
    pub network: NetworkSpec,
    pub slot_id: u32,
    pub app_specification: AppSpecification,
    pub konan: Konan,
    pub request_game_specification: RequestGameSpecification,
    pub user_profile: UserProfile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<VideoCodec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_range: Option<DynamicRange>,
    pub handshake_key: String,
}

/// Parameters the client chooses for a launch spec
#[derive(Debug, Clone)]
pub struct LaunchParams {
    pub width: u32,
    pub height: u32,
    pub max_fps: u32,
    pub bw_kbps_sent: u32,
    pub mtu: u32,
    pub rtt: u32,
    pub ps5: bool,
    pub codec: VideoCodec,
    pub hdr: bool,
}

impl LaunchSpec {
    pub fn new(params: &LaunchParams, handshake_key: &[u8; HANDSHAKE_KEY_SIZE]) -> Self {
        let (video_codec, dynamic_range) = if params.ps5 {
            let range = if params.hdr {
                DynamicRange::Hdr
            } else {
                DynamicRange::Sdr
            };
            (Some(params.codec), Some(range))
        } else {
            (None, None)
        };

        Self {
            session_id: "sessionId4321".to_string(),
            stream_resolutions: vec![StreamResolution {
                resolution: ResolutionSize {
                    width: params.width,
                    height: params.height,
                },
                max_fps: params.max_fps,
                score: 10,
            }],
            network: NetworkSpec {
                bw_kbps_sent: params.bw_kbps_sent,
                bw_loss: 0.001,
                mtu: params.mtu,
                rtt: params.rtt,
                ports: vec![53, 2053],
            },
            slot_id: 1,
            app_specification: AppSpecification {
                min_fps: 30,
                min_bandwidth: 0,
                ext_title_id: "ps3".to_string(),
                version: 1,
                time_limit: 1,
                start_timeout: 100,
                afk_timeout: 100,
                afk_timeout_disconnect: 100,
            },
            konan: Konan {
                ps3_access_token: "accessToken".to_string(),
                ps3_refresh_token: "refreshToken".to_string(),
            },
            request_game_specification: RequestGameSpecification {
                model: "bravia_tv".to_string(),
                platform: "android".to_string(),
                audio_channels: "5.1".to_string(),
                language: "sp".to_string(),
                accept_button: "X".to_string(),
                connected_controllers: vec!["xinput".into(), "ds3".into(), "ds4".into()],
                yuv_coefficient: "bt601".to_string(),
                video_encoder_profile: "hw4.1".to_string(),
                audio_encoder_profile: "audio1".to_string(),
            },
            user_profile: UserProfile {
                online_id: "psnId".to_string(),
                np_id: "npId".to_string(),
                region: "US".to_string(),
                languages_used: vec!["en".into(), "jp".into()],
            },
            video_codec,
            dynamic_range,
            handshake_key: BASE64.encode(handshake_key),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|_| ProtocolError::InvalidField("launch spec"))
    }

    pub fn from_json(data: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(data).map_err(|_| ProtocolError::InvalidField("launch spec"))
    }

    /// Decoded handshake key
    pub fn handshake_key(&self) -> Result<[u8; HANDSHAKE_KEY_SIZE], ProtocolError> {
        let raw = BASE64
            .decode(&self.handshake_key)
            .map_err(|_| ProtocolError::InvalidField("handshakeKey"))?;
        raw.try_into()
            .map_err(|_| ProtocolError::InvalidField("handshakeKey"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(ps5: bool) -> LaunchParams {
        LaunchParams {
            width: 1280,
            height: 720,
            max_fps: 60,
            bw_kbps_sent: 10000,
            mtu: 1454,
            rtt: 12,
            ps5,
            codec: VideoCodec::H265,
            hdr: false,
        }
    }

    #[test]
    fn test_ps5_extras() {
        let spec = LaunchSpec::new(&params(true), &[7; HANDSHAKE_KEY_SIZE]);
        let json: serde_json::Value = serde_json::from_slice(&spec.to_json().unwrap()).unwrap();
        assert_eq!(json["videoCodec"], "hevc");
        assert_eq!(json["dynamicRange"], "SDR");
        assert_eq!(json["streamResolutions"][0]["resolution"]["width"], 1280);
        assert_eq!(json["network"]["bwKbpsSent"], 10000);
    }

    #[test]
    fn test_ps4_has_no_codec_fields() {
        let spec = LaunchSpec::new(&params(false), &[7; HANDSHAKE_KEY_SIZE]);
        let json: serde_json::Value = serde_json::from_slice(&spec.to_json().unwrap()).unwrap();
        assert!(json.get("videoCodec").is_none());
        assert!(json.get("dynamicRange").is_none());
    }

    #[test]
    fn test_handshake_key_recovered() {
        let key = [0x5a; HANDSHAKE_KEY_SIZE];
        let spec = LaunchSpec::new(&params(true), &key);
        let parsed = LaunchSpec::from_json(&spec.to_json().unwrap()).unwrap();
        assert_eq!(parsed.handshake_key().unwrap(), key);
    }
}
