//! Controller feedback formats
//!
//! Inbound: rumble, pad info (LED, player index, motion reset, DualSense
//! effect intensities) and adaptive trigger effects. Outbound: the
//! controller state snapshot sent by the feedback sender.

use std::f32::consts::FRAC_1_SQRT_2;

use serde::{Deserialize, Serialize};

use super::error::ProtocolError;
use super::wire::ByteReader;

const GYRO_MIN: f32 = -30.0;
const GYRO_MAX: f32 = 30.0;
const ACCEL_MIN: f32 = -5.0;
const ACCEL_MAX: f32 = 5.0;

/// Length of the v9 feedback state block
pub const FEEDBACK_STATE_SIZE_V9: usize = 0x19;
/// Length of the v12 feedback state block
pub const FEEDBACK_STATE_SIZE_V12: usize = 0x1c;

/// Short pad info layout
const PAD_INFO_SHORT: usize = 0x11;
/// Pad info layout prefixed with feedback sequence number and timestamp
const PAD_INFO_LONG: usize = 0x19;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rumble {
    pub unknown: u8,
    pub left: u8,
    pub right: u8,
}

impl Rumble {
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = ByteReader::new(buf);
        Ok(Self {
            unknown: r.read_u8()?,
            left: r.read_u8()?,
            right: r.read_u8()?,
        })
    }
}

/// DualSense haptic / adaptive trigger strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EffectIntensity {
    Off = 0,
    Strong = 1,
    Medium = 2,
    Weak = 3,
}

impl TryFrom<u8> for EffectIntensity {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EffectIntensity::Off),
            1 => Ok(EffectIntensity::Strong),
            2 => Ok(EffectIntensity::Medium),
            3 => Ok(EffectIntensity::Weak),
            _ => Err(ProtocolError::InvalidField("intensity")),
        }
    }
}

/// Decoded pad info message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PadInfo {
    pub player_index: u8,
    pub led: [u8; 3],
    pub motion_reset: bool,
    pub haptic_intensity: EffectIntensity,
    pub trigger_intensity: EffectIntensity,
}

impl PadInfo {
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        // The long form carries feedback seq num + timestamp in its first 8 bytes
        let (base, intensity_at) = match buf.len() {
            PAD_INFO_LONG => (8, 20),
            PAD_INFO_SHORT => (0, 12),
            _ => return Err(ProtocolError::InvalidField("pad info size")),
        };
        let mut r = ByteReader::new(&buf[base..]);
        let player_index = r.read_u8()?;
        let led = r.read_array::<3>()?;
        let motion_reset = r.read_u8()? != 0;
        Ok(Self {
            player_index,
            led,
            motion_reset,
            haptic_intensity: EffectIntensity::try_from(buf[intensity_at])?,
            trigger_intensity: EffectIntensity::try_from(buf[intensity_at + 1])?,
        })
    }
}

/// Changes produced by applying a pad info message to the tracked pad state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PadChanges {
    pub player_index: Option<u8>,
    pub led: Option<[u8; 3]>,
    pub motion_reset: bool,
    pub haptic_intensity: Option<EffectIntensity>,
    pub trigger_intensity: Option<EffectIntensity>,
}

/// Last known pad state, used to report only what changed
#[derive(Debug, Clone)]
pub struct PadState {
    player_index: u8,
    led: [u8; 3],
    haptic_intensity: EffectIntensity,
    trigger_intensity: EffectIntensity,
}

impl Default for PadState {
    fn default() -> Self {
        Self {
            player_index: 0,
            led: [0; 3],
            haptic_intensity: EffectIntensity::Strong,
            trigger_intensity: EffectIntensity::Strong,
        }
    }
}

impl PadState {
    pub fn apply(&mut self, info: &PadInfo) -> PadChanges {
        let mut changes = PadChanges {
            motion_reset: info.motion_reset,
            ..PadChanges::default()
        };
        if info.player_index != self.player_index {
            self.player_index = info.player_index;
            changes.player_index = Some(info.player_index);
        }
        if info.led != self.led {
            self.led = info.led;
            changes.led = Some(info.led);
        }
        if info.haptic_intensity != self.haptic_intensity {
            self.haptic_intensity = info.haptic_intensity;
            changes.haptic_intensity = Some(info.haptic_intensity);
        }
        if info.trigger_intensity != self.trigger_intensity {
            self.trigger_intensity = info.trigger_intensity;
            changes.trigger_intensity = Some(info.trigger_intensity);
        }
        changes
    }
}

/// Adaptive trigger effect parameters for both triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEffects {
    pub type_left: u8,
    pub type_right: u8,
    pub left: [u8; 10],
    pub right: [u8; 10],
}

impl TriggerEffects {
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = ByteReader::new(buf);
        r.skip(1)?;
        let type_left = r.read_u8()?;
        let type_right = r.read_u8()?;
        r.skip(2)?;
        let left = r.read_array::<10>()?;
        let right = r.read_array::<10>()?;
        Ok(Self {
            type_left,
            type_right,
            left,
            right,
        })
    }
}

/// Local controller state as sent by the feedback sender
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    pub buttons: u32,
    pub l2: u8,
    pub r2: u8,
    pub left_x: i16,
    pub left_y: i16,
    pub right_x: i16,
    pub right_y: i16,
    pub gyro: [f32; 3],
    pub accel: [f32; 3],
    /// Orientation quaternion (x, y, z, w)
    pub orient: [f32; 4],
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            buttons: 0,
            l2: 0,
            r2: 0,
            left_x: 0,
            left_y: 0,
            right_x: 0,
            right_y: 0,
            gyro: [0.0; 3],
            accel: [0.0, 1.0, 0.0],
            orient: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

fn scale_u16(value: f32, min: f32, max: f32) -> u16 {
    let clamped = value.clamp(min, max);
    (65535.0 * (clamped - min) / (max - min)) as u16
}

/// Pack a unit quaternion into 32 bits: sign and index of the largest
/// component, then the other three at 9 bits each
fn compress_quat(q: &[f32; 4]) -> u32 {
    let mut largest = 0;
    for i in 1..4 {
        if q[i].abs() > q[largest].abs() {
            largest = i;
        }
    }
    let mut r = u32::from(q[largest] < 0.0) | ((largest as u32) << 1);
    for i in 0..3 {
        let qi = if i < largest { i } else { i + 1 };
        let v = q[qi].clamp(-FRAC_1_SQRT_2, FRAC_1_SQRT_2) + FRAC_1_SQRT_2;
        let v = v * (0x1ff as f32) / (2.0 * FRAC_1_SQRT_2);
        r |= (v as u32) << (3 + i * 9);
    }
    r
}

impl ControllerState {
    /// Motion and stick block shared by all protocol versions
    pub fn encode_v9(&self) -> [u8; FEEDBACK_STATE_SIZE_V9] {
        let mut buf = [0u8; FEEDBACK_STATE_SIZE_V9];
        buf[0] = 0xa0;
        for (i, g) in self.gyro.iter().enumerate() {
            let v = scale_u16(*g, GYRO_MIN, GYRO_MAX);
            buf[1 + i * 2..3 + i * 2].copy_from_slice(&v.to_le_bytes());
        }
        for (i, a) in self.accel.iter().enumerate() {
            let v = scale_u16(*a, ACCEL_MIN, ACCEL_MAX);
            buf[7 + i * 2..9 + i * 2].copy_from_slice(&v.to_le_bytes());
        }
        buf[0x0d..0x11].copy_from_slice(&compress_quat(&self.orient).to_le_bytes());
        buf[0x11..0x13].copy_from_slice(&self.left_x.to_be_bytes());
        buf[0x13..0x15].copy_from_slice(&self.left_y.to_be_bytes());
        buf[0x15..0x17].copy_from_slice(&self.right_x.to_be_bytes());
        buf[0x17..0x19].copy_from_slice(&self.right_y.to_be_bytes());
        buf
    }

    /// PS5 layout: the v9 block plus the DualSense feature flag
    pub fn encode_v12(&self, enable_dualsense: bool) -> [u8; FEEDBACK_STATE_SIZE_V12] {
        let mut buf = [0u8; FEEDBACK_STATE_SIZE_V12];
        buf[..FEEDBACK_STATE_SIZE_V9].copy_from_slice(&self.encode_v9());
        buf[0x1b] = if enable_dualsense { 0x0 } else { 0x1 };
        buf
    }

    /// Full feedback payload: buttons and triggers followed by the state block
    pub fn encode(&self, ps5: bool, enable_dualsense: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + FEEDBACK_STATE_SIZE_V12);
        out.extend_from_slice(&self.buttons.to_be_bytes());
        out.push(self.l2);
        out.push(self.r2);
        if ps5 {
            out.extend_from_slice(&self.encode_v12(enable_dualsense));
        } else {
            out.extend_from_slice(&self.encode_v9());
        }
        out
    }
}
