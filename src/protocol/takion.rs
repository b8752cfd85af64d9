//! Session control messages carried inside SESSION_MESSAGE frames
//!
//! Body layout: `data_type u8 | len u16 | record[len]`. Protobuf records
//! (data type 0) hold one `TakionMessage`; the other data types carry raw
//! controller feedback (rumble, pad info, trigger effects) decoded in
//! `pad.rs`.

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;

use super::error::ProtocolError;
use super::wire::ByteReader;

/// Size of the audio format header in stream parameters
pub const AUDIO_HEADER_SIZE: usize = 14;

/// Reason string sent when the client ends a session
pub const CLIENT_DISCONNECT_REASON: &str = "Client Disconnecting";

/// Reason string the console sends when it shuts down
pub const SERVER_SHUTDOWN_REASON: &str = "Server shutting down";

/// Kinds of data carried in a session message body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataType {
    Protobuf = 0,
    Rumble = 7,
    PadInfo = 9,
    TriggerEffects = 11,
}

impl TryFrom<u8> for DataType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DataType::Protobuf),
            7 => Ok(DataType::Rumble),
            9 => Ok(DataType::PadInfo),
            11 => Ok(DataType::TriggerEffects),
            other => Err(ProtocolError::UnknownDataType(other)),
        }
    }
}

/// Frame a record with its data type and length
pub fn encode_data(data_type: DataType, record: &[u8]) -> Result<Bytes, ProtocolError> {
    let len = u16::try_from(record.len()).map_err(|_| ProtocolError::PayloadTooLarge(record.len()))?;
    let mut buf = BytesMut::with_capacity(3 + record.len());
    buf.put_u8(data_type as u8);
    buf.put_u16(len);
    buf.put_slice(record);
    Ok(buf.freeze())
}

/// Split a session message body into data type and record
pub fn decode_data(body: &[u8]) -> Result<(DataType, &[u8]), ProtocolError> {
    let mut reader = ByteReader::new(body);
    let data_type = DataType::try_from(reader.read_u8()?)?;
    let len = reader.read_u16()? as usize;
    let record = reader.read_bytes(len)?;
    Ok((data_type, record))
}

/// Wire identifiers of protobuf message kinds
mod kind {
    pub const BIG: u64 = 1;
    pub const BANG: u64 = 2;
    pub const STREAMINFO: u64 = 3;
    pub const STREAMINFOACK: u64 = 4;
    pub const HEARTBEAT: u64 = 5;
    pub const DISCONNECT: u64 = 6;
    pub const CONNECTIONQUALITY: u64 = 7;
    pub const CORRUPTFRAME: u64 = 8;
    pub const IDRREQUEST: u64 = 9;
    pub const CONTROLLERCONNECTION: u64 = 10;
    pub const CONGESTION: u64 = 11;
}

/// Handshake-open message sent by the client
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct BigPayload {
    #[prost(uint32, tag = "1")]
    pub client_version: u32,
    #[prost(string, tag = "2")]
    pub session_key: String,
    #[prost(string, tag = "3")]
    pub launch_spec: String,
    #[prost(bytes = "vec", tag = "4")]
    pub encrypted_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub ecdh_pub_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "6")]
    pub ecdh_sig: Vec<u8>,
}

/// Handshake reply from the console
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct BangPayload {
    #[prost(bool, tag = "1")]
    pub version_accepted: bool,
    #[prost(bool, tag = "2")]
    pub encrypted_key_accepted: bool,
    #[prost(bytes = "vec", tag = "3")]
    pub ecdh_pub_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub ecdh_sig: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Resolution {
    #[prost(uint32, tag = "1")]
    pub width: u32,
    #[prost(uint32, tag = "2")]
    pub height: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub video_header: Vec<u8>,
}

/// Stream parameters: audio format and the offered video resolutions
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct StreamInfo {
    #[prost(bytes = "vec", tag = "1")]
    pub audio_header: Vec<u8>,
    #[prost(message, repeated, tag = "2")]
    pub resolutions: Vec<Resolution>,
}

/// Periodic quality report from the console
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ConnectionQuality {
    #[prost(uint32, tag = "1")]
    pub target_bitrate: u32,
    #[prost(uint32, tag = "2")]
    pub upstream_bitrate: u32,
    #[prost(float, tag = "3")]
    pub upstream_loss: f32,
    #[prost(bool, tag = "4")]
    pub disable_upstream_audio: bool,
    #[prost(double, tag = "5")]
    pub rtt: f64,
    #[prost(uint64, tag = "6")]
    pub loss: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
struct DisconnectPayload {
    #[prost(string, tag = "1")]
    reason: String,
}

/// Frame range of a corrupt frame report, or received/lost counts of a
/// congestion report
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
struct CounterPair {
    #[prost(uint32, tag = "1")]
    first: u32,
    #[prost(uint32, tag = "2")]
    second: u32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
struct ControllerConnectionPayload {
    #[prost(bool, tag = "1")]
    connected: bool,
    #[prost(uint32, tag = "2")]
    controller_type: u32,
}

/// Envelope record: a message kind plus at most one payload
#[derive(Clone, PartialEq, ::prost::Message)]
struct TakionRecord {
    #[prost(uint64, optional, tag = "1")]
    kind: Option<u64>,
    #[prost(message, optional, tag = "2")]
    big: Option<BigPayload>,
    #[prost(message, optional, tag = "3")]
    bang: Option<BangPayload>,
    #[prost(message, optional, tag = "4")]
    stream_info: Option<StreamInfo>,
    #[prost(message, optional, tag = "5")]
    disconnect: Option<DisconnectPayload>,
    #[prost(message, optional, tag = "6")]
    connection_quality: Option<ConnectionQuality>,
    #[prost(message, optional, tag = "7")]
    corrupt_frame: Option<CounterPair>,
    #[prost(message, optional, tag = "8")]
    controller_connection: Option<ControllerConnectionPayload>,
    #[prost(message, optional, tag = "9")]
    congestion: Option<CounterPair>,
}

impl TakionRecord {
    fn of_kind(kind: u64) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControllerType {
    DualShock4 = 0,
    DualSense = 1,
}

impl TryFrom<u32> for ControllerType {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ControllerType::DualShock4),
            1 => Ok(ControllerType::DualSense),
            _ => Err(ProtocolError::InvalidField("controller_type")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TakionMessage {
    Big(BigPayload),
    Bang(BangPayload),
    StreamInfo(StreamInfo),
    StreamInfoAck,
    Heartbeat,
    Disconnect { reason: String },
    ConnectionQuality(ConnectionQuality),
    CorruptFrame { start: u32, end: u32 },
    IdrRequest,
    ControllerConnection { connected: bool, controller_type: ControllerType },
    Congestion { received: u32, lost: u32 },
}

impl TakionMessage {
    pub fn name(&self) -> &'static str {
        match self {
            TakionMessage::Big(_) => "BIG",
            TakionMessage::Bang(_) => "BANG",
            TakionMessage::StreamInfo(_) => "STREAMINFO",
            TakionMessage::StreamInfoAck => "STREAMINFOACK",
            TakionMessage::Heartbeat => "HEARTBEAT",
            TakionMessage::Disconnect { .. } => "DISCONNECT",
            TakionMessage::ConnectionQuality(_) => "CONNECTIONQUALITY",
            TakionMessage::CorruptFrame { .. } => "CORRUPTFRAME",
            TakionMessage::IdrRequest => "IDRREQUEST",
            TakionMessage::ControllerConnection { .. } => "CONTROLLERCONNECTION",
            TakionMessage::Congestion { .. } => "CONGESTION",
        }
    }

    fn to_record(&self) -> TakionRecord {
        match self {
            TakionMessage::Big(big) => TakionRecord {
                big: Some(big.clone()),
                ..TakionRecord::of_kind(kind::BIG)
            },
            TakionMessage::Bang(bang) => TakionRecord {
                bang: Some(bang.clone()),
                ..TakionRecord::of_kind(kind::BANG)
            },
            TakionMessage::StreamInfo(info) => TakionRecord {
                stream_info: Some(info.clone()),
                ..TakionRecord::of_kind(kind::STREAMINFO)
            },
            TakionMessage::StreamInfoAck => TakionRecord::of_kind(kind::STREAMINFOACK),
            TakionMessage::Heartbeat => TakionRecord::of_kind(kind::HEARTBEAT),
            TakionMessage::Disconnect { reason } => TakionRecord {
                disconnect: Some(DisconnectPayload {
                    reason: reason.clone(),
                }),
                ..TakionRecord::of_kind(kind::DISCONNECT)
            },
            TakionMessage::ConnectionQuality(q) => TakionRecord {
                connection_quality: Some(*q),
                ..TakionRecord::of_kind(kind::CONNECTIONQUALITY)
            },
            TakionMessage::CorruptFrame { start, end } => TakionRecord {
                corrupt_frame: Some(CounterPair {
                    first: *start,
                    second: *end,
                }),
                ..TakionRecord::of_kind(kind::CORRUPTFRAME)
            },
            TakionMessage::IdrRequest => TakionRecord::of_kind(kind::IDRREQUEST),
            TakionMessage::ControllerConnection {
                connected,
                controller_type,
            } => TakionRecord {
                controller_connection: Some(ControllerConnectionPayload {
                    connected: *connected,
                    controller_type: *controller_type as u32,
                }),
                ..TakionRecord::of_kind(kind::CONTROLLERCONNECTION)
            },
            TakionMessage::Congestion { received, lost } => TakionRecord {
                congestion: Some(CounterPair {
                    first: *received,
                    second: *lost,
                }),
                ..TakionRecord::of_kind(kind::CONGESTION)
            },
        }
    }

    /// Encode as a protobuf record (without the data-type framing)
    pub fn encode(&self) -> Bytes {
        Bytes::from(self.to_record().encode_to_vec())
    }

    /// Encode with data-type framing, ready for `send_session`
    pub fn to_body(&self) -> Result<Bytes, ProtocolError> {
        encode_data(DataType::Protobuf, &self.encode())
    }

    /// Decode a protobuf record. Unknown fields are skipped; an unknown or
    /// missing message kind is an error, as is a kind whose payload is absent.
    pub fn decode(record: &[u8]) -> Result<Self, ProtocolError> {
        let record = TakionRecord::decode(record)?;
        let kind = record.kind.ok_or(ProtocolError::MissingField("type"))?;
        let missing = || ProtocolError::MissingField("payload");

        match kind {
            kind::BIG => record.big.map(TakionMessage::Big).ok_or_else(missing),
            kind::BANG => record.bang.map(TakionMessage::Bang).ok_or_else(missing),
            kind::STREAMINFO => record
                .stream_info
                .map(TakionMessage::StreamInfo)
                .ok_or_else(missing),
            kind::STREAMINFOACK => Ok(TakionMessage::StreamInfoAck),
            kind::HEARTBEAT => Ok(TakionMessage::Heartbeat),
            kind::DISCONNECT => {
                let payload = record.disconnect.ok_or_else(missing)?;
                Ok(TakionMessage::Disconnect {
                    reason: payload.reason,
                })
            }
            kind::CONNECTIONQUALITY => record
                .connection_quality
                .map(TakionMessage::ConnectionQuality)
                .ok_or_else(missing),
            kind::CORRUPTFRAME => {
                let pair = record.corrupt_frame.ok_or_else(missing)?;
                Ok(TakionMessage::CorruptFrame {
                    start: pair.first,
                    end: pair.second,
                })
            }
            kind::IDRREQUEST => Ok(TakionMessage::IdrRequest),
            kind::CONTROLLERCONNECTION => {
                let payload = record.controller_connection.ok_or_else(missing)?;
                Ok(TakionMessage::ControllerConnection {
                    connected: payload.connected,
                    controller_type: ControllerType::try_from(payload.controller_type)?,
                })
            }
            kind::CONGESTION => {
                let pair = record.congestion.ok_or_else(missing)?;
                Ok(TakionMessage::Congestion {
                    received: pair.first,
                    lost: pair.second,
                })
            }
            other => Err(ProtocolError::UnknownMessageKind(other)),
        }
    }
}

/// Audio header announcing the client's microphone stream
/// (16 bit, mono, 48 kHz, 480-sample frames)
pub fn microphone_audio_header() -> Vec<u8> {
    let mut header = Vec::with_capacity(AUDIO_HEADER_SIZE);
    header.put_u8(16);
    header.put_u8(1);
    header.put_u32(48000);
    header.put_u32(480);
    header.put_u32(1);
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_roundtrip() {
        let big = BigPayload {
            client_version: 12,
            session_key: "AbCdEf0123456789AbCdEf01".to_string(),
            launch_spec: "bGF1bmNo".to_string(),
            encrypted_key: vec![0, 0, 0, 0],
            ecdh_pub_key: vec![0x42; 32],
            ecdh_sig: vec![0x24; 32],
        };
        let msg = TakionMessage::Big(big);
        let body = msg.to_body().unwrap();
        let (data_type, record) = decode_data(&body).unwrap();
        assert_eq!(data_type, DataType::Protobuf);
        assert_eq!(TakionMessage::decode(record).unwrap(), msg);
    }

    #[test]
    fn test_stream_info_with_multiple_resolutions() {
        let info = StreamInfo {
            audio_header: vec![1; AUDIO_HEADER_SIZE],
            resolutions: vec![
                Resolution {
                    width: 1280,
                    height: 720,
                    video_header: vec![0, 0, 0, 1, 0x67],
                },
                Resolution {
                    width: 1920,
                    height: 1080,
                    video_header: vec![0, 0, 0, 1, 0x68],
                },
            ],
        };
        let msg = TakionMessage::StreamInfo(info.clone());
        match TakionMessage::decode(&msg.encode()).unwrap() {
            TakionMessage::StreamInfo(decoded) => assert_eq!(decoded, info),
            other => panic!("Wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let record = TakionRecord::of_kind(99).encode_to_vec();
        assert_eq!(
            TakionMessage::decode(&record),
            Err(ProtocolError::UnknownMessageKind(99))
        );
    }

    #[test]
    fn test_missing_kind_rejected() {
        let record = TakionRecord {
            disconnect: Some(DisconnectPayload {
                reason: "bye".to_string(),
            }),
            ..TakionRecord::default()
        };
        assert_eq!(
            TakionMessage::decode(&record.encode_to_vec()),
            Err(ProtocolError::MissingField("type"))
        );
    }

    #[test]
    fn test_missing_payload_rejected() {
        let record = TakionRecord::of_kind(kind::BANG).encode_to_vec();
        assert_eq!(
            TakionMessage::decode(&record),
            Err(ProtocolError::MissingField("payload"))
        );
    }

    #[test]
    fn test_unknown_fields_skipped() {
        let mut record = TakionMessage::Disconnect {
            reason: "bye".to_string(),
        }
        .encode()
        .to_vec();
        // field 20, length-delimited, "extension"
        record.extend_from_slice(&[0xa2, 0x01, 9]);
        record.extend_from_slice(b"extension");
        assert_eq!(
            TakionMessage::decode(&record).unwrap(),
            TakionMessage::Disconnect {
                reason: "bye".to_string()
            }
        );
    }

    #[test]
    fn test_malformed_record_rejected() {
        // field 4 declares 10 bytes but only 2 follow
        let record = [0x08, kind::STREAMINFO as u8, 0x22, 0x0a, 0x01, 0x02];
        assert!(matches!(
            TakionMessage::decode(&record),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_kind_is_first_field_on_the_wire() {
        let record = TakionMessage::Heartbeat.encode();
        assert_eq!(&record[..], &[0x08, kind::HEARTBEAT as u8]);
    }

    #[test]
    fn test_invalid_controller_type_rejected() {
        let record = TakionRecord {
            controller_connection: Some(ControllerConnectionPayload {
                connected: true,
                controller_type: 7,
            }),
            ..TakionRecord::of_kind(kind::CONTROLLERCONNECTION)
        };
        assert_eq!(
            TakionMessage::decode(&record.encode_to_vec()),
            Err(ProtocolError::InvalidField("controller_type"))
        );
    }

    #[test]
    fn test_truncated_data_framing() {
        let body = [DataType::Protobuf as u8, 0x00, 0x10, 0x01];
        assert!(matches!(
            decode_data(&body),
            Err(ProtocolError::Truncated { .. })
        ));
        assert_eq!(
            decode_data(&[0x42, 0, 0]),
            Err(ProtocolError::UnknownDataType(0x42))
        );
    }

    #[test]
    fn test_microphone_header_size() {
        assert_eq!(microphone_audio_header().len(), AUDIO_HEADER_SIZE);
    }
}
