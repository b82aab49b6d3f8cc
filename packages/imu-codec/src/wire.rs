//! Binary wire protocol.
//!
//! Every frame starts with a fixed 12-byte little-endian header:
//!
//! ```text
//! version:u8 | type:u8 | payload_len:u16 | request_id:u32 | timestamp_ms_lo:u32
//! ```
//!
//! Payloads are purely binary for the high-rate telemetry types (motion data,
//! device status) and JSON-encoded UTF-8 for command envelopes. Requests carry
//! a `request_id`; the matching response echoes it. `request_id == 0` marks a
//! fire-and-forget message.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use imu_types::device::DeviceRecord;
use imu_types::error::ErrorCode;
use imu_types::joint::{Session, SessionRequest};

pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 12;
pub const MAX_PAYLOAD_LEN: usize = 65_535;

// ── Message types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Heartbeat = 0x01,
    Error = 0x02,
    Status = 0x03,
    BleScanRequest = 0x10,
    BleScanResponse = 0x11,
    BleConnectRequest = 0x12,
    BleConnectResponse = 0x13,
    BleDisconnectRequest = 0x14,
    BleDisconnectResponse = 0x15,
    BleSyncRequest = 0x16,
    BleSyncResponse = 0x17,
    RecordStartRequest = 0x20,
    RecordStartResponse = 0x21,
    RecordStopRequest = 0x22,
    RecordStopResponse = 0x23,
    MotionData = 0x30,
    DeviceStatus = 0x31,
    BatteryUpdate = 0x32,
    ScanRequest = 0x40,
    Ack = 0xF0,
    Ping = 0xF1,
    Pong = 0xF2,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<MessageType> {
        use MessageType::*;
        Some(match v {
            0x01 => Heartbeat,
            0x02 => Error,
            0x03 => Status,
            0x10 => BleScanRequest,
            0x11 => BleScanResponse,
            0x12 => BleConnectRequest,
            0x13 => BleConnectResponse,
            0x14 => BleDisconnectRequest,
            0x15 => BleDisconnectResponse,
            0x16 => BleSyncRequest,
            0x17 => BleSyncResponse,
            0x20 => RecordStartRequest,
            0x21 => RecordStartResponse,
            0x22 => RecordStopRequest,
            0x23 => RecordStopResponse,
            0x30 => MotionData,
            0x31 => DeviceStatus,
            0x32 => BatteryUpdate,
            0x40 => ScanRequest,
            0xF0 => Ack,
            0xF1 => Ping,
            0xF2 => Pong,
            _ => return None,
        })
    }

    /// The response type paired with a request, where one exists.
    pub fn response_type(&self) -> Option<MessageType> {
        use MessageType::*;
        Some(match self {
            BleScanRequest | ScanRequest => BleScanResponse,
            BleConnectRequest => BleConnectResponse,
            BleDisconnectRequest => BleDisconnectResponse,
            BleSyncRequest => BleSyncResponse,
            RecordStartRequest => RecordStartResponse,
            RecordStopRequest => RecordStopResponse,
            Ping => Pong,
            _ => return None,
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame shorter than header ({0} bytes)")]
    TooShort(usize),
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("unknown message type 0x{0:02X}")]
    UnknownType(u8),
    #[error("payload length {0} exceeds maximum")]
    PayloadTooLarge(usize),
    #[error("header declares {declared} payload bytes, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("json envelope: {0}")]
    Json(#[from] serde_json::Error),
}

impl WireError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::WireProtocolError
    }
}

// ── Header & framing ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    pub version: u8,
    pub msg_type: MessageType,
    pub payload_len: u16,
    pub request_id: u32,
    pub timestamp_ms_lo: u32,
}

/// Assemble a frame. The payload is copied once into the output buffer.
pub fn encode_frame(
    msg_type: MessageType,
    request_id: u32,
    timestamp_ms_lo: u32,
    payload: &[u8],
) -> Result<Bytes, WireError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(msg_type as u8);
    buf.put_u16_le(payload.len() as u16);
    buf.put_u32_le(request_id);
    buf.put_u32_le(timestamp_ms_lo);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Split a frame into its header and payload. Rejects unknown versions and
/// frames whose declared length disagrees with the buffer.
pub fn decode_frame(frame: &[u8]) -> Result<(WireHeader, &[u8]), WireError> {
    if frame.len() < HEADER_LEN {
        return Err(WireError::TooShort(frame.len()));
    }
    let version = frame[0];
    if version != PROTOCOL_VERSION {
        return Err(WireError::BadVersion(version));
    }
    let msg_type = MessageType::from_u8(frame[1]).ok_or(WireError::UnknownType(frame[1]))?;
    let payload_len = u16::from_le_bytes([frame[2], frame[3]]) as usize;
    let request_id = u32::from_le_bytes(frame[4..8].try_into().unwrap());
    let timestamp_ms_lo = u32::from_le_bytes(frame[8..12].try_into().unwrap());

    let payload = &frame[HEADER_LEN..];
    if payload.len() != payload_len {
        return Err(WireError::LengthMismatch { declared: payload_len, actual: payload.len() });
    }
    Ok((
        WireHeader {
            version,
            msg_type,
            payload_len: payload_len as u16,
            request_id,
            timestamp_ms_lo,
        },
        payload,
    ))
}

// ── Motion data payload (binary) ──────────────────────────────────────────────

/// Consolidated dual-joint snapshot carried by `MOTION_DATA` frames.
///
/// Layout: `name_len:u16 | name:UTF-8 | f32×6` — left current/max/min then
/// right current/max/min. This implementation transmits angles, not raw
/// quaternions.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionDataPayload {
    pub device_name: String,
    pub left_current: f32,
    pub left_max: f32,
    pub left_min: f32,
    pub right_current: f32,
    pub right_max: f32,
    pub right_min: f32,
}

impl MotionDataPayload {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let name = self.device_name.as_bytes();
        if name.len() > u16::MAX as usize {
            return Err(WireError::MalformedPayload("device name too long".into()));
        }
        let mut buf = BytesMut::with_capacity(2 + name.len() + 24);
        buf.put_u16_le(name.len() as u16);
        buf.put_slice(name);
        for v in [
            self.left_current,
            self.left_max,
            self.left_min,
            self.right_current,
            self.right_max,
            self.right_min,
        ] {
            buf.put_f32_le(v);
        }
        Ok(buf.to_vec())
    }

    pub fn decode(mut data: &[u8]) -> Result<MotionDataPayload, WireError> {
        if data.remaining() < 2 {
            return Err(WireError::MalformedPayload("missing name length".into()));
        }
        let name_len = data.get_u16_le() as usize;
        if data.remaining() < name_len + 24 {
            return Err(WireError::MalformedPayload("short motion payload".into()));
        }
        let name_bytes = &data[..name_len];
        let device_name = std::str::from_utf8(name_bytes)
            .map_err(|e| WireError::MalformedPayload(format!("name not UTF-8: {e}")))?
            .to_string();
        data.advance(name_len);
        Ok(MotionDataPayload {
            device_name,
            left_current: data.get_f32_le(),
            left_max: data.get_f32_le(),
            left_min: data.get_f32_le(),
            right_current: data.get_f32_le(),
            right_max: data.get_f32_le(),
            right_min: data.get_f32_le(),
        })
    }
}

// ── Device status payload (binary) ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceStatusEntry {
    /// 32-bit device-name hash (see `imu_types::device::name_hash32`).
    pub name_hash: u32,
    pub connected: bool,
    pub battery: f32,
}

/// Low-rate fleet status: `timestamp:u32 | (hash:u32, connected:u8, battery:f32)*`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatusPayload {
    pub timestamp: u32,
    pub entries: Vec<DeviceStatusEntry>,
}

impl DeviceStatusPayload {
    const ENTRY_LEN: usize = 9;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + self.entries.len() * Self::ENTRY_LEN);
        buf.put_u32_le(self.timestamp);
        for e in &self.entries {
            buf.put_u32_le(e.name_hash);
            buf.put_u8(e.connected as u8);
            buf.put_f32_le(e.battery);
        }
        buf.to_vec()
    }

    pub fn decode(mut data: &[u8]) -> Result<DeviceStatusPayload, WireError> {
        if data.remaining() < 4 {
            return Err(WireError::MalformedPayload("missing status timestamp".into()));
        }
        let timestamp = data.get_u32_le();
        if data.remaining() % Self::ENTRY_LEN != 0 {
            return Err(WireError::MalformedPayload("ragged status entries".into()));
        }
        let mut entries = Vec::with_capacity(data.remaining() / Self::ENTRY_LEN);
        while data.has_remaining() {
            entries.push(DeviceStatusEntry {
                name_hash: data.get_u32_le(),
                connected: data.get_u8() != 0,
                battery: data.get_f32_le(),
            });
        }
        Ok(DeviceStatusPayload { timestamp, entries })
    }
}

// ── Command envelopes (JSON) ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequestEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDeviceEnvelope {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResponseEnvelope {
    pub devices: Vec<DiscoveredDeviceEnvelope>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequestEnvelope {
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectRequestEnvelope {
    pub device_id: String,
}

/// Per-device statistics reported by a sync session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSyncStatsEnvelope {
    pub device_id: String,
    pub offset_ms: i64,
    pub rtt_avg_ms: f64,
    pub rtt_min_ms: f64,
    pub rtt_max_ms: f64,
    pub samples_used: u32,
    pub sync_state: imu_types::device::SyncState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponseEnvelope {
    pub results: Vec<DeviceSyncStatsEnvelope>,
}

pub type RecordStartRequestEnvelope = SessionRequest;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordStartResponseEnvelope {
    pub session: Session,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordStopResponseEnvelope {
    pub session_id: String,
    pub chunk_count: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub code: ErrorCode,
    pub message: String,
}

/// Generic command result: `{success, message, code?, data?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into(), code: None, data: None }
    }

    pub fn ok_with(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self { success: true, message: message.into(), code: None, data: Some(data) }
    }

    pub fn err(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { success: false, message: message.into(), code: Some(code), data: None }
    }
}

/// Service snapshot pushed to a subscriber right after it connects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdateEnvelope {
    pub devices: Vec<DeviceRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording: Option<Session>,
    #[serde(default)]
    pub diagnostics: serde_json::Value,
}

/// Encode a JSON envelope into a framed message.
pub fn encode_envelope<T: Serialize>(
    msg_type: MessageType,
    request_id: u32,
    timestamp_ms_lo: u32,
    envelope: &T,
) -> Result<Bytes, WireError> {
    let payload = serde_json::to_vec(envelope)?;
    encode_frame(msg_type, request_id, timestamp_ms_lo, &payload)
}

/// Decode a JSON envelope payload.
pub fn decode_envelope<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, WireError> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn motion_data_frame_matches_documented_length() {
        // header(12) + name_len(2) + name + floats(24)
        let payload = MotionDataPayload {
            device_name: "tropx_ln_top".to_string(),
            left_current: 10.1,
            left_max: 45.3,
            left_min: -3.2,
            right_current: 11.0,
            right_max: 50.1,
            right_min: -4.0,
        };
        let encoded = payload.encode().unwrap();
        let frame = encode_frame(MessageType::MotionData, 0, 1234, &encoded).unwrap();
        assert_eq!(frame.len(), HEADER_LEN + 2 + payload.device_name.len() + 24);

        let (header, body) = decode_frame(&frame).unwrap();
        assert_eq!(header.msg_type, MessageType::MotionData);
        assert_eq!(header.request_id, 0);
        assert_eq!(header.timestamp_ms_lo, 1234);
        let decoded = MotionDataPayload::decode(body).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn bad_version_is_rejected() {
        let frame = encode_frame(MessageType::Heartbeat, 0, 0, &[]).unwrap();
        let mut bytes = frame.to_vec();
        bytes[0] = 2;
        assert!(matches!(decode_frame(&bytes), Err(WireError::BadVersion(2))));
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let frame = encode_frame(MessageType::Heartbeat, 7, 0, &[1, 2, 3]).unwrap();
        let mut bytes = frame.to_vec();
        bytes.pop();
        assert!(matches!(
            decode_frame(&bytes),
            Err(WireError::LengthMismatch { declared: 3, actual: 2 })
        ));
    }

    #[test]
    fn oversized_payload_is_rejected_at_encode() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert!(matches!(
            encode_frame(MessageType::Status, 0, 0, &payload),
            Err(WireError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let frame = encode_frame(MessageType::Heartbeat, 0, 0, &[]).unwrap();
        let mut bytes = frame.to_vec();
        bytes[1] = 0x7F;
        assert!(matches!(decode_frame(&bytes), Err(WireError::UnknownType(0x7F))));
    }

    #[test]
    fn device_status_round_trips() {
        let payload = DeviceStatusPayload {
            timestamp: 42,
            entries: vec![
                DeviceStatusEntry { name_hash: 0xDEADBEEF, connected: true, battery: 87.5 },
                DeviceStatusEntry { name_hash: 1, connected: false, battery: 0.0 },
            ],
        };
        let decoded = DeviceStatusPayload::decode(&payload.encode()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn request_response_pairing() {
        assert_eq!(
            MessageType::BleConnectRequest.response_type(),
            Some(MessageType::BleConnectResponse)
        );
        assert_eq!(MessageType::Ping.response_type(), Some(MessageType::Pong));
        assert_eq!(MessageType::MotionData.response_type(), None);
    }

    #[test]
    fn envelopes_round_trip_via_frames() {
        let env = ErrorEnvelope {
            code: ErrorCode::TimeSyncFailed,
            message: "device went away".into(),
        };
        let frame = encode_envelope(MessageType::Error, 99, 0, &env).unwrap();
        let (header, payload) = decode_frame(&frame).unwrap();
        assert_eq!(header.request_id, 99);
        let back: ErrorEnvelope = decode_envelope(payload).unwrap();
        assert_eq!(back.code, ErrorCode::TimeSyncFailed);
    }
}
