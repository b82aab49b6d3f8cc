//! Error taxonomy shared across the suite.
//!
//! Codes travel on the wire in error envelopes and command results; the
//! variants are kinds, not component-specific types. Components recover
//! locally where they can and surface the code otherwise.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InitFailed,
    ServiceUnavailable,
    DeviceConnectFailed,
    DeviceDisconnected,
    BluetoothUnavailable,
    TimeSyncFailed,
    SyncSuspectedReset,
    MotionProcessingFailed,
    RecordingOverrun,
    DataCorruption,
    WireProtocolError,
    ClientDisconnected,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InitFailed => "INIT_FAILED",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::DeviceConnectFailed => "DEVICE_CONNECT_FAILED",
            ErrorCode::DeviceDisconnected => "DEVICE_DISCONNECTED",
            ErrorCode::BluetoothUnavailable => "BLUETOOTH_UNAVAILABLE",
            ErrorCode::TimeSyncFailed => "TIME_SYNC_FAILED",
            ErrorCode::SyncSuspectedReset => "SYNC_SUSPECTED_RESET",
            ErrorCode::MotionProcessingFailed => "MOTION_PROCESSING_FAILED",
            ErrorCode::RecordingOverrun => "RECORDING_OVERRUN",
            ErrorCode::DataCorruption => "DATA_CORRUPTION",
            ErrorCode::WireProtocolError => "WIRE_PROTOCOL_ERROR",
            ErrorCode::ClientDisconnected => "CLIENT_DISCONNECTED",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }

    /// Fatal codes keep the affected component down until restart; everything
    /// else is recoverable at some scope.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorCode::InitFailed | ErrorCode::ServiceUnavailable)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A coded error surfaced by any public operation.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct CodedError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CodedError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: None }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_screaming_snake() {
        let s = serde_json::to_string(&ErrorCode::SyncSuspectedReset).unwrap();
        assert_eq!(s, "\"SYNC_SUSPECTED_RESET\"");
        assert_eq!(ErrorCode::SyncSuspectedReset.as_str(), "SYNC_SUSPECTED_RESET");
    }

    #[test]
    fn only_init_and_service_are_fatal() {
        assert!(ErrorCode::InitFailed.is_fatal());
        assert!(ErrorCode::ServiceUnavailable.is_fatal());
        assert!(!ErrorCode::TimeSyncFailed.is_fatal());
        assert!(!ErrorCode::WireProtocolError.is_fatal());
    }
}
