//! Device transport capability.
//!
//! The backend is polymorphic over this trait: the simulator fleet implements
//! it in-process, a BLE GATT stack would implement it against real hardware.
//! Implementations serialize operations per device (FIFO) but run freely in
//! parallel across devices; every operation is cancellable by dropping the
//! future.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

// ── Characteristics ───────────────────────────────────────────────────────────

/// Command characteristic: write `[opcode, args...]` to execute.
pub const CHAR_COMMAND: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
/// Reply characteristic: latched response of the last command with a reply.
pub const CHAR_REPLY: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);
/// System status register, read/write one byte.
pub const CHAR_SYSTEM_STATUS: Uuid = Uuid::from_u128(0x6e400004_b5a3_f393_e0a9_e50e24dcca9e);
/// IMU data stream, notify-only.
pub const CHAR_IMU_DATA: Uuid = Uuid::from_u128(0x6e400005_b5a3_f393_e0a9_e50e24dcca9e);
/// Battery level, notify + read, one byte percent.
pub const CHAR_BATTERY: Uuid = Uuid::from_u128(0x6e400006_b5a3_f393_e0a9_e50e24dcca9e);

// ── Firmware opcodes ──────────────────────────────────────────────────────────

pub mod opcode {
    /// `[0x0B, u32 LE unix seconds]` — initialize the RTC.
    pub const SET_DATETIME: u8 = 0x0B;
    /// `[0x31, u32 LE ms]` — firmware subtracts the absolute value from all
    /// subsequent timestamps. Written at most once per device lifetime.
    pub const SET_CLOCK_OFFSET: u8 = 0x31;
    /// `[0x32]` — enter time-sync mode.
    pub const ENTER_TIMESYNC: u8 = 0x32;
    /// `[0x33]` — exit time-sync mode.
    pub const EXIT_TIMESYNC: u8 = 0x33;
    /// `[0xB2]` — latch the current device counter (u64 LE ms) into the
    /// reply characteristic.
    pub const GET_TIMESTAMP: u8 = 0xB2;
}

/// System-status value for IDLE; time sync requires the device parked here.
pub const SYSTEM_STATUS_IDLE: u8 = 0x02;
/// System-status value while streaming IMU data.
pub const SYSTEM_STATUS_STREAMING: u8 = 0x04;

/// Reference epoch for device counters: unix 1,580,000,000 s
/// (2020-01-26T00:53:20Z).
pub const DEVICE_COUNTER_EPOCH_UNIX_S: u64 = 1_580_000_000;

// ── Scan types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    /// Only report devices whose advertised name contains this substring.
    pub name_contains: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub id: String,
    pub name: String,
    pub rssi: Option<i16>,
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("adapter unavailable: {0}")]
    Unavailable(String),
    #[error("unknown device {0}")]
    UnknownDevice(String),
    #[error("device {0} is not connected")]
    NotConnected(String),
    #[error("connect to {0} failed: {1}")]
    ConnectFailed(String, String),
    #[error("characteristic {0} not supported")]
    UnknownCharacteristic(Uuid),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("read failed: {0}")]
    ReadFailed(String),
    #[error("operation timed out")]
    Timeout,
}

// ── Capability trait ──────────────────────────────────────────────────────────

/// Short-range wireless transport to the sensor fleet.
///
/// Upper layers assume FIFO ordering per device and full parallelism across
/// devices. Streams end when the transport drops its sender (device gone or
/// scan stopped).
#[async_trait]
pub trait DeviceTransport: Send + Sync + 'static {
    /// Begin scanning; discovered devices arrive on the returned channel
    /// until [`DeviceTransport::stop_scan`] or the scan timeout.
    async fn start_scan(
        &self,
        filter: ScanFilter,
    ) -> Result<mpsc::Receiver<DiscoveredDevice>, TransportError>;

    async fn stop_scan(&self);

    async fn connect(&self, device_id: &str) -> Result<(), TransportError>;

    async fn disconnect(&self, device_id: &str) -> Result<(), TransportError>;

    async fn write_characteristic(
        &self,
        device_id: &str,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    async fn read_characteristic(
        &self,
        device_id: &str,
        characteristic: Uuid,
    ) -> Result<Bytes, TransportError>;

    /// Subscribe to notifications on a characteristic. The channel is bounded;
    /// slow consumers lose oldest frames at the transport edge.
    async fn subscribe_notifications(
        &self,
        device_id: &str,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Bytes>, TransportError>;
}

// ── Command payload helpers ───────────────────────────────────────────────────

/// Build a `SET_DATETIME` command payload.
pub fn set_datetime_payload(unix_seconds: u32) -> [u8; 5] {
    let mut p = [0u8; 5];
    p[0] = opcode::SET_DATETIME;
    p[1..5].copy_from_slice(&unix_seconds.to_le_bytes());
    p
}

/// Build a `SET_CLOCK_OFFSET` command payload from an absolute millisecond
/// correction.
pub fn set_clock_offset_payload(offset_abs_ms: u32) -> [u8; 5] {
    let mut p = [0u8; 5];
    p[0] = opcode::SET_CLOCK_OFFSET;
    p[1..5].copy_from_slice(&offset_abs_ms.to_le_bytes());
    p
}

/// Parse the reply to `GET_TIMESTAMP`.
pub fn parse_timestamp_reply(data: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = data.get(..8)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}
