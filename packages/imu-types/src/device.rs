//! Device records and lifecycle states.
//!
//! The registry is the single authoritative holder of these records; every
//! other component observes snapshots through its event channel.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ── Lifecycle state machine ───────────────────────────────────────────────────

/// Connection lifecycle of a sensor.
///
/// ```text
///  discovered → connecting → connected → streaming
///                          ↓             ↓
///                        error        connected
///                          ↓             ↓
///                     disconnected ← (all)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    Discovered,
    Connecting,
    Connected,
    Streaming,
    Disconnected,
    Error,
}

impl DeviceState {
    /// Whether the lifecycle machine permits moving to `next` from here.
    /// `streaming ⇒ connected` and re-discovery only after disconnect are
    /// the load-bearing edges.
    pub fn can_transition_to(&self, next: DeviceState) -> bool {
        use DeviceState::*;
        match (self, next) {
            (_, Disconnected) => true,
            (Discovered, Connecting) => true,
            (Connecting, Connected) | (Connecting, Error) => true,
            (Connected, Streaming) | (Connected, Error) => true,
            (Streaming, Connected) | (Streaming, Error) => true,
            (Error, Disconnected) => true,
            (Disconnected, Discovered) | (Disconnected, Connecting) => true,
            (a, b) => *a == b,
        }
    }
}

// ── Time-sync ladder ──────────────────────────────────────────────────────────

/// How far a device has progressed through clock synchronization.
///
/// The ladder only moves forward. `FullySynced` is sticky across reconnects:
/// a device that already received its hardware offset must never receive a
/// second `SET_CLOCK_OFFSET` (the double-offset failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    NotSynced,
    RtcInitialized,
    OffsetComputed,
    FullySynced,
}

impl Default for SyncState {
    fn default() -> Self {
        SyncState::NotSynced
    }
}

// ── Device record ─────────────────────────────────────────────────────────────

/// Registry snapshot of one sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    /// Stable id assigned at first discovery.
    pub id: String,
    /// Advertised name, informational (plain UTF-8, no normalization).
    pub name: String,
    pub state: DeviceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_pct: Option<f32>,
    /// Master-clock ms of the last event touching this device.
    pub last_seen_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(default)]
    pub sync_state: SyncState,
    /// Median master−device offset from the last sync session, ms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clock_offset_ms: Option<i64>,
}

impl DeviceRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, now_ms: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            state: DeviceState::Discovered,
            battery_pct: None,
            last_seen_ms: now_ms,
            error_reason: None,
            sync_state: SyncState::NotSynced,
            clock_offset_ms: None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.state == DeviceState::Streaming
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, DeviceState::Connected | DeviceState::Streaming)
    }
}

// ── Registry events ───────────────────────────────────────────────────────────

/// Fan-out events published by the registry on its broadcast channel.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// State or metadata changed; carries the full new snapshot.
    DeviceChanged { id: String, snapshot: DeviceRecord },
    /// Battery level update.
    Battery { id: String, pct: f32 },
}

// ── Wire hash ─────────────────────────────────────────────────────────────────

/// Stable 32-bit hash of a device name for the DEVICE_STATUS wire payload.
/// First four bytes of SHA-256, little-endian.
pub fn name_hash32(name: &str) -> u32 {
    let digest = Sha256::digest(name.as_bytes());
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_requires_connected() {
        assert!(!DeviceState::Discovered.can_transition_to(DeviceState::Streaming));
        assert!(!DeviceState::Disconnected.can_transition_to(DeviceState::Streaming));
        assert!(DeviceState::Connected.can_transition_to(DeviceState::Streaming));
    }

    #[test]
    fn rediscovery_only_after_disconnect() {
        assert!(!DeviceState::Connected.can_transition_to(DeviceState::Discovered));
        assert!(!DeviceState::Error.can_transition_to(DeviceState::Discovered));
        assert!(DeviceState::Disconnected.can_transition_to(DeviceState::Discovered));
    }

    #[test]
    fn sync_ladder_orders_forward() {
        assert!(SyncState::NotSynced < SyncState::RtcInitialized);
        assert!(SyncState::RtcInitialized < SyncState::OffsetComputed);
        assert!(SyncState::OffsetComputed < SyncState::FullySynced);
    }

    #[test]
    fn name_hash_is_stable_and_distinct() {
        let a = name_hash32("tropx_ln_top");
        assert_eq!(a, name_hash32("tropx_ln_top"));
        assert_ne!(a, name_hash32("tropx_ln_bottom"));
    }
}
