//! Joints, sessions, and recording chunks.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::quat::JointCalibration;

/// Container format identifier for chunk blobs produced by the QDG1 pipeline.
pub const COMPRESSION_VERSION: &str = "quant-delta-gzip-v1";

// ── Joint configuration ───────────────────────────────────────────────────────

/// One joint spanned by a pair of sensors. A joint is *active* when both
/// patterns resolve to currently streaming devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JointConfig {
    pub name: String,
    /// Substring matched against device names for the sensor above the joint.
    pub top_device_pattern: String,
    /// Substring matched against device names for the sensor below the joint.
    pub bottom_device_pattern: String,
    #[serde(default)]
    pub calibration: JointCalibration,
}

impl JointConfig {
    pub fn matches_top(&self, device_name: &str) -> bool {
        device_name.contains(&self.top_device_pattern)
    }

    pub fn matches_bottom(&self, device_name: &str) -> bool {
        device_name.contains(&self.bottom_device_pattern)
    }
}

// ── Angle samples & rolling window ────────────────────────────────────────────

/// Quality of one pipeline tick for one joint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TickQuality {
    /// Both sensors delivered fresh samples straddling the tick.
    Valid,
    /// Interpolation spanned more than one input period.
    Interpolated,
    /// No usable input this tick; the previous value was repeated.
    Missing,
}

/// One emitted joint-angle sample on the master timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JointAngleSample {
    pub joint_name: String,
    pub angle_deg: f64,
    pub timestamp_master_ms: u64,
    pub contributing_device_ids: Vec<String>,
    pub quality: TickQuality,
}

/// Per-joint rolling window, reset at recording start.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JointWindow {
    pub min_angle: f64,
    pub max_angle: f64,
    pub current: f64,
    pub last_update_ms: u64,
}

impl Default for JointWindow {
    fn default() -> Self {
        Self {
            min_angle: f64::INFINITY,
            max_angle: f64::NEG_INFINITY,
            current: 0.0,
            last_update_ms: 0,
        }
    }
}

impl JointWindow {
    /// Fold a new angle into the window. Range of motion never decreases.
    pub fn update(&mut self, angle_deg: f64, now_ms: u64) {
        self.current = angle_deg;
        self.min_angle = self.min_angle.min(angle_deg);
        self.max_angle = self.max_angle.max(angle_deg);
        self.last_update_ms = now_ms;
    }

    /// Range of motion in degrees; zero before the first update.
    pub fn range_of_motion(&self) -> f64 {
        if self.max_angle < self.min_angle {
            0.0
        } else {
            self.max_angle - self.min_angle
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ── Sessions ──────────────────────────────────────────────────────────────────

/// Parameters supplied by the caller when starting a recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub exercise_id: String,
    pub set_number: u32,
    /// Target pipeline rate; one of 100, 200, 400.
    #[serde(default = "default_sample_rate")]
    pub sample_rate_hz: u32,
}

fn default_sample_rate() -> u32 {
    100
}

/// An active (or finished) recording session. At most one is active
/// process-wide.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub exercise_id: String,
    pub set_number: u32,
    pub start_master_ms: u64,
    pub sample_rate_hz: u32,
    pub active_joints: Vec<String>,
}

// ── Chunks ────────────────────────────────────────────────────────────────────

/// A bounded contiguous segment of a recording. Chunks of a session are
/// contiguous and non-overlapping; `chunk_index` is dense from 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub session_id: String,
    pub chunk_index: u32,
    pub start_ms: u64,
    pub end_ms: u64,
    pub sample_count: u32,
    /// QDG1 blobs, one per joint.
    #[serde(skip)]
    pub per_joint_compressed: HashMap<String, Vec<u8>>,
    /// Tick indices (chunk-relative) whose value was interpolated.
    pub per_joint_interpolated: HashMap<String, Vec<u32>>,
    /// Tick indices (chunk-relative) with no valid input.
    pub per_joint_missing: HashMap<String, Vec<u32>>,
    pub compression_version: String,
}

/// Chunk sample capacity for a target rate: roughly one minute of data.
pub fn chunk_size_for_rate(target_hz: u32) -> u32 {
    if target_hz <= 100 {
        6000
    } else if target_hz <= 200 {
        12_000
    } else {
        24_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_rom_never_decreases() {
        let mut w = JointWindow::default();
        w.update(10.0, 1);
        w.update(50.0, 2);
        let rom = w.range_of_motion();
        w.update(30.0, 3);
        assert_eq!(w.range_of_motion(), rom);
        assert_eq!(w.current, 30.0);
    }

    #[test]
    fn chunk_size_tiers() {
        assert_eq!(chunk_size_for_rate(100), 6000);
        assert_eq!(chunk_size_for_rate(200), 12_000);
        assert_eq!(chunk_size_for_rate(400), 24_000);
    }
}
