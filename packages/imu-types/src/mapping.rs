//! Device-name → joint/position mapping.
//!
//! Substring rules are tried first; a small legacy table of exact names from
//! earlier firmware batches is the fallback. The mapping is deterministic so
//! the same fleet always resolves to the same joints.

use serde::{Deserialize, Serialize};

use crate::joint::JointConfig;
use crate::quat::JointCalibration;

// ── Placement ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JointName {
    LeftKnee,
    RightKnee,
}

impl JointName {
    pub fn as_str(&self) -> &'static str {
        match self {
            JointName::LeftKnee => "left_knee",
            JointName::RightKnee => "right_knee",
        }
    }

    fn code(&self) -> u8 {
        match self {
            JointName::LeftKnee => 0x1,
            JointName::RightKnee => 0x2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MountPosition {
    Top,
    Bottom,
}

impl MountPosition {
    fn code(&self) -> u8 {
        match self {
            MountPosition::Top => 0x1,
            MountPosition::Bottom => 0x2,
        }
    }
}

/// Where a sensor sits on the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePlacement {
    pub joint: JointName,
    pub position: MountPosition,
}

impl DevicePlacement {
    /// Single-byte semantic id: joint in the upper nibble, position in the
    /// lower. `0x00` is reserved for unknown placements.
    pub fn semantic_id(&self) -> u8 {
        (self.joint.code() << 4) | self.position.code()
    }
}

// ── Name resolution ───────────────────────────────────────────────────────────

/// Exact names used by the first hardware batch, kept for compatibility.
const LEGACY_NAMES: &[(&str, JointName, MountPosition)] = &[
    ("TROPX-L1", JointName::LeftKnee, MountPosition::Top),
    ("TROPX-L2", JointName::LeftKnee, MountPosition::Bottom),
    ("TROPX-R1", JointName::RightKnee, MountPosition::Top),
    ("TROPX-R2", JointName::RightKnee, MountPosition::Bottom),
];

/// Resolve a device name to its placement. Substring rules first
/// (`_ln_`/`_rn_` and `top`/`bottom`), then the legacy exact table.
pub fn placement_for_name(name: &str) -> Option<DevicePlacement> {
    let lower = name.to_ascii_lowercase();

    let joint = if lower.contains("_ln_") || lower.contains("left") {
        Some(JointName::LeftKnee)
    } else if lower.contains("_rn_") || lower.contains("right") {
        Some(JointName::RightKnee)
    } else {
        None
    };
    let position = if lower.contains("top") || lower.contains("upper") {
        Some(MountPosition::Top)
    } else if lower.contains("bottom") || lower.contains("lower") {
        Some(MountPosition::Bottom)
    } else {
        None
    };
    if let (Some(joint), Some(position)) = (joint, position) {
        return Some(DevicePlacement { joint, position });
    }

    LEGACY_NAMES
        .iter()
        .find(|(n, _, _)| *n == name)
        .map(|(_, joint, position)| DevicePlacement { joint: *joint, position: *position })
}

/// Default dual-knee joint set matching the standard fleet naming.
pub fn default_joints() -> Vec<JointConfig> {
    vec![
        JointConfig {
            name: JointName::LeftKnee.as_str().to_string(),
            top_device_pattern: "_ln_top".to_string(),
            bottom_device_pattern: "_ln_bottom".to_string(),
            calibration: JointCalibration::default(),
        },
        JointConfig {
            name: JointName::RightKnee.as_str().to_string(),
            top_device_pattern: "_rn_top".to_string(),
            bottom_device_pattern: "_rn_bottom".to_string(),
            calibration: JointCalibration::default(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substring_rules_resolve_standard_fleet() {
        let p = placement_for_name("tropx_ln_top").unwrap();
        assert_eq!(p.joint, JointName::LeftKnee);
        assert_eq!(p.position, MountPosition::Top);

        let p = placement_for_name("tropx_rn_bottom").unwrap();
        assert_eq!(p.joint, JointName::RightKnee);
        assert_eq!(p.position, MountPosition::Bottom);
    }

    #[test]
    fn legacy_names_resolve_exactly() {
        let p = placement_for_name("TROPX-R1").unwrap();
        assert_eq!(p.joint, JointName::RightKnee);
        assert_eq!(p.position, MountPosition::Top);
        assert!(placement_for_name("TROPX-R3").is_none());
    }

    #[test]
    fn semantic_id_packs_nibbles() {
        let p = DevicePlacement { joint: JointName::RightKnee, position: MountPosition::Top };
        assert_eq!(p.semantic_id(), 0x21);
        let p = DevicePlacement { joint: JointName::LeftKnee, position: MountPosition::Bottom };
        assert_eq!(p.semantic_id(), 0x12);
    }

    #[test]
    fn default_joints_match_fleet_names() {
        let joints = default_joints();
        assert_eq!(joints.len(), 2);
        assert!(joints[0].matches_top("tropx_ln_top"));
        assert!(joints[0].matches_bottom("tropx_ln_bottom"));
        assert!(!joints[0].matches_top("tropx_rn_top"));
        assert!(joints[1].matches_top("tropx_rn_top"));
    }
}
