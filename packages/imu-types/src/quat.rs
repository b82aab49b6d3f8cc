//! Quaternion kernel — orientation math for joint-angle extraction.
//!
//! Pure synchronous math; nothing here suspends or allocates. All functions
//! tolerate malformed input: a quaternion that fails validation collapses to
//! identity rather than propagating NaNs into the pipeline.

use serde::{Deserialize, Serialize};

/// Norm tolerance for "already unit" checks.
pub const UNIT_EPSILON: f64 = 1e-6;

/// Below this norm a quaternion carries no usable orientation.
const DEGENERATE_NORM: f64 = 1e-6;

/// SLERP falls back to LERP+normalize when the arc is this close to zero.
const SLERP_DOT_THRESHOLD: f64 = 0.9995;

/// Orientation quaternion `(w, x, y, z)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion { w: 1.0, x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(w: f64, x: f64, y: f64, z: f64) -> Self {
        Self { w, x, y, z }
    }

    /// Build from Euler angles (roll, pitch, yaw) in radians, ZYX order.
    pub fn from_euler(roll: f64, pitch: f64, yaw: f64) -> Self {
        let (cr, sr) = ((roll / 2.0).cos(), (roll / 2.0).sin());
        let (cp, sp) = ((pitch / 2.0).cos(), (pitch / 2.0).sin());
        let (cy, sy) = ((yaw / 2.0).cos(), (yaw / 2.0).sin());
        Self {
            w: cr * cp * cy + sr * sp * sy,
            x: sr * cp * cy - cr * sp * sy,
            y: cr * sp * cy + sr * cp * sy,
            z: cr * cp * sy - sr * sp * cy,
        }
    }

    pub fn norm(&self) -> f64 {
        (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// True when every component is finite and the norm is usable.
    pub fn is_valid(&self) -> bool {
        self.w.is_finite()
            && self.x.is_finite()
            && self.y.is_finite()
            && self.z.is_finite()
            && self.norm() >= DEGENERATE_NORM
    }

    /// Normalize to unit length. Invalid input collapses to identity.
    pub fn normalize(&self) -> Quaternion {
        if !self.is_valid() {
            return Self::IDENTITY;
        }
        let n = self.norm();
        if (n - 1.0).abs() <= UNIT_EPSILON {
            return *self;
        }
        Quaternion {
            w: self.w / n,
            x: self.x / n,
            y: self.y / n,
            z: self.z / n,
        }
    }

    /// Multiplicative inverse. For unit quaternions this is the conjugate;
    /// the general form divides by the squared norm. Invalid input yields
    /// identity.
    pub fn inverse(&self) -> Quaternion {
        if !self.is_valid() {
            return Self::IDENTITY;
        }
        let n2 = self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z;
        Quaternion {
            w: self.w / n2,
            x: -self.x / n2,
            y: -self.y / n2,
            z: -self.z / n2,
        }
    }

    /// Hamilton product `self · other`.
    pub fn multiply(&self, other: &Quaternion) -> Quaternion {
        let (aw, ax, ay, az) = (self.w, self.x, self.y, self.z);
        let (bw, bx, by, bz) = (other.w, other.x, other.y, other.z);
        Quaternion {
            w: aw * bw - ax * bx - ay * by - az * bz,
            x: aw * bx + ax * bw + ay * bz - az * by,
            y: aw * by - ax * bz + ay * bw + az * bx,
            z: aw * bz + ax * by - ay * bx + az * bw,
        }
    }

    pub fn dot(&self, other: &Quaternion) -> f64 {
        self.w * other.w + self.x * other.x + self.y * other.y + self.z * other.z
    }

    /// 3×3 rotation matrix, row-major. Assumes unit norm.
    pub fn to_rotation_matrix(&self) -> [[f64; 3]; 3] {
        let (w, x, y, z) = (self.w, self.x, self.y, self.z);
        [
            [
                1.0 - 2.0 * (y * y + z * z),
                2.0 * (x * y - w * z),
                2.0 * (x * z + w * y),
            ],
            [
                2.0 * (x * y + w * z),
                1.0 - 2.0 * (x * x + z * z),
                2.0 * (y * z - w * x),
            ],
            [
                2.0 * (x * z - w * y),
                2.0 * (y * z + w * x),
                1.0 - 2.0 * (x * x + y * y),
            ],
        ]
    }

    /// Linear interpolation followed by normalization. Adequate for small
    /// arcs; the pipeline selects this when the endpoints are nearly aligned.
    pub fn nlerp(&self, other: &Quaternion, t: f64) -> Quaternion {
        // Take the short way around the hypersphere
        let sign = if self.dot(other) < 0.0 { -1.0 } else { 1.0 };
        Quaternion {
            w: self.w + t * (sign * other.w - self.w),
            x: self.x + t * (sign * other.x - self.x),
            y: self.y + t * (sign * other.y - self.y),
            z: self.z + t * (sign * other.z - self.z),
        }
        .normalize()
    }

    /// Spherical linear interpolation between two unit quaternions.
    pub fn slerp(&self, other: &Quaternion, t: f64) -> Quaternion {
        let mut dot = self.dot(other);
        let mut b = *other;
        if dot < 0.0 {
            b = Quaternion { w: -b.w, x: -b.x, y: -b.y, z: -b.z };
            dot = -dot;
        }
        if dot > SLERP_DOT_THRESHOLD {
            return self.nlerp(&b, t);
        }
        let theta = dot.clamp(-1.0, 1.0).acos();
        let sin_theta = theta.sin();
        let wa = ((1.0 - t) * theta).sin() / sin_theta;
        let wb = (t * theta).sin() / sin_theta;
        Quaternion {
            w: wa * self.w + wb * b.w,
            x: wa * self.x + wb * b.x,
            y: wa * self.y + wb * b.y,
            z: wa * self.z + wb * b.z,
        }
        .normalize()
    }

    /// Interpolate to parameter `t`, picking SLERP for wide arcs and
    /// LERP+normalize for narrow ones.
    pub fn interpolate(&self, other: &Quaternion, t: f64) -> Quaternion {
        if self.dot(other).abs() > SLERP_DOT_THRESHOLD {
            self.nlerp(other, t)
        } else {
            self.slerp(other, t)
        }
    }
}

// ── Joint angle extraction ────────────────────────────────────────────────────

/// Linear calibration applied to the raw flexion angle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JointCalibration {
    pub offset: f64,
    pub multiplier: f64,
}

impl Default for JointCalibration {
    fn default() -> Self {
        Self { offset: 0.0, multiplier: 1.0 }
    }
}

/// Result of a joint-angle computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlexionAngle {
    /// Calibrated flexion angle in degrees.
    pub degrees: f64,
    /// Set when either input orientation was degenerate and the angle was
    /// substituted with zero.
    pub degraded: bool,
}

/// Compute the calibrated flexion angle across a joint from the orientations
/// of the sensor above and below it.
///
/// The relative rotation is `q_rel = top⁻¹ · bottom`; flexion is the signed
/// rotation about the mediolateral (X) axis of the relative frame, read from
/// the rotation matrix as `atan2(m21, m22)`. Never panics and never returns
/// a non-finite value.
pub fn joint_angle_from_pair(
    top: &Quaternion,
    bottom: &Quaternion,
    cal: &JointCalibration,
) -> FlexionAngle {
    if !top.is_valid() || !bottom.is_valid() {
        return FlexionAngle { degrees: 0.0, degraded: true };
    }
    let top = top.normalize();
    let bottom = bottom.normalize();
    let q_rel = top.inverse().multiply(&bottom).normalize();
    let m = q_rel.to_rotation_matrix();
    let raw = m[2][1].atan2(m[2][2]).to_degrees();
    let degrees = raw * cal.multiplier + cal.offset;
    if degrees.is_finite() {
        FlexionAngle { degrees, degraded: false }
    } else {
        FlexionAngle { degrees: 0.0, degraded: true }
    }
}

/// Relative rotation across a joint, normalized. This is the quantity the
/// recording chunker compresses.
pub fn relative_rotation(top: &Quaternion, bottom: &Quaternion) -> Quaternion {
    top.normalize().inverse().multiply(&bottom.normalize()).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64, eps: f64) {
        assert!((a - b).abs() <= eps, "{a} !~ {b} (eps {eps})");
    }

    #[test]
    fn normalize_collapses_invalid_to_identity() {
        let zero = Quaternion::new(0.0, 0.0, 0.0, 0.0);
        assert_eq!(zero.normalize(), Quaternion::IDENTITY);
        let nan = Quaternion::new(f64::NAN, 0.0, 0.0, 0.0);
        assert_eq!(nan.normalize(), Quaternion::IDENTITY);
    }

    #[test]
    fn double_inverse_round_trips() {
        let q = Quaternion::from_euler(0.3, -0.7, 1.1);
        let back = q.inverse().inverse().normalize();
        approx(back.w, q.w, 1e-6);
        approx(back.x, q.x, 1e-6);
        approx(back.y, q.y, 1e-6);
        approx(back.z, q.z, 1e-6);
    }

    #[test]
    fn multiply_by_inverse_is_identity() {
        let q = Quaternion::from_euler(0.9, 0.2, -0.4);
        let id = q.multiply(&q.inverse());
        approx(id.w, 1.0, 1e-9);
        approx(id.x, 0.0, 1e-9);
        approx(id.y, 0.0, 1e-9);
        approx(id.z, 0.0, 1e-9);
    }

    #[test]
    fn slerp_endpoints_match_inputs() {
        let a = Quaternion::from_euler(0.0, 0.0, 0.0);
        let b = Quaternion::from_euler(1.2, 0.0, 0.0);
        let s0 = a.slerp(&b, 0.0);
        let s1 = a.slerp(&b, 1.0);
        approx(s0.dot(&a).abs(), 1.0, 1e-9);
        approx(s1.dot(&b).abs(), 1.0, 1e-9);
    }

    #[test]
    fn slerp_midpoint_halves_the_angle() {
        let a = Quaternion::IDENTITY;
        let b = Quaternion::from_euler(1.0, 0.0, 0.0);
        let mid = a.slerp(&b, 0.5);
        let expected = Quaternion::from_euler(0.5, 0.0, 0.0);
        approx(mid.dot(&expected).abs(), 1.0, 1e-9);
    }

    #[test]
    fn flexion_angle_recovers_known_rotation() {
        let cal = JointCalibration::default();
        let top = Quaternion::IDENTITY;
        for deg in [-90.0_f64, -30.0, 0.0, 15.0, 45.0, 120.0] {
            let bottom = Quaternion::from_euler(deg.to_radians(), 0.0, 0.0);
            let angle = joint_angle_from_pair(&top, &bottom, &cal);
            assert!(!angle.degraded);
            approx(angle.degrees, deg, 1e-6);
        }
    }

    #[test]
    fn flexion_angle_applies_calibration() {
        let cal = JointCalibration { offset: 5.0, multiplier: -1.0 };
        let bottom = Quaternion::from_euler(30.0_f64.to_radians(), 0.0, 0.0);
        let angle = joint_angle_from_pair(&Quaternion::IDENTITY, &bottom, &cal);
        approx(angle.degrees, -25.0, 1e-6);
    }

    #[test]
    fn degenerate_input_flags_quality() {
        let cal = JointCalibration::default();
        let zero = Quaternion::new(0.0, 0.0, 0.0, 0.0);
        let angle = joint_angle_from_pair(&zero, &Quaternion::IDENTITY, &cal);
        assert!(angle.degraded);
        assert_eq!(angle.degrees, 0.0);
    }
}
