//! IMU sample and its notification payload layout.
//!
//! Sensors push orientation frames as characteristic notifications. The
//! payload is little-endian:
//!
//! ```text
//! flags:u8 | device_counter_ms:u64 | qw,qx,qy,qz:f32×4
//!          | [ax,ay,az:f32×3 when flags&0x01]
//!          | [gx,gy,gz:f32×3 when flags&0x02]
//! ```

use bytes::{Buf, BufMut, BytesMut};

use crate::quat::Quaternion;

const FLAG_ACCEL: u8 = 0x01;
const FLAG_GYRO: u8 = 0x02;

/// Minimum frame: flags + counter + quaternion.
pub const MIN_FRAME_LEN: usize = 1 + 8 + 16;

/// One orientation sample from a sensor. `device_counter_ms` is the raw
/// free-running device counter; alignment to the master timeline happens in
/// the pipeline using the registry's per-device offset.
#[derive(Debug, Clone, Copy)]
pub struct ImuSample {
    pub device_counter_ms: u64,
    pub orientation: Quaternion,
    pub accel: Option<[f32; 3]>,
    pub gyro: Option<[f32; 3]>,
}

impl ImuSample {
    pub fn new(device_counter_ms: u64, orientation: Quaternion) -> Self {
        Self { device_counter_ms, orientation, accel: None, gyro: None }
    }

    /// Encode into a notification frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.accel.is_some() {
            flags |= FLAG_ACCEL;
        }
        if self.gyro.is_some() {
            flags |= FLAG_GYRO;
        }
        let mut buf = BytesMut::with_capacity(MIN_FRAME_LEN + 24);
        buf.put_u8(flags);
        buf.put_u64_le(self.device_counter_ms);
        buf.put_f32_le(self.orientation.w as f32);
        buf.put_f32_le(self.orientation.x as f32);
        buf.put_f32_le(self.orientation.y as f32);
        buf.put_f32_le(self.orientation.z as f32);
        if let Some(a) = self.accel {
            for v in a {
                buf.put_f32_le(v);
            }
        }
        if let Some(g) = self.gyro {
            for v in g {
                buf.put_f32_le(v);
            }
        }
        buf.to_vec()
    }

    /// Decode a notification frame. Returns `None` on truncation; the caller
    /// drops the frame and increments a counter.
    pub fn decode(mut data: &[u8]) -> Option<ImuSample> {
        if data.len() < MIN_FRAME_LEN {
            return None;
        }
        let flags = data.get_u8();
        let counter = data.get_u64_le();
        let w = data.get_f32_le() as f64;
        let x = data.get_f32_le() as f64;
        let y = data.get_f32_le() as f64;
        let z = data.get_f32_le() as f64;

        let accel = if flags & FLAG_ACCEL != 0 {
            if data.remaining() < 12 {
                return None;
            }
            Some([data.get_f32_le(), data.get_f32_le(), data.get_f32_le()])
        } else {
            None
        };
        let gyro = if flags & FLAG_GYRO != 0 {
            if data.remaining() < 12 {
                return None;
            }
            Some([data.get_f32_le(), data.get_f32_le(), data.get_f32_le()])
        } else {
            None
        };

        Some(ImuSample {
            device_counter_ms: counter,
            orientation: Quaternion::new(w, x, y, z),
            accel,
            gyro,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips() {
        let mut s = ImuSample::new(123_456, Quaternion::from_euler(0.2, -0.1, 0.5));
        s.accel = Some([0.1, -9.8, 0.0]);
        let bytes = s.encode();
        let back = ImuSample::decode(&bytes).unwrap();
        assert_eq!(back.device_counter_ms, 123_456);
        assert!((back.orientation.w - s.orientation.w).abs() < 1e-6);
        assert_eq!(back.accel, Some([0.1, -9.8, 0.0]));
        assert_eq!(back.gyro, None);
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let s = ImuSample::new(1, Quaternion::IDENTITY);
        let bytes = s.encode();
        assert!(ImuSample::decode(&bytes[..bytes.len() - 1]).is_none());
        assert!(ImuSample::decode(&[]).is_none());
    }
}
