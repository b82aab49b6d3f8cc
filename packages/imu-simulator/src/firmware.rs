//! Virtual sensor firmware.
//!
//! Mirrors what the real wearable does at the characteristic level: a
//! free-running millisecond counter since the device epoch, an RTC that
//! `SET_DATETIME` can set with one-second granularity, a hardware offset
//! register that `SET_CLOCK_OFFSET` subtracts from every subsequent
//! timestamp, and a latched reply slot for commands that answer.

use std::collections::HashMap;

use tokio::time::Instant;

use imu_types::transport::{opcode, DEVICE_COUNTER_EPOCH_UNIX_S, SYSTEM_STATUS_IDLE};

/// One simulated sensor's firmware state. Owned behind a per-device lock in
/// the fleet; command handling is synchronous.
#[derive(Debug)]
pub struct VirtualSensor {
    pub id: String,
    pub name: String,
    pub battery_pct: f32,
    pub system_status: u8,
    pub connected: bool,
    pub in_timesync_mode: bool,
    /// Fault injection: when set, `SET_DATETIME` writes are silently lost,
    /// as seen on sensors with a wedged RTC after a hard reset.
    pub datetime_fault: bool,

    /// Reference point for counter arithmetic.
    boot: Instant,
    /// Counter value at `boot`, ms since the device epoch.
    counter_at_boot_ms: u64,
    /// Crystal error, parts per million. Positive runs fast.
    drift_ppm: f64,
    /// Sub-second phase the firmware cannot correct via `SET_DATETIME`; this
    /// is exactly the residual the coordinator's `SET_CLOCK_OFFSET` removes.
    subsecond_phase_ms: u64,
    /// Accumulated hardware offset, subtracted from every reported timestamp.
    applied_offset_ms: u64,

    /// Latched reply of the most recent command that produces one.
    reply: Vec<u8>,
    /// Writes seen per opcode, for test assertions on the one-shot guard.
    write_counts: HashMap<u8, u32>,
}

impl VirtualSensor {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        initial_skew_ms: u64,
        subsecond_phase_ms: u64,
        drift_ppm: f64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            battery_pct: 100.0,
            system_status: SYSTEM_STATUS_IDLE,
            connected: false,
            in_timesync_mode: false,
            datetime_fault: false,
            boot: Instant::now(),
            counter_at_boot_ms: initial_skew_ms,
            drift_ppm,
            subsecond_phase_ms,
            applied_offset_ms: 0,
            reply: Vec::new(),
            write_counts: HashMap::new(),
        }
    }

    /// Current device counter in ms, offset register applied.
    pub fn counter_ms(&self) -> u64 {
        let elapsed = self.boot.elapsed().as_secs_f64() * 1000.0;
        let drifted = elapsed * (1.0 + self.drift_ppm * 1e-6);
        let raw = self.counter_at_boot_ms + drifted as u64;
        raw.saturating_sub(self.applied_offset_ms)
    }

    pub fn latched_reply(&self) -> Vec<u8> {
        self.reply.clone()
    }

    pub fn write_count(&self, op: u8) -> u32 {
        self.write_counts.get(&op).copied().unwrap_or(0)
    }

    /// Shove the counter forward or back, bypassing every register. Models a
    /// crystal glitch or reset for tests.
    pub fn shift_counter(&mut self, delta_ms: i64) {
        self.counter_at_boot_ms = (self.counter_at_boot_ms as i64 + delta_ms).max(0) as u64;
    }

    /// Execute a command written to the command characteristic.
    pub fn handle_command(&mut self, payload: &[u8]) {
        let Some((&op, args)) = payload.split_first() else {
            return;
        };
        *self.write_counts.entry(op).or_insert(0) += 1;

        match op {
            opcode::SET_DATETIME => {
                if self.datetime_fault {
                    return;
                }
                if let Ok(bytes) = <[u8; 4]>::try_from(args) {
                    let unix_s = u32::from_le_bytes(bytes) as u64;
                    // Firmware realigns the counter at one-second granularity;
                    // the sub-second phase survives.
                    let base = unix_s.saturating_sub(DEVICE_COUNTER_EPOCH_UNIX_S) * 1000;
                    let elapsed = self.boot.elapsed().as_secs_f64() * 1000.0;
                    self.counter_at_boot_ms =
                        (base + self.subsecond_phase_ms).saturating_sub(elapsed as u64);
                }
            }
            opcode::SET_CLOCK_OFFSET => {
                if let Ok(bytes) = <[u8; 4]>::try_from(args) {
                    self.applied_offset_ms += u32::from_le_bytes(bytes) as u64;
                }
            }
            opcode::ENTER_TIMESYNC => self.in_timesync_mode = true,
            opcode::EXIT_TIMESYNC => self.in_timesync_mode = false,
            opcode::GET_TIMESTAMP => {
                self.reply = self.counter_ms().to_le_bytes().to_vec();
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imu_types::transport::{set_clock_offset_payload, set_datetime_payload};

    #[test]
    fn set_datetime_realigns_to_epoch_with_subsecond_residue() {
        let mut dev = VirtualSensor::new("d1", "tropx_ln_top", 5_000_000, 321, 0.0);
        dev.handle_command(&set_datetime_payload(
            (DEVICE_COUNTER_EPOCH_UNIX_S + 10) as u32,
        ));
        let counter = dev.counter_ms();
        assert!(
            (counter as i64 - (10_000 + 321)).abs() < 50,
            "counter {counter}"
        );
    }

    #[test]
    fn clock_offset_subtracts_and_is_counted() {
        let mut dev = VirtualSensor::new("d1", "tropx_ln_top", 100_000, 0, 0.0);
        let before = dev.counter_ms();
        dev.handle_command(&set_clock_offset_payload(400));
        let after = dev.counter_ms();
        assert!(before - after >= 395, "before {before} after {after}");
        assert_eq!(dev.write_count(opcode::SET_CLOCK_OFFSET), 1);
    }

    #[test]
    fn get_timestamp_latches_reply() {
        let mut dev = VirtualSensor::new("d1", "tropx_ln_top", 42_000, 0, 0.0);
        dev.handle_command(&[opcode::GET_TIMESTAMP]);
        let reply = dev.latched_reply();
        let ts = u64::from_le_bytes(reply.try_into().unwrap());
        assert!(ts >= 42_000);
    }

    #[test]
    fn timesync_mode_toggles() {
        let mut dev = VirtualSensor::new("d1", "tropx_ln_top", 0, 0, 0.0);
        dev.handle_command(&[opcode::ENTER_TIMESYNC]);
        assert!(dev.in_timesync_mode);
        dev.handle_command(&[opcode::EXIT_TIMESYNC]);
        assert!(!dev.in_timesync_mode);
    }
}
