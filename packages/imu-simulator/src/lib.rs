//! # imu-simulator
//!
//! Virtual TropX sensor fleet. Implements the [`imu_types::transport::DeviceTransport`]
//! capability in-process so the backend, its integration tests, and the
//! `imu-sim` CLI can run without hardware.
//!
//! Each virtual sensor carries:
//! - a free-running millisecond counter with its own initial skew and ppm
//!   drift (the thing time sync exists to fix)
//! - the firmware command set (`SET_DATETIME`, `ENTER/EXIT_TIMESYNC`,
//!   `GET_TIMESTAMP`, `SET_CLOCK_OFFSET`) with per-opcode write counters so
//!   tests can assert the one-shot offset guard
//! - a synthetic knee-motion generator streaming orientation notifications
//!   at the configured rate

pub mod firmware;
pub mod fleet;
pub mod motion;

pub use fleet::{FleetConfig, SimFleet};
pub use motion::KneeMotionModel;
