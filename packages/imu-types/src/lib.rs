//! # imu-types
//!
//! Shared types for the TropX motion suite.
//!
//! These types are used by:
//! - `tropx-backend`: device registry, time sync, motion pipeline, recording
//! - `imu-simulator`: virtual sensor fleet implementing [`transport::DeviceTransport`]
//! - `imu-codec`: wire payloads and chunk containers built from these records
//!
//! ## Conventions
//!
//! - **Master clock**: host monotonic milliseconds, the common timeline all
//!   device counters are aligned to after sync.
//! - **Device counter**: per-device free-running millisecond counter, epoch
//!   2020-01-26T00:53:20Z (unix 1,580,000,000 s).
//! - **Quaternions**: `(w, x, y, z)`, unit norm after [`quat::Quaternion::normalize`].
//!
//! ## Invariants
//! - Any quaternion handed to downstream consumers satisfies |q| = 1 ± 1e-6;
//!   invalid inputs collapse to identity.
//! - A device receives `SET_CLOCK_OFFSET` at most once per lifetime; the
//!   [`device::SyncState`] ladder encodes how far a device has progressed.

pub mod device;
pub mod error;
pub mod joint;
pub mod mapping;
pub mod quat;
pub mod sample;
pub mod transport;

pub use device::{DeviceEvent, DeviceRecord, DeviceState, SyncState};
pub use error::{CodedError, ErrorCode};
pub use joint::{Chunk, JointConfig, JointWindow, Session, TickQuality};
pub use quat::{JointCalibration, Quaternion};
pub use sample::ImuSample;
