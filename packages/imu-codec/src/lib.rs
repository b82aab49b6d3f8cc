//! # imu-codec
//!
//! Bit/byte codecs and the binary wire protocol for the TropX motion suite.
//!
//! - [`bitio`]: MSB-first bit-level reader/writer
//! - [`quat_stream`]: QDG1 quantize + delta + gzip container for quaternion
//!   component streams
//! - [`sparse`]: delta + gzip codec for sparse tick-index sets
//! - [`downsample`]: nearest-index stream reduction for previews
//! - [`wire`]: 12-byte-header framed request/response and telemetry messages
//! - [`chunk`]: recording chunk container (per-joint blobs + index sets)

pub mod bitio;
pub mod chunk;
pub mod downsample;
pub mod quat_stream;
pub mod sparse;
pub mod wire;

pub use wire::{MessageType, WireError, WireHeader};

use thiserror::Error;

/// Errors shared by the byte-stream codecs.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("bad container magic")]
    BadMagic,
    #[error("truncated input: {0}")]
    Truncated(&'static str),
    #[error("component count {0} is not a multiple of 4")]
    NotQuaternions(usize),
    #[error("declared count {declared} does not match payload ({actual})")]
    CountMismatch { declared: usize, actual: usize },
    #[error("deflate: {0}")]
    Io(#[from] std::io::Error),
}
