//! QDG1 — the quantize + delta + gzip container for quaternion streams.
//!
//! Input is a flat stream of `f64` quaternion components, four per sample.
//! Pipeline: clamp to `[-1, 1]`, quantize to `i16` via `round(v * 32767)`,
//! delta each component lane against its previous value (first sample stored
//! absolute), gzip the little-endian `i16` stream at max level.
//!
//! Framing: `"QDG1" | u32 LE sample_count | gzip payload`.
//!
//! Deltas use wrapping arithmetic so reconstruction is bit-exact for the
//! quantized representation; round-trip error per component is bounded by
//! `1/32767` of the original value.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::CodecError;

pub const MAGIC: &[u8; 4] = b"QDG1";
pub const QUANT_SCALE: f64 = 32767.0;

/// Maximum absolute round-trip error per component.
pub const MAX_COMPONENT_ERROR: f64 = 1.0 / 32767.0;

fn quantize(v: f64) -> i16 {
    (v.clamp(-1.0, 1.0) * QUANT_SCALE).round() as i16
}

/// Compress a flat component stream (4 components per sample).
pub fn compress(components: &[f64]) -> Result<Vec<u8>, CodecError> {
    if components.len() % 4 != 0 {
        return Err(CodecError::NotQuaternions(components.len()));
    }
    let sample_count = components.len() / 4;

    // Quantize, then delta per component lane
    let mut prev = [0i16; 4];
    let mut deltas = Vec::with_capacity(components.len() * 2);
    for (i, &v) in components.iter().enumerate() {
        let lane = i % 4;
        let q = quantize(v);
        let d = if i < 4 { q } else { q.wrapping_sub(prev[lane]) };
        prev[lane] = q;
        deltas.extend_from_slice(&d.to_le_bytes());
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(&deltas)?;
    let deflated = encoder.finish()?;

    let mut out = Vec::with_capacity(8 + deflated.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&(sample_count as u32).to_le_bytes());
    out.extend_from_slice(&deflated);
    Ok(out)
}

/// Decompress a QDG1 container back to the component stream.
pub fn decompress(data: &[u8]) -> Result<Vec<f64>, CodecError> {
    if data.len() < 8 {
        return Err(CodecError::Truncated("QDG1 header"));
    }
    if &data[..4] != MAGIC {
        return Err(CodecError::BadMagic);
    }
    let declared = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;

    let mut raw = Vec::with_capacity(declared * 8);
    GzDecoder::new(&data[8..]).read_to_end(&mut raw)?;

    if raw.len() != declared * 8 {
        return Err(CodecError::CountMismatch { declared, actual: raw.len() / 8 });
    }

    let mut prev = [0i16; 4];
    let mut out = Vec::with_capacity(declared * 4);
    for (i, chunk) in raw.chunks_exact(2).enumerate() {
        let lane = i % 4;
        let d = i16::from_le_bytes([chunk[0], chunk[1]]);
        let q = if i < 4 { d } else { prev[lane].wrapping_add(d) };
        prev[lane] = q;
        out.push(q as f64 / QUANT_SCALE);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sinusoidal_session(samples: usize) -> Vec<f64> {
        // Slow flexion sweep, the shape a knee sensor actually produces
        let mut out = Vec::with_capacity(samples * 4);
        for i in 0..samples {
            let t = i as f64 / samples as f64;
            let angle = (t * std::f64::consts::TAU * 0.5).sin() * 0.8;
            let half = angle / 2.0;
            out.extend_from_slice(&[half.cos(), half.sin(), 0.0, 0.0]);
        }
        out
    }

    #[test]
    fn round_trip_is_within_quantization_error() {
        let input = sinusoidal_session(500);
        let packed = compress(&input).unwrap();
        let output = decompress(&packed).unwrap();
        assert_eq!(output.len(), input.len());
        for (a, b) in input.iter().zip(&output) {
            assert!((a - b).abs() <= MAX_COMPONENT_ERROR, "{a} vs {b}");
        }
    }

    #[test]
    fn out_of_range_components_clamp() {
        let input = vec![1.5, -2.0, 0.0, 1.0];
        let output = decompress(&compress(&input).unwrap()).unwrap();
        assert!((output[0] - 1.0).abs() <= MAX_COMPONENT_ERROR);
        assert!((output[1] + 1.0).abs() <= MAX_COMPONENT_ERROR);
    }

    #[test]
    fn slow_motion_compresses_hard() {
        // One minute at 100 Hz of slow sinusoidal motion, raw 192,000 bytes.
        let input = sinusoidal_session(6000);
        let packed = compress(&input).unwrap();
        assert!(
            packed.len() <= 12_000,
            "compressed {} bytes, expected ≤ 12000",
            packed.len()
        );
        let output = decompress(&packed).unwrap();
        for (a, b) in input.iter().zip(&output) {
            assert!((a - b).abs() <= MAX_COMPONENT_ERROR);
        }
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut packed = compress(&[0.0, 0.0, 0.0, 1.0]).unwrap();
        packed[0] = b'X';
        assert!(matches!(decompress(&packed), Err(CodecError::BadMagic)));
    }

    #[test]
    fn empty_stream_round_trips() {
        let packed = compress(&[]).unwrap();
        assert_eq!(decompress(&packed).unwrap(), Vec::<f64>::new());
    }

    #[test]
    fn odd_component_count_is_rejected() {
        assert!(matches!(
            compress(&[0.1, 0.2, 0.3]),
            Err(CodecError::NotQuaternions(3))
        ));
    }
}
