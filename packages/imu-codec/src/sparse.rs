//! Sparse tick-index codec.
//!
//! Interpolated/missing index sets are strictly increasing `u32` sequences
//! that are usually short runs; delta encoding turns them into small values
//! that deflate to almost nothing.
//!
//! Framing: `u32 LE count | gzip(delta i32 LE stream)`. The first index is
//! stored absolute; deltas use wrapping arithmetic so any input round-trips
//! exactly.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::CodecError;

pub fn compress_indices(indices: &[u32]) -> Result<Vec<u8>, CodecError> {
    let mut deltas = Vec::with_capacity(indices.len() * 4);
    let mut prev = 0u32;
    for (i, &v) in indices.iter().enumerate() {
        let d = if i == 0 { v as i32 } else { v.wrapping_sub(prev) as i32 };
        prev = v;
        deltas.extend_from_slice(&d.to_le_bytes());
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(&deltas)?;
    let deflated = encoder.finish()?;

    let mut out = Vec::with_capacity(4 + deflated.len());
    out.extend_from_slice(&(indices.len() as u32).to_le_bytes());
    out.extend_from_slice(&deflated);
    Ok(out)
}

pub fn decompress_indices(data: &[u8]) -> Result<Vec<u32>, CodecError> {
    if data.len() < 4 {
        return Err(CodecError::Truncated("sparse index header"));
    }
    let declared = u32::from_le_bytes(data[..4].try_into().unwrap()) as usize;

    let mut raw = Vec::with_capacity(declared * 4);
    GzDecoder::new(&data[4..]).read_to_end(&mut raw)?;
    if raw.len() != declared * 4 {
        return Err(CodecError::CountMismatch { declared, actual: raw.len() / 4 });
    }

    let mut out = Vec::with_capacity(declared);
    let mut prev = 0u32;
    for (i, chunk) in raw.chunks_exact(4).enumerate() {
        let d = i32::from_le_bytes(chunk.try_into().unwrap());
        let v = if i == 0 { d as u32 } else { prev.wrapping_add(d as u32) };
        prev = v;
        out.push(v);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increasing_sequences_round_trip() {
        for v in [
            vec![],
            vec![0],
            vec![3, 4, 5, 6, 7, 100, 5999],
            vec![0, 1, 2, 10_000, 10_001, 4_000_000_000],
            (0..1000u32).map(|i| i * 7).collect(),
        ] {
            let packed = compress_indices(&v).unwrap();
            assert_eq!(decompress_indices(&packed).unwrap(), v);
        }
    }

    #[test]
    fn consecutive_runs_stay_tiny() {
        let run: Vec<u32> = (1200..1250).collect();
        let packed = compress_indices(&run).unwrap();
        assert!(packed.len() < 60, "packed {} bytes", packed.len());
    }

    #[test]
    fn truncated_input_is_rejected() {
        assert!(matches!(
            decompress_indices(&[1, 0]),
            Err(CodecError::Truncated(_))
        ));
    }
}
