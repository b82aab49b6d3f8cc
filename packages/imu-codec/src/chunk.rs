//! Recording chunk container.
//!
//! One blob per chunk, handed to the blob sink as opaque bytes. Little-endian
//! framing, string fields length-prefixed UTF-8:
//!
//! ```text
//! "CHK1" | session_id:str16 | chunk_index:u32 | start_ms:u64 | end_ms:u64
//!        | sample_count:u32 | compression_version:str16 | joint_count:u8
//!        | per joint: name:str16 | qdg1_len:u32 | qdg1 blob
//!                   | interp_len:u32 | sparse blob | missing_len:u32 | sparse blob
//! ```
//!
//! The QDG1 blob is the §quat_stream container; index sets use the sparse
//! codec. Joints are written in sorted-name order so encoding is
//! deterministic.

use bytes::{Buf, BufMut, BytesMut};

use imu_types::joint::Chunk;

use crate::{sparse, CodecError};

pub const MAGIC: &[u8; 4] = b"CHK1";

fn put_str16(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_str16(data: &mut &[u8]) -> Result<String, CodecError> {
    if data.remaining() < 2 {
        return Err(CodecError::Truncated("string length"));
    }
    let len = data.get_u16_le() as usize;
    if data.remaining() < len {
        return Err(CodecError::Truncated("string body"));
    }
    let s = std::str::from_utf8(&data[..len])
        .map_err(|_| CodecError::Truncated("string not UTF-8"))?
        .to_string();
    data.advance(len);
    Ok(s)
}

fn get_blob(data: &mut &[u8]) -> Result<Vec<u8>, CodecError> {
    if data.remaining() < 4 {
        return Err(CodecError::Truncated("blob length"));
    }
    let len = data.get_u32_le() as usize;
    if data.remaining() < len {
        return Err(CodecError::Truncated("blob body"));
    }
    let blob = data[..len].to_vec();
    data.advance(len);
    Ok(blob)
}

/// Serialize a chunk (with already-compressed per-joint blobs) into one
/// sink-ready byte buffer.
pub fn encode_chunk(chunk: &Chunk) -> Result<Vec<u8>, CodecError> {
    let mut joints: Vec<&String> = chunk.per_joint_compressed.keys().collect();
    joints.sort();

    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(MAGIC);
    put_str16(&mut buf, &chunk.session_id);
    buf.put_u32_le(chunk.chunk_index);
    buf.put_u64_le(chunk.start_ms);
    buf.put_u64_le(chunk.end_ms);
    buf.put_u32_le(chunk.sample_count);
    put_str16(&mut buf, &chunk.compression_version);
    buf.put_u8(joints.len() as u8);

    for name in joints {
        let blob = &chunk.per_joint_compressed[name];
        let interp = chunk
            .per_joint_interpolated
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let missing = chunk.per_joint_missing.get(name).map(Vec::as_slice).unwrap_or(&[]);
        let interp_blob = sparse::compress_indices(interp)?;
        let missing_blob = sparse::compress_indices(missing)?;

        put_str16(&mut buf, name);
        buf.put_u32_le(blob.len() as u32);
        buf.put_slice(blob);
        buf.put_u32_le(interp_blob.len() as u32);
        buf.put_slice(&interp_blob);
        buf.put_u32_le(missing_blob.len() as u32);
        buf.put_slice(&missing_blob);
    }
    Ok(buf.to_vec())
}

/// Parse a chunk container back into a [`Chunk`] with decoded index sets.
pub fn decode_chunk(mut data: &[u8]) -> Result<Chunk, CodecError> {
    if data.remaining() < 4 {
        return Err(CodecError::Truncated("chunk magic"));
    }
    if &data[..4] != MAGIC {
        return Err(CodecError::BadMagic);
    }
    data.advance(4);

    let session_id = get_str16(&mut data)?;
    if data.remaining() < 4 + 8 + 8 + 4 {
        return Err(CodecError::Truncated("chunk header"));
    }
    let chunk_index = data.get_u32_le();
    let start_ms = data.get_u64_le();
    let end_ms = data.get_u64_le();
    let sample_count = data.get_u32_le();
    let compression_version = get_str16(&mut data)?;
    if !data.has_remaining() {
        return Err(CodecError::Truncated("joint count"));
    }
    let joint_count = data.get_u8();

    let mut chunk = Chunk {
        session_id,
        chunk_index,
        start_ms,
        end_ms,
        sample_count,
        per_joint_compressed: Default::default(),
        per_joint_interpolated: Default::default(),
        per_joint_missing: Default::default(),
        compression_version,
    };

    for _ in 0..joint_count {
        let name = get_str16(&mut data)?;
        let blob = get_blob(&mut data)?;
        let interp = sparse::decompress_indices(&get_blob(&mut data)?)?;
        let missing = sparse::decompress_indices(&get_blob(&mut data)?)?;
        chunk.per_joint_compressed.insert(name.clone(), blob);
        chunk.per_joint_interpolated.insert(name.clone(), interp);
        chunk.per_joint_missing.insert(name, missing);
    }
    Ok(chunk)
}
