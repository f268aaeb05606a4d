//! Chunk encoding: the raw byte layout of one measurement's run of samples,
//! and the chunk-metadata record that indexes it.
//!
//! Column encodings and compression codecs are out of scope for this layer —
//! a chunk's payload is samples written back-to-back as little-endian
//! `timestamp | value`, tagged with the measurement's [`memtable::DataValue`]
//! variant. The `data_type` byte plays the role the original design reserves
//! for a pluggable codec tag; swapping in real encodings later only touches
//! [`encode_samples`]/[`decode_samples`].

use crate::format::{Result, TsFileError};
pub use metacache::ChunkMetadata;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memtable::DataValue;
use std::io::{Read, Write};

pub fn encode_samples(samples: &[(i64, DataValue)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(samples.len() * 12);
    for (ts, value) in samples {
        buf.write_i64::<LittleEndian>(*ts).unwrap();
        match value {
            DataValue::Int32(v) => buf.write_i32::<LittleEndian>(*v).unwrap(),
            DataValue::Int64(v) => buf.write_i64::<LittleEndian>(*v).unwrap(),
            DataValue::Float(v) => buf.write_f32::<LittleEndian>(*v).unwrap(),
            DataValue::Double(v) => buf.write_f64::<LittleEndian>(*v).unwrap(),
            DataValue::Bool(v) => buf.write_u8(*v as u8).unwrap(),
            DataValue::Text(s) => {
                buf.write_u32::<LittleEndian>(s.len() as u32).unwrap();
                buf.extend_from_slice(s.as_bytes());
            }
        }
    }
    buf
}

pub fn decode_samples(mut bytes: &[u8], data_type: u8, point_count: u64) -> Result<Vec<(i64, DataValue)>> {
    let mut out = Vec::with_capacity(point_count as usize);
    for _ in 0..point_count {
        let ts = bytes.read_i64::<LittleEndian>()?;
        let value = match data_type {
            0 => DataValue::Int32(bytes.read_i32::<LittleEndian>()?),
            1 => DataValue::Int64(bytes.read_i64::<LittleEndian>()?),
            2 => DataValue::Float(bytes.read_f32::<LittleEndian>()?),
            3 => DataValue::Double(bytes.read_f64::<LittleEndian>()?),
            4 => DataValue::Bool(bytes.read_u8()? != 0),
            5 => {
                let len = bytes.read_u32::<LittleEndian>()? as usize;
                let mut buf = vec![0u8; len];
                bytes.read_exact(&mut buf)?;
                DataValue::Text(String::from_utf8(buf).map_err(|e| TsFileError::Corrupt(e.to_string()))?)
            }
            other => return Err(TsFileError::Corrupt(format!("unknown data type tag {other}"))),
        };
        out.push((ts, value));
    }
    Ok(out)
}

/// Writes one [`ChunkMetadata`] record (used in the contiguous chunk-metadata
/// region a leaf-measurement node's entry points at).
pub fn write_chunk_metadata<W: Write>(w: &mut W, m: &ChunkMetadata) -> Result<()> {
    w.write_u64::<LittleEndian>(m.offset)?;
    w.write_u32::<LittleEndian>(m.compressed_size)?;
    w.write_u32::<LittleEndian>(m.uncompressed_size)?;
    w.write_i64::<LittleEndian>(m.start_time)?;
    w.write_i64::<LittleEndian>(m.end_time)?;
    w.write_u64::<LittleEndian>(m.point_count)?;
    w.write_u8(m.data_type)?;
    Ok(())
}

pub fn read_chunk_metadata<R: Read>(r: &mut R) -> Result<ChunkMetadata> {
    Ok(ChunkMetadata {
        offset: r.read_u64::<LittleEndian>()?,
        compressed_size: r.read_u32::<LittleEndian>()?,
        uncompressed_size: r.read_u32::<LittleEndian>()?,
        start_time: r.read_i64::<LittleEndian>()?,
        end_time: r.read_i64::<LittleEndian>()?,
        point_count: r.read_u64::<LittleEndian>()?,
        data_type: r.read_u8()?,
    })
}

/// Byte size of one serialized [`ChunkMetadata`] record.
pub const CHUNK_METADATA_RECORD_LEN: u64 = 8 + 4 + 4 + 8 + 8 + 8 + 1;
