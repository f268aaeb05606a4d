//! On-disk binary format constants and the file-metadata tail.
//!
//! ## File layout
//!
//! ```text
//! MAGIC(4) | VERSION(1)
//! ( chunk group )*                  -- one per flush, per device
//! SEPARATOR(1)
//! chunk-metadata region             -- contiguous per-(device,measurement) runs
//! metadata-index-tree
//! file-metadata                     -- root pointer + bloom filter
//! file_metadata_size: i32
//! MAGIC(4)
//! ```
//!
//! A chunk group is: `(CHUNK_HEADER marker | chunk)* | CHUNK_GROUP_FOOTER marker
//! | device | chunk_count:u32 | footer_len:u32 | VERSION marker | version:u64`.
//!
//! All integers are little-endian. `HEADER_LEN` (5 bytes: magic + version tag)
//! is the offset self-check starts scanning from.

use bloom::BloomFilter;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom, Write};

/// Magic identifying this format (ASCII "TsF1"), written at both the head and
/// the tail of a complete file.
pub const MAGIC: u32 = 0x5473_4631;

/// Format version tag following the head magic.
pub const FORMAT_VERSION: u8 = 1;

/// `MAGIC` (4 bytes) + format version tag (1 byte).
pub const HEADER_LEN: u64 = 5;

/// Marks the start of one chunk within a chunk group.
pub const CHUNK_HEADER: u8 = 1;
/// Marks the end of a device's chunk group.
pub const CHUNK_GROUP_FOOTER: u8 = 2;
/// Marks a version record following a chunk-group footer.
pub const VERSION_MARKER: u8 = 3;
/// Marks the end of the data section, before the metadata-index tree.
pub const SEPARATOR: u8 = 4;

/// One entry kind in the metadata-index tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IndexNodeKind {
    InternalDevice = 0,
    LeafDevice = 1,
    InternalMeasurement = 2,
    LeafMeasurement = 3,
}

impl IndexNodeKind {
    pub fn from_u8(b: u8) -> Result<Self, TsFileError> {
        match b {
            0 => Ok(Self::InternalDevice),
            1 => Ok(Self::LeafDevice),
            2 => Ok(Self::InternalMeasurement),
            3 => Ok(Self::LeafMeasurement),
            other => Err(TsFileError::UnknownMarker(other)),
        }
    }
}

/// Errors raised while reading or writing a time-series file.
#[derive(Debug, thiserror::Error)]
pub enum TsFileError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt file: {0}")]
    Corrupt(String),

    #[error("unknown marker byte: {0}")]
    UnknownMarker(u8),

    #[error("head or tail magic does not match")]
    MagicMismatch,
}

pub type Result<T> = std::result::Result<T, TsFileError>;

/// The root pointer into the metadata-index tree plus the file-level bloom
/// filter, read from the tail of the file.
pub struct FileMetadata {
    pub root_offset: u64,
    pub root_kind: IndexNodeKind,
    pub bloom: BloomFilter,
}

impl FileMetadata {
    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u64::<LittleEndian>(self.root_offset)?;
        w.write_u8(self.root_kind as u8)?;
        self.bloom.write_to(w)?;
        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        let root_offset = r.read_u64::<LittleEndian>()?;
        let root_kind = IndexNodeKind::from_u8(r.read_u8()?)?;
        let bloom = BloomFilter::read_from(r)?;
        Ok(Self {
            root_offset,
            root_kind,
            bloom,
        })
    }
}

/// Reads the tail (`file_metadata_size:i32 | MAGIC`), seeks back, and parses
/// the file-metadata section. Returns `(file_metadata, file_metadata_start)`.
pub fn read_tail<R: Read + Seek>(r: &mut R) -> Result<(FileMetadata, u64)> {
    let filesize = r.seek(SeekFrom::End(0))?;
    if filesize < HEADER_LEN + 4 + 4 {
        return Err(TsFileError::Corrupt("file too small for tail".into()));
    }

    r.seek(SeekFrom::End(-4))?;
    let magic = r.read_u32::<LittleEndian>()?;
    if magic != MAGIC {
        return Err(TsFileError::MagicMismatch);
    }

    r.seek(SeekFrom::End(-8))?;
    let file_metadata_size = r.read_i32::<LittleEndian>()?;
    if file_metadata_size < 0 {
        return Err(TsFileError::Corrupt("negative file_metadata_size".into()));
    }
    let file_metadata_start = filesize - 8 - file_metadata_size as u64;
    r.seek(SeekFrom::Start(file_metadata_start))?;
    let meta = FileMetadata::read(r)?;
    Ok((meta, file_metadata_start))
}

/// Reads and validates the head magic + version tag, leaving the cursor
/// positioned right after the header.
pub fn read_head<R: Read + Seek>(r: &mut R) -> Result<()> {
    r.seek(SeekFrom::Start(0))?;
    let magic = r.read_u32::<LittleEndian>()?;
    if magic != MAGIC {
        return Err(TsFileError::MagicMismatch);
    }
    let _version = r.read_u8()?;
    Ok(())
}
