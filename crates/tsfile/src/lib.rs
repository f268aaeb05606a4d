//! # tsfile - columnar time-series storage files
//!
//! Immutable, on-disk storage files for a time-series storage-group engine.
//!
//! When a storage group's in-memory memtable exceeds its size threshold, the
//! engine flushes it to disk as a tsfile. A tsfile is *write-once,
//! read-many* — it is replaced wholesale during a merge, never patched in
//! place.
//!
//! ## File layout
//!
//! ```text
//! MAGIC(4) | VERSION(1)
//! ( chunk group )*
//! SEPARATOR(1)
//! chunk-metadata region
//! metadata-index tree
//! file-metadata (root pointer + bloom filter)
//! file_metadata_size: i32
//! MAGIC(4)
//! ```
//!
//! A chunk group holds one device's measurements for one flush: a
//! `CHUNK_HEADER`-tagged run per measurement, a `CHUNK_GROUP_FOOTER`, and a
//! `VERSION_MARKER` recording the file's merge-lineage version. See
//! [`format`] for the exact byte layout and [`index`] for how the
//! metadata-index tree is built and traversed.

mod chunk;
mod format;
mod index;
mod merge;
mod reader;
mod writer;

pub use chunk::{decode_samples, encode_samples, ChunkMetadata};
pub use format::{IndexNodeKind, TsFileError, MAGIC};
pub use index::bulk_read_is_cheaper;
pub use merge::{merge_samples, SampleMergeIterator, SampleSource};
pub use reader::{recover_side_car, RecoveredSidecar, SelfCheckResult, TsFileReader};
pub use writer::TsFileWriter;

pub type Result<T> = std::result::Result<T, TsFileError>;
