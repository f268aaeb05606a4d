//! # mergelog — the merge write-ahead log
//!
//! Makes a two-phase file merge crash-recoverable. A merge task writes one
//! record per phase transition; on restart, [`MergeLogAnalysis::analyze`]
//! replays the log and classifies how far the interrupted merge got, so the
//! engine can resume from the right phase instead of redoing (or losing)
//! work.
//!
//! Record kinds, in the order a successful merge writes them:
//!
//! 1. [`MergeLogRecord::Source`] — the input seq/unseq file paths.
//! 2. [`MergeLogRecord::MergeStart`] — inputs are locked (`merging` flag set,
//!    flushes finished); a barrier.
//! 3. [`MergeLogRecord::TsEnd`] — one per completed (device, measurement)
//!    series.
//! 4. [`MergeLogRecord::AllTsMerged`] — every series is merged; about to
//!    swap files into place.
//! 5. [`MergeLogRecord::FileEnd`] — one per target file swapped in.
//! 6. [`MergeLogRecord::MergeEnd`] — the merge committed successfully.
//!
//! ## Binary record format
//!
//! ```text
//! [record_len: u32 LE][crc32: u32 LE][body ...]
//! ```
//!
//! `record_len` counts the CRC plus the body, not itself — the same framing
//! the storage engine's insert-path write-ahead log uses, generalized here
//! from two record kinds (put/delete) to the six phase markers above.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// One phase marker or data record in a merge log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeLogRecord {
    /// The input file set a merge task was submitted with.
    Source {
        seq_paths: Vec<PathBuf>,
        unseq_paths: Vec<PathBuf>,
    },
    /// Barrier: inputs are enumerated and locked.
    MergeStart,
    /// One series has finished merging.
    TsEnd { device: String, measurement: String },
    /// Barrier: every series is merged; file swap is about to begin.
    AllTsMerged,
    /// One target file has been swapped into place.
    FileEnd { path: PathBuf },
    /// The merge committed successfully.
    MergeEnd,
}

/// Errors that can occur while appending to or replaying a merge log.
#[derive(Debug, Error)]
pub enum MergeLogError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt merge log record")]
    Corrupt,
}

const OP_SOURCE: u8 = 0;
const OP_MERGE_START: u8 = 1;
const OP_TS_END: u8 = 2;
const OP_ALL_TS_MERGED: u8 = 3;
const OP_FILE_END: u8 = 4;
const OP_MERGE_END: u8 = 5;

fn write_path<W: Write>(w: &mut W, path: &Path) -> Result<(), MergeLogError> {
    let bytes = path.to_string_lossy();
    w.write_u32::<LittleEndian>(bytes.len() as u32)?;
    w.write_all(bytes.as_bytes())?;
    Ok(())
}

fn read_path<R: Read>(r: &mut R) -> Result<PathBuf, MergeLogError> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(PathBuf::from(String::from_utf8(buf).map_err(|_| MergeLogError::Corrupt)?))
}

fn write_str<W: Write>(w: &mut W, s: &str) -> Result<(), MergeLogError> {
    w.write_u32::<LittleEndian>(s.len() as u32)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

fn read_str<R: Read>(r: &mut R) -> Result<String, MergeLogError> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| MergeLogError::Corrupt)
}

/// Append-only merge log writer.
///
/// Every `append` is fsynced before returning — phase markers are rare
/// compared to insert-path writes, and recovery correctness depends on each
/// one being durable before the next phase starts.
pub struct MergeLogWriter {
    file: File,
    buf: Vec<u8>,
}

impl MergeLogWriter {
    /// Creates (or truncates) a merge log at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, MergeLogError> {
        let file = OpenOptions::new().create(true).write(true).truncate(true).read(true).open(path)?;
        Ok(Self {
            file,
            buf: Vec::with_capacity(256),
        })
    }

    /// Opens an existing merge log in append mode (used when a merge task
    /// resumes writing after a partial crash recovery).
    pub fn append_to<P: AsRef<Path>>(path: P) -> Result<Self, MergeLogError> {
        let file = OpenOptions::new().create(true).append(true).read(true).open(path)?;
        Ok(Self {
            file,
            buf: Vec::with_capacity(256),
        })
    }

    pub fn append(&mut self, record: &MergeLogRecord) -> Result<(), MergeLogError> {
        self.buf.clear();
        self.buf.extend_from_slice(&[0u8; 8]);

        match record {
            MergeLogRecord::Source { seq_paths, unseq_paths } => {
                self.buf.write_u8(OP_SOURCE)?;
                self.buf.write_u32::<LittleEndian>(seq_paths.len() as u32)?;
                for p in seq_paths {
                    write_path(&mut self.buf, p)?;
                }
                self.buf.write_u32::<LittleEndian>(unseq_paths.len() as u32)?;
                for p in unseq_paths {
                    write_path(&mut self.buf, p)?;
                }
            }
            MergeLogRecord::MergeStart => {
                self.buf.write_u8(OP_MERGE_START)?;
            }
            MergeLogRecord::TsEnd { device, measurement } => {
                self.buf.write_u8(OP_TS_END)?;
                write_str(&mut self.buf, device)?;
                write_str(&mut self.buf, measurement)?;
            }
            MergeLogRecord::AllTsMerged => {
                self.buf.write_u8(OP_ALL_TS_MERGED)?;
            }
            MergeLogRecord::FileEnd { path } => {
                self.buf.write_u8(OP_FILE_END)?;
                write_path(&mut self.buf, path)?;
            }
            MergeLogRecord::MergeEnd => {
                self.buf.write_u8(OP_MERGE_END)?;
            }
        }

        let body = &self.buf[8..];
        let mut hasher = Crc32::new();
        hasher.update(body);
        let crc = hasher.finalize();

        let record_len = (body.len() as u64) + 4;
        if record_len > (u32::MAX as u64) {
            return Err(MergeLogError::Io(io::Error::new(io::ErrorKind::InvalidInput, "merge log record too large")));
        }

        self.buf[0..4].copy_from_slice(&(record_len as u32).to_le_bytes());
        self.buf[4..8].copy_from_slice(&crc.to_le_bytes());

        self.file.write_all(&self.buf)?;
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Sequential merge log reader.
pub struct MergeLogReader<R: Read> {
    rdr: BufReader<R>,
}

impl MergeLogReader<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<MergeLogReader<File>, MergeLogError> {
        let f = File::open(path)?;
        Ok(MergeLogReader { rdr: BufReader::new(f) })
    }
}

impl<R: Read> MergeLogReader<R> {
    pub fn from_reader(reader: R) -> Self {
        MergeLogReader { rdr: BufReader::new(reader) }
    }

    /// Replays every complete record, calling `apply` for each one. A
    /// truncated tail record (partial write from a crash) is treated as a
    /// clean end of log, not an error — everything before it is still
    /// returned.
    pub fn replay<F>(&mut self, mut apply: F) -> Result<(), MergeLogError>
    where
        F: FnMut(MergeLogRecord),
    {
        let mut body = Vec::with_capacity(256);

        loop {
            let record_len = match self.rdr.read_u32::<LittleEndian>() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(MergeLogError::Io(e)),
            };

            const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;
            if record_len <= 4 || record_len > MAX_RECORD_SIZE {
                return Err(MergeLogError::Corrupt);
            }

            let crc = match self.rdr.read_u32::<LittleEndian>() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(MergeLogError::Io(e)),
            };

            let body_len = (record_len - 4) as usize;
            body.clear();
            body.resize(body_len, 0);
            match self.rdr.read_exact(&mut body) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(MergeLogError::Io(e)),
            }

            let mut hasher = Crc32::new();
            hasher.update(&body);
            if hasher.finalize() != crc {
                return Err(MergeLogError::Corrupt);
            }

            let mut br = &body[..];
            let op = br.read_u8()?;
            let record = match op {
                OP_SOURCE => {
                    let seq_count = br.read_u32::<LittleEndian>()?;
                    let mut seq_paths = Vec::with_capacity(seq_count as usize);
                    for _ in 0..seq_count {
                        seq_paths.push(read_path(&mut br)?);
                    }
                    let unseq_count = br.read_u32::<LittleEndian>()?;
                    let mut unseq_paths = Vec::with_capacity(unseq_count as usize);
                    for _ in 0..unseq_count {
                        unseq_paths.push(read_path(&mut br)?);
                    }
                    MergeLogRecord::Source { seq_paths, unseq_paths }
                }
                OP_MERGE_START => MergeLogRecord::MergeStart,
                OP_TS_END => {
                    let device = read_str(&mut br)?;
                    let measurement = read_str(&mut br)?;
                    MergeLogRecord::TsEnd { device, measurement }
                }
                OP_ALL_TS_MERGED => MergeLogRecord::AllTsMerged,
                OP_FILE_END => MergeLogRecord::FileEnd { path: read_path(&mut br)? },
                OP_MERGE_END => MergeLogRecord::MergeEnd,
                _ => return Err(MergeLogError::Corrupt),
            };

            apply(record);
        }
    }
}

/// How far an interrupted merge got, as of its last fully-written log
/// record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// No merge log, or a log with no `Source` record: nothing to recover.
    None,
    /// Inputs locked, series merge in progress (possibly zero done).
    MergeStart,
    /// All series merged, file-swap phase in progress.
    AllTsMerged,
    /// The merge committed.
    MergeEnd,
}

/// The full result of replaying a merge log: the phase reached plus enough
/// data to resume (or abort) from that phase.
#[derive(Debug, Clone, Default)]
pub struct MergeLogAnalysis {
    pub state_is_none: bool,
    pub seq_paths: Vec<PathBuf>,
    pub unseq_paths: Vec<PathBuf>,
    pub completed_series: Vec<(String, String)>,
    pub swapped_files: Vec<PathBuf>,
}

impl MergeLogAnalysis {
    /// Replays `path` (if it exists) and classifies the merge's last known
    /// phase. Returns `(analysis, state)`.
    pub fn analyze<P: AsRef<Path>>(path: P) -> Result<(Self, RecoveryState), MergeLogError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok((Self { state_is_none: true, ..Default::default() }, RecoveryState::None));
        }

        let mut reader = MergeLogReader::open(path)?;
        let mut analysis = Self::default();
        let mut state = RecoveryState::None;

        reader.replay(|record| match record {
            MergeLogRecord::Source { seq_paths, unseq_paths } => {
                analysis.seq_paths = seq_paths;
                analysis.unseq_paths = unseq_paths;
            }
            MergeLogRecord::MergeStart => state = RecoveryState::MergeStart,
            MergeLogRecord::TsEnd { device, measurement } => {
                analysis.completed_series.push((device, measurement));
            }
            MergeLogRecord::AllTsMerged => state = RecoveryState::AllTsMerged,
            MergeLogRecord::FileEnd { path } => analysis.swapped_files.push(path),
            MergeLogRecord::MergeEnd => state = RecoveryState::MergeEnd,
        })?;

        if state == RecoveryState::None && analysis.seq_paths.is_empty() && analysis.unseq_paths.is_empty() {
            analysis.state_is_none = true;
        }

        Ok((analysis, state))
    }
}

/// Removes the merge log file (called once recovery decides no more replay
/// is needed: after a clean `MergeEnd`, or after an abort rolls back).
pub fn remove_log<P: AsRef<Path>>(path: P) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
