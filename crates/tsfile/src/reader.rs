//! Random-access reader for a sealed (or self-checked) time-series file.

use crate::chunk::{self, ChunkMetadata};
use crate::format::{self, FileMetadata, Result, TsFileError, CHUNK_GROUP_FOOTER, CHUNK_HEADER, HEADER_LEN, MAGIC, SEPARATOR, VERSION_MARKER};
use crate::index;
use byteorder::{LittleEndian, ReadBytesExt};
use memtable::DataValue;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Outcome of [`TsFileReader::self_check`]: how much of a possibly-torn file
/// is safe to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfCheckResult {
    /// Tail magic present and, when checked, the metadata section parses.
    Complete,
    /// Only the head magic/version is present; no chunk groups were written.
    OnlyMagicHead,
    /// Head magic does not match, or the file is too short to contain one.
    Incompatible,
    /// Safe to truncate to this byte offset and resume appending.
    Truncated(u64),
}

/// A random-access reader over one time-series file.
///
/// Holds the file handle behind a [`Mutex`] so `&self` methods can seek and
/// read without requiring external synchronization, resolving device lookups
/// through metadata-index-tree traversal rather than a single flat index.
pub struct TsFileReader {
    path: PathBuf,
    file: Mutex<BufReader<File>>,
    file_metadata: FileMetadata,
}

impl TsFileReader {
    /// Opens `path`, validates the head and tail magic, and loads the file
    /// metadata (bloom filter + metadata-index root pointer).
    pub fn open(path: &Path) -> Result<Self> {
        let raw = File::open(path)?;
        let mut file = BufReader::new(raw);
        format::read_head(&mut file)?;
        let (file_metadata, _) = format::read_tail(&mut file)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            file_metadata,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Quick bloom-filter check for `device.measurement`. `false` means the
    /// pair is definitely absent from this file.
    #[must_use]
    pub fn may_contain(&self, device: &str, measurement: &str) -> bool {
        let mut key = Vec::with_capacity(device.len() + measurement.len() + 1);
        key.extend_from_slice(device.as_bytes());
        key.push(b'.');
        key.extend_from_slice(measurement.as_bytes());
        self.file_metadata.bloom.may_contain(&key)
    }

    /// Returns the sorted chunk-metadata list for `(device, measurement)`, or
    /// an empty list if either is absent from this file.
    pub fn chunk_metadata(&self, device: &str, measurement: &str) -> Result<Vec<ChunkMetadata>> {
        if !self.may_contain(device, measurement) {
            return Ok(Vec::new());
        }

        let mut file = self.file.lock();
        let Some(device_entry) =
            index::find_device(&mut *file, self.file_metadata.root_offset, self.file_metadata.root_kind, device)?
        else {
            return Ok(Vec::new());
        };

        let Some(m) = index::find_measurement(&mut *file, device_entry.offset, device_entry.kind, measurement)?
        else {
            return Ok(Vec::new());
        };

        self.read_chunk_list(&mut file, m.chunk_list_offset, m.chunk_list_len)
    }

    /// Returns chunk-metadata lists for every requested measurement of
    /// `device` in one call, switching to a full subtree scan (the "bulk
    /// read" path) when `measurements.len()` exceeds the cost-heuristic
    /// threshold for `max_degree`.
    pub fn chunk_metadata_for_device(
        &self,
        device: &str,
        measurements: &[String],
        max_degree: usize,
    ) -> Result<HashMap<String, Vec<ChunkMetadata>>> {
        let mut file = self.file.lock();
        let Some(device_entry) =
            index::find_device(&mut *file, self.file_metadata.root_offset, self.file_metadata.root_kind, device)?
        else {
            return Ok(HashMap::new());
        };

        let mut out = HashMap::new();

        if index::bulk_read_is_cheaper(measurements.len(), max_degree) {
            let wanted: std::collections::HashSet<&str> = measurements.iter().map(String::as_str).collect();
            for entry in index::collect_all_measurements(&mut *file, device_entry.offset, device_entry.kind)? {
                if wanted.contains(entry.name.as_str()) {
                    let metas = self.read_chunk_list(&mut file, entry.chunk_list_offset, entry.chunk_list_len)?;
                    out.insert(entry.name, metas);
                }
            }
        } else {
            for measurement in measurements {
                if let Some(m) =
                    index::find_measurement(&mut *file, device_entry.offset, device_entry.kind, measurement)?
                {
                    let metas = self.read_chunk_list(&mut file, m.chunk_list_offset, m.chunk_list_len)?;
                    out.insert(measurement.clone(), metas);
                }
            }
        }

        Ok(out)
    }

    /// Returns chunk-metadata lists for every measurement recorded under
    /// `device`, without requiring the caller to already know their names —
    /// used by the merge engine, which must enumerate a device's full
    /// measurement set rather than look up specific ones.
    pub fn all_chunk_metadata_for_device(&self, device: &str) -> Result<HashMap<String, Vec<ChunkMetadata>>> {
        let mut file = self.file.lock();
        let Some(device_entry) =
            index::find_device(&mut *file, self.file_metadata.root_offset, self.file_metadata.root_kind, device)?
        else {
            return Ok(HashMap::new());
        };

        let mut out = HashMap::new();
        for entry in index::collect_all_measurements(&mut *file, device_entry.offset, device_entry.kind)? {
            let metas = self.read_chunk_list(&mut file, entry.chunk_list_offset, entry.chunk_list_len)?;
            out.insert(entry.name, metas);
        }
        Ok(out)
    }

    fn read_chunk_list(&self, file: &mut BufReader<File>, offset: u64, len: u32) -> Result<Vec<ChunkMetadata>> {
        file.seek(SeekFrom::Start(offset))?;
        let mut out = Vec::with_capacity(len as usize);
        for _ in 0..len {
            out.push(chunk::read_chunk_metadata(file)?);
        }
        out.sort_by_key(|m| m.start_time);
        Ok(out)
    }

    /// Reads and decodes the samples for one chunk.
    pub fn read_chunk(&self, meta: &ChunkMetadata) -> Result<Vec<(i64, DataValue)>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(meta.offset))?;

        let marker = file.read_u8()?;
        if marker != CHUNK_HEADER {
            return Err(TsFileError::Corrupt(format!("expected chunk header marker, found {marker}")));
        }
        let name_len = file.read_u16::<LittleEndian>()?;
        let mut name_buf = vec![0u8; name_len as usize];
        file.read_exact(&mut name_buf)?;
        let _data_type = file.read_u8()?;
        let _start_time = file.read_i64::<LittleEndian>()?;
        let _end_time = file.read_i64::<LittleEndian>()?;
        let _point_count = file.read_u64::<LittleEndian>()?;
        let compressed_size = file.read_u32::<LittleEndian>()?;
        let _uncompressed_size = file.read_u32::<LittleEndian>()?;

        let mut payload = vec![0u8; compressed_size as usize];
        file.read_exact(&mut payload)?;

        chunk::decode_samples(&payload, meta.data_type, meta.point_count)
    }

    /// Runs self-check on `path` without requiring an already-open reader —
    /// used during recovery on files whose `.resource` side-car is missing
    /// or whose `.closing` flag is set.
    pub fn self_check(path: &Path, fast_finish: bool) -> std::io::Result<SelfCheckResult> {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(SelfCheckResult::Incompatible),
            Err(e) => return Err(e),
        };

        let filesize = file.seek(SeekFrom::End(0))?;
        if filesize < HEADER_LEN {
            return Ok(SelfCheckResult::Incompatible);
        }

        file.seek(SeekFrom::Start(0))?;
        let head_magic = file.read_u32::<LittleEndian>()?;
        if head_magic != MAGIC {
            return Ok(SelfCheckResult::Incompatible);
        }
        let _version = file.read_u8()?;

        if filesize == HEADER_LEN {
            return Ok(SelfCheckResult::OnlyMagicHead);
        }

        if fast_finish && filesize >= HEADER_LEN + 4 {
            file.seek(SeekFrom::End(-4))?;
            if file.read_u32::<LittleEndian>()? == MAGIC {
                return Ok(SelfCheckResult::Complete);
            }
        }

        file.seek(SeekFrom::Start(HEADER_LEN))?;
        let mut last_safe_pos = HEADER_LEN;
        let mut reached_separator = false;

        loop {
            let marker = match file.read_u8() {
                Ok(m) => m,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            };

            match marker {
                CHUNK_HEADER => {
                    if read_and_discard_chunk(&mut file).is_err() {
                        break;
                    }
                }
                CHUNK_GROUP_FOOTER => {
                    if read_and_discard_footer(&mut file).is_err() {
                        break;
                    }
                }
                VERSION_MARKER => match file.read_u64::<LittleEndian>() {
                    Ok(_) => last_safe_pos = file.stream_position()?,
                    Err(_) => break,
                },
                SEPARATOR => {
                    reached_separator = true;
                    break;
                }
                _ => {
                    // Unknown marker: corruption caught during self-check,
                    // not propagated. Truncate to the last complete group.
                    break;
                }
            }
        }

        if reached_separator {
            file.seek(SeekFrom::Start(0))?;
            match format::read_tail(&mut file) {
                Ok(_) => Ok(SelfCheckResult::Complete),
                Err(_) => Ok(SelfCheckResult::Truncated(last_safe_pos)),
            }
        } else {
            Ok(SelfCheckResult::Truncated(last_safe_pos))
        }
    }
}

/// Per-device time ranges and flush versions recovered by re-walking a
/// file's chunk-group region directly, independent of whether its tail
/// (metadata-index tree) is intact. Enough to rebuild a `.resource`
/// side-car from scratch.
#[derive(Debug, Default, Clone)]
pub struct RecoveredSidecar {
    pub device_ranges: BTreeMap<String, (i64, i64)>,
    pub versions: BTreeSet<u64>,
}

/// Classifies `path` exactly as [`TsFileReader::self_check`] would, while
/// also recovering every completed chunk group's device, time range, and
/// flush version along the way. Always walks the full chunk-group region
/// (never takes `self_check`'s tail-magic fast path), since the point here
/// is to recover metadata a missing or stale `.resource` side-car didn't
/// capture, not to classify cheaply.
pub fn recover_side_car(path: &Path) -> std::io::Result<(SelfCheckResult, RecoveredSidecar)> {
    let mut sidecar = RecoveredSidecar::default();

    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok((SelfCheckResult::Incompatible, sidecar)),
        Err(e) => return Err(e),
    };

    let filesize = file.seek(SeekFrom::End(0))?;
    if filesize < HEADER_LEN {
        return Ok((SelfCheckResult::Incompatible, sidecar));
    }

    file.seek(SeekFrom::Start(0))?;
    let head_magic = file.read_u32::<LittleEndian>()?;
    if head_magic != MAGIC {
        return Ok((SelfCheckResult::Incompatible, sidecar));
    }
    let _version = file.read_u8()?;

    if filesize == HEADER_LEN {
        return Ok((SelfCheckResult::OnlyMagicHead, sidecar));
    }

    file.seek(SeekFrom::Start(HEADER_LEN))?;
    let mut last_safe_pos = HEADER_LEN;
    let mut reached_separator = false;
    let mut group_times: Vec<(i64, i64)> = Vec::new();

    loop {
        let marker = match file.read_u8() {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };

        match marker {
            CHUNK_HEADER => match read_and_collect_chunk(&mut file) {
                Ok(times) => group_times.push(times),
                Err(_) => break,
            },
            CHUNK_GROUP_FOOTER => match read_and_collect_footer(&mut file) {
                Ok(device) => {
                    if let Some((start, end)) =
                        group_times.iter().copied().reduce(|(s0, e0), (s1, e1)| (s0.min(s1), e0.max(e1)))
                    {
                        sidecar
                            .device_ranges
                            .entry(device)
                            .and_modify(|(s, e)| {
                                *s = (*s).min(start);
                                *e = (*e).max(end);
                            })
                            .or_insert((start, end));
                    }
                    group_times.clear();
                }
                Err(_) => break,
            },
            VERSION_MARKER => match file.read_u64::<LittleEndian>() {
                Ok(v) => {
                    sidecar.versions.insert(v);
                    last_safe_pos = file.stream_position()?;
                }
                Err(_) => break,
            },
            SEPARATOR => {
                reached_separator = true;
                break;
            }
            _ => break,
        }
    }

    let result = if reached_separator {
        file.seek(SeekFrom::Start(0))?;
        match format::read_tail(&mut file) {
            Ok(_) => SelfCheckResult::Complete,
            Err(_) => SelfCheckResult::Truncated(last_safe_pos),
        }
    } else {
        SelfCheckResult::Truncated(last_safe_pos)
    };

    Ok((result, sidecar))
}

fn read_and_collect_chunk(file: &mut File) -> std::io::Result<(i64, i64)> {
    let name_len = file.read_u16::<LittleEndian>()?;
    let mut buf = vec![0u8; name_len as usize];
    file.read_exact(&mut buf)?;
    let _data_type = file.read_u8()?;
    let start_time = file.read_i64::<LittleEndian>()?;
    let end_time = file.read_i64::<LittleEndian>()?;
    let _point_count = file.read_u64::<LittleEndian>()?;
    let compressed_size = file.read_u32::<LittleEndian>()?;
    let _uncompressed_size = file.read_u32::<LittleEndian>()?;
    let mut payload = vec![0u8; compressed_size as usize];
    file.read_exact(&mut payload)?;
    Ok((start_time, end_time))
}

fn read_and_collect_footer(file: &mut File) -> std::io::Result<String> {
    let name_len = file.read_u16::<LittleEndian>()?;
    let mut buf = vec![0u8; name_len as usize];
    file.read_exact(&mut buf)?;
    let device = String::from_utf8_lossy(&buf).into_owned();
    let _chunk_count = file.read_u32::<LittleEndian>()?;
    let _footer_len = file.read_u32::<LittleEndian>()?;
    Ok(device)
}

fn read_and_discard_chunk(file: &mut File) -> std::io::Result<()> {
    let name_len = file.read_u16::<LittleEndian>()?;
    let mut buf = vec![0u8; name_len as usize];
    file.read_exact(&mut buf)?;
    let _data_type = file.read_u8()?;
    let _start_time = file.read_i64::<LittleEndian>()?;
    let _end_time = file.read_i64::<LittleEndian>()?;
    let _point_count = file.read_u64::<LittleEndian>()?;
    let compressed_size = file.read_u32::<LittleEndian>()?;
    let _uncompressed_size = file.read_u32::<LittleEndian>()?;
    let mut payload = vec![0u8; compressed_size as usize];
    file.read_exact(&mut payload)?;
    Ok(())
}

fn read_and_discard_footer(file: &mut File) -> std::io::Result<()> {
    let name_len = file.read_u16::<LittleEndian>()?;
    let mut buf = vec![0u8; name_len as usize];
    file.read_exact(&mut buf)?;
    let _chunk_count = file.read_u32::<LittleEndian>()?;
    let _footer_len = file.read_u32::<LittleEndian>()?;
    Ok(())
}
